use std::fmt::{Display, Formatter};
use std::ops::Deref;

use cellstore_error::{CellstoreResult, cellstore_err};

/// The largest alignment ever required by a fixed-length field.
pub const MAX_FIELD_ALIGNMENT: Alignment = Alignment::new(8);

/// The alignment of a field or record, always a power of two.
///
/// Layouts track alignment as a mask (`alignment - 1`), which is what the allocator reports
/// upward so that an enclosing scope can pad to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Alignment(usize);

impl Alignment {
    /// Create a new alignment.
    ///
    /// ## Panics
    ///
    /// Panics if `align` is not a power of 2.
    #[inline]
    pub const fn new(align: usize) -> Self {
        assert!(align > 0, "Alignment must be greater than 0");
        assert!(align.is_power_of_two(), "Alignment must be a power of 2");
        Self(align)
    }

    /// An alignment of one byte, i.e. no alignment at all.
    #[inline]
    pub const fn none() -> Self {
        Self::new(1)
    }

    /// Create an alignment from the log2 of the alignment.
    #[inline]
    pub const fn from_exponent(exponent: u8) -> Self {
        Self::new(1 << exponent)
    }

    /// Create an alignment from a mask of the form `alignment - 1`.
    pub fn from_mask(mask: u32) -> CellstoreResult<Self> {
        let align = (mask as usize)
            .checked_add(1)
            .filter(|a| a.is_power_of_two())
            .ok_or_else(|| cellstore_err!("alignment mask {mask:#x} is not of the form 2^n - 1"))?;
        Ok(Self(align))
    }

    /// The documented alignment for a fixed-length field of `length` bytes: the largest power
    /// of two dividing the length, capped at [`MAX_FIELD_ALIGNMENT`].
    ///
    /// A zero-length field requires no alignment.
    pub const fn of_length(length: u32) -> Self {
        if length == 0 {
            return Self::none();
        }
        let natural = 1usize << length.trailing_zeros();
        if natural > MAX_FIELD_ALIGNMENT.0 {
            MAX_FIELD_ALIGNMENT
        } else {
            Self(natural)
        }
    }

    /// Returns the log2 of the alignment.
    #[inline]
    pub fn exponent(&self) -> u8 {
        u8::try_from(self.0.trailing_zeros()).unwrap_or(u8::MAX)
    }

    /// Returns the alignment as the mask `alignment - 1`.
    #[inline]
    pub fn mask(&self) -> u32 {
        u32::try_from(self.0 - 1).unwrap_or(u32::MAX)
    }

    /// Whether `offset` is a multiple of this alignment.
    #[inline]
    pub fn is_aligned(&self, offset: u64) -> bool {
        offset % self.0 as u64 == 0
    }

    /// Whether this alignment is at least as strict as `other`.
    #[inline]
    pub fn is_aligned_to(&self, other: Alignment) -> bool {
        self.0 % other.0 == 0
    }

    /// Rounds `offset` up to the next multiple of this alignment, returning `None` on overflow.
    #[inline]
    pub fn align_up(&self, offset: u32) -> Option<u32> {
        let mask = self.mask();
        offset.checked_add(mask).map(|v| v & !mask)
    }

    /// The number of padding bytes required to bring `offset` to this alignment.
    #[inline]
    pub fn padding(&self, offset: u64) -> u64 {
        offset.next_multiple_of(self.0 as u64) - offset
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Self::none()
    }
}

impl Deref for Alignment {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Alignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Alignment> for usize {
    fn from(value: Alignment) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 1)]
    #[case(4, 4)]
    #[case(6, 2)]
    #[case(8, 8)]
    #[case(12, 4)]
    #[case(16, 8)]
    #[case(0, 1)]
    fn documented_alignment(#[case] length: u32, #[case] expected: usize) {
        assert_eq!(*Alignment::of_length(length), expected);
    }

    #[test]
    fn mask_roundtrip() {
        let align = Alignment::new(4);
        assert_eq!(align.mask(), 3);
        assert_eq!(Alignment::from_mask(3).unwrap(), align);
        assert!(Alignment::from_mask(5).is_err());
        assert_eq!(Alignment::from_exponent(align.exponent()), align);
    }

    #[test]
    fn align_up() {
        let align = Alignment::new(8);
        assert_eq!(align.align_up(0), Some(0));
        assert_eq!(align.align_up(7), Some(8));
        assert_eq!(align.align_up(16), Some(16));
        assert_eq!(align.align_up(u32::MAX - 2), None);
        assert_eq!(align.padding(13), 3);
        assert!(align.is_aligned(24));
        assert!(align.is_aligned_to(Alignment::new(2)));
    }
}
