use cellstore_buffer::Alignment;
use cellstore_error::{CellstoreResult, cellstore_bail, cellstore_err};

use crate::{LengthSpec, LengthTable, OffsetTable, OrderEntry, OrderList, Slot, SpecialLengths};

/// Owner of the restorable length recorded when allocation passes an
/// [`OrderEntry::Checkpoint`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Checkpoint(Option<u32>);

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded length, or `None` when the order list had no checkpoint.
    pub fn get(&self) -> Option<u32> {
        self.0
    }
}

/// Assign offsets to every requested field of a scope.
///
/// Fields are placed in order-list sequence. A fixed-length field is placed at the next
/// multiple of its documented alignment ([`Alignment::of_length`]) and widens `alignment` to
/// it; an indirect field is placed at the current cumulative length and never forces
/// alignment. Fields marked [`Slot::Pending`] or carrying an offset from an earlier pass are
/// (re)allocated, so repeated passes over identical inputs produce identical tables.
///
/// Returns the cumulative length of the record, without end-of-record padding.
pub fn allocate(
    order: &OrderList,
    offsets: &mut OffsetTable,
    lengths: &LengthTable,
    specials: &SpecialLengths,
    mut checkpoint: Option<&mut Checkpoint>,
    alignment: &mut Alignment,
) -> CellstoreResult<u32> {
    let mut cumulative: u32 = 0;
    for entry in order.iter() {
        let code = match entry {
            OrderEntry::Checkpoint => {
                match checkpoint.as_deref_mut() {
                    Some(owner) => owner.0 = Some(cumulative),
                    None => {
                        cellstore_bail!(Programming: "order list has a checkpoint but no owner")
                    }
                }
                continue;
            }
            OrderEntry::Field(code) => *code,
        };
        if !offsets.is_requested(code) {
            continue;
        }

        let spec = lengths.get(code)?;
        let length = specials.resolve(spec)?;
        let offset = match spec {
            LengthSpec::Fixed(_) => {
                let field_alignment = Alignment::of_length(length);
                *alignment = (*alignment).max(field_alignment);
                field_alignment.align_up(cumulative).ok_or_else(|| {
                    cellstore_err!(Overflow: "aligning field {} past offset {}", code, cumulative)
                })?
            }
            LengthSpec::Indirect(_) => cumulative,
        };
        offsets.set(code, Slot::At(offset));
        cumulative = offset.checked_add(length).ok_or_else(|| {
            cellstore_err!(
                Overflow: "field {} of {} bytes at offset {} exceeds the record size limit",
                code,
                length,
                offset
            )
        })?;
        log::trace!("allocated field {code} at {offset}..{cumulative}");
    }
    Ok(cumulative)
}

#[cfg(test)]
mod tests {
    use cellstore_error::CellstoreError;
    use itertools::Itertools;
    use rstest::rstest;

    use super::*;
    use crate::{FieldCode, SpecialKey};

    const A: FieldCode = FieldCode::new(0);
    const B: FieldCode = FieldCode::new(1);
    const KEY: SpecialKey = SpecialKey::new(1);

    fn worked_example() -> (OrderList, LengthTable, SpecialLengths) {
        let order = OrderList::new(vec![OrderEntry::Field(A), OrderEntry::Field(B)]);
        let lengths = LengthTable::new(vec![LengthSpec::Fixed(4), LengthSpec::Indirect(KEY)]);
        let specials = SpecialLengths::new().with(KEY, 3);
        (order, lengths, specials)
    }

    #[test]
    fn allocates_worked_example() {
        let (order, lengths, specials) = worked_example();
        let mut offsets = OffsetTable::new(2);
        offsets.request(A).unwrap();
        offsets.request(B).unwrap();
        let mut alignment = Alignment::none();

        let total =
            allocate(&order, &mut offsets, &lengths, &specials, None, &mut alignment).unwrap();

        assert_eq!(offsets.offset(A), Some(0));
        assert_eq!(offsets.offset(B), Some(4));
        assert_eq!(total, 7);
        assert_eq!(alignment.mask(), 3);
    }

    #[test]
    fn repeated_passes_are_identical() {
        let (order, lengths, specials) = worked_example();
        let mut offsets = OffsetTable::new(2);
        offsets.request(A).unwrap();
        offsets.request(B).unwrap();

        let mut first_alignment = Alignment::none();
        let first = allocate(
            &order,
            &mut offsets,
            &lengths,
            &specials,
            None,
            &mut first_alignment,
        )
        .unwrap();
        let first_offsets = offsets.clone();

        let mut second_alignment = Alignment::none();
        let second = allocate(
            &order,
            &mut offsets,
            &lengths,
            &specials,
            None,
            &mut second_alignment,
        )
        .unwrap();

        assert_eq!(first, second);
        assert_eq!(first_offsets, offsets);
        assert_eq!(first_alignment, second_alignment);
    }

    #[test]
    fn unrequested_fields_are_skipped() {
        let (order, lengths, specials) = worked_example();
        let mut offsets = OffsetTable::new(2);
        offsets.request(B).unwrap();
        let mut alignment = Alignment::none();

        let total =
            allocate(&order, &mut offsets, &lengths, &specials, None, &mut alignment).unwrap();

        assert_eq!(offsets.slot(A), Slot::NotRequested);
        assert_eq!(offsets.offset(B), Some(0));
        assert_eq!(total, 3);
        assert_eq!(alignment, Alignment::none());
    }

    #[rstest]
    #[case(&[1, 8, 2, 4, 3, 8], &[true, true, true, true, true, true])]
    #[case(&[2, 1, 4, 1, 8], &[true, true, false, true, true])]
    #[case(&[12, 6, 3, 16], &[true, true, true, true])]
    fn fixed_fields_are_aligned_and_disjoint(#[case] lengths: &[u32], #[case] requested: &[bool]) {
        let order = (0..lengths.len())
            .map(|i| OrderEntry::Field(FieldCode::new(u8::try_from(i).unwrap())))
            .collect::<OrderList>();
        let table = LengthTable::new(lengths.iter().map(|&l| LengthSpec::Fixed(l)).collect());
        let mut offsets = OffsetTable::new(lengths.len());
        for (i, _) in requested.iter().enumerate().filter(|(_, r)| **r) {
            offsets.request(FieldCode::new(u8::try_from(i).unwrap())).unwrap();
        }
        let mut alignment = Alignment::none();

        let total = allocate(
            &order,
            &mut offsets,
            &table,
            &SpecialLengths::new(),
            None,
            &mut alignment,
        )
        .unwrap();

        let mut previous_end = 0;
        for code in order.fields() {
            let Some(offset) = offsets.offset(code) else {
                continue;
            };
            let length = lengths[code.index()];
            assert!(Alignment::of_length(length).is_aligned(offset as u64));
            assert!(alignment.is_aligned_to(Alignment::of_length(length)));
            assert!(offset >= previous_end, "field {code} overlaps its predecessor");
            previous_end = offset + length;
        }
        assert_eq!(total, previous_end);
        assert!(
            offsets
                .allocated()
                .iter()
                .map(|(code, _)| *code)
                .tuple_windows()
                .all(|(a, b)| a < b)
        );
    }

    #[test]
    fn checkpoint_records_prefix() {
        let order = OrderList::new(vec![
            OrderEntry::Field(A),
            OrderEntry::Checkpoint,
            OrderEntry::Field(B),
        ]);
        let lengths = LengthTable::new(vec![LengthSpec::Fixed(2), LengthSpec::Fixed(8)]);
        let mut offsets = OffsetTable::new(2);
        offsets.request(A).unwrap();
        offsets.request(B).unwrap();
        let mut checkpoint = Checkpoint::new();
        let mut alignment = Alignment::none();

        let total = allocate(
            &order,
            &mut offsets,
            &lengths,
            &SpecialLengths::new(),
            Some(&mut checkpoint),
            &mut alignment,
        )
        .unwrap();

        assert_eq!(checkpoint.get(), Some(2));
        assert_eq!(offsets.offset(B), Some(8));
        assert_eq!(total, 16);
        assert_eq!(alignment.mask(), 7);
    }

    #[test]
    fn checkpoint_without_owner_fails() {
        let order = OrderList::new(vec![OrderEntry::Checkpoint]);
        let err = allocate(
            &order,
            &mut OffsetTable::new(0),
            &LengthTable::default(),
            &SpecialLengths::new(),
            None,
            &mut Alignment::none(),
        )
        .unwrap_err();
        assert!(matches!(err, CellstoreError::Programming(..)));
    }

    #[test]
    fn missing_special_length_fails() {
        let (order, lengths, _) = worked_example();
        let mut offsets = OffsetTable::new(2);
        offsets.request(B).unwrap();
        let err = allocate(
            &order,
            &mut offsets,
            &lengths,
            &SpecialLengths::new(),
            None,
            &mut Alignment::none(),
        )
        .unwrap_err();
        assert!(matches!(err, CellstoreError::Programming(..)));
    }

    #[test]
    fn overflow_is_reported() {
        let (order, lengths, _) = worked_example();
        let specials = SpecialLengths::new().with(KEY, u32::MAX - 2);
        let mut offsets = OffsetTable::new(2);
        offsets.request(A).unwrap();
        offsets.request(B).unwrap();
        let err = allocate(
            &order,
            &mut offsets,
            &lengths,
            &specials,
            None,
            &mut Alignment::none(),
        )
        .unwrap_err();
        assert!(matches!(err, CellstoreError::Overflow(..)));
    }
}
