use bytes::{Buf, BufMut};
use cellstore_error::{CellstoreResult, cellstore_bail};

/// Extension methods for writing fixed-width character fields and padding.
pub trait FixedBufMut: BufMut {
    /// Write `value` into a field of exactly `width` bytes, padding with NUL bytes.
    ///
    /// Values longer than `width` are rejected rather than silently truncated.
    fn put_fixed_str(&mut self, value: &str, width: usize) -> CellstoreResult<()> {
        let bytes = value.as_bytes();
        if bytes.len() > width {
            cellstore_bail!(
                "value '{}' does not fit a {} byte character field",
                value,
                width
            );
        }
        self.put_slice(bytes);
        self.put_bytes(0, width - bytes.len());
        Ok(())
    }
}

impl<B: BufMut> FixedBufMut for B {}

/// Extension methods for reading fixed-width character fields.
pub trait FixedBuf: Buf {
    /// Read a field of exactly `width` bytes, dropping trailing NUL padding.
    ///
    /// Invalid UTF-8 is replaced rather than rejected: character fields are informational.
    fn get_fixed_str(&mut self, width: usize) -> CellstoreResult<String> {
        if self.remaining() < width {
            cellstore_bail!(
                "need {} bytes for a character field, {} remaining",
                width,
                self.remaining()
            );
        }
        let mut raw = vec![0u8; width];
        self.copy_to_slice(&mut raw);
        Ok(trim_nul(&raw))
    }
}

impl<B: Buf> FixedBuf for B {}

/// Decode a NUL-padded character field.
pub fn trim_nul(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
