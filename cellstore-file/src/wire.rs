//! Framing of header blocks and self-describing fields.
//!
//! ```text
//! block:  name[8] | u32 field area length | field | field | ...
//! field:  name[8] | u8 wire type | u8 scale | u16 element length | u32 count | payload
//! ```
//!
//! All integers are little-endian. The payload is `element length * count` bytes with no
//! padding, so a reader can step over any field it does not know.

use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cellstore_buffer::{FixedBuf, FixedBufMut};
use cellstore_error::{CellstoreResult, cellstore_bail, cellstore_err};
use cellstore_io::{ByteSink, ByteSource};

/// Width of block and field names.
pub const WIRE_NAME_WIDTH: usize = 8;
/// Size of a block header: name and field area length.
pub const BLOCK_HEADER_SIZE: usize = WIRE_NAME_WIDTH + 4;
/// Size of a field header: name, wire type, scale, element length and count.
pub const FIELD_HEADER_SIZE: usize = WIRE_NAME_WIDTH + 8;

/// Representation of the elements of a header field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireType {
    /// Two's complement fixed-point, 1, 2, 4 or 8 bytes.
    Signed,
    /// Unsigned fixed-point, 1, 2, 4 or 8 bytes.
    Unsigned,
    /// IEEE 754 binary32 or binary64.
    Float,
    /// Raw characters.
    Bytes,
}

impl WireType {
    pub fn code(&self) -> u8 {
        match self {
            WireType::Signed => 1,
            WireType::Unsigned => 2,
            WireType::Float => 3,
            WireType::Bytes => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(WireType::Signed),
            2 => Some(WireType::Unsigned),
            3 => Some(WireType::Float),
            4 => Some(WireType::Bytes),
            _ => None,
        }
    }

    /// Signed and unsigned fields form one category and convert into each other.
    pub fn is_fixed_point(&self) -> bool {
        matches!(self, WireType::Signed | WireType::Unsigned)
    }

    /// Whether a field of this type can be converted into a field of type `other`.
    pub fn converts_to(&self, other: WireType) -> bool {
        self == &other || (self.is_fixed_point() && other.is_fixed_point())
    }
}

impl Display for WireType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WireType::Signed => write!(f, "signed"),
            WireType::Unsigned => write!(f, "unsigned"),
            WireType::Float => write!(f, "float"),
            WireType::Bytes => write!(f, "bytes"),
        }
    }
}

/// A field exactly as found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawField {
    pub name: String,
    /// Raw wire type code; unknown codes are kept so unknown fields can still be skipped.
    pub code: u8,
    pub scale: u8,
    pub elen: u16,
    pub count: u32,
    pub payload: Bytes,
}

impl RawField {
    pub fn wire_type(&self) -> Option<WireType> {
        WireType::from_code(self.code)
    }

    pub fn encoded_len(&self) -> usize {
        FIELD_HEADER_SIZE + self.payload.len()
    }

    fn encode(&self, buf: &mut BytesMut) -> CellstoreResult<()> {
        let expected = u64::from(self.elen) * u64::from(self.count);
        if expected != self.payload.len() as u64 {
            cellstore_bail!(
                Programming: "field {} carries {} bytes, declared {} x {}",
                self.name,
                self.payload.len(),
                self.count,
                self.elen
            );
        }
        buf.put_fixed_str(&self.name, WIRE_NAME_WIDTH)?;
        buf.put_u8(self.code);
        buf.put_u8(self.scale);
        buf.put_u16_le(self.elen);
        buf.put_u32_le(self.count);
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode(area: &mut Bytes, block: &str) -> CellstoreResult<Self> {
        if area.remaining() < FIELD_HEADER_SIZE {
            cellstore_bail!(
                SchemaMismatch: "block {} ends inside a field header ({} bytes left)",
                block,
                area.remaining()
            );
        }
        let name = area.get_fixed_str(WIRE_NAME_WIDTH)?;
        let code = area.get_u8();
        let scale = area.get_u8();
        let elen = area.get_u16_le();
        let count = area.get_u32_le();
        let len = usize::try_from(u64::from(elen) * u64::from(count))
            .ok()
            .filter(|&len| len <= area.remaining())
            .ok_or_else(|| {
                cellstore_err!(
                    SchemaMismatch: "field {}.{} declares {} x {} bytes, block has {} left",
                    block,
                    name,
                    count,
                    elen,
                    area.remaining()
                )
            })?;
        let payload = area.split_to(len);
        Ok(Self {
            name,
            code,
            scale,
            elen,
            count,
            payload,
        })
    }
}

/// A block exactly as found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawBlock {
    pub name: String,
    pub fields: Vec<RawField>,
}

impl RawBlock {
    pub fn field(&self, name: &str) -> Option<&RawField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Size of the block on disk, header included.
    pub fn encoded_len(&self) -> usize {
        BLOCK_HEADER_SIZE + self.fields.iter().map(RawField::encoded_len).sum::<usize>()
    }

    pub fn encode(&self) -> CellstoreResult<Bytes> {
        let area = self.fields.iter().map(RawField::encoded_len).sum::<usize>();
        let area_len = u32::try_from(area).map_err(|_| {
            cellstore_err!(Overflow: "block {} has a {} byte field area", self.name, area)
        })?;
        let mut buf = BytesMut::with_capacity(BLOCK_HEADER_SIZE + area);
        buf.put_fixed_str(&self.name, WIRE_NAME_WIDTH)?;
        buf.put_u32_le(area_len);
        for field in &self.fields {
            field.encode(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    pub fn write<K: ByteSink>(&self, sink: &mut K) -> CellstoreResult<u64> {
        let encoded = self.encode()?;
        sink.write_all_from(&encoded)?;
        Ok(encoded.len() as u64)
    }

    /// Read the next block. Field payloads are sliced out of the block buffer, not copied.
    pub fn read<S: ByteSource>(source: &mut S) -> CellstoreResult<Self> {
        let mut header = Bytes::from(source.read_vec(BLOCK_HEADER_SIZE)?);
        let name = header.get_fixed_str(WIRE_NAME_WIDTH)?;
        let area_len = header.get_u32_le();
        let area_len = usize::try_from(area_len)
            .map_err(|_| cellstore_err!(Overflow: "block {} of {} bytes", name, area_len))?;
        let mut area = Bytes::from(source.read_vec(area_len)?);
        let mut fields = Vec::new();
        while area.has_remaining() {
            fields.push(RawField::decode(&mut area, &name)?);
        }
        Ok(Self { name, fields })
    }
}
