//! Header field values and their conversion between on-disk and prototype representation.
//!
//! Fixed-point values stay scaled integers throughout: a value `v` with scale `s` stands for
//! `v / 2^s`. Converting between scales shifts the integer; nothing passes through floats.

use std::fmt::{Display, Formatter};

use bytes::{BufMut, BytesMut};
use cellstore_buffer::trim_nul;
use cellstore_error::{CellstoreResult, cellstore_bail, cellstore_err};
use itertools::Itertools;

use crate::schema::FieldProto;
use crate::to_usize;
use crate::wire::{RawField, WireType};

/// The elements of one header field.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Signed(Vec<i64>),
    Unsigned(Vec<u64>),
    Float(Vec<f64>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn unsigned(value: u64) -> Self {
        Value::Unsigned(vec![value])
    }

    pub fn signed(value: i64) -> Self {
        Value::Signed(vec![value])
    }

    pub fn text(value: &str) -> Self {
        Value::Bytes(value.as_bytes().to_vec())
    }

    pub fn wire_type(&self) -> WireType {
        match self {
            Value::Signed(_) => WireType::Signed,
            Value::Unsigned(_) => WireType::Unsigned,
            Value::Float(_) => WireType::Float,
            Value::Bytes(_) => WireType::Bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Signed(v) => v.len(),
            Value::Unsigned(v) => v.len(),
            Value::Float(v) => v.len(),
            Value::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_unsigned(&self) -> Option<&[u64]> {
        match self {
            Value::Unsigned(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_signed(&self) -> Option<&[i64]> {
        match self {
            Value::Signed(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<&[f64]> {
        match self {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Character fields up to the first NUL.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Bytes(v) => Some(trim_nul(v)),
            _ => None,
        }
    }

    /// The zero value of a prototype, used for optional fields missing from a block.
    pub fn zero(proto: &FieldProto) -> Self {
        let count = usize::try_from(proto.count).unwrap_or(0);
        match proto.wire {
            WireType::Signed => Value::Signed(vec![0; count]),
            WireType::Unsigned => Value::Unsigned(vec![0; count]),
            WireType::Float => Value::Float(vec![0.0; count]),
            WireType::Bytes => Value::Bytes(vec![0; count]),
        }
    }

    /// Check that this value can be written with `proto`: same type, same element count (at
    /// most the width for characters) and every element representable in the element width.
    pub fn check(&self, proto: &FieldProto) -> CellstoreResult<()> {
        if self.wire_type() != proto.wire {
            cellstore_bail!(
                Programming: "field {} is {}, got a {} value",
                proto.name,
                proto.wire,
                self.wire_type()
            );
        }
        let count = usize::try_from(proto.count).unwrap_or(usize::MAX);
        let count_ok = match self {
            Value::Bytes(v) => v.len() <= count,
            _ => self.len() == count,
        };
        if !count_ok {
            cellstore_bail!(
                Programming: "field {} holds {} elements, got {}",
                proto.name,
                proto.count,
                self.len()
            );
        }
        let bits = u32::from(proto.elen) * 8;
        let fits = match self {
            Value::Signed(v) => v
                .iter()
                .all(|&x| signed_range(bits).contains(&i128::from(x))),
            Value::Unsigned(v) => v
                .iter()
                .all(|&x| unsigned_range(bits).contains(&i128::from(x))),
            Value::Float(v) => proto.elen == 8 || v.iter().all(|&x| fits_f32(x)),
            Value::Bytes(_) => true,
        };
        if !fits {
            cellstore_bail!(
                Programming: "value {} of field {} does not fit {} byte elements",
                self,
                proto.name,
                proto.elen
            );
        }
        Ok(())
    }

    /// Encode this value as a field of `proto`.
    pub fn encode(&self, proto: &FieldProto) -> CellstoreResult<RawField> {
        self.check(proto)?;
        let elen = usize::from(proto.elen);
        let mut payload = BytesMut::with_capacity(to_usize(proto.payload_len())?);
        match self {
            Value::Signed(v) => v
                .iter()
                .for_each(|x| payload.put_slice(&x.to_le_bytes()[..elen])),
            Value::Unsigned(v) => v
                .iter()
                .for_each(|x| payload.put_slice(&x.to_le_bytes()[..elen])),
            Value::Float(v) => v.iter().for_each(|&x| {
                if elen == 4 {
                    payload.put_f32_le(narrow_f64(x));
                } else {
                    payload.put_f64_le(x);
                }
            }),
            Value::Bytes(v) => {
                payload.put_slice(v);
                payload.put_bytes(0, to_usize(proto.payload_len())? - v.len());
            }
        }
        Ok(RawField {
            name: proto.name.to_string(),
            code: proto.wire.code(),
            scale: proto.scale,
            elen: proto.elen,
            count: proto.count,
            payload: payload.freeze(),
        })
    }

    /// Decode a raw field in its own on-disk representation, without conversion.
    pub fn from_raw(raw: &RawField) -> CellstoreResult<(Self, WireType)> {
        let wire = raw.wire_type().ok_or_else(|| {
            cellstore_err!(SchemaMismatch: "field {} has unknown wire type {}", raw.name, raw.code)
        })?;
        let elen = usize::from(raw.elen);
        let valid_elen = match wire {
            WireType::Signed | WireType::Unsigned => matches!(elen, 1 | 2 | 4 | 8),
            WireType::Float => matches!(elen, 4 | 8),
            WireType::Bytes => true,
        };
        if !valid_elen {
            cellstore_bail!(
                SchemaMismatch: "{} field {} has {} byte elements",
                wire,
                raw.name,
                elen
            );
        }
        let elements = raw.payload.chunks_exact(elen.max(1));
        let value = match wire {
            WireType::Signed => Value::Signed(elements.map(sign_extend).collect()),
            WireType::Unsigned => Value::Unsigned(elements.map(zero_extend).collect()),
            WireType::Float if elen == 4 => Value::Float(
                elements
                    .map(|e| <[u8; 4]>::try_from(e).map_or(0.0, |b| f64::from(f32::from_le_bytes(b))))
                    .collect(),
            ),
            WireType::Float => Value::Float(
                elements
                    .map(|e| f64::from_bits(zero_extend(e)))
                    .collect(),
            ),
            WireType::Bytes => Value::Bytes(raw.payload.to_vec()),
        };
        Ok((value, wire))
    }

    /// Convert an on-disk field into the representation of `proto`.
    ///
    /// Fixed-point values are widened, rescaled by `2^(proto scale - file scale)` (rounding
    /// toward negative infinity when scaling down) and range checked; signed and unsigned
    /// convert into each other when representable. Floats convert between widths, characters
    /// are truncated or NUL padded. Element counts are normalized to the prototype except for
    /// numeric MustMatch fields, whose count takes part in the comparison.
    pub fn convert(raw: &RawField, proto: &FieldProto) -> CellstoreResult<Self> {
        let (value, wire) = Self::from_raw(raw)?;
        if !wire.converts_to(proto.wire) {
            cellstore_bail!(
                SchemaMismatch: "field {} is {} on disk, {} expected",
                proto.name,
                wire,
                proto.wire
            );
        }
        let target = if proto.is_must_match() && proto.wire != WireType::Bytes {
            value.len()
        } else {
            to_usize(u64::from(proto.count))?
        };
        let converted = match value {
            Value::Bytes(mut v) => {
                v.resize(target, 0);
                Value::Bytes(v)
            }
            Value::Float(mut v) => {
                v.resize(target, 0.0);
                Value::Float(v)
            }
            Value::Signed(v) => {
                convert_fixed(v.into_iter().map(i128::from), raw.scale, proto, target)?
            }
            Value::Unsigned(v) => {
                convert_fixed(v.into_iter().map(i128::from), raw.scale, proto, target)?
            }
        };
        Ok(converted)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Signed(v) => write!(f, "[{}]", v.iter().join(", ")),
            Value::Unsigned(v) => write!(f, "[{}]", v.iter().join(", ")),
            Value::Float(v) => write!(f, "[{}]", v.iter().join(", ")),
            Value::Bytes(v) => write!(f, "'{}'", trim_nul(v)),
        }
    }
}

fn convert_fixed(
    values: impl Iterator<Item = i128>,
    file_scale: u8,
    proto: &FieldProto,
    target: usize,
) -> CellstoreResult<Value> {
    let shift = i32::from(proto.scale) - i32::from(file_scale);
    let bits = u32::from(proto.elen) * 8;
    let range = if proto.wire == WireType::Signed {
        signed_range(bits)
    } else {
        unsigned_range(bits)
    };
    let mut scaled = values
        .map(|v| {
            rescale(v, shift)
                .filter(|r| range.contains(r))
                .ok_or_else(|| {
                    cellstore_err!(
                        SchemaMismatch: "value {} at scale {} of field {} does not fit {} {} byte elements at scale {}",
                        v,
                        file_scale,
                        proto.name,
                        proto.wire,
                        proto.elen,
                        proto.scale
                    )
                })
        })
        .collect::<CellstoreResult<Vec<i128>>>()?;
    scaled.resize(target, 0);
    // every element was range checked against the prototype width
    Ok(if proto.wire == WireType::Signed {
        Value::Signed(
            scaled
                .into_iter()
                .map(|v| i64::try_from(v).unwrap_or_default())
                .collect(),
        )
    } else {
        Value::Unsigned(
            scaled
                .into_iter()
                .map(|v| u64::try_from(v).unwrap_or_default())
                .collect(),
        )
    })
}

fn signed_range(bits: u32) -> std::ops::RangeInclusive<i128> {
    let half = 1i128 << (bits - 1);
    -half..=half - 1
}

fn unsigned_range(bits: u32) -> std::ops::RangeInclusive<i128> {
    0..=(1i128 << bits) - 1
}

/// Multiply by `2^shift`, flooring when `shift` is negative. `None` when the result leaves the
/// 64-bit range every field width fits in.
fn rescale(value: i128, shift: i32) -> Option<i128> {
    if shift >= 0 {
        if value == 0 {
            return Some(0);
        }
        if shift >= 64 {
            return None;
        }
        value.checked_mul(1i128 << shift)
    } else {
        Some(value >> shift.unsigned_abs().min(127))
    }
}

fn sign_extend(bytes: &[u8]) -> i64 {
    let mut buf = if bytes.last().is_some_and(|b| b & 0x80 != 0) {
        [0xffu8; 8]
    } else {
        [0u8; 8]
    };
    buf[..bytes.len()].copy_from_slice(bytes);
    i64::from_le_bytes(buf)
}

fn zero_extend(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn fits_f32(value: f64) -> bool {
    value.is_nan() || f64::from(narrow_f64(value)) == value
}

#[allow(clippy::cast_possible_truncation)]
fn narrow_f64(value: f64) -> f32 {
    value as f32
}
