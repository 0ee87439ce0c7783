use cellstore_error::{CellstoreResult, ResultExt, cellstore_bail, cellstore_err};
use cellstore_io::ByteSink;

use crate::ident::Identification;
use crate::schema::{FieldProto, Schema};
use crate::value::Value;
use crate::wire::RawBlock;

/// A prototype together with the values of one block.
///
/// Values are checked against their prototype when they are set, so a value wider than its
/// field is reported where it is produced rather than when the block is written.
#[derive(Clone, Debug, PartialEq)]
pub struct HeaderInstance<'s> {
    schema: &'s Schema,
    values: Vec<Option<Value>>,
}

impl<'s> HeaderInstance<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            values: vec![None; schema.fields().len()],
        }
    }

    pub(crate) fn from_values(schema: &'s Schema, values: Vec<Option<Value>>) -> Self {
        Self { schema, values }
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    /// Set a field. Character values are NUL padded to the field width, the form they take
    /// when read back.
    pub fn set(&mut self, name: &str, mut value: Value) -> CellstoreResult<&mut Self> {
        let idx = self.schema.position(name).ok_or_else(|| {
            cellstore_err!(Programming: "{} has no field {}", self.schema.kind(), name)
        })?;
        let proto = &self.schema.fields()[idx];
        value
            .check(proto)
            .with_context(|| format!("block {}", self.schema.kind()))?;
        if let Value::Bytes(v) = &mut value {
            v.resize(usize::try_from(proto.count).unwrap_or(v.len()), 0);
        }
        self.values[idx] = Some(value);
        Ok(self)
    }

    pub fn with(mut self, name: &str, value: Value) -> CellstoreResult<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema
            .position(name)
            .and_then(|idx| self.values[idx].as_ref())
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).and_then(Value::as_text)
    }

    pub fn unsigned(&self, name: &str) -> Option<u64> {
        self.get(name)
            .and_then(Value::as_unsigned)
            .and_then(|v| v.first().copied())
    }

    pub fn signed(&self, name: &str) -> Option<i64> {
        self.get(name)
            .and_then(Value::as_signed)
            .and_then(|v| v.first().copied())
    }

    /// A single unsigned value that must fit in a `u32`.
    pub fn unsigned_u32(&self, name: &str) -> CellstoreResult<u32> {
        let value = self
            .unsigned(name)
            .ok_or_else(|| cellstore_err!(SchemaMismatch: "{} has no value for {}", self.schema.kind(), name))?;
        u32::try_from(value).map_err(|_| {
            cellstore_err!(SchemaMismatch: "{}.{} = {} exceeds 32 bits", self.schema.kind(), name, value)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldProto, Option<&Value>)> + '_ {
        self.schema
            .fields()
            .iter()
            .zip(self.values.iter().map(Option::as_ref))
    }

    /// The first MustMatch field whose value differs from `other`'s.
    pub fn must_match_disagreement(&self, other: &HeaderInstance<'_>) -> Option<&'static str> {
        self.schema
            .fields()
            .iter()
            .filter(|proto| proto.is_must_match())
            .find(|proto| self.get(proto.name) != other.get(proto.name))
            .map(|proto| proto.name)
    }

    /// Encode every set field; a required field without a value is an error.
    pub fn encode(&self) -> CellstoreResult<RawBlock> {
        let mut fields = Vec::with_capacity(self.values.len());
        for (proto, value) in self.iter() {
            match value {
                Some(value) => fields.push(value.encode(proto)?),
                None if proto.is_required() => {
                    cellstore_bail!(
                        Programming: "required field {}.{} was never set",
                        self.schema.kind(),
                        proto.name
                    );
                }
                None => {}
            }
        }
        Ok(RawBlock {
            name: self.schema.kind().name().to_string(),
            fields,
        })
    }

    /// Size of the encoded block in bytes. Depends only on which fields are set, never on their
    /// values.
    pub fn encoded_len(&self) -> CellstoreResult<u64> {
        Ok(self.encode()?.encoded_len() as u64)
    }
}

/// Writes the identification header and header blocks to a [`ByteSink`], tracking the file
/// offset.
pub struct BlockWriter<K> {
    sink: K,
    position: u64,
}

impl<K: ByteSink> BlockWriter<K> {
    pub fn new(sink: K) -> Self {
        Self { sink, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write_ident(&mut self, ident: &Identification) -> CellstoreResult<()> {
        let encoded = ident.encode()?;
        self.sink.write_all_from(&encoded)?;
        self.position += encoded.len() as u64;
        Ok(())
    }

    /// Write one block, returning the offset it starts at.
    pub fn write_header(&mut self, header: &HeaderInstance<'_>) -> CellstoreResult<u64> {
        let start = self.position;
        self.position += header.encode()?.write(&mut self.sink)?;
        log::trace!(
            "wrote {} block at offset {}",
            header.schema().kind(),
            start
        );
        Ok(start)
    }

    /// Write payload bytes following the headers.
    pub fn write_payload(&mut self, bytes: &[u8]) -> CellstoreResult<()> {
        self.sink.write_all_from(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn into_inner(self) -> K {
        self.sink
    }
}

impl<K: ByteSink> ByteSink for BlockWriter<K> {
    fn write_all_from(&mut self, buf: &[u8]) -> CellstoreResult<()> {
        self.write_payload(buf)
    }
}
