use cellstore_buffer::trim_nul;
use cellstore_error::{CellstoreResult, ResultExt, cellstore_bail};
use cellstore_io::{ByteSource, Tracked};

use crate::ident::Identification;
use crate::schema::{BlockKind, Schema};
use crate::value::Value;
use crate::wire::RawBlock;
use crate::writer::HeaderInstance;

/// Streams the header blocks of a save file of any version.
///
/// The reader stops after the `END` block; the underlying source is then positioned at the
/// first payload byte and can be taken back with [`BlockReader::into_source`].
pub struct BlockReader<S> {
    source: Tracked<S>,
    ident: Identification,
    finished: bool,
}

impl<S: ByteSource> BlockReader<S> {
    /// Read and check the identification header.
    pub fn open(source: S) -> CellstoreResult<Self> {
        let mut source = Tracked::new(source);
        let ident = Identification::read(&mut source)?;
        log::debug!(
            "opened save file '{}' written {} ({})",
            ident.title,
            ident.timestamp,
            ident.label
        );
        Ok(Self {
            source,
            ident,
            finished: false,
        })
    }

    pub fn ident(&self) -> &Identification {
        &self.ident
    }

    /// The next block, or `None` once the `END` block has been read.
    pub fn next_block(&mut self) -> CellstoreResult<Option<RawBlock>> {
        if self.finished {
            return Ok(None);
        }
        let offset = self.source.position();
        let block = RawBlock::read(&mut self.source)?;
        log::trace!(
            "read {} block at offset {} with {} fields",
            block.name,
            offset,
            block.fields.len()
        );
        if block.name == BlockKind::End.name() {
            self.finished = true;
        }
        Ok(Some(block))
    }

    pub fn position(&self) -> u64 {
        self.source.position()
    }

    pub fn into_source(self) -> Tracked<S> {
        self.source
    }
}

/// Convert a raw block into the representation of `schema`.
///
/// Unknown fields are skipped, missing optional fields take their zero value and a missing
/// required field is a schema mismatch.
pub fn decode_block<'s>(raw: &RawBlock, schema: &'s Schema) -> CellstoreResult<HeaderInstance<'s>> {
    let mut values: Vec<Option<Value>> = vec![None; schema.fields().len()];
    for field in &raw.fields {
        let Some(idx) = schema.position(&field.name) else {
            log::trace!("skipping unknown field {}.{}", raw.name, field.name);
            continue;
        };
        if values[idx].is_some() {
            log::debug!("ignoring repeated field {}.{}", raw.name, field.name);
            continue;
        }
        let proto = &schema.fields()[idx];
        let value = Value::convert(field, proto)
            .with_context(|| format!("field {}.{}", raw.name, field.name))?;
        values[idx] = Some(value);
    }
    for (proto, value) in schema.fields().iter().zip(values.iter_mut()) {
        if value.is_none() {
            if proto.is_required() {
                cellstore_bail!(
                    SchemaMismatch: "required field {}.{} is missing",
                    raw.name,
                    proto.name
                );
            }
            *value = Some(Value::zero(proto));
        }
    }
    Ok(HeaderInstance::from_values(schema, values))
}

/// Read a character field straight from a raw block, without validating the rest of it.
pub fn raw_text(raw: &RawBlock, name: &str) -> Option<String> {
    raw.field(name)
        .filter(|f| f.elen == 1)
        .map(|f| trim_nul(&f.payload))
}

/// Read an unsigned field straight from a raw block, without validating the rest of it.
pub fn raw_unsigned(raw: &RawBlock, name: &str) -> Option<u64> {
    raw.field(name)
        .and_then(|f| Value::from_raw(f).ok())
        .and_then(|(value, _)| match value {
            Value::Unsigned(v) => v.first().copied(),
            Value::Signed(v) => v.first().and_then(|&x| u64::try_from(x).ok()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use cellstore_io::IoSource;

    use super::*;
    use crate::schema::{FieldProto, names};
    use crate::wire::RawField;

    fn end_block(pos: u64) -> HeaderInstance<'static> {
        HeaderInstance::new(BlockKind::End.schema())
            .with("DATAPOS", Value::unsigned(pos))
            .unwrap()
    }

    #[test]
    fn reads_until_end() {
        let mut file = Vec::new();
        let ident = Identification::now("t", "l").unwrap();
        ident.write(&mut file).unwrap();
        let file_block = HeaderInstance::new(BlockKind::File.schema())
            .with("NREGION", Value::unsigned(1))
            .unwrap()
            .with("NCELLS", Value::unsigned(2))
            .unwrap()
            .with("NCONNS", Value::unsigned(3))
            .unwrap();
        file_block.encode().unwrap().write(&mut file).unwrap();
        end_block(99).encode().unwrap().write(&mut file).unwrap();
        file.extend_from_slice(b"payload");

        let mut reader = BlockReader::open(IoSource::new(&file[..])).unwrap();
        assert_eq!(reader.ident(), &ident);
        let first = reader.next_block().unwrap().unwrap();
        let decoded = decode_block(&first, BlockKind::File.schema()).unwrap();
        assert_eq!(decoded.unsigned("NCONNS"), Some(3));
        // optional fields default to zero
        assert_eq!(decoded.get(names::SEEDS), Some(&Value::Signed(vec![0, 0])));
        let end = reader.next_block().unwrap().unwrap();
        assert_eq!(end.name, "END");
        assert!(reader.next_block().unwrap().is_none());
        let position = reader.position();
        let mut source = reader.into_source();
        assert_eq!(source.read_vec(7).unwrap(), b"payload");
        assert_eq!(source.position(), position + 7);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut raw = end_block(5).encode().unwrap();
        raw.fields.insert(
            0,
            RawField {
                name: "FUTURE".to_string(),
                code: 77,
                scale: 0,
                elen: 3,
                count: 1,
                payload: bytes::Bytes::from_static(b"abc"),
            },
        );
        let decoded = decode_block(&raw, BlockKind::End.schema()).unwrap();
        assert_eq!(decoded.unsigned("DATAPOS"), Some(5));
    }

    #[test]
    fn missing_required_field_is_a_mismatch() {
        let schema = Schema::try_new(BlockKind::End, vec![FieldProto::unsigned("OTHER", 4)]).unwrap();
        let raw = HeaderInstance::new(&schema)
            .with("OTHER", Value::unsigned(1))
            .unwrap()
            .encode()
            .unwrap();
        let err = decode_block(&raw, BlockKind::End.schema()).unwrap_err();
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn raw_accessors_ignore_the_schema() {
        let raw = HeaderInstance::new(BlockKind::Conns.schema())
            .with(names::REGION, Value::text("v1"))
            .unwrap()
            .with(names::ORDINAL, Value::unsigned(2))
            .unwrap();
        let raw = RawBlock {
            name: "CONNS".to_string(),
            fields: raw
                .iter()
                .filter_map(|(proto, value)| value.map(|v| v.encode(proto).unwrap()))
                .collect(),
        };
        assert_eq!(raw_text(&raw, names::REGION).unwrap(), "v1");
        assert_eq!(raw_unsigned(&raw, names::ORDINAL), Some(2));
        assert_eq!(raw_unsigned(&raw, names::COUNT), None);
    }
}
