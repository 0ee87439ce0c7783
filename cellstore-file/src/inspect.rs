use std::fmt::{Display, Formatter};

use cellstore_error::CellstoreResult;
use cellstore_io::ByteSource;

use crate::ident::Identification;
use crate::reader::BlockReader;
use crate::value::Value;
use crate::wire::{RawBlock, WireType};

/// One field of a block as found on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct InspectedField {
    pub name: String,
    pub code: u8,
    pub scale: u8,
    pub elen: u16,
    pub count: u32,
    /// `None` when the field cannot be interpreted by this version.
    pub value: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InspectedBlock {
    pub name: String,
    pub offset: u64,
    pub length: u64,
    pub fields: Vec<InspectedField>,
}

/// Everything a save file says about itself, decoded without a model.
#[derive(Clone, Debug, PartialEq)]
pub struct Inspection {
    pub ident: Identification,
    pub blocks: Vec<InspectedBlock>,
    pub data_start: u64,
}

fn inspect_block(raw: &RawBlock, offset: u64) -> InspectedBlock {
    InspectedBlock {
        name: raw.name.clone(),
        offset,
        length: raw.encoded_len() as u64,
        fields: raw
            .fields
            .iter()
            .map(|field| InspectedField {
                name: field.name.clone(),
                code: field.code,
                scale: field.scale,
                elen: field.elen,
                count: field.count,
                value: Value::from_raw(field).ok().map(|(value, _)| value),
            })
            .collect(),
    }
}

/// Decode every header block of a save file.
pub fn inspect<S: ByteSource>(source: S) -> CellstoreResult<Inspection> {
    let mut reader = BlockReader::open(source)?;
    let mut blocks = Vec::new();
    loop {
        let offset = reader.position();
        let Some(raw) = reader.next_block()? else {
            break;
        };
        blocks.push(inspect_block(&raw, offset));
    }
    Ok(Inspection {
        ident: reader.ident().clone(),
        blocks,
        data_start: reader.position(),
    })
}

impl Display for Inspection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "title:     {}", self.ident.title)?;
        writeln!(f, "written:   {}", self.ident.timestamp)?;
        writeln!(f, "label:     {}", self.ident.label)?;
        writeln!(f, "payload:   from offset {}", self.data_start)?;
        for block in &self.blocks {
            writeln!(
                f,
                "\n{} @ {} ({} bytes)",
                block.name, block.offset, block.length
            )?;
            for field in &block.fields {
                writeln!(f, "  {}", field)?;
            }
        }
        Ok(())
    }
}

impl Display for InspectedField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let wire = WireType::from_code(self.code)
            .map_or_else(|| format!("type {}", self.code), |w| w.to_string());
        let shape = if self.scale > 0 {
            format!("{} {}x{} S{}", wire, self.elen, self.count, self.scale)
        } else {
            format!("{} {}x{}", wire, self.elen, self.count)
        };
        match &self.value {
            Some(value) => write!(f, "{:<8} {:<20} {}", self.name, shape, value),
            None => write!(f, "{:<8} {}", self.name, shape),
        }
    }
}

impl Inspection {
    /// Blocks of one kind, in file order.
    pub fn blocks_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a InspectedBlock> + 'a {
        self.blocks.iter().filter(move |b| b.name == name)
    }
}
