//! Save and restore the state of a cell simulation.
//!
//! A save file is self-describing. After a fixed-size identification header it holds one
//! header block per saved entity, each a list of named, typed fields, followed by an `END`
//! block and then the bulk payload. Readers never rely on block order or field order: a header
//! is decoded against the schema of its block kind, unknown fields are skipped and missing
//! optional fields take their defaults. This lets a model restore from files written by older
//! or newer versions, or by a model whose cell types have gained or lost fields.
//!
//! # Restoring
//!
//! [`Restorer`] matches every live entity against the blocks of one or more save files by
//! name, with optional pins to a file or an ordinal, in the order regions, cell types,
//! connection types. Entities that find no block are either an error or left to be generated
//! fresh, depending on [`RestoreOptions`]. The result is a [`RestoreReport`] listing where each
//! entity came from.
//!
//! # File Format
//!
//! ```text
//! ┌────────────────────────────┐
//! │  Identification (160 B)    │
//! │ version token, title, date │
//! ├────────────────────────────┤
//! │  FILE block (global state) │
//! ├────────────────────────────┤
//! │  REGION, CELLS, CONNS,     │
//! │  GCONN, MODUL blocks       │
//! ├────────────────────────────┤
//! │  END block (payload start) │
//! ├────────────────────────────┤
//! │  per cell type: histories, │
//! │  then records              │
//! └────────────────────────────┘
//! ```
//!
//! Every block starts with an 8 byte name and a little-endian u32 length; every field with
//! an 8 byte name, a wire type code, a scale, an element length and an element count.

#[cfg(test)]
mod tests;

mod entity;
mod history;
mod ident;
mod inspect;
mod live;
mod matcher;
mod mover;
mod options;
mod reader;
mod restore;
mod save;
pub mod schema;
mod value;
mod wire;
mod writer;

use cellstore_error::{CellstoreResult, cellstore_err};
pub use entity::*;
pub use forever_constant::*;
pub use history::*;
pub use ident::*;
pub use inspect::*;
pub use live::*;
pub use matcher::*;
pub use mover::*;
pub use options::*;
pub use reader::*;
pub use restore::*;
pub use save::*;
pub use schema::{BlockKind, FieldFlags, FieldProto, Schema};
pub use value::*;
pub use wire::*;
pub use writer::*;

pub(crate) fn to_usize(value: u64) -> CellstoreResult<usize> {
    usize::try_from(value)
        .map_err(|_| cellstore_err!(Overflow: "{} bytes exceed the address space", value))
}

/// Constants that will never change (i.e., doing so would break reading old save files)
mod forever_constant {
    /// The extension for save files
    pub const SAVE_FILE_EXTENSION: &str = "csave";

    /// The token every save file starts with, ending in the format version
    pub const VERSION_TOKEN: [u8; 8] = *b"CSAVE\0\0\x01";

    /// The size of the identification header in bytes
    pub const IDENT_SIZE: usize = 160;

}
