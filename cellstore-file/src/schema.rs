//! Canonical prototypes of the header blocks.
//!
//! One [`Schema`] per [`BlockKind`] is used both to write blocks and to validate what is read
//! back. A schema may gain fields over time; readers default missing optional fields and skip
//! fields they do not know.

use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

use cellstore_error::{CellstoreExpect, CellstoreResult, cellstore_bail};
use cellstore_layout::{FieldCatalog, NAME_WIDTH, Scope};
use serde::{Deserialize, Serialize};

use crate::wire::{WIRE_NAME_WIDTH, WireType};

/// Field names shared by several blocks.
pub mod names {
    pub const NAME: &str = "NAME";
    pub const REGION: &str = "REGION";
    pub const CELL: &str = "CELL";
    pub const SRCREG: &str = "SRCREG";
    pub const SRCCELL: &str = "SRCCELL";
    pub const ORDINAL: &str = "ORDINAL";
    pub const COUNT: &str = "COUNT";
    pub const SEEDS: &str = "SEEDS";
    pub const RESTLEN: &str = "RESTLEN";
    pub const DATAOFF: &str = "DATAOFF";
}

/// Flags of a [`FieldProto`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FieldFlags(u8);

impl FieldFlags {
    pub const NONE: FieldFlags = FieldFlags(0);
    /// The field must be present when a block is read.
    pub const REQUIRED: FieldFlags = FieldFlags(1);
    /// The value must agree between file and live entity for a binding to be accepted.
    pub const MUST_MATCH: FieldFlags = FieldFlags(2);

    pub const fn contains(&self, other: FieldFlags) -> bool {
        self.0 & other.0 == other.0
    }

    const fn union(self, other: FieldFlags) -> Self {
        FieldFlags(self.0 | other.0)
    }
}

/// Describes one field of a header block: name, representation and flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldProto {
    pub name: &'static str,
    pub wire: WireType,
    /// Bytes per element.
    pub elen: u16,
    /// Number of elements; for [`WireType::Bytes`] the character width.
    pub count: u32,
    /// Fraction bits of fixed-point values.
    pub scale: u8,
    pub flags: FieldFlags,
}

impl FieldProto {
    pub const fn new(name: &'static str, wire: WireType, elen: u16, count: u32) -> Self {
        Self {
            name,
            wire,
            elen,
            count,
            scale: 0,
            flags: FieldFlags::NONE,
        }
    }

    pub const fn signed(name: &'static str, elen: u16) -> Self {
        Self::new(name, WireType::Signed, elen, 1)
    }

    pub const fn unsigned(name: &'static str, elen: u16) -> Self {
        Self::new(name, WireType::Unsigned, elen, 1)
    }

    pub const fn text(name: &'static str, width: u32) -> Self {
        Self::new(name, WireType::Bytes, 1, width)
    }

    pub const fn times(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub const fn scaled(mut self, scale: u8) -> Self {
        self.scale = scale;
        self
    }

    pub const fn required(mut self) -> Self {
        self.flags = self.flags.union(FieldFlags::REQUIRED);
        self
    }

    /// MustMatch fields take part in binding and are therefore also required.
    pub const fn must_match(mut self) -> Self {
        self.flags = self
            .flags
            .union(FieldFlags::REQUIRED)
            .union(FieldFlags::MUST_MATCH);
        self
    }

    pub fn is_required(&self) -> bool {
        self.flags.contains(FieldFlags::REQUIRED)
    }

    pub fn is_must_match(&self) -> bool {
        self.flags.contains(FieldFlags::MUST_MATCH)
    }

    pub fn payload_len(&self) -> u64 {
        u64::from(self.elen) * u64::from(self.count)
    }
}

/// The kinds of header blocks, in the order they appear in a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    File,
    Region,
    Cells,
    Conns,
    /// Geometric connections.
    Gconn,
    /// Modulatory connections.
    Modul,
    End,
}

impl BlockKind {
    pub const ALL: [BlockKind; 7] = [
        BlockKind::File,
        BlockKind::Region,
        BlockKind::Cells,
        BlockKind::Conns,
        BlockKind::Gconn,
        BlockKind::Modul,
        BlockKind::End,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::File => "FILE",
            BlockKind::Region => "REGION",
            BlockKind::Cells => "CELLS",
            BlockKind::Conns => "CONNS",
            BlockKind::Gconn => "GCONN",
            BlockKind::Modul => "MODUL",
            BlockKind::End => "END",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// The canonical schema of this block kind.
    pub fn schema(&self) -> &'static Schema {
        match self {
            BlockKind::File => &FILE,
            BlockKind::Region => &REGION,
            BlockKind::Cells => &CELLS,
            BlockKind::Conns => &CONNS,
            BlockKind::Gconn => &GCONN,
            BlockKind::Modul => &MODUL,
            BlockKind::End => &END,
        }
    }
}

impl Display for BlockKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The prototype of one block kind: an ordered list of field descriptors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    kind: BlockKind,
    fields: Vec<FieldProto>,
}

impl Schema {
    pub fn try_new(kind: BlockKind, fields: Vec<FieldProto>) -> CellstoreResult<Self> {
        for (idx, field) in fields.iter().enumerate() {
            if field.name.is_empty() || field.name.len() > WIRE_NAME_WIDTH {
                cellstore_bail!(
                    Programming: "field name '{}' in {} must be 1 to {} bytes",
                    field.name,
                    kind,
                    WIRE_NAME_WIDTH
                );
            }
            if fields[..idx].iter().any(|f| f.name == field.name) {
                cellstore_bail!(Programming: "field {} appears twice in {}", field.name, kind);
            }
            let valid_elen = match field.wire {
                WireType::Signed | WireType::Unsigned => matches!(field.elen, 1 | 2 | 4 | 8),
                WireType::Float => matches!(field.elen, 4 | 8),
                WireType::Bytes => field.elen == 1,
            };
            if !valid_elen {
                cellstore_bail!(
                    Programming: "{} field {}.{} cannot have {} byte elements",
                    field.wire,
                    kind,
                    field.name,
                    field.elen
                );
            }
        }
        Ok(Self { kind, fields })
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn fields(&self) -> &[FieldProto] {
        &self.fields
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldProto> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Replace the descriptor of the same name, producing another version of this schema.
    pub fn with_field(mut self, proto: FieldProto) -> CellstoreResult<Self> {
        match self.position(proto.name) {
            Some(idx) => self.fields[idx] = proto,
            None => self.fields.push(proto),
        }
        Self::try_new(self.kind, self.fields)
    }

    /// Drop a descriptor, producing another version of this schema.
    pub fn without_field(mut self, name: &str) -> Self {
        self.fields.retain(|f| f.name != name);
        self
    }
}

fn table_len(scope: Scope) -> u32 {
    u32::try_from(FieldCatalog::standard().scope(scope).len()).unwrap_or(u32::MAX)
}

fn name_width() -> u32 {
    u32::try_from(NAME_WIDTH).unwrap_or(u32::MAX)
}

fn build(kind: BlockKind, fields: Vec<FieldProto>) -> Schema {
    Schema::try_new(kind, fields).cellstore_expect("canonical header schema is valid")
}

/// Global counts, seeds and time step.
pub static FILE: LazyLock<Schema> = LazyLock::new(|| {
    build(
        BlockKind::File,
        vec![
            FieldProto::unsigned("NREGION", 4).required(),
            FieldProto::unsigned("NCELLS", 4).required(),
            FieldProto::unsigned("NCONNS", 4).required(),
            FieldProto::unsigned("NSECOND", 4),
            FieldProto::signed(names::SEEDS, 4).times(2),
            // seconds, 20 fraction bits
            FieldProto::signed("DT", 4).scaled(20),
            FieldProto::unsigned("NODES", 4),
        ],
    )
});

pub static REGION: LazyLock<Schema> = LazyLock::new(|| {
    build(
        BlockKind::Region,
        vec![
            FieldProto::text(names::NAME, name_width()).must_match(),
            FieldProto::unsigned("GRIDX", 4).must_match(),
            FieldProto::unsigned("GRIDY", 4).must_match(),
            FieldProto::unsigned("GRPLEN", 4).required(),
            FieldProto::unsigned("GRPOFF", 4).times(table_len(Scope::Group)),
            FieldProto::unsigned("NCELLS", 4),
        ],
    )
});

pub static CELLS: LazyLock<Schema> = LazyLock::new(|| {
    build(
        BlockKind::Cells,
        vec![
            FieldProto::text(names::REGION, name_width()).must_match(),
            FieldProto::text(names::NAME, name_width()).must_match(),
            FieldProto::unsigned(names::COUNT, 4).must_match(),
            FieldProto::unsigned("RECLEN", 4).required(),
            FieldProto::unsigned(names::RESTLEN, 4).must_match(),
            FieldProto::unsigned("OFFSETS", 4).times(table_len(Scope::Cell)),
            FieldProto::signed(names::SEEDS, 4).times(2),
            FieldProto::signed("AUTOSCL", 4).scaled(16),
            FieldProto::unsigned("HWIDTH", 1).required(),
            FieldProto::unsigned("HPHASE", 1),
            FieldProto::unsigned("HDEPTH", 2).required(),
            FieldProto::unsigned("HISTOFF", 8).required(),
            FieldProto::unsigned(names::DATAOFF, 8).required(),
            FieldProto::unsigned("NCONNT", 2).required(),
        ],
    )
});

pub static CONNS: LazyLock<Schema> = LazyLock::new(|| {
    build(
        BlockKind::Conns,
        vec![
            FieldProto::text(names::REGION, name_width()).must_match(),
            FieldProto::text(names::CELL, name_width()).must_match(),
            FieldProto::text(names::SRCREG, name_width()).must_match(),
            FieldProto::text(names::SRCCELL, name_width()).must_match(),
            FieldProto::unsigned(names::ORDINAL, 2).required(),
            FieldProto::unsigned("MODE", 1).must_match(),
            FieldProto::new("GEOM", WireType::Float, 4, 4),
            FieldProto::unsigned(names::COUNT, 4).must_match(),
            FieldProto::unsigned("STRIDE", 4).required(),
            FieldProto::unsigned(names::RESTLEN, 4).must_match(),
            FieldProto::unsigned("ONCELEN", 4),
            FieldProto::unsigned("RECOFF", 4).required(),
            FieldProto::unsigned("CONNOFF", 4).times(table_len(Scope::Connection)),
            FieldProto::unsigned("ONCEOFF", 4).times(table_len(Scope::ConnType)),
            FieldProto::signed(names::SEEDS, 4).times(2),
            FieldProto::unsigned(names::DATAOFF, 8),
        ],
    )
});

fn secondary(kind: BlockKind) -> Schema {
    build(
        kind,
        vec![
            FieldProto::text(names::REGION, name_width()).must_match(),
            FieldProto::text(names::CELL, name_width()).must_match(),
            FieldProto::text(names::SRCREG, name_width()).must_match(),
            FieldProto::text(names::SRCCELL, name_width()).must_match(),
            FieldProto::unsigned(names::ORDINAL, 2).required(),
            FieldProto::unsigned(names::COUNT, 4).must_match(),
        ],
    )
}

pub static GCONN: LazyLock<Schema> = LazyLock::new(|| secondary(BlockKind::Gconn));

pub static MODUL: LazyLock<Schema> = LazyLock::new(|| secondary(BlockKind::Modul));

/// Terminates the header section.
pub static END: LazyLock<Schema> = LazyLock::new(|| {
    build(
        BlockKind::End,
        vec![FieldProto::unsigned("DATAPOS", 8).required()],
    )
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_valid_schema() {
        for kind in BlockKind::ALL {
            let schema = kind.schema();
            assert_eq!(schema.kind(), kind);
            assert!(!schema.fields().is_empty());
            assert_eq!(BlockKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn must_match_implies_required() {
        let count = CELLS.field(names::COUNT).unwrap();
        assert!(count.is_must_match());
        assert!(count.is_required());
        let seeds = CELLS.field(names::SEEDS).unwrap();
        assert!(!seeds.is_required());
    }

    #[test]
    fn offset_tables_follow_the_catalog() {
        let catalog = FieldCatalog::standard();
        assert_eq!(
            CELLS.field("OFFSETS").unwrap().count as usize,
            catalog.scope(Scope::Cell).len()
        );
        assert_eq!(
            CONNS.field("CONNOFF").unwrap().count as usize,
            catalog.scope(Scope::Connection).len()
        );
    }

    #[test]
    fn invalid_prototypes_are_rejected() {
        assert!(
            Schema::try_new(BlockKind::End, vec![FieldProto::signed("ODD", 3)]).is_err()
        );
        assert!(
            Schema::try_new(
                BlockKind::End,
                vec![FieldProto::signed("A", 4), FieldProto::unsigned("A", 4)]
            )
            .is_err()
        );
        assert!(
            Schema::try_new(BlockKind::End, vec![FieldProto::signed("TOOLONGNAME", 4)]).is_err()
        );
    }

    #[test]
    fn schema_versions() {
        let old = CELLS
            .clone()
            .with_field(FieldProto::unsigned("RECLEN", 2).required())
            .unwrap();
        assert_eq!(old.field("RECLEN").unwrap().elen, 2);
        assert_eq!(old.fields().len(), CELLS.fields().len());
        let older = old.without_field("AUTOSCL");
        assert!(older.field("AUTOSCL").is_none());
    }
}
