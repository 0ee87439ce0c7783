//! The field catalog of the standard model build.
//!
//! Each scope lists its optional fields in descending order of typical size. The cell and
//! per-connection scopes put the fields that survive a save/restore cycle before their
//! checkpoint; everything after it is recomputed on restore.

use std::sync::LazyLock;

use cellstore_error::{CellstoreExpect, CellstoreResult};

use crate::{FieldCatalog, LengthSpec, Scope, ScopeTable, SpecialKey};

/// Bytes of region-level response terms.
pub const GROUP_ALPHA_TERMS: SpecialKey = SpecialKey::new(0);
/// Bytes of per-cell conductance state.
pub const CELL_CONDUCTANCES: SpecialKey = SpecialKey::new(1);
/// Bytes of per-connection-type summation terms.
pub const CONN_SUM_TERMS: SpecialKey = SpecialKey::new(2);
/// Bytes of the per-connection delay queue.
pub const CONN_DELAY_QUEUE: SpecialKey = SpecialKey::new(3);

static STANDARD: LazyLock<FieldCatalog> = LazyLock::new(|| {
    standard_catalog().cellstore_expect("the standard field catalog is well formed")
});

impl FieldCatalog {
    /// The catalog shared by every entity of the standard model build.
    pub fn standard() -> &'static FieldCatalog {
        &STANDARD
    }
}

fn standard_catalog() -> CellstoreResult<FieldCatalog> {
    use LengthSpec::{Fixed, Indirect};

    let group = ScopeTable::builder(Scope::Group)
        .field("GSTATE", Fixed(8))
        .field("GNOISE", Fixed(4))
        .field("GALPHA", Indirect(GROUP_ALPHA_TERMS))
        .field("GINHIB", Fixed(2))
        .field("GFLAGS", Fixed(1))
        .build()?;

    let cell = ScopeTable::builder(Scope::Cell)
        .field("IZVU", Fixed(8))
        .field("NSEED", Fixed(4))
        .field("DEPR", Fixed(4))
        .field("GCOND", Indirect(CELL_CONDUCTANCES))
        .field("SBAR", Fixed(2))
        .field("QBAR", Fixed(2))
        .field("PHASE", Fixed(1))
        .checkpoint()
        .field("XYZ", Fixed(12))
        .field("RFRC", Fixed(2))
        .build()?;

    let conn_type = ScopeTable::builder(Scope::ConnType)
        .field("AEFF", Fixed(8))
        .field("NUK", Fixed(4))
        .field("CSUMS", Indirect(CONN_SUM_TERMS))
        .field("ASRC", Fixed(2))
        .build()?;

    let connection = ScopeTable::builder(Scope::Connection)
        .field("CIJ", Fixed(2))
        .field("CIJ0", Fixed(2))
        .field("MIJ", Fixed(2))
        .field("PPF", Fixed(2))
        .field("DLY", Fixed(1))
        .checkpoint()
        .field("LIJ", Fixed(4))
        .field("RBAR", Fixed(2))
        .field("DLYQ", Indirect(CONN_DELAY_QUEUE))
        .build()?;

    FieldCatalog::try_new(group, cell, conn_type, connection)
}
