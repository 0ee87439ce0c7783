//! Record layouts for variable-shaped population models.
//!
//! Every entity of a model (region, cell, connection type, connection) owns a record whose
//! fields are optional. Which fields are present is decided at runtime, so byte offsets are
//! assigned by a table-driven allocator:
//!
//! * an [`OrderList`] fixes the allocation sequence of a scope,
//! * a [`LengthTable`] gives each field a fixed or an indirect length,
//! * [`SpecialLengths`] resolves indirect lengths for one allocation pass,
//! * [`allocate`] fills an [`OffsetTable`] and reports the record length and alignment.
//!
//! The [`ScopeComposer`] drives the allocator over a whole [`ModelSpec`] and rolls record
//! lengths up the hierarchy.

mod allocate;
pub mod catalog;
mod compose;
mod field;
mod model;
mod offsets;
mod order;
mod scope;

pub use allocate::*;
pub use compose::*;
pub use field::*;
pub use model::*;
pub use offsets::*;
pub use order::*;
pub use scope::*;
