use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use cellstore_error::{CellstoreResult, cellstore_bail, cellstore_err};
use serde::{Deserialize, Serialize};

/// Identifies one optional field within one [`crate::Scope`].
///
/// Codes are dense indices into the scope's [`LengthTable`] and [`crate::OffsetTable`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FieldCode(u8);

impl FieldCode {
    pub const fn new(code: u8) -> Self {
        Self(code)
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for FieldCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Key of a [`SpecialLengths`] slot, used by [`LengthSpec::Indirect`] entries.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SpecialKey(u8);

impl SpecialKey {
    pub const fn new(key: u8) -> Self {
        Self(key)
    }
}

impl Display for SpecialKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "special[{}]", self.0)
    }
}

/// How the byte length of a field is determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LengthSpec {
    /// A static length in bytes.
    Fixed(u32),
    /// A length that depends on runtime counts and is looked up in the [`SpecialLengths`]
    /// supplied to the allocation pass.
    Indirect(SpecialKey),
}

impl LengthSpec {
    pub fn is_fixed(&self) -> bool {
        matches!(self, LengthSpec::Fixed(_))
    }
}

/// Maps each [`FieldCode`] of a scope to its [`LengthSpec`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LengthTable(Vec<LengthSpec>);

impl LengthTable {
    pub fn new(lengths: Vec<LengthSpec>) -> Self {
        Self(lengths)
    }

    pub fn get(&self, code: FieldCode) -> CellstoreResult<LengthSpec> {
        self.0
            .get(code.index())
            .copied()
            .ok_or_else(|| cellstore_err!(Programming: "field {} has no length table entry", code))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, spec: LengthSpec) -> FieldCode {
        let code = FieldCode::new(u8::try_from(self.0.len()).unwrap_or(u8::MAX));
        self.0.push(spec);
        code
    }
}

/// The Special-Length Table: byte lengths of indirect fields, populated for each allocation
/// pass from the runtime counts of the entity being laid out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecialLengths(BTreeMap<SpecialKey, u32>);

impl SpecialLengths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: SpecialKey, length: u32) -> Self {
        self.insert(key, length);
        self
    }

    pub fn insert(&mut self, key: SpecialKey, length: u32) {
        self.0.insert(key, length);
    }

    pub fn get(&self, key: SpecialKey) -> Option<u32> {
        self.0.get(&key).copied()
    }

    /// Resolve a length entry to a byte length.
    ///
    /// An indirect entry whose slot has not been populated is a programming error: the caller
    /// must populate every key used at a scope before allocating it.
    pub fn resolve(&self, spec: LengthSpec) -> CellstoreResult<u32> {
        match spec {
            LengthSpec::Fixed(length) => Ok(length),
            LengthSpec::Indirect(key) => match self.get(key) {
                Some(length) => Ok(length),
                None => cellstore_bail!(Programming: "{} was not populated before allocation", key),
            },
        }
    }
}

impl FromIterator<(SpecialKey, u32)> for SpecialLengths {
    fn from_iter<T: IntoIterator<Item = (SpecialKey, u32)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
