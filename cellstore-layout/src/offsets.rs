use cellstore_error::{CellstoreResult, cellstore_bail};
use itertools::Itertools;

use crate::FieldCode;

/// Marker written on the wire for fields that have no allocated offset.
pub const NOT_ALLOCATED: u32 = u32::MAX;

/// The allocation state of one field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The field is absent from the record.
    #[default]
    NotRequested,
    /// The field was requested and is waiting for an allocation pass.
    Pending,
    /// The field lives at this byte offset from the start of its scope's record.
    At(u32),
}

impl Slot {
    pub fn is_requested(&self) -> bool {
        !matches!(self, Slot::NotRequested)
    }

    pub fn offset(&self) -> Option<u32> {
        match self {
            Slot::At(offset) => Some(*offset),
            _ => None,
        }
    }
}

/// Maps each [`FieldCode`] of a scope to its [`Slot`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct OffsetTable {
    slots: Vec<Slot>,
}

impl OffsetTable {
    /// A table of `len` fields, none of them requested.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![Slot::NotRequested; len],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Mark `code` as requested. A field that already has an offset keeps it until the next
    /// allocation pass.
    pub fn request(&mut self, code: FieldCode) -> CellstoreResult<()> {
        match self.slots.get_mut(code.index()) {
            Some(slot) => {
                if !slot.is_requested() {
                    *slot = Slot::Pending;
                }
                Ok(())
            }
            None => cellstore_bail!(
                Programming: "field {} is outside of an offset table of {} fields",
                code,
                self.slots.len()
            ),
        }
    }

    pub fn slot(&self, code: FieldCode) -> Slot {
        self.slots.get(code.index()).copied().unwrap_or_default()
    }

    pub fn is_requested(&self, code: FieldCode) -> bool {
        self.slot(code).is_requested()
    }

    pub fn offset(&self, code: FieldCode) -> Option<u32> {
        self.slot(code).offset()
    }

    pub(crate) fn set(&mut self, code: FieldCode, slot: Slot) {
        if let Some(s) = self.slots.get_mut(code.index()) {
            *s = slot;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldCode, Slot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (FieldCode::new(u8::try_from(i).unwrap_or(u8::MAX)), *slot))
    }

    /// Offsets in wire form, with [`NOT_ALLOCATED`] for absent fields.
    ///
    /// Pending fields have no offset yet and are written as absent.
    pub fn to_wire(&self) -> Vec<u32> {
        self.slots
            .iter()
            .map(|slot| slot.offset().unwrap_or(NOT_ALLOCATED))
            .collect()
    }

    /// Rebuild a table from its wire form.
    pub fn from_wire(offsets: &[u32]) -> Self {
        Self {
            slots: offsets
                .iter()
                .map(|&offset| {
                    if offset == NOT_ALLOCATED {
                        Slot::NotRequested
                    } else {
                        Slot::At(offset)
                    }
                })
                .collect(),
        }
    }

    /// The allocated fields ordered by offset.
    pub fn allocated(&self) -> Vec<(FieldCode, u32)> {
        self.iter()
            .filter_map(|(code, slot)| slot.offset().map(|offset| (code, offset)))
            .sorted_by_key(|(_, offset)| *offset)
            .collect()
    }
}
