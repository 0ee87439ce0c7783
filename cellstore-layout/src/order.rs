use crate::FieldCode;

/// One step of an [`OrderList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OrderEntry {
    Field(FieldCode),
    /// Records the cumulative record length reached so far: everything before this marker is
    /// the restorable prefix of the record.
    Checkpoint,
}

/// The fixed allocation order of a scope's fields, descending by typical size.
///
/// The end of the list terminates allocation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct OrderList(Vec<OrderEntry>);

impl OrderList {
    pub fn new(entries: Vec<OrderEntry>) -> Self {
        Self(entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrderEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_checkpoint(&self) -> bool {
        self.0.contains(&OrderEntry::Checkpoint)
    }

    pub(crate) fn push(&mut self, entry: OrderEntry) {
        self.0.push(entry);
    }

    /// The field codes of the list, in allocation order.
    pub fn fields(&self) -> impl Iterator<Item = FieldCode> + '_ {
        self.0.iter().filter_map(|entry| match entry {
            OrderEntry::Field(code) => Some(*code),
            OrderEntry::Checkpoint => None,
        })
    }
}

impl FromIterator<OrderEntry> for OrderList {
    fn from_iter<T: IntoIterator<Item = OrderEntry>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
