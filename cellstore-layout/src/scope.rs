use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use cellstore_error::{CellstoreResult, cellstore_bail, cellstore_err};

use crate::{FieldCode, LengthSpec, LengthTable, OrderEntry, OrderList};

/// The structural levels at which dynamic fields are laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Once per region.
    Group,
    /// Once per cell of a population.
    Cell,
    /// Once per connection type of a cell.
    ConnType,
    /// Once per individual connection.
    Connection,
}

impl Scope {
    pub const ALL: [Scope; 4] = [Scope::Group, Scope::Cell, Scope::ConnType, Scope::Connection];

    /// Whether records of this scope have a restorable prefix.
    pub fn allows_checkpoint(&self) -> bool {
        matches!(self, Scope::Cell | Scope::Connection)
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Group => write!(f, "group"),
            Scope::Cell => write!(f, "cell"),
            Scope::ConnType => write!(f, "connection-type"),
            Scope::Connection => write!(f, "connection"),
        }
    }
}

/// The fixed configuration of one scope: allocation order, lengths and field names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeTable {
    scope: Scope,
    order: OrderList,
    lengths: LengthTable,
    names: Vec<String>,
}

impl ScopeTable {
    pub fn builder(scope: Scope) -> ScopeTableBuilder {
        ScopeTableBuilder {
            scope,
            order: OrderList::default(),
            lengths: LengthTable::default(),
            names: Vec::new(),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn order(&self) -> &OrderList {
        &self.order
    }

    pub fn lengths(&self) -> &LengthTable {
        &self.lengths
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, code: FieldCode) -> Option<&str> {
        self.names.get(code.index()).map(String::as_str)
    }

    pub fn code(&self, name: &str) -> Option<FieldCode> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| u8::try_from(i).ok())
            .map(FieldCode::new)
    }

    /// Resolve field names to codes, rejecting names this scope does not define.
    pub fn codes<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> CellstoreResult<BTreeSet<FieldCode>> {
        names
            .into_iter()
            .map(|name| {
                self.code(name).ok_or_else(|| {
                    cellstore_err!("unknown {} field '{}'", self.scope, name)
                })
            })
            .collect()
    }
}

pub struct ScopeTableBuilder {
    scope: Scope,
    order: OrderList,
    lengths: LengthTable,
    names: Vec<String>,
}

impl ScopeTableBuilder {
    /// Append a field to the order list, assigning it the next code.
    pub fn field(mut self, name: impl Into<String>, length: LengthSpec) -> Self {
        let code = self.lengths.push(length);
        self.order.push(OrderEntry::Field(code));
        self.names.push(name.into());
        self
    }

    /// Append the restorable-prefix marker.
    pub fn checkpoint(mut self) -> Self {
        self.order.push(OrderEntry::Checkpoint);
        self
    }

    pub fn build(self) -> CellstoreResult<ScopeTable> {
        if self.names.len() > u8::MAX as usize {
            cellstore_bail!(
                Programming: "{} scope defines {} fields, at most {} are addressable",
                self.scope,
                self.names.len(),
                u8::MAX
            );
        }
        let checkpoints = self
            .order
            .iter()
            .filter(|e| matches!(e, OrderEntry::Checkpoint))
            .count();
        if checkpoints > 1 {
            cellstore_bail!(Programming: "{} order list has {} checkpoints", self.scope, checkpoints);
        }
        if checkpoints == 1 && !self.scope.allows_checkpoint() {
            cellstore_bail!(Programming: "{} records have no restorable prefix", self.scope);
        }
        let mut seen = BTreeSet::new();
        for name in &self.names {
            if !seen.insert(name.as_str()) {
                cellstore_bail!(Programming: "{} field '{}' defined twice", self.scope, name);
            }
        }
        Ok(ScopeTable {
            scope: self.scope,
            order: self.order,
            lengths: self.lengths,
            names: self.names,
        })
    }
}

/// The four scope tables of a model build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldCatalog {
    group: ScopeTable,
    cell: ScopeTable,
    conn_type: ScopeTable,
    connection: ScopeTable,
}

impl FieldCatalog {
    pub fn try_new(
        group: ScopeTable,
        cell: ScopeTable,
        conn_type: ScopeTable,
        connection: ScopeTable,
    ) -> CellstoreResult<Self> {
        for (table, expected) in [
            (&group, Scope::Group),
            (&cell, Scope::Cell),
            (&conn_type, Scope::ConnType),
            (&connection, Scope::Connection),
        ] {
            if table.scope() != expected {
                cellstore_bail!(
                    Programming: "{} table supplied as the {} table",
                    table.scope(),
                    expected
                );
            }
        }
        Ok(Self {
            group,
            cell,
            conn_type,
            connection,
        })
    }

    pub fn scope(&self, scope: Scope) -> &ScopeTable {
        match scope {
            Scope::Group => &self.group,
            Scope::Cell => &self.cell,
            Scope::ConnType => &self.conn_type,
            Scope::Connection => &self.connection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assigns_codes_in_order() {
        let table = ScopeTable::builder(Scope::Cell)
            .field("VM", LengthSpec::Fixed(4))
            .checkpoint()
            .field("PHASE", LengthSpec::Fixed(1))
            .build()
            .unwrap();
        assert_eq!(table.code("VM"), Some(FieldCode::new(0)));
        assert_eq!(table.code("PHASE"), Some(FieldCode::new(1)));
        assert_eq!(table.name(FieldCode::new(1)), Some("PHASE"));
        assert!(table.order().has_checkpoint());
        assert!(table.codes(["VM", "NOPE"]).is_err());
    }

    #[test]
    fn checkpoint_rejected_outside_restorable_scopes() {
        assert!(
            ScopeTable::builder(Scope::Group)
                .checkpoint()
                .build()
                .is_err()
        );
    }

    #[test]
    fn duplicate_names_rejected() {
        assert!(
            ScopeTable::builder(Scope::Connection)
                .field("CIJ", LengthSpec::Fixed(2))
                .field("CIJ", LengthSpec::Fixed(2))
                .build()
                .is_err()
        );
    }
}
