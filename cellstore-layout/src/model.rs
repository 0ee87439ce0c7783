//! Structural description of a population model.
//!
//! The model layer decides which optional fields each entity needs and supplies the runtime
//! counts behind indirect lengths; the composer only consumes these answers.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::path::Path;

use cellstore_error::{CellstoreResult, ResultExt, cellstore_bail, cellstore_err};
use serde::{Deserialize, Serialize};

use crate::{FieldCode, ScopeTable, SpecialLengths};

/// Width of every name field on disk; longer names are rejected when a model is validated.
pub const NAME_WIDTH: usize = 16;

/// The "is this field requested" predicate supplied by the model layer.
pub trait FieldRequests {
    fn is_requested(&self, code: FieldCode) -> bool;
}

impl FieldRequests for BTreeSet<FieldCode> {
    fn is_requested(&self, code: FieldCode) -> bool {
        self.contains(&code)
    }
}

impl FieldRequests for [FieldCode] {
    fn is_requested(&self, code: FieldCode) -> bool {
        self.contains(&code)
    }
}

/// Adapts a closure into a [`FieldRequests`] predicate.
pub struct RequestFn<F>(pub F);

impl<F: Fn(FieldCode) -> bool> FieldRequests for RequestFn<F> {
    fn is_requested(&self, code: FieldCode) -> bool {
        (self.0)(code)
    }
}

/// A set of requested fields, named as in the scope's catalog table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSelection(BTreeSet<String>);

impl FieldSelection {
    pub fn resolve(&self, table: &ScopeTable) -> CellstoreResult<BTreeSet<FieldCode>> {
        table.codes(self.0.iter().map(String::as_str))
    }
}

impl<S: Into<String>> FromIterator<S> for FieldSelection {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Option flags queried from the model layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// Keep the state history at 16-bit resolution instead of 8-bit.
    pub wide_history: bool,
    /// Keep a phase byte next to every history value.
    pub history_phase: bool,
}

/// How the connections of a connection type are generated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    Uniform,
    Gaussian,
    Topographic,
    Matrix,
    External,
}

impl GenerationMode {
    pub fn code(&self) -> u8 {
        match self {
            GenerationMode::Uniform => 1,
            GenerationMode::Gaussian => 2,
            GenerationMode::Topographic => 3,
            GenerationMode::Matrix => 4,
            GenerationMode::External => 5,
        }
    }

    pub fn from_code(code: u8) -> CellstoreResult<Self> {
        Ok(match code {
            1 => GenerationMode::Uniform,
            2 => GenerationMode::Gaussian,
            3 => GenerationMode::Topographic,
            4 => GenerationMode::Matrix,
            5 => GenerationMode::External,
            _ => cellstore_bail!("unknown connection generation mode {}", code),
        })
    }
}

/// Classes of connections that carry no layout of their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryClass {
    /// Geometric (lateral) connections.
    Geometric,
    /// Modulatory connections.
    Modulatory,
}

/// Names a cell population anywhere in the model.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub region: String,
    pub cell: String,
}

impl SourceRef {
    pub fn new(region: impl Into<String>, cell: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            cell: cell.into(),
        }
    }
}

impl Display for SourceRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.region, self.cell)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub options: ModelOptions,
    pub regions: Vec<RegionSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub name: String,
    #[serde(default)]
    pub grid: [u32; 2],
    #[serde(default)]
    pub group: FieldSelection,
    #[serde(default)]
    pub specials: SpecialLengths,
    #[serde(default)]
    pub cells: Vec<CellSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CellSpec {
    pub name: String,
    pub count: u32,
    #[serde(default)]
    pub fields: FieldSelection,
    #[serde(default)]
    pub specials: SpecialLengths,
    /// Number of past states kept per cell.
    #[serde(default)]
    pub history_depth: u16,
    #[serde(default)]
    pub conns: Vec<ConnSpec>,
    #[serde(default)]
    pub secondary: Vec<SecondarySpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnSpec {
    pub source: SourceRef,
    #[serde(default)]
    pub mode: GenerationMode,
    #[serde(default)]
    pub geometry: [f32; 4],
    /// Connections per cell.
    pub count: u32,
    #[serde(default)]
    pub once_fields: FieldSelection,
    #[serde(default)]
    pub fields: FieldSelection,
    #[serde(default)]
    pub specials: SpecialLengths,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondarySpec {
    pub class: SecondaryClass,
    pub source: SourceRef,
    pub count: u32,
}

impl ModelSpec {
    pub fn from_json(json: &str) -> CellstoreResult<Self> {
        let model: ModelSpec = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_path(path: impl AsRef<Path>) -> CellstoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| cellstore_err!("cannot read model {}: {}", path.display(), e))?;
        Self::from_json(&json).with_context(|| format!("model {}", path.display()))
    }

    /// Check names and references: names fit their on-disk field, cell names are unique within
    /// a region, and every connection source exists.
    pub fn validate(&self) -> CellstoreResult<()> {
        let mut regions = BTreeSet::new();
        for region in &self.regions {
            check_name("region", &region.name)?;
            if !regions.insert(region.name.as_str()) {
                cellstore_bail!("region '{}' is defined twice", region.name);
            }
            let mut cells = BTreeSet::new();
            for cell in &region.cells {
                check_name("cell population", &cell.name)?;
                if !cells.insert(cell.name.as_str()) {
                    cellstore_bail!(
                        "cell population '{}' is defined twice in region '{}'",
                        cell.name,
                        region.name
                    );
                }
            }
        }
        for region in &self.regions {
            for cell in &region.cells {
                let sources = cell
                    .conns
                    .iter()
                    .map(|c| &c.source)
                    .chain(cell.secondary.iter().map(|s| &s.source));
                for source in sources {
                    if self.cell(source).is_none() {
                        cellstore_bail!(
                            "{}/{} receives connections from unknown population {}",
                            region.name,
                            cell.name,
                            source
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn cell(&self, source: &SourceRef) -> Option<&CellSpec> {
        self.regions
            .iter()
            .find(|r| r.name == source.region)
            .and_then(|r| r.cells.iter().find(|c| c.name == source.cell))
    }
}

fn check_name(what: &str, name: &str) -> CellstoreResult<()> {
    if name.is_empty() || name.len() > NAME_WIDTH || name.contains('\0') {
        cellstore_bail!(
            "{} name '{}' must be 1 to {} bytes without NUL",
            what,
            name,
            NAME_WIDTH
        );
    }
    Ok(())
}
