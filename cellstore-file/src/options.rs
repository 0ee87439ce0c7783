use std::collections::BTreeMap;

use cellstore_error::{CellstoreResult, cellstore_bail};
use cellstore_io::DEFAULT_CHUNK_SIZE;

use crate::entity::EntityId;
use crate::ident::{LABEL_WIDTH, TITLE_WIDTH};
use crate::matcher::Pin;

/// Options for writing a save file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOptions {
    title: String,
    label: String,
    chunk_size: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            title: String::new(),
            label: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl WriteOptions {
    /// Configure the run title recorded in the identification header.
    pub fn with_title(mut self, title: impl Into<String>) -> CellstoreResult<Self> {
        let title = title.into();
        if title.len() > TITLE_WIDTH {
            cellstore_bail!(InvalidArgument: "title exceeds {} bytes", TITLE_WIDTH);
        }
        self.title = title;
        Ok(self)
    }

    /// Configure the free-form label recorded in the identification header.
    pub fn with_label(mut self, label: impl Into<String>) -> CellstoreResult<Self> {
        let label = label.into();
        if label.len() > LABEL_WIDTH {
            cellstore_bail!(InvalidArgument: "label exceeds {} bytes", LABEL_WIDTH);
        }
        self.label = label;
        Ok(self)
    }

    /// Configure the size of the chunks workers send their payload in.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> CellstoreResult<Self> {
        if chunk_size == 0 {
            cellstore_bail!(InvalidArgument: "chunk size must be positive");
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Options for restoring a model from save files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreOptions {
    allow_generate: bool,
    chunk_size: usize,
    pins: BTreeMap<EntityId, Pin>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            allow_generate: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            pins: BTreeMap::new(),
        }
    }
}

impl RestoreOptions {
    /// Let entities missing from every file be generated afresh instead of failing the restore.
    pub fn with_allow_generate(mut self, allow_generate: bool) -> Self {
        self.allow_generate = allow_generate;
        self
    }

    /// Configure the size of the chunks payload is fanned out in.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> CellstoreResult<Self> {
        if chunk_size == 0 {
            cellstore_bail!(InvalidArgument: "chunk size must be positive");
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    /// Restore `entity` only from the given file and, optionally, on-disk ordinal.
    ///
    /// Pinning a region or cell population is allowed; connection types follow the file their
    /// cell population was bound to, so a connection pin must name that same file.
    pub fn with_pin(mut self, entity: EntityId, pin: Pin) -> CellstoreResult<Self> {
        if pin.file.is_none() && pin.ordinal.is_some() {
            cellstore_bail!(InvalidArgument: "an ordinal pin for {} needs a file", entity);
        }
        self.pins.insert(entity, pin);
        Ok(self)
    }

    pub fn allow_generate(&self) -> bool {
        self.allow_generate
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn pin(&self, entity: EntityId) -> Pin {
        self.pins.get(&entity).copied().unwrap_or_default()
    }

    /// Check the pins against the number of files being restored from.
    pub(crate) fn validate(&self, files: usize) -> CellstoreResult<()> {
        for (entity, pin) in &self.pins {
            if let Some(file) = pin.file.filter(|&f| f >= files) {
                cellstore_bail!(
                    InvalidArgument: "{} is pinned to file {} of {}",
                    entity,
                    file,
                    files
                );
            }
        }
        Ok(())
    }
}
