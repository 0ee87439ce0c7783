//! Binding live entities to the header blocks of one or more save files.
//!
//! Every entity to restore becomes a [`MatchRequest`] in a [`Worklist`]. Files are visited in
//! order and every block is offered to the pending requests with the same name; the first
//! request whose MustMatch fields all agree with the block is bound to it. Requests pinned to
//! an on-disk ordinal take their blocks first. The rest are wildcards and bind to the remaining
//! blocks in encounter order.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use bit_vec::BitVec;
use cellstore_error::{CellstoreResult, cellstore_bail, cellstore_err};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityName};
use crate::reader::{decode_block, raw_unsigned};
use crate::schema::{BlockKind, names};
use crate::wire::RawBlock;
use crate::writer::HeaderInstance;

/// Restricts which file and which on-disk ordinal an entity may be restored from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    #[serde(default)]
    pub file: Option<usize>,
    #[serde(default)]
    pub ordinal: Option<u32>,
}

impl Pin {
    pub fn file(file: usize) -> Self {
        Self {
            file: Some(file),
            ordinal: None,
        }
    }

    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = Some(ordinal);
        self
    }
}

pub struct MatchRequest {
    pub id: EntityId,
    pub name: EntityName,
    pub pin: Pin,
    /// The file the enclosing cell population was bound to; connection types must come from
    /// the same record.
    pub parent_file: Option<usize>,
    pub live: HeaderInstance<'static>,
}

impl MatchRequest {
    fn kind(&self) -> BlockKind {
        self.live.schema().kind()
    }

    fn accepts(&self, kind: BlockKind, name: &EntityName, file: usize, ordinal: u32) -> bool {
        self.kind() == kind
            && &self.name == name
            && self.pin.file.is_none_or(|f| f == file)
            && self.pin.ordinal.is_none_or(|o| o == ordinal)
            && self.parent_file.is_none_or(|f| f == file)
    }
}

/// A block bound to a request, decoded into the current prototype.
#[derive(Clone, Debug)]
pub struct Binding {
    pub file: usize,
    pub ordinal: u32,
    pub header: HeaderInstance<'static>,
}

/// Where the state of an entity comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    /// Restored from the block with on-disk `ordinal` in file `file`.
    Bound { file: usize, ordinal: u32 },
    /// Not found on disk; the model generates it afresh.
    Generate,
}

impl RestoreStatus {
    pub fn is_bound(&self) -> bool {
        matches!(self, RestoreStatus::Bound { .. })
    }
}

impl Display for RestoreStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreStatus::Bound { file, ordinal } => {
                write!(f, "file {} ordinal {}", file, ordinal)
            }
            RestoreStatus::Generate => write!(f, "generate"),
        }
    }
}

/// The outcome of matching one request.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub id: EntityId,
    pub name: EntityName,
    pub binding: Option<Binding>,
}

impl Resolved {
    pub fn status(&self) -> RestoreStatus {
        match &self.binding {
            Some(b) => RestoreStatus::Bound {
                file: b.file,
                ordinal: b.ordinal,
            },
            None => RestoreStatus::Generate,
        }
    }
}

/// The ordinal a block is pinned by: the connection type index recorded in the block for
/// connection blocks, the position among the file's blocks of its kind otherwise.
pub fn on_disk_ordinal(kind: BlockKind, raw: &RawBlock, sequence: usize) -> u32 {
    match kind {
        BlockKind::Conns | BlockKind::Gconn | BlockKind::Modul => raw_unsigned(raw, names::ORDINAL)
            .and_then(|o| u32::try_from(o).ok())
            .unwrap_or(u32::MAX),
        _ => u32::try_from(sequence).unwrap_or(u32::MAX),
    }
}

/// Which requests a pass over a file offers its blocks to.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Requests pinned to an on-disk ordinal.
    Pinned,
    /// Everything else, in encounter order over the blocks the pinned pass left.
    Wildcard,
}

/// Pending requests of one matching phase, in declaration order.
pub struct Worklist {
    requests: Vec<MatchRequest>,
    pending: Vec<bool>,
    bindings: Vec<Option<Binding>>,
    /// Request indices by the block they look for, in declaration order.
    by_name: BTreeMap<(BlockKind, EntityName), Vec<usize>>,
    /// Blocks already bound, per file and kind, indexed by position among the blocks of the kind.
    bound: BTreeMap<(usize, BlockKind), BitVec>,
}

impl Worklist {
    pub fn new(requests: Vec<MatchRequest>) -> Self {
        let len = requests.len();
        let mut by_name: BTreeMap<(BlockKind, EntityName), Vec<usize>> = BTreeMap::new();
        for (i, request) in requests.iter().enumerate() {
            by_name
                .entry((request.kind(), request.name.clone()))
                .or_default()
                .push(i);
        }
        Self {
            requests,
            pending: vec![true; len],
            bindings: vec![None; len],
            by_name,
            bound: BTreeMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.iter().filter(|p| **p).count()
    }

    fn is_bound(&self, file: usize, kind: BlockKind, sequence: usize) -> bool {
        self.bound
            .get(&(file, kind))
            .and_then(|mask| mask.get(sequence))
            .unwrap_or(false)
    }

    fn mark_bound(&mut self, file: usize, kind: BlockKind, sequence: usize) {
        let mask = self.bound.entry((file, kind)).or_default();
        if mask.len() <= sequence {
            mask.grow(sequence + 1 - mask.len(), false);
        }
        mask.set(sequence, true);
    }

    /// Offer one block to the pending requests of `pass`, returning the index of the request
    /// it bound.
    fn offer(
        &mut self,
        file: usize,
        sequence: usize,
        raw: &RawBlock,
        pass: Pass,
    ) -> CellstoreResult<Option<usize>> {
        let Some(kind) = BlockKind::from_name(&raw.name) else {
            return Ok(None);
        };
        let Some(name) = EntityName::of_block(raw) else {
            return Ok(None);
        };
        if self.is_bound(file, kind, sequence) {
            return Ok(None);
        }
        let ordinal = on_disk_ordinal(kind, raw, sequence);
        let key = (kind, name);
        let candidates: Vec<usize> = self
            .by_name
            .get(&key)
            .map(|indices| {
                indices
                    .iter()
                    .copied()
                    .filter(|&i| {
                        let request = &self.requests[i];
                        self.pending[i]
                            && request.pin.ordinal.is_some() == (pass == Pass::Pinned)
                            && request.accepts(kind, &key.1, file, ordinal)
                    })
                    .collect()
            })
            .unwrap_or_default();
        if candidates.is_empty() {
            return Ok(None);
        }
        let (kind, name) = key;

        let decoded = match decode_block(raw, kind.schema()) {
            Ok(decoded) => decoded,
            Err(e) => {
                if candidates
                    .iter()
                    .any(|&i| self.requests[i].pin.file == Some(file))
                {
                    return Err(e.with_context(format!(
                        "{} block for {} in file {}",
                        kind, name, file
                    )));
                }
                log::warn!(
                    "skipping unreadable {} block for {} in file {}: {}",
                    kind,
                    name,
                    file,
                    e
                );
                return Ok(None);
            }
        };

        for i in candidates {
            let request = &self.requests[i];
            if let Some(field) = request.live.must_match_disagreement(&decoded) {
                if request.pin.file.is_some() {
                    cellstore_bail!(
                        SchemaMismatch: "{} pinned to file {} disagrees with ordinal {} on {}",
                        request.name,
                        file,
                        ordinal,
                        field
                    );
                }
                log::debug!(
                    "{} block {} in file {} is not {}: {} differs",
                    kind,
                    ordinal,
                    file,
                    request.name,
                    field
                );
                continue;
            }
            log::debug!("bound {} to {} block {} in file {}", request.name, kind, ordinal, file);
            self.mark_bound(file, kind, sequence);
            self.pending[i] = false;
            self.bindings[i] = Some(Binding {
                file,
                ordinal,
                header: decoded,
            });
            return Ok(Some(i));
        }
        Ok(None)
    }

    /// Offer the blocks of one file, first to requests pinned to an ordinal, then to the
    /// wildcards in file order.
    fn offer_file(&mut self, file: usize, blocks: &[RawBlock]) -> CellstoreResult<()> {
        for pass in [Pass::Pinned, Pass::Wildcard] {
            let mut sequences: BTreeMap<&str, usize> = BTreeMap::new();
            for raw in blocks {
                let sequence = sequences.entry(raw.name.as_str()).or_default();
                self.offer(file, *sequence, raw, pass)?;
                *sequence += 1;
            }
        }
        Ok(())
    }

    /// Offer every block of every file, files in order.
    pub fn offer_files<'a>(
        &mut self,
        files: impl IntoIterator<Item = &'a [RawBlock]>,
    ) -> CellstoreResult<()> {
        for (file, blocks) in files.into_iter().enumerate() {
            self.offer_file(file, blocks)?;
            if self.pending() == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Resolve the remaining requests. An entity pinned to a file must have been found there;
    /// others are generated afresh when `allow_generate` is set.
    pub fn finish(self, allow_generate: bool) -> CellstoreResult<Vec<Resolved>> {
        let mut resolved = Vec::with_capacity(self.requests.len());
        for ((request, pending), binding) in self
            .requests
            .into_iter()
            .zip(self.pending)
            .zip(self.bindings)
        {
            if pending {
                if let Some(file) = request.pin.file {
                    return Err(cellstore_err!(
                        Unmatched: "no compatible block for {} in file {}",
                        request.name,
                        file
                    ));
                }
                if !allow_generate {
                    return Err(cellstore_err!(
                        Unmatched: "no compatible block for {}",
                        request.name
                    ));
                }
                log::warn!("{} not found in any save file, it will be generated", request.name);
            }
            resolved.push(Resolved {
                id: request.id,
                name: request.name,
                binding,
            });
        }
        Ok(resolved)
    }
}

/// One line of a [`RestoreReport`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReport {
    pub id: EntityId,
    pub name: EntityName,
    pub status: RestoreStatus,
}

/// Where every entity of a restored model came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub entities: Vec<EntityReport>,
}

impl RestoreReport {
    pub fn status(&self, id: EntityId) -> Option<RestoreStatus> {
        self.entities.iter().find(|e| e.id == id).map(|e| e.status)
    }

    pub fn generated(&self) -> impl Iterator<Item = &EntityReport> + '_ {
        self.entities
            .iter()
            .filter(|e| e.status == RestoreStatus::Generate)
    }
}

impl Display for RestoreReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for entity in &self.entities {
            writeln!(f, "{:<24} {:<40} {}", entity.id.to_string(), entity.name.to_string(), entity.status)?;
        }
        Ok(())
    }
}
