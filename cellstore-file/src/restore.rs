//! Restoring a live model from one or more save files.
//!
//! The coordinator scans the headers of every file, binds the model's entities to blocks and
//! derives a transfer plan. The plan is broadcast, so every node knows which bytes it is about
//! to receive, and then the coordinator streams each file front to back, fanning history and
//! record bytes out to the nodes owning them.

use std::io;

use bytes::Bytes;
use cellstore_error::{CellstoreResult, ResultExt, cellstore_bail, cellstore_err};
use cellstore_io::{ByteSource, COORDINATOR, Channel, Inbox, IoSource, LocalMesh, Outbox, Tracked};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityName, entities, live_header};
use crate::history::{HistoryFormat, HistoryWidth, transcode};
use crate::ident::Identification;
use crate::live::{ConnState, GlobalState, LiveModel, PopulationState};
use crate::matcher::{EntityReport, MatchRequest, Resolved, RestoreReport, Worklist};
use crate::mover::{RecordPlan, Run, copy_bytes};
use crate::options::RestoreOptions;
use crate::reader::{BlockReader, decode_block};
use crate::save::check_channel;
use crate::schema::{BlockKind, names};
use crate::wire::RawBlock;
use crate::writer::HeaderInstance;

/// The header section of one save file, with the source positioned at its payload.
pub struct ScannedFile<S> {
    pub ident: Identification,
    pub blocks: Vec<RawBlock>,
    pub data_start: u64,
    source: Tracked<S>,
}

impl<S: ByteSource> ScannedFile<S> {
    pub fn scan(source: S) -> CellstoreResult<Self> {
        let mut reader = BlockReader::open(source)?;
        let mut blocks = Vec::new();
        let mut data_start = None;
        while let Some(block) = reader.next_block()? {
            if block.name == BlockKind::End.name() {
                let end = decode_block(&block, BlockKind::End.schema())?;
                data_start = end.unsigned("DATAPOS");
            }
            blocks.push(block);
        }
        let position = reader.position();
        let data_start = data_start.unwrap_or(position);
        if data_start < position {
            cellstore_bail!(
                SchemaMismatch: "payload at {} starts inside the headers ending at {}",
                data_start,
                position
            );
        }
        let ident = reader.ident().clone();
        Ok(Self {
            ident,
            blocks,
            data_start,
            source: reader.into_source(),
        })
    }

    /// The first block of `kind`.
    pub fn block(&self, kind: BlockKind) -> Option<&RawBlock> {
        self.blocks.iter().find(|b| b.name == kind.name())
    }
}

/// Where the history of one population lies in its file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct HistoryTransfer {
    offset: u64,
    format: HistoryFormat,
    depth: u16,
}

impl HistoryTransfer {
    fn stride(&self) -> u64 {
        u64::from(self.depth) * self.format.entry_size() as u64
    }
}

/// Everything a node needs to restore one bound cell population.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct PopulationTransfer {
    region: usize,
    cell: usize,
    file: usize,
    state: PopulationState,
    conns: Vec<(usize, ConnState)>,
    history: HistoryTransfer,
    data_offset: u64,
    file_record_length: u32,
    runs: Vec<Run>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct RestorePlan {
    global: GlobalState,
    report: RestoreReport,
    populations: Vec<PopulationTransfer>,
}

/// What the coordinator broadcasts once the headers are matched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum PlanMessage {
    Plan(RestorePlan),
    Abort(String),
}

/// One read from a file, in the order every node processes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Step {
    History(usize),
    Records(usize),
}

fn steps(plan: &RestorePlan) -> Vec<Step> {
    let mut steps: Vec<(usize, u64, Step)> = plan
        .populations
        .iter()
        .enumerate()
        .flat_map(|(i, p)| {
            [
                (p.file, p.history.offset, Step::History(i)),
                (p.file, p.data_offset, Step::Records(i)),
            ]
        })
        .collect();
    steps.sort();
    steps.into_iter().map(|(_, _, step)| step).collect()
}

fn seeds(header: &HeaderInstance<'_>) -> CellstoreResult<[i32; 2]> {
    let values = header
        .get(names::SEEDS)
        .and_then(|v| v.as_signed())
        .unwrap_or_default();
    let mut seeds = [0i32; 2];
    for (seed, &value) in seeds.iter_mut().zip(values) {
        *seed = i32::try_from(value)
            .map_err(|_| cellstore_err!(SchemaMismatch: "seed {} exceeds 32 bits", value))?;
    }
    Ok(seeds)
}

fn signed_i32(header: &HeaderInstance<'_>, name: &str) -> CellstoreResult<i32> {
    let value = header.signed(name).unwrap_or(0);
    i32::try_from(value)
        .map_err(|_| cellstore_err!(SchemaMismatch: "{} = {} exceeds 32 bits", name, value))
}

/// Restores models from save files.
#[derive(Clone, Debug, Default)]
pub struct Restorer {
    options: RestoreOptions,
}

impl Restorer {
    pub fn new(options: RestoreOptions) -> Self {
        Self { options }
    }

    /// Restore a model held by a single process.
    pub fn restore<S: ByteSource>(
        &self,
        files: Vec<S>,
        model: &mut LiveModel,
    ) -> CellstoreResult<RestoreReport> {
        self.restore_coordinator(files, model, &mut LocalMesh::single())
    }

    /// Restore a distributed model on the coordinator, which reads the files.
    pub fn restore_coordinator<S: ByteSource, C: Channel>(
        &self,
        files: Vec<S>,
        model: &mut LiveModel,
        channel: &mut C,
    ) -> CellstoreResult<RestoreReport> {
        check_channel(model, channel)?;
        if !channel.is_coordinator() {
            cellstore_bail!(Programming: "node {} cannot read save files", channel.node());
        }
        let (plan, files) = match self.prepare(files, model) {
            Ok(prepared) => prepared,
            Err(e) => {
                if channel.nodes() > 1 {
                    let message = PlanMessage::Abort(e.to_string());
                    if let Err(broadcast) = broadcast(channel, &message) {
                        log::warn!("could not tell the workers to abort: {}", broadcast);
                    }
                }
                return Err(e);
            }
        };
        if channel.nodes() > 1 {
            broadcast(channel, &PlanMessage::Plan(plan.clone()))?;
        }
        apply_state(&plan, model)?;
        self.send_payload(&plan, files, model, channel)?;
        log::info!(
            "restored {} cell populations, {} entities generated",
            plan.populations.len(),
            plan.report.generated().count()
        );
        Ok(plan.report)
    }

    /// Restore this worker's part of a distributed model, receiving its payload from the
    /// coordinator.
    pub fn restore_worker<C: Channel>(
        &self,
        model: &mut LiveModel,
        channel: &mut C,
    ) -> CellstoreResult<RestoreReport> {
        check_channel(model, channel)?;
        if channel.is_coordinator() {
            cellstore_bail!(Programming: "the coordinator must read the save files");
        }
        let message: PlanMessage = serde_json::from_slice(&channel.broadcast(COORDINATOR, None)?)?;
        let plan = match message {
            PlanMessage::Plan(plan) => plan,
            PlanMessage::Abort(reason) => {
                return Err(cellstore_err!("the coordinator abandoned the restore: {}", reason));
            }
        };
        apply_state(&plan, model)?;

        let node = channel.node();
        let partition = model.partition();
        let mut inbox = Inbox::new(channel);
        for step in steps(&plan) {
            match step {
                Step::History(i) => {
                    let transfer = &plan.populations[i];
                    let cells = model.cells_mut(transfer.region, transfer.cell)?;
                    let range = partition.range(cells.count(), node);
                    let len = u64::from(range.end - range.start) * transfer.history.stride();
                    let src = inbox.source(COORDINATOR).read_vec(crate::to_usize(len)?)?;
                    restore_history(&src, &transfer.history, cells)?;
                }
                Step::Records(i) => {
                    let transfer = &plan.populations[i];
                    let cells = model.cells_mut(transfer.region, transfer.cell)?;
                    let record_plan = record_plan(transfer, cells.record_length())?;
                    if record_plan.transfer_length() == 0 {
                        continue;
                    }
                    let mut compact = vec![0u8; record_plan.transfer_length()];
                    for element in cells.range() {
                        inbox.source(COORDINATOR).read_exact_into(&mut compact)?;
                        record_plan.scatter_record(&compact, cells.record_mut(element)?)?;
                    }
                }
            }
        }
        inbox.finish()?;
        Ok(plan.report)
    }

    /// Scan the files and match the model against them.
    fn prepare<S: ByteSource>(
        &self,
        files: Vec<S>,
        model: &LiveModel,
    ) -> CellstoreResult<(RestorePlan, Vec<ScannedFile<S>>)> {
        if files.is_empty() {
            cellstore_bail!(InvalidArgument: "no save files to restore from");
        }
        self.options.validate(files.len())?;
        let files = files
            .into_iter()
            .enumerate()
            .map(|(i, source)| {
                ScannedFile::scan(source).with_context(|| format!("save file {}", i))
            })
            .collect::<CellstoreResult<Vec<_>>>()?;

        let global = {
            let block = files[0].block(BlockKind::File).ok_or_else(|| {
                cellstore_err!(SchemaMismatch: "save file 0 has no {} block", BlockKind::File)
            })?;
            let header = decode_block(block, BlockKind::File.schema())?;
            GlobalState {
                seeds: seeds(&header)?,
                time_step: signed_i32(&header, "DT")?,
            }
        };
        let blocks = || files.iter().map(|f| f.blocks.as_slice());
        let named = entities(model);

        let regions = self.match_phase(
            model,
            named.iter().filter(|(id, _)| matches!(id, EntityId::Region(_))),
            |_| None,
            blocks(),
        )?;
        let cells = self.match_phase(
            model,
            named.iter().filter(|(id, _)| matches!(id, EntityId::Cells(..))),
            |_| None,
            blocks(),
        )?;
        let cell_file = |id: EntityId| {
            let (r, c) = id.population()?;
            cells
                .iter()
                .find(|resolved| resolved.id == EntityId::Cells(r, c))
                .and_then(|resolved| resolved.binding.as_ref())
                .map(|binding| binding.file)
        };

        // connection types of generated populations are generated with them
        let (orphans, conn_entities): (Vec<_>, Vec<_>) = named
            .iter()
            .filter(|(id, _)| matches!(id, EntityId::Conns(..) | EntityId::Secondary(..)))
            .partition(|(id, _)| cell_file(*id).is_none());
        let conns = self.match_phase(model, conn_entities.into_iter(), cell_file, blocks())?;

        let mut resolved: Vec<Resolved> = regions.into_iter().chain(cells).chain(conns).collect();
        resolved.extend(orphans.into_iter().map(|(id, name)| Resolved {
            id: *id,
            name: name.clone(),
            binding: None,
        }));

        let report = RestoreReport {
            entities: named
                .iter()
                .filter_map(|(id, _)| resolved.iter().find(|r| r.id == *id))
                .map(|r| EntityReport {
                    id: r.id,
                    name: r.name.clone(),
                    status: r.status(),
                })
                .collect(),
        };

        let populations = resolved
            .iter()
            .filter_map(|r| match (r.id, &r.binding) {
                (EntityId::Cells(region, cell), Some(binding)) => Some(self.population_transfer(
                    model,
                    region,
                    cell,
                    binding.file,
                    &binding.header,
                    &resolved,
                )),
                _ => None,
            })
            .collect::<CellstoreResult<Vec<_>>>()?;

        Ok((
            RestorePlan {
                global,
                report,
                populations,
            },
            files,
        ))
    }

    fn match_phase<'a>(
        &self,
        model: &LiveModel,
        named: impl Iterator<Item = &'a (EntityId, EntityName)>,
        parent_file: impl Fn(EntityId) -> Option<usize>,
        files: impl Iterator<Item = &'a [RawBlock]>,
    ) -> CellstoreResult<Vec<Resolved>> {
        let requests = named
            .map(|(id, name)| {
                Ok(MatchRequest {
                    id: *id,
                    name: name.clone(),
                    pin: self.options.pin(*id),
                    parent_file: parent_file(*id),
                    live: live_header(model, *id)?,
                })
            })
            .collect::<CellstoreResult<Vec<_>>>()?;
        let mut worklist = Worklist::new(requests);
        worklist.offer_files(files)?;
        worklist.finish(self.options.allow_generate())
    }

    fn population_transfer(
        &self,
        model: &LiveModel,
        region: usize,
        cell: usize,
        file: usize,
        header: &HeaderInstance<'static>,
        resolved: &[Resolved],
    ) -> CellstoreResult<PopulationTransfer> {
        let layout = model
            .layout()
            .regions()
            .get(region)
            .and_then(|r| r.cells().get(cell))
            .ok_or_else(|| cellstore_err!("no cell population {}/{}", region, cell))?;
        let file_record_length = header.unsigned_u32("RECLEN")?;
        let width = HistoryWidth::from_bytes(header.unsigned("HWIDTH").unwrap_or(0))?;
        let depth = u16::try_from(header.unsigned("HDEPTH").unwrap_or(0))
            .map_err(|_| cellstore_err!(SchemaMismatch: "history depth exceeds 16 bits"))?;

        let mut runs = vec![Run::once(0, 0, layout.cell().restorable_length())];
        let mut conns = Vec::new();
        for r in resolved {
            let EntityId::Conns(cr, cc, k) = r.id else {
                continue;
            };
            let Some(binding) = r.binding.as_ref().filter(|_| (cr, cc) == (region, cell)) else {
                continue;
            };
            let conn = layout
                .conns()
                .get(k)
                .ok_or_else(|| cellstore_err!("no connection type {} of {}/{}", k, region, cell))?;
            runs.push(Run {
                file_offset: binding.header.unsigned_u32("RECOFF")?,
                live_offset: conn.offset_in_cell(),
                len: conn.per_conn().restorable_length(),
                repeat: conn.count(),
                file_stride: binding.header.unsigned_u32("STRIDE")?,
                live_stride: conn.stride(),
            });
            conns.push((
                k,
                ConnState {
                    seeds: seeds(&binding.header)?,
                },
            ));
        }
        runs.sort_by_key(|run| run.file_offset);
        // validated here so a bad file fails before any payload moves
        RecordPlan::new(file_record_length, layout.record_length(), runs.clone())
            .with_context(|| format!("records of {}/{} in file {}", region, cell, file))?;

        Ok(PopulationTransfer {
            region,
            cell,
            file,
            state: PopulationState {
                seeds: seeds(header)?,
                autoscale: signed_i32(header, "AUTOSCL")?,
            },
            conns,
            history: HistoryTransfer {
                offset: header.unsigned("HISTOFF").unwrap_or(0),
                format: HistoryFormat::new(width, header.unsigned("HPHASE").unwrap_or(0) != 0),
                depth,
            },
            data_offset: header.unsigned(names::DATAOFF).unwrap_or(0),
            file_record_length,
            runs,
        })
    }

    /// Stream every file front to back, keeping this node's share and sending the rest on.
    fn send_payload<S: ByteSource, C: Channel>(
        &self,
        plan: &RestorePlan,
        mut files: Vec<ScannedFile<S>>,
        model: &mut LiveModel,
        channel: &mut C,
    ) -> CellstoreResult<()> {
        let node = channel.node();
        let nodes = channel.nodes();
        let partition = model.partition();
        let mut outbox = Outbox::new(channel, self.options.chunk_size())?;
        for step in steps(plan) {
            match step {
                Step::History(i) => {
                    let transfer = &plan.populations[i];
                    let source = &mut files[transfer.file].source;
                    source.seek_forward(transfer.history.offset)?;
                    let cells = model.cells_mut(transfer.region, transfer.cell)?;
                    for peer in 0..nodes {
                        let range = partition.range(cells.count(), peer);
                        let len = u64::from(range.end - range.start) * transfer.history.stride();
                        if peer == node {
                            let src = source.read_vec(crate::to_usize(len)?)?;
                            restore_history(&src, &transfer.history, cells)?;
                        } else {
                            copy_bytes(source, &mut outbox.sink(peer), len, self.options.chunk_size())?;
                        }
                    }
                }
                Step::Records(i) => {
                    let transfer = &plan.populations[i];
                    let cells = model.cells_mut(transfer.region, transfer.cell)?;
                    let record_plan = record_plan(transfer, cells.record_length())?;
                    if record_plan.transfer_length() == 0 {
                        continue;
                    }
                    let source = &mut files[transfer.file].source;
                    source.seek_forward(transfer.data_offset)?;
                    let mut compact = vec![0u8; record_plan.transfer_length()];
                    let count = cells.count();
                    for element in 0..count {
                        record_plan.read_record(source, &mut compact)?;
                        let owner = partition.owner(count, element);
                        if owner == node {
                            record_plan.scatter_record(&compact, cells.record_mut(element)?)?;
                        } else {
                            outbox.write(owner, &compact)?;
                        }
                    }
                }
            }
        }
        outbox.finish()
    }
}

/// Open save files on disk for [`Restorer::restore`].
pub fn open_files<P: AsRef<std::path::Path>>(
    paths: &[P],
) -> CellstoreResult<Vec<IoSource<io::BufReader<std::fs::File>>>> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            std::fs::File::open(path)
                .map(|file| IoSource::new(io::BufReader::new(file)))
                .map_err(|e| cellstore_err!("cannot open {}: {}", path.display(), e))
        })
        .collect()
}

fn broadcast<C: Channel>(channel: &mut C, message: &PlanMessage) -> CellstoreResult<()> {
    let data = Bytes::from(serde_json::to_vec(message)?);
    channel.broadcast(COORDINATOR, Some(data))?;
    Ok(())
}

fn apply_state(plan: &RestorePlan, model: &mut LiveModel) -> CellstoreResult<()> {
    model.global = plan.global;
    for transfer in &plan.populations {
        let cells = model.cells_mut(transfer.region, transfer.cell)?;
        cells.state = transfer.state;
        for (k, state) in &transfer.conns {
            if let Some(conn) = cells.conns.get_mut(*k) {
                *conn = *state;
            }
        }
    }
    Ok(())
}

fn record_plan(transfer: &PopulationTransfer, live_record_length: usize) -> CellstoreResult<RecordPlan> {
    let live_record_length = u32::try_from(live_record_length)
        .map_err(|_| cellstore_err!(Overflow: "record of {} bytes", live_record_length))?;
    RecordPlan::new(transfer.file_record_length, live_record_length, transfer.runs.clone())
}

fn restore_history(
    src: &[u8],
    transfer: &HistoryTransfer,
    cells: &mut crate::live::LiveCells,
) -> CellstoreResult<()> {
    let (to, depth) = (cells.history_format(), cells.depth());
    transcode(src, transfer.format, transfer.depth, cells.histories_mut(), to, depth)
}
