use std::ops::Range;

use cellstore_error::{CellstoreResult, ResultExt, cellstore_bail, cellstore_err};
use cellstore_io::{NodeId, Partition};
use cellstore_layout::{CellLayout, FieldCatalog, ModelLayout, ModelSpec, ScopeComposer};
use serde::{Deserialize, Serialize};

use crate::history::HistoryFormat;

/// Run-wide state saved in the `FILE` block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalState {
    pub seeds: [i32; 2],
    /// Time step in seconds with 20 fraction bits.
    pub time_step: i32,
}

/// Population-wide state, identical on every node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationState {
    pub seeds: [i32; 2],
    /// Automatic gain with 16 fraction bits.
    pub autoscale: i32,
}

/// State of one connection type, identical on every node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnState {
    pub seeds: [i32; 2],
}

/// The in-memory data of one cell population on this node.
///
/// A node holds the records and histories of the contiguous element range the [`Partition`]
/// assigns to it. Element indices passed to the accessors are population-wide.
#[derive(Clone, Debug)]
pub struct LiveCells {
    count: u32,
    range: Range<u32>,
    record_length: usize,
    depth: u16,
    format: HistoryFormat,
    pub state: PopulationState,
    pub conns: Vec<ConnState>,
    history: Vec<u8>,
    records: Vec<u8>,
}

impl LiveCells {
    fn new(
        layout: &CellLayout,
        depth: u16,
        format: HistoryFormat,
        range: Range<u32>,
    ) -> CellstoreResult<Self> {
        let owned = u64::from(range.end - range.start);
        let record_length = layout.record_length() as usize;
        let records = owned
            .checked_mul(u64::from(layout.record_length()))
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| cellstore_err!(Overflow: "{} records of {} bytes", owned, record_length))?;
        let history = owned
            .checked_mul(u64::from(depth) * format.entry_size() as u64)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| cellstore_err!(Overflow: "history of {} cells, depth {}", owned, depth))?;
        Ok(Self {
            count: layout.count(),
            range,
            record_length,
            depth,
            format,
            state: PopulationState::default(),
            conns: vec![ConnState::default(); layout.conns().len()],
            history: vec![0; history],
            records: vec![0; records],
        })
    }

    /// Number of cells in the whole population.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Elements held by this node.
    pub fn range(&self) -> Range<u32> {
        self.range.clone()
    }

    pub fn record_length(&self) -> usize {
        self.record_length
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn history_format(&self) -> HistoryFormat {
        self.format
    }

    /// Bytes of history per cell.
    pub fn history_stride(&self) -> usize {
        usize::from(self.depth) * self.format.entry_size()
    }

    fn local(&self, element: u32) -> CellstoreResult<usize> {
        if !self.range.contains(&element) {
            cellstore_bail!(
                "cell {} is not held by this node (holding {}..{})",
                element,
                self.range.start,
                self.range.end
            );
        }
        Ok((element - self.range.start) as usize)
    }

    pub fn record(&self, element: u32) -> CellstoreResult<&[u8]> {
        let start = self.local(element)? * self.record_length;
        Ok(&self.records[start..start + self.record_length])
    }

    pub fn record_mut(&mut self, element: u32) -> CellstoreResult<&mut [u8]> {
        let start = self.local(element)? * self.record_length;
        Ok(&mut self.records[start..start + self.record_length])
    }

    /// Records of every cell held by this node, back to back.
    pub fn records(&self) -> &[u8] {
        &self.records
    }

    pub fn history(&self, element: u32) -> CellstoreResult<&[u8]> {
        let stride = self.history_stride();
        let start = self.local(element)? * stride;
        Ok(&self.history[start..start + stride])
    }

    pub fn history_mut(&mut self, element: u32) -> CellstoreResult<&mut [u8]> {
        let stride = self.history_stride();
        let start = self.local(element)? * stride;
        Ok(&mut self.history[start..start + stride])
    }

    /// Histories of every cell held by this node, back to back.
    pub fn histories(&self) -> &[u8] {
        &self.history
    }

    pub(crate) fn histories_mut(&mut self) -> &mut [u8] {
        &mut self.history
    }
}

/// The live model on one node: its structural description, composed layout and the data of
/// the elements the node holds.
#[derive(Clone, Debug)]
pub struct LiveModel {
    spec: ModelSpec,
    layout: ModelLayout,
    partition: Partition,
    node: NodeId,
    pub global: GlobalState,
    cells: Vec<Vec<LiveCells>>,
}

impl LiveModel {
    /// A model held entirely by a single process.
    pub fn new(spec: ModelSpec, catalog: &FieldCatalog) -> CellstoreResult<Self> {
        Self::for_node(spec, catalog, Partition::new(1), 0)
    }

    /// The part of a model held by `node` of a run distributed by `partition`.
    pub fn for_node(
        spec: ModelSpec,
        catalog: &FieldCatalog,
        partition: Partition,
        node: NodeId,
    ) -> CellstoreResult<Self> {
        if node >= partition.nodes() {
            cellstore_bail!("node {} outside a run of {} nodes", node, partition.nodes());
        }
        spec.validate()?;
        let layout = ScopeComposer::new(catalog).compose(&spec)?;
        let format = HistoryFormat::from_options(&spec.options);
        let cells = spec
            .regions
            .iter()
            .zip(layout.regions())
            .map(|(region, region_layout)| {
                region
                    .cells
                    .iter()
                    .zip(region_layout.cells())
                    .map(|(cell, cell_layout)| {
                        LiveCells::new(
                            cell_layout,
                            cell.history_depth,
                            format,
                            partition.range(cell.count, node),
                        )
                        .with_context(|| format!("cell population {}/{}", region.name, cell.name))
                    })
                    .collect::<CellstoreResult<Vec<_>>>()
            })
            .collect::<CellstoreResult<Vec<_>>>()?;
        Ok(Self {
            spec,
            layout,
            partition,
            node,
            global: GlobalState::default(),
            cells,
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn history_format(&self) -> HistoryFormat {
        HistoryFormat::from_options(&self.spec.options)
    }

    /// Indices of the named cell population.
    pub fn find(&self, region: &str, cell: &str) -> Option<(usize, usize)> {
        self.spec
            .regions
            .iter()
            .enumerate()
            .find(|(_, r)| r.name == region)
            .and_then(|(ri, r)| {
                r.cells
                    .iter()
                    .position(|c| c.name == cell)
                    .map(|ci| (ri, ci))
            })
    }

    pub fn cells(&self, region: usize, cell: usize) -> CellstoreResult<&LiveCells> {
        self.cells
            .get(region)
            .and_then(|r| r.get(cell))
            .ok_or_else(|| cellstore_err!("no cell population {}/{}", region, cell))
    }

    pub fn cells_mut(&mut self, region: usize, cell: usize) -> CellstoreResult<&mut LiveCells> {
        self.cells
            .get_mut(region)
            .and_then(|r| r.get_mut(cell))
            .ok_or_else(|| cellstore_err!("no cell population {}/{}", region, cell))
    }

    /// Every cell population with its indices, in model order.
    pub fn populations(&self) -> impl Iterator<Item = (usize, usize, &LiveCells)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .flat_map(|(ri, r)| r.iter().enumerate().map(move |(ci, c)| (ri, ci, c)))
    }
}
