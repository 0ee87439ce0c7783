//! Entities of a live model and the header blocks describing them.
//!
//! Save and restore build the same header instance for an entity: save fills in the payload
//! offsets and writes it, restore compares its MustMatch fields with the blocks found on disk.

use std::fmt::{Display, Formatter};

use cellstore_error::{CellstoreResult, cellstore_err};
use cellstore_layout::{NOT_ALLOCATED, OffsetTable, SecondaryClass, SourceRef};
use serde::{Deserialize, Serialize};

use crate::history::HistoryWidth;
use crate::live::LiveModel;
use crate::reader::raw_text;
use crate::schema::{BlockKind, names};
use crate::value::Value;
use crate::wire::RawBlock;
use crate::writer::HeaderInstance;

/// Position of an entity in the live model: region, cell population and connection type
/// indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityId {
    Region(usize),
    Cells(usize, usize),
    Conns(usize, usize, usize),
    Secondary(usize, usize, usize),
}

impl EntityId {
    /// The population an entity belongs to, if any.
    pub fn population(&self) -> Option<(usize, usize)> {
        match *self {
            EntityId::Region(_) => None,
            EntityId::Cells(r, c) | EntityId::Conns(r, c, _) | EntityId::Secondary(r, c, _) => {
                Some((r, c))
            }
        }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Region(r) => write!(f, "region[{}]", r),
            EntityId::Cells(r, c) => write!(f, "cells[{}.{}]", r, c),
            EntityId::Conns(r, c, k) => write!(f, "conns[{}.{}.{}]", r, c, k),
            EntityId::Secondary(r, c, k) => write!(f, "secondary[{}.{}.{}]", r, c, k),
        }
    }
}

/// The hierarchical name blocks are matched by.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityName {
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
}

impl EntityName {
    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            cell: None,
            source: None,
        }
    }

    pub fn cells(region: impl Into<String>, cell: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            cell: Some(cell.into()),
            source: None,
        }
    }

    pub fn conns(region: impl Into<String>, cell: impl Into<String>, source: SourceRef) -> Self {
        Self {
            region: region.into(),
            cell: Some(cell.into()),
            source: Some(source),
        }
    }

    /// The name carried by a raw block, or `None` for unnamed blocks or blocks missing a part
    /// of their name.
    pub fn of_block(raw: &RawBlock) -> Option<Self> {
        match BlockKind::from_name(&raw.name)? {
            BlockKind::Region => Some(Self::region(raw_text(raw, names::NAME)?)),
            BlockKind::Cells => Some(Self::cells(
                raw_text(raw, names::REGION)?,
                raw_text(raw, names::NAME)?,
            )),
            BlockKind::Conns | BlockKind::Gconn | BlockKind::Modul => Some(Self::conns(
                raw_text(raw, names::REGION)?,
                raw_text(raw, names::CELL)?,
                SourceRef::new(raw_text(raw, names::SRCREG)?, raw_text(raw, names::SRCCELL)?),
            )),
            BlockKind::File | BlockKind::End => None,
        }
    }
}

impl Display for EntityName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.region)?;
        if let Some(cell) = &self.cell {
            write!(f, "/{}", cell)?;
        }
        if let Some(source) = &self.source {
            write!(f, " <- {}", source)?;
        }
        Ok(())
    }
}

/// The block kind secondary connections of a class are saved as.
pub fn secondary_kind(class: SecondaryClass) -> BlockKind {
    match class {
        SecondaryClass::Geometric => BlockKind::Gconn,
        SecondaryClass::Modulatory => BlockKind::Modul,
    }
}

/// Every entity of the model with its name, in the order the blocks are written.
pub fn entities(model: &LiveModel) -> Vec<(EntityId, EntityName)> {
    let mut out = Vec::new();
    for (r, region) in model.spec().regions.iter().enumerate() {
        out.push((EntityId::Region(r), EntityName::region(&region.name)));
    }
    for (r, region) in model.spec().regions.iter().enumerate() {
        for (c, cell) in region.cells.iter().enumerate() {
            out.push((EntityId::Cells(r, c), EntityName::cells(&region.name, &cell.name)));
            for (k, conn) in cell.conns.iter().enumerate() {
                out.push((
                    EntityId::Conns(r, c, k),
                    EntityName::conns(&region.name, &cell.name, conn.source.clone()),
                ));
            }
            for (k, secondary) in cell.secondary.iter().enumerate() {
                out.push((
                    EntityId::Secondary(r, c, k),
                    EntityName::conns(&region.name, &cell.name, secondary.source.clone()),
                ));
            }
        }
    }
    out
}

fn offsets_value(offsets: &OffsetTable, width: u32) -> Value {
    let mut wire: Vec<u64> = offsets.to_wire().into_iter().map(u64::from).collect();
    wire.resize(width as usize, u64::from(NOT_ALLOCATED));
    Value::Unsigned(wire)
}

fn width_of(kind: BlockKind, field: &str) -> u32 {
    kind.schema().field(field).map_or(0, |proto| proto.count)
}

fn seeds(seeds: [i32; 2]) -> Value {
    Value::Signed(seeds.iter().map(|&s| i64::from(s)).collect())
}

fn missing(id: EntityId) -> cellstore_error::CellstoreError {
    cellstore_err!("{} does not exist in the live model", id)
}

/// The `FILE` block of a model. Counts and global state are the same on every node.
pub fn file_header(model: &LiveModel) -> CellstoreResult<HeaderInstance<'static>> {
    let spec = model.spec();
    let cells = spec.regions.iter().map(|r| r.cells.len()).sum::<usize>();
    let conns = spec
        .regions
        .iter()
        .flat_map(|r| &r.cells)
        .map(|c| c.conns.len())
        .sum::<usize>();
    let secondary = spec
        .regions
        .iter()
        .flat_map(|r| &r.cells)
        .map(|c| c.secondary.len())
        .sum::<usize>();
    HeaderInstance::new(BlockKind::File.schema())
        .with("NREGION", Value::unsigned(spec.regions.len() as u64))?
        .with("NCELLS", Value::unsigned(cells as u64))?
        .with("NCONNS", Value::unsigned(conns as u64))?
        .with("NSECOND", Value::unsigned(secondary as u64))?
        .with(names::SEEDS, seeds(model.global.seeds))?
        .with("DT", Value::signed(i64::from(model.global.time_step)))?
        .with("NODES", Value::unsigned(model.partition().nodes() as u64))
}

/// The live header of one entity. Payload offsets of cell populations are zero until the
/// writer fills them in.
pub fn live_header(model: &LiveModel, id: EntityId) -> CellstoreResult<HeaderInstance<'static>> {
    let spec = model.spec();
    let layout = model.layout();
    match id {
        EntityId::Region(r) => {
            let region = spec.regions.get(r).ok_or_else(|| missing(id))?;
            let region_layout = layout.regions().get(r).ok_or_else(|| missing(id))?;
            HeaderInstance::new(BlockKind::Region.schema())
                .with(names::NAME, Value::text(&region.name))?
                .with("GRIDX", Value::unsigned(u64::from(region.grid[0])))?
                .with("GRIDY", Value::unsigned(u64::from(region.grid[1])))?
                .with("GRPLEN", Value::unsigned(u64::from(region_layout.group_length())))?
                .with(
                    "GRPOFF",
                    offsets_value(
                        region_layout.group().offsets(),
                        width_of(BlockKind::Region, "GRPOFF"),
                    ),
                )?
                .with("NCELLS", Value::unsigned(region.cells.len() as u64))
        }
        EntityId::Cells(r, c) => {
            let region = spec.regions.get(r).ok_or_else(|| missing(id))?;
            let cell = region.cells.get(c).ok_or_else(|| missing(id))?;
            let cell_layout = layout
                .regions()
                .get(r)
                .and_then(|l| l.cells().get(c))
                .ok_or_else(|| missing(id))?;
            let live = model.cells(r, c)?;
            let format = live.history_format();
            let width = match format.width {
                HistoryWidth::Narrow => 1,
                HistoryWidth::Wide => 2,
            };
            HeaderInstance::new(BlockKind::Cells.schema())
                .with(names::REGION, Value::text(&region.name))?
                .with(names::NAME, Value::text(&cell.name))?
                .with(names::COUNT, Value::unsigned(u64::from(cell.count)))?
                .with("RECLEN", Value::unsigned(u64::from(cell_layout.record_length())))?
                .with(
                    names::RESTLEN,
                    Value::unsigned(u64::from(cell_layout.cell().restorable_length())),
                )?
                .with(
                    "OFFSETS",
                    offsets_value(cell_layout.cell().offsets(), width_of(BlockKind::Cells, "OFFSETS")),
                )?
                .with(names::SEEDS, seeds(live.state.seeds))?
                .with("AUTOSCL", Value::signed(i64::from(live.state.autoscale)))?
                .with("HWIDTH", Value::unsigned(width))?
                .with("HPHASE", Value::unsigned(u64::from(format.phase)))?
                .with("HDEPTH", Value::unsigned(u64::from(cell.history_depth)))?
                .with("HISTOFF", Value::unsigned(0))?
                .with(names::DATAOFF, Value::unsigned(0))?
                .with("NCONNT", Value::unsigned(cell.conns.len() as u64))
        }
        EntityId::Conns(r, c, k) => {
            let region = spec.regions.get(r).ok_or_else(|| missing(id))?;
            let cell = region.cells.get(c).ok_or_else(|| missing(id))?;
            let conn = cell.conns.get(k).ok_or_else(|| missing(id))?;
            let conn_layout = layout
                .regions()
                .get(r)
                .and_then(|l| l.cells().get(c))
                .and_then(|l| l.conns().get(k))
                .ok_or_else(|| missing(id))?;
            let live = model.cells(r, c)?;
            let state = live.conns.get(k).ok_or_else(|| missing(id))?;
            HeaderInstance::new(BlockKind::Conns.schema())
                .with(names::REGION, Value::text(&region.name))?
                .with(names::CELL, Value::text(&cell.name))?
                .with(names::SRCREG, Value::text(&conn.source.region))?
                .with(names::SRCCELL, Value::text(&conn.source.cell))?
                .with(names::ORDINAL, Value::unsigned(k as u64))?
                .with("MODE", Value::unsigned(u64::from(conn.mode.code())))?
                .with(
                    "GEOM",
                    Value::Float(conn.geometry.iter().map(|&g| f64::from(g)).collect()),
                )?
                .with(names::COUNT, Value::unsigned(u64::from(conn.count)))?
                .with("STRIDE", Value::unsigned(u64::from(conn_layout.stride())))?
                .with(
                    names::RESTLEN,
                    Value::unsigned(u64::from(conn_layout.per_conn().restorable_length())),
                )?
                .with("ONCELEN", Value::unsigned(u64::from(conn_layout.once().length())))?
                .with("RECOFF", Value::unsigned(u64::from(conn_layout.offset_in_cell())))?
                .with(
                    "CONNOFF",
                    offsets_value(
                        conn_layout.per_conn().offsets(),
                        width_of(BlockKind::Conns, "CONNOFF"),
                    ),
                )?
                .with(
                    "ONCEOFF",
                    offsets_value(conn_layout.once().offsets(), width_of(BlockKind::Conns, "ONCEOFF")),
                )?
                .with(names::SEEDS, seeds(state.seeds))?
                .with(names::DATAOFF, Value::unsigned(0))
        }
        EntityId::Secondary(r, c, k) => {
            let region = spec.regions.get(r).ok_or_else(|| missing(id))?;
            let cell = region.cells.get(c).ok_or_else(|| missing(id))?;
            let secondary = cell.secondary.get(k).ok_or_else(|| missing(id))?;
            HeaderInstance::new(secondary_kind(secondary.class).schema())
                .with(names::REGION, Value::text(&region.name))?
                .with(names::CELL, Value::text(&cell.name))?
                .with(names::SRCREG, Value::text(&secondary.source.region))?
                .with(names::SRCCELL, Value::text(&secondary.source.cell))?
                .with(names::ORDINAL, Value::unsigned(k as u64))?
                .with(names::COUNT, Value::unsigned(u64::from(secondary.count)))
        }
    }
}

#[cfg(test)]
mod tests {
    use cellstore_layout::{CellSpec, ConnSpec, FieldCatalog, ModelSpec, RegionSpec, SecondarySpec};

    use super::*;

    fn model() -> LiveModel {
        let spec = ModelSpec {
            options: Default::default(),
            regions: vec![RegionSpec {
                name: "v1".to_string(),
                grid: [2, 3],
                cells: vec![CellSpec {
                    name: "pyr".to_string(),
                    count: 4,
                    fields: ["IZVU"].into_iter().collect(),
                    conns: vec![ConnSpec {
                        source: SourceRef::new("v1", "pyr"),
                        count: 2,
                        fields: ["CIJ"].into_iter().collect(),
                        ..Default::default()
                    }],
                    secondary: vec![SecondarySpec {
                        class: SecondaryClass::Modulatory,
                        source: SourceRef::new("v1", "pyr"),
                        count: 1,
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };
        LiveModel::new(spec, FieldCatalog::standard()).unwrap()
    }

    #[test]
    fn entities_are_listed_in_block_order() {
        let ids: Vec<EntityId> = entities(&model()).into_iter().map(|(id, _)| id).collect();
        assert_eq!(
            ids,
            vec![
                EntityId::Region(0),
                EntityId::Cells(0, 0),
                EntityId::Conns(0, 0, 0),
                EntityId::Secondary(0, 0, 0),
            ]
        );
    }

    #[test]
    fn block_names_round_trip() {
        let model = model();
        for (id, name) in entities(&model) {
            let raw = live_header(&model, id).unwrap().encode().unwrap();
            assert_eq!(EntityName::of_block(&raw), Some(name));
        }
    }

    #[test]
    fn secondary_classes_use_their_own_block() {
        let model = model();
        let header = live_header(&model, EntityId::Secondary(0, 0, 0)).unwrap();
        assert_eq!(header.schema().kind(), BlockKind::Modul);
    }

    #[test]
    fn conns_header_describes_the_layout() {
        let model = model();
        let header = live_header(&model, EntityId::Conns(0, 0, 0)).unwrap();
        let layout = &model.layout().regions()[0].cells()[0].conns()[0];
        assert_eq!(header.unsigned("STRIDE"), Some(u64::from(layout.stride())));
        assert_eq!(header.unsigned("RECOFF"), Some(u64::from(layout.offset_in_cell())));
        assert_eq!(header.unsigned(names::COUNT), Some(2));
        assert!(live_header(&model, EntityId::Conns(0, 0, 1)).is_err());
    }

    #[test]
    fn names_display_hierarchically() {
        let name = EntityName::conns("v1", "pyr", SourceRef::new("lgn", "on"));
        assert_eq!(name.to_string(), "v1/pyr <- lgn/on");
        assert_eq!(EntityName::region("v1").to_string(), "v1");
    }
}
