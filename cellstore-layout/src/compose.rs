use cellstore_buffer::Alignment;
use cellstore_error::{CellstoreResult, ResultExt, cellstore_bail, cellstore_err};
use itertools::Itertools;

use crate::{
    Checkpoint, FieldCatalog, FieldCode, FieldRequests, ModelSpec, OffsetTable, Scope,
    ScopeTable, SourceRef, SpecialLengths, allocate,
};

/// The layout of one scope's record: where each requested field lives, the record length and
/// the alignment an enclosing scope must respect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordLayout {
    offsets: OffsetTable,
    length: u32,
    alignment: Alignment,
    restorable: Option<u32>,
}

impl RecordLayout {
    /// Lay out one record of `table`'s scope.
    pub fn compute(
        table: &ScopeTable,
        requests: &(impl FieldRequests + ?Sized),
        specials: &SpecialLengths,
    ) -> CellstoreResult<Self> {
        let mut offsets = OffsetTable::new(table.len());
        for code in table.order().fields() {
            if requests.is_requested(code) {
                offsets.request(code)?;
            }
        }

        let mut alignment = Alignment::none();
        let mut checkpoint = Checkpoint::new();
        let owner = table
            .scope()
            .allows_checkpoint()
            .then_some(&mut checkpoint);
        let length = allocate(
            table.order(),
            &mut offsets,
            table.lengths(),
            specials,
            owner,
            &mut alignment,
        )?;

        Ok(Self {
            offsets,
            length,
            alignment,
            restorable: checkpoint.get(),
        })
    }

    pub fn offsets(&self) -> &OffsetTable {
        &self.offsets
    }

    pub fn offset(&self, code: FieldCode) -> Option<u32> {
        self.offsets.offset(code)
    }

    /// Length of the record before any end-of-record padding.
    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    /// The length of the prefix eligible for restoration. Records of scopes without a
    /// checkpoint are restorable in full.
    pub fn restorable_length(&self) -> u32 {
        self.restorable.unwrap_or(self.length)
    }

    /// Length padded to the record's own alignment, i.e. the stride of an array of records.
    pub fn padded_length(&self) -> CellstoreResult<u32> {
        pad(self.length, self.alignment)
    }
}

fn pad(length: u32, alignment: Alignment) -> CellstoreResult<u32> {
    alignment
        .align_up(length)
        .ok_or_else(|| cellstore_err!(Overflow: "padding {} bytes to {}", length, alignment))
}

/// The layout of one connection type within a cell record.
///
/// The per-connection records form an array of `count` records of `stride` bytes; the
/// once-per-type record follows at `once_offset`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnLayout {
    source: SourceRef,
    ordinal: u32,
    per_conn: RecordLayout,
    once: RecordLayout,
    count: u32,
    stride: u32,
    once_offset: u32,
    total: u32,
    alignment: Alignment,
    offset_in_cell: u32,
}

impl ConnLayout {
    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    /// Position of this connection type among its cell's connection types.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn per_conn(&self) -> &RecordLayout {
        &self.per_conn
    }

    pub fn once(&self) -> &RecordLayout {
        &self.once
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn once_offset(&self) -> u32 {
        self.once_offset
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    /// Offset of this connection type's block from the start of the cell record.
    pub fn offset_in_cell(&self) -> u32 {
        self.offset_in_cell
    }
}

/// The layout of one cell population: the per-cell record including its connection types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellLayout {
    name: String,
    count: u32,
    cell: RecordLayout,
    conns: Vec<ConnLayout>,
    record_length: u32,
    alignment: Alignment,
    total: u64,
}

impl CellLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn cell(&self) -> &RecordLayout {
        &self.cell
    }

    pub fn conns(&self) -> &[ConnLayout] {
        &self.conns
    }

    /// Bytes per cell, including all connection types and padding.
    pub fn record_length(&self) -> u32 {
        self.record_length
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    /// Bytes for the whole population.
    pub fn total(&self) -> u64 {
        self.total
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionLayout {
    name: String,
    group: RecordLayout,
    group_length: u32,
    cells: Vec<CellLayout>,
    total: u64,
}

impl RegionLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &RecordLayout {
        &self.group
    }

    /// Group record length padded to its own alignment.
    pub fn group_length(&self) -> u32 {
        self.group_length
    }

    pub fn cells(&self) -> &[CellLayout] {
        &self.cells
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Offsets and record lengths of every entity of a model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelLayout {
    regions: Vec<RegionLayout>,
    total: u64,
}

impl ModelLayout {
    pub fn regions(&self) -> &[RegionLayout] {
        &self.regions
    }

    pub fn region(&self, name: &str) -> Option<&RegionLayout> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn cell(&self, region: &str, cell: &str) -> Option<&CellLayout> {
        self.region(region)
            .and_then(|r| r.cells.iter().find(|c| c.name == cell))
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Drives the allocator over every scope of a model and rolls record lengths up the
/// hierarchy: connection -> cell -> region.
pub struct ScopeComposer<'a> {
    catalog: &'a FieldCatalog,
}

impl<'a> ScopeComposer<'a> {
    pub fn new(catalog: &'a FieldCatalog) -> Self {
        Self { catalog }
    }

    pub fn compose(&self, model: &ModelSpec) -> CellstoreResult<ModelLayout> {
        let regions = model
            .regions
            .iter()
            .map(|region| {
                self.compose_region(region)
                    .with_context(|| format!("region {}", region.name))
            })
            .collect::<CellstoreResult<Vec<_>>>()?;
        let total = checked_sum(regions.iter().map(RegionLayout::total))
            .ok_or_else(|| cellstore_err!(Overflow: "model exceeds {} bytes", u64::MAX))?;
        log::debug!("composed {} regions, {} bytes of records", regions.len(), total);
        Ok(ModelLayout { regions, total })
    }

    fn compose_region(&self, region: &crate::RegionSpec) -> CellstoreResult<RegionLayout> {
        let table = self.catalog.scope(Scope::Group);
        let group = RecordLayout::compute(table, &region.group.resolve(table)?, &region.specials)?;
        let group_length = group.padded_length()?;

        let cells = region
            .cells
            .iter()
            .map(|cell| {
                self.compose_cell(cell)
                    .with_context(|| format!("cell population {}/{}", region.name, cell.name))
            })
            .collect::<CellstoreResult<Vec<_>>>()?;

        let total = checked_sum(cells.iter().map(CellLayout::total))
            .and_then(|cells| cells.checked_add(group_length as u64))
            .ok_or_else(|| cellstore_err!(Overflow: "region {} exceeds {} bytes", region.name, u64::MAX))?;

        Ok(RegionLayout {
            name: region.name.clone(),
            group,
            group_length,
            cells,
            total,
        })
    }

    fn compose_cell(&self, spec: &crate::CellSpec) -> CellstoreResult<CellLayout> {
        let table = self.catalog.scope(Scope::Cell);
        let cell = RecordLayout::compute(table, &spec.fields.resolve(table)?, &spec.specials)?;

        let mut conns = spec
            .conns
            .iter()
            .enumerate()
            .map(|(ordinal, conn)| {
                self.compose_conn(conn, u32::try_from(ordinal).unwrap_or(u32::MAX))
                    .with_context(|| format!("connections from {}", conn.source))
            })
            .collect::<CellstoreResult<Vec<_>>>()?;

        let conn_alignment = conns
            .iter()
            .map(ConnLayout::alignment)
            .max()
            .unwrap_or_else(Alignment::none);
        let record_alignment = cell.alignment().max(conn_alignment);

        let mut cursor = pad(cell.length(), record_alignment)?;
        for conn in conns.iter_mut() {
            conn.offset_in_cell = pad(cursor, conn.alignment)?;
            cursor = conn
                .offset_in_cell
                .checked_add(conn.total)
                .ok_or_else(|| cellstore_err!(Overflow: "cell record exceeds {} bytes", u32::MAX))?;
        }
        let record_length = pad(cursor, record_alignment)?;
        let total = (record_length as u64)
            .checked_mul(spec.count as u64)
            .ok_or_else(|| cellstore_err!(Overflow: "{} cells of {} bytes", spec.count, record_length))?;

        log::trace!(
            "cell population {}: {} byte records ({} cell, {} connection types), alignment {}",
            spec.name,
            record_length,
            cell.length(),
            conns.len(),
            record_alignment
        );

        Ok(CellLayout {
            name: spec.name.clone(),
            count: spec.count,
            cell,
            conns,
            record_length,
            alignment: record_alignment,
            total,
        })
    }

    fn compose_conn(&self, spec: &crate::ConnSpec, ordinal: u32) -> CellstoreResult<ConnLayout> {
        let per_table = self.catalog.scope(Scope::Connection);
        let per_conn =
            RecordLayout::compute(per_table, &spec.fields.resolve(per_table)?, &spec.specials)?;
        let once_table = self.catalog.scope(Scope::ConnType);
        let once =
            RecordLayout::compute(once_table, &spec.once_fields.resolve(once_table)?, &spec.specials)?;

        let stride = per_conn.padded_length()?;
        let array = stride.checked_mul(spec.count).ok_or_else(|| {
            cellstore_err!(Overflow: "{} connections of {} bytes", spec.count, stride)
        })?;
        let once_offset = pad(array, once.alignment())?;
        let alignment = per_conn.alignment().max(once.alignment());
        let total = once_offset
            .checked_add(once.length())
            .ok_or_else(|| cellstore_err!(Overflow: "connection type exceeds {} bytes", u32::MAX))
            .and_then(|end| pad(end, alignment))?;

        Ok(ConnLayout {
            source: spec.source.clone(),
            ordinal,
            per_conn,
            once,
            count: spec.count,
            stride,
            once_offset,
            total,
            alignment,
            offset_in_cell: 0,
        })
    }
}

fn checked_sum(mut values: impl Iterator<Item = u64>) -> Option<u64> {
    values.try_fold(0u64, |acc, v| acc.checked_add(v))
}

/// Check that allocated fields of a record never overlap.
pub fn check_disjoint(
    table: &ScopeTable,
    record: &RecordLayout,
    specials: &SpecialLengths,
) -> CellstoreResult<()> {
    let ranges = record
        .offsets()
        .allocated()
        .into_iter()
        .map(|(code, offset)| {
            let length = specials.resolve(table.lengths().get(code)?)?;
            Ok((code, offset, offset.saturating_add(length)))
        })
        .collect::<CellstoreResult<Vec<_>>>()?;
    for ((a, _, a_end), (b, b_start, _)) in ranges.iter().tuple_windows() {
        if *a_end > *b_start {
            cellstore_bail!(Programming: "fields {} and {} overlap", a, b);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rstest::rstest;

    use super::*;
    use crate::catalog::{CELL_CONDUCTANCES, CONN_DELAY_QUEUE};
    use crate::{CellSpec, ConnSpec, FieldSelection, RegionSpec, RequestFn};

    fn selection(names: &[&str]) -> FieldSelection {
        names.iter().copied().collect()
    }

    fn model() -> ModelSpec {
        ModelSpec {
            options: Default::default(),
            regions: vec![RegionSpec {
                name: "V1".into(),
                grid: [4, 4],
                group: selection(&["GSTATE", "GFLAGS"]),
                specials: Default::default(),
                cells: vec![CellSpec {
                    name: "pyr".into(),
                    count: 16,
                    fields: selection(&["IZVU", "GCOND", "SBAR", "PHASE", "XYZ"]),
                    specials: SpecialLengths::new().with(CELL_CONDUCTANCES, 6),
                    history_depth: 2,
                    conns: vec![ConnSpec {
                        source: SourceRef::new("V1", "pyr"),
                        count: 3,
                        once_fields: selection(&["NUK"]),
                        fields: selection(&["CIJ", "DLY", "LIJ", "DLYQ"]),
                        specials: SpecialLengths::new().with(CONN_DELAY_QUEUE, 3),
                        ..Default::default()
                    }],
                    secondary: vec![],
                }],
            }],
        }
    }

    #[test]
    fn composes_hierarchy() {
        let layout = ScopeComposer::new(FieldCatalog::standard())
            .compose(&model())
            .unwrap();
        let region = layout.region("V1").unwrap();
        // GSTATE 0..8, GFLAGS 8..9, padded to 16.
        assert_eq!(region.group().length(), 9);
        assert_eq!(region.group_length(), 16);

        let cell = layout.cell("V1", "pyr").unwrap();
        let table = FieldCatalog::standard().scope(Scope::Cell);
        // IZVU 0..8, GCOND 8..14, SBAR 14..16, PHASE 16..17 | XYZ 20..32.
        assert_eq!(cell.cell().offset(table.code("IZVU").unwrap()), Some(0));
        assert_eq!(cell.cell().offset(table.code("GCOND").unwrap()), Some(8));
        assert_eq!(cell.cell().offset(table.code("SBAR").unwrap()), Some(14));
        assert_eq!(cell.cell().offset(table.code("PHASE").unwrap()), Some(16));
        assert_eq!(cell.cell().offset(table.code("XYZ").unwrap()), Some(20));
        assert_eq!(cell.cell().restorable_length(), 17);
        assert_eq!(cell.cell().length(), 32);

        let conn = &cell.conns()[0];
        // CIJ 0..2, DLY 2..3 | LIJ 4..8, DLYQ 8..11 -> stride 12.
        assert_eq!(conn.per_conn().restorable_length(), 3);
        assert_eq!(conn.stride(), 12);
        // 3 * 12 = 36, NUK at 36..40.
        assert_eq!(conn.once_offset(), 36);
        assert_eq!(conn.total(), 40);
        assert_eq!(conn.offset_in_cell(), 32);
        assert_eq!(cell.record_length(), 72);
        assert_eq!(cell.total(), 72 * 16);
        assert_eq!(region.total(), 16 + 72 * 16);
        assert_eq!(layout.total(), region.total());
    }

    #[test]
    fn composing_twice_is_deterministic() {
        let composer = ScopeComposer::new(FieldCatalog::standard());
        assert_eq!(composer.compose(&model()).unwrap(), composer.compose(&model()).unwrap());
    }

    #[test]
    fn overflow_names_the_entity() {
        let mut model = model();
        model.regions[0].cells[0].count = u32::MAX;
        model.regions[0].cells[0].conns[0].count = u32::MAX / 4;
        let err = ScopeComposer::new(FieldCatalog::standard())
            .compose(&model)
            .unwrap_err();
        assert!(matches!(err.root(), cellstore_error::CellstoreError::Overflow(..)));
        assert!(err.to_string().contains("cell population V1/pyr"));
    }

    #[test]
    fn unknown_field_rejected() {
        let mut model = model();
        model.regions[0].cells[0].fields = selection(&["CIJ"]);
        assert!(
            ScopeComposer::new(FieldCatalog::standard())
                .compose(&model)
                .is_err()
        );
    }

    #[rstest]
    #[case(Scope::Group)]
    #[case(Scope::Cell)]
    #[case(Scope::ConnType)]
    #[case(Scope::Connection)]
    fn every_field_requested_is_disjoint(#[case] scope: Scope) {
        let table = FieldCatalog::standard().scope(scope);
        let specials: SpecialLengths = (0..4).map(|k| (crate::SpecialKey::new(k), 5)).collect();
        let record = RecordLayout::compute(table, &RequestFn(|_| true), &specials).unwrap();
        check_disjoint(table, &record, &specials).unwrap();
        for (code, offset) in record.offsets().allocated() {
            if let crate::LengthSpec::Fixed(length) = table.lengths().get(code).unwrap() {
                assert!(Alignment::of_length(length).is_aligned(offset as u64));
            }
        }
    }

    #[test]
    fn empty_selection_has_empty_record() {
        let table = FieldCatalog::standard().scope(Scope::Cell);
        let record =
            RecordLayout::compute(table, &BTreeSet::<FieldCode>::new(), &SpecialLengths::new()).unwrap();
        assert_eq!(record.length(), 0);
        assert_eq!(record.restorable_length(), 0);
        assert_eq!(record.alignment(), Alignment::none());
    }
}
