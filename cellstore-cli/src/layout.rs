use std::io::Write;
use std::path::Path;

use cellstore::{FieldCatalog, ModelSpec, RecordLayout, Scope, ScopeComposer};

pub fn exec_layout(model: impl AsRef<Path>) -> anyhow::Result<()> {
    let spec = ModelSpec::from_path(model)?;
    let catalog = FieldCatalog::standard();
    let layout = ScopeComposer::new(catalog).compose(&spec)?;
    let mut out = std::io::stdout().lock();

    writeln!(out, "model: {} bytes of records", layout.total())?;
    for region in layout.regions() {
        writeln!(
            out,
            "{}: group record {} bytes, {} bytes in total",
            region.name(),
            region.group_length(),
            region.total()
        )?;
        write_fields(&mut out, catalog, Scope::Group, region.group(), 2)?;
        for cell in region.cells() {
            writeln!(
                out,
                "  {} x{}: {} byte records, {} restorable, alignment {}",
                cell.name(),
                cell.count(),
                cell.record_length(),
                cell.cell().restorable_length(),
                cell.alignment()
            )?;
            write_fields(&mut out, catalog, Scope::Cell, cell.cell(), 4)?;
            for conn in cell.conns() {
                writeln!(
                    out,
                    "    <- {} [{}] at {}: x{} of {} bytes, {} restorable",
                    conn.source(),
                    conn.ordinal(),
                    conn.offset_in_cell(),
                    conn.count(),
                    conn.stride(),
                    conn.per_conn().restorable_length()
                )?;
                write_fields(&mut out, catalog, Scope::Connection, conn.per_conn(), 6)?;
                if conn.once().length() > 0 {
                    writeln!(out, "      once per type at {}:", conn.once_offset())?;
                    write_fields(&mut out, catalog, Scope::ConnType, conn.once(), 8)?;
                }
            }
        }
    }
    Ok(())
}

fn write_fields(
    out: &mut impl Write,
    catalog: &FieldCatalog,
    scope: Scope,
    record: &RecordLayout,
    indent: usize,
) -> anyhow::Result<()> {
    let table = catalog.scope(scope);
    for (code, offset) in record.offsets().allocated() {
        let name = table.name(code).unwrap_or("?");
        writeln!(out, "{:indent$}{:<8} @ {}", "", name, offset, indent = indent)?;
    }
    Ok(())
}
