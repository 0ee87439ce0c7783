use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use cellstore::error::CellstoreResult;
use cellstore::file::{LiveModel, SaveLayout, SaveWriter, WriteOptions};
use cellstore::io::{IoSink, Partition};
use cellstore::{FieldCatalog, ModelSpec};

use crate::demo::fill;
use crate::mesh::on_mesh;

#[derive(clap::Args)]
pub struct SaveFlags {
    /// Title recorded in the identification header.
    #[arg(long, default_value = "cellstore demo")]
    pub title: String,
    #[arg(long, default_value = "")]
    pub label: String,
    /// Seed of the demo data.
    #[arg(long, default_value_t = 1)]
    pub seed: i32,
    /// Number of nodes the model is distributed over.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub nodes: u16,
    #[arg(long)]
    pub chunk_size: Option<usize>,
}

pub fn exec_save(
    model: impl AsRef<Path>,
    output: impl AsRef<Path>,
    flags: SaveFlags,
) -> anyhow::Result<()> {
    let spec = ModelSpec::from_path(model)?;
    let mut options = WriteOptions::default()
        .with_title(flags.title)?
        .with_label(flags.label)?;
    if let Some(chunk_size) = flags.chunk_size {
        options = options.with_chunk_size(chunk_size)?;
    }
    let writer = SaveWriter::new(options);
    let partition = Partition::new(usize::from(flags.nodes));
    let part = |node| -> CellstoreResult<LiveModel> {
        let mut live = LiveModel::for_node(spec.clone(), FieldCatalog::standard(), partition, node)?;
        fill(&mut live, flags.seed)?;
        Ok(live)
    };

    let output = output.as_ref();
    let sink = IoSink::new(BufWriter::new(File::create(output)?));
    let coordinator = part(0)?;
    let length = SaveLayout::new(&coordinator)?.length();
    on_mesh(
        partition.nodes(),
        |channel| writer.write_coordinator(sink, &coordinator, channel)?.finish(),
        |node, channel| writer.write_worker(&part(node)?, channel),
    )?;
    tracing::info!("wrote {} bytes to {}", length, output.display());
    Ok(())
}
