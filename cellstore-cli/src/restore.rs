use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use cellstore::error::CellstoreResult;
use cellstore::file::{EntityId, LiveModel, Pin, RestoreOptions, Restorer, open_files};
use cellstore::io::Partition;
use cellstore::{FieldCatalog, ModelSpec};

use crate::mesh::on_mesh;

#[derive(clap::Args)]
pub struct RestoreFlags {
    /// Generate entities no save file has instead of failing.
    #[arg(long)]
    pub allow_generate: bool,
    /// Restore an entity from one file only: `region=FILE`, `region/cell=FILE` or
    /// `region/cell=FILE:ORDINAL`, files numbered from 0.
    #[arg(long)]
    pub pin: Vec<String>,
    /// Number of nodes the model is distributed over.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub nodes: u16,
    #[arg(long)]
    pub chunk_size: Option<usize>,
}

pub fn exec_restore(
    model: impl AsRef<Path>,
    files: Vec<PathBuf>,
    flags: RestoreFlags,
) -> anyhow::Result<()> {
    let spec = ModelSpec::from_path(model)?;
    let partition = Partition::new(usize::from(flags.nodes));
    let fresh = |node| -> CellstoreResult<LiveModel> {
        LiveModel::for_node(spec.clone(), FieldCatalog::standard(), partition, node)
    };
    let mut coordinator = fresh(0)?;

    let mut options = RestoreOptions::default().with_allow_generate(flags.allow_generate);
    if let Some(chunk_size) = flags.chunk_size {
        options = options.with_chunk_size(chunk_size)?;
    }
    for pin in &flags.pin {
        let (entity, pin) =
            parse_pin(&coordinator, pin).with_context(|| format!("invalid pin '{}'", pin))?;
        options = options.with_pin(entity, pin)?;
    }
    let restorer = Restorer::new(options);

    // opened before any node starts, so a missing file cannot leave workers waiting
    let sources = open_files(&files)?;
    let report = on_mesh(
        partition.nodes(),
        |channel| restorer.restore_coordinator(sources, &mut coordinator, channel),
        |node, channel| restorer.restore_worker(&mut fresh(node)?, channel).map(|_| ()),
    )?;

    print!("{}", report);
    tracing::info!(
        "restored {} entities from {} files, {} generated",
        report.entities.len(),
        files.len(),
        report.generated().count()
    );
    Ok(())
}

/// `region=FILE`, `region/cell=FILE` or `region/cell=FILE:ORDINAL`.
fn parse_pin(model: &LiveModel, text: &str) -> anyhow::Result<(EntityId, Pin)> {
    let (name, target) = text
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=FILE"))?;
    let (file, ordinal) = match target.split_once(':') {
        Some((file, ordinal)) => (file, Some(ordinal.parse::<u32>()?)),
        None => (target, None),
    };
    let mut pin = Pin::file(file.parse()?);
    if let Some(ordinal) = ordinal {
        pin = pin.with_ordinal(ordinal);
    }

    let entity = match name.split_once('/') {
        Some((region, cell)) => {
            let (r, c) = model
                .find(region, cell)
                .ok_or_else(|| anyhow!("no cell population {}", name))?;
            EntityId::Cells(r, c)
        }
        None => {
            let Some(r) = model.spec().regions.iter().position(|r| r.name == name) else {
                bail!("no region {}", name);
            };
            EntityId::Region(r)
        }
    };
    Ok((entity, pin))
}
