mod demo;
mod layout;
mod logging;
mod mesh;
mod restore;
mod save;

use std::path::PathBuf;

use cellstore::file::inspect;
use cellstore::io::IoSource;
use clap::Parser;

use crate::logging::{default_env_filter, setup_logger};
use crate::restore::{RestoreFlags, exec_restore};
use crate::save::{SaveFlags, exec_save};

#[derive(clap::Parser)]
#[command(version, about)]
struct Cli {
    /// Log everything down to trace level, unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Print the identification and every header block of a save file.
    Inspect { file: PathBuf },
    /// Print the record layout of a model description.
    Layout { model: PathBuf },
    /// Save a model filled with demo data.
    Save {
        /// JSON model description.
        model: PathBuf,
        /// Save file to write.
        output: PathBuf,
        #[command(flatten)]
        flags: SaveFlags,
    },
    /// Restore a model from one or more save files and report where each entity came from.
    Restore {
        /// JSON model description.
        model: PathBuf,
        /// Save files, searched in order.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        flags: RestoreFlags,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logger(default_env_filter(cli.verbose));

    match cli.command {
        Commands::Inspect { file } => {
            let source = IoSource::new(std::io::BufReader::new(std::fs::File::open(&file)?));
            print!("{}", inspect(source)?);
        }
        Commands::Layout { model } => layout::exec_layout(model)?,
        Commands::Save {
            model,
            output,
            flags,
        } => exec_save(model, output, flags)?,
        Commands::Restore {
            model,
            files,
            flags,
        } => exec_restore(model, files, flags)?,
    };

    Ok(())
}
