use std::io::IsTerminal;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log targets of this workspace. Targets match by prefix and `log` records carry their module
/// path, so `cellstore` covers every module of every library crate.
const OWN_TARGETS: [&str; 2] = ["csx", "cellstore"];

/// Log to stderr; the library crates' `log` records are forwarded to the subscriber.
pub fn setup_logger(filter: EnvFilter) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_target(true)
        .with_env_filter(filter)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

/// `RUST_LOG` when set. Otherwise warnings from everything, and info (trace when verbose)
/// from the cellstore crates.
pub fn default_env_filter(is_verbose: bool) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .parse_lossy(own_directives(is_verbose)),
    }
}

fn own_directives(is_verbose: bool) -> String {
    let level = if is_verbose { "trace" } else { "info" };
    OWN_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}
