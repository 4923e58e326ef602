//! Chunk distribution and deferred transfer engine behind `openpmd-pipe`.
//!
//! A series (root attributes plus numbered iterations of meshes and particle species) is read
//! from a source backend and written to a destination backend by a group of cooperating ranks.
//! For every chunked dataset a [`StrategySpec`] decides which rank copies which part; each rank
//! reserves destination buffers while walking the hierarchy and fills them from the source in
//! one batch per iteration (see [`deferred`]).
//!
//! # Backends
//!
//! - JSON documents on disk (`*.json`, see [`json`])
//! - named in-process series (`memory://<name>`, see [`memory`]), which also support streaming
//!
//! # Ranks
//!
//! Ranks talk through a [`comm::Communicator`]. Inside one process the ranks of a
//! [`comm::LocalGroup`] run as concurrent tasks.

use std::future::Future;

pub mod backend;
pub mod chunk;
pub mod comm;
pub mod config;
pub mod deferred;
pub mod error;
pub mod hierarchy;
pub mod json;
pub mod memory;
pub mod ranks;
pub mod strategy;
pub mod timing;
pub mod walker;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, SeriesConfig};
pub use error::PipeError;
pub use ranks::{Placement, RankDirectory};
pub use strategy::StrategySpec;
pub use walker::{Pipe, Settings, Summary};

fn init_tracing(output: &OutputConfig) {
    let level = match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // a subscriber may already be installed (tests), keep it
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .with_writer(std::io::stderr)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_target(false)
        .try_init();
}

/// Runs `func` on a fresh tokio runtime with logging set up according to `output`.
///
/// Returns `None` if the runtime could not be built or `func` failed; the error has been
/// reported already (unless quiet). The summary is printed to stdout when requested.
pub fn run<Fut, T>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<T>
where
    T: std::fmt::Display,
    Fut: Future<Output = anyhow::Result<T>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                tracing::error!("failed to start tokio runtime: {}", &error);
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
            }
            None
        }
    }
}
