//! Configuration types for runtime, output and series settings

use crate::error::PipeError;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Storage backends available for a series location
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A JSON document on disk
    Json,
    /// A named series living in this process
    Memory,
}

/// Per-series configuration blob, given as JSON on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeriesConfig {
    /// Backend override (default: inferred from the location)
    pub backend: Option<BackendKind>,
    /// Reader waits for a producer to close further iterations
    pub streaming: bool,
    /// Pretty-print written JSON documents
    pub pretty: bool,
}

impl SeriesConfig {
    /// Parse a JSON configuration blob. An empty or blank blob means defaults.
    pub fn parse(blob: &str) -> Result<Self, PipeError> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(blob).map_err(|err| {
            PipeError::Configuration(format!("malformed series configuration {blob:?}: {err}"))
        })
    }
}
