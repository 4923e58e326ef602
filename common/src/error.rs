use crate::hierarchy::{NodeKind, NodePath};

/// Fatal failures of a pipe run. None of them is retried.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// Unknown strategy name, malformed configuration blob, unusable location.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("structural mismatch at {path}: source is {source_kind}, destination is {destination_kind}")]
    StructuralMismatch {
        path: NodePath,
        source_kind: NodeKind,
        destination_kind: NodeKind,
    },
    #[error("unsupported node at {path}: {kind}")]
    UnsupportedNode { path: NodePath, kind: String },
    /// Read, write or flush failure reported by a backend.
    #[error("backend failure at {path}: {source:#}")]
    Backend {
        path: NodePath,
        #[source]
        source: anyhow::Error,
    },
}

impl PipeError {
    pub fn backend(path: &NodePath, source: anyhow::Error) -> Self {
        PipeError::Backend {
            path: path.clone(),
            source,
        }
    }
}
