//! Abstract source and destination interfaces the walker is written against.
//!
//! Nodes are addressed by [`NodePath`]. A reader serves one iteration at a time in increasing
//! index order; a writer accepts chunk reservations ([`WritableSpan`]s) that are filled later
//! and committed when the destination iteration is closed.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::chunk::{Chunk, byte_len};
use crate::comm::Communicator;
use crate::config::{BackendKind, SeriesConfig};
use crate::error::PipeError;
use crate::hierarchy::{Attribute, DatasetInfo, Datatype, NodeKind, NodePath, Scalar};
use crate::{json, memory};

/// Location prefix selecting the in-memory backend.
pub const MEMORY_SCHEME: &str = "memory://";

/// Destination buffer for one chunk, reserved before the data is read.
///
/// Cloning yields another handle to the same buffer.
#[derive(Debug, Clone)]
pub struct WritableSpan {
    dtype: Datatype,
    extent: Vec<u64>,
    len: usize,
    buffer: Arc<tokio::sync::Mutex<Vec<u8>>>,
}

impl WritableSpan {
    /// Fails if the extent does not fit in memory.
    pub fn zeroed(dtype: Datatype, extent: &[u64]) -> anyhow::Result<Self> {
        let len = byte_len(extent, dtype.size())?;
        Ok(Self {
            dtype,
            extent: extent.to_vec(),
            len,
            buffer: Arc::new(tokio::sync::Mutex::new(vec![0; len])),
        })
    }

    #[must_use]
    pub fn dtype(&self) -> Datatype {
        self.dtype
    }

    #[must_use]
    pub fn extent(&self) -> &[u64] {
        &self.extent
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fills the whole span. `bytes` must be exactly [`WritableSpan::len`] long.
    pub async fn write(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut buffer = self.buffer.lock().await;
        if bytes.len() != buffer.len() {
            return Err(anyhow!(
                "span of {} bytes cannot take {} bytes",
                buffer.len(),
                bytes.len()
            ));
        }
        buffer.copy_from_slice(bytes);
        Ok(())
    }

    pub async fn contents(&self) -> Vec<u8> {
        self.buffer.lock().await.clone()
    }
}

#[async_trait]
pub trait SeriesReader: Send + Sync {
    /// Next iteration in increasing index order, `None` once the series has ended.
    /// May block on streaming sources.
    async fn next_iteration(&mut self) -> anyhow::Result<Option<u64>>;
    /// Releases the iteration; nothing under it may be read afterwards.
    async fn close_iteration(&mut self, index: u64) -> anyhow::Result<()>;
    async fn contains(&self, path: &NodePath) -> anyhow::Result<bool>;
    async fn kind(&self, path: &NodePath) -> anyhow::Result<NodeKind>;
    /// Child names of a container. A particle species does not list its patch sub-tree.
    async fn children(&self, path: &NodePath) -> anyhow::Result<Vec<String>>;
    async fn attributes(&self, path: &NodePath) -> anyhow::Result<Vec<(String, Attribute)>>;
    async fn dataset(&self, path: &NodePath) -> anyhow::Result<DatasetInfo>;
    async fn available_chunks(&self, path: &NodePath) -> anyhow::Result<Vec<Chunk>>;
    /// Reads the region `offset..offset+extent` into `span`.
    async fn load_chunk(
        &self,
        path: &NodePath,
        offset: &[u64],
        extent: &[u64],
        span: &WritableSpan,
    ) -> anyhow::Result<()>;
    /// All values of a patch record component.
    async fn load_patch(&self, path: &NodePath) -> anyhow::Result<Vec<Scalar>>;
}

#[async_trait]
pub trait SeriesWriter: Send + Sync {
    /// Opens iteration `index`, creating it on first access.
    async fn open_iteration(&mut self, index: u64) -> anyhow::Result<()>;
    /// Commits every span reserved so far and flushes. Collective over the communicator.
    async fn close_iteration(&mut self, index: u64) -> anyhow::Result<()>;
    /// Kind of the node at `path`, `None` if it does not exist yet.
    async fn kind(&self, path: &NodePath) -> anyhow::Result<Option<NodeKind>>;
    async fn create_node(&mut self, path: &NodePath, kind: NodeKind) -> anyhow::Result<()>;
    async fn set_attribute(
        &mut self,
        path: &NodePath,
        key: &str,
        value: Attribute,
    ) -> anyhow::Result<()>;
    /// Declares element type and shape. Existing data is kept if both already match.
    async fn reset_dataset(
        &mut self,
        path: &NodePath,
        dtype: Datatype,
        shape: &[u64],
    ) -> anyhow::Result<()>;
    async fn make_constant(&mut self, path: &NodePath, value: Scalar) -> anyhow::Result<()>;
    /// Reserves a buffer for the region `offset..offset+extent`.
    async fn store_chunk(
        &mut self,
        path: &NodePath,
        offset: &[u64],
        extent: &[u64],
    ) -> anyhow::Result<WritableSpan>;
    /// Stores one entry of a patch record component.
    async fn store_patch(&mut self, path: &NodePath, index: u64, value: Scalar)
    -> anyhow::Result<()>;
    /// Marks the series as complete. Collective over the communicator.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Backend selected by `config`, or inferred from the location.
pub fn backend_kind(location: &str, config: &SeriesConfig) -> Result<BackendKind, PipeError> {
    if let Some(kind) = config.backend {
        return Ok(kind);
    }
    if location.starts_with(MEMORY_SCHEME) {
        Ok(BackendKind::Memory)
    } else if location.ends_with(".json") {
        Ok(BackendKind::Json)
    } else {
        Err(PipeError::Configuration(format!(
            "cannot infer a backend for {location:?}, use a .json file, {MEMORY_SCHEME}<name> or set \"backend\""
        )))
    }
}

fn memory_name(location: &str) -> &str {
    location.strip_prefix(MEMORY_SCHEME).unwrap_or(location)
}

/// Opens a read-only source.
pub async fn open_reader(
    location: &str,
    config: &SeriesConfig,
    comm: Arc<dyn Communicator>,
) -> Result<Box<dyn SeriesReader>, PipeError> {
    tracing::debug!("rank {} opening {location} for reading", comm.rank());
    let reader: Box<dyn SeriesReader> = match backend_kind(location, config)? {
        BackendKind::Memory => Box::new(
            memory::open_reader(memory_name(location), config)
                .await
                .map_err(|err| PipeError::backend(&NodePath::root(), err))?,
        ),
        BackendKind::Json => {
            if config.streaming {
                return Err(PipeError::Configuration(
                    "streaming reads are only supported by the memory backend".to_string(),
                ));
            }
            Box::new(
                json::open_reader(std::path::Path::new(location))
                    .await
                    .map_err(|err| PipeError::backend(&NodePath::root(), err))?,
            )
        }
    };
    Ok(reader)
}

/// Opens a writable destination shared by all ranks of `comm`.
pub async fn open_writer(
    location: &str,
    config: &SeriesConfig,
    comm: Arc<dyn Communicator>,
) -> Result<Box<dyn SeriesWriter>, PipeError> {
    tracing::debug!("rank {} opening {location} for writing", comm.rank());
    let writer: Box<dyn SeriesWriter> = match backend_kind(location, config)? {
        BackendKind::Memory => Box::new(memory::open_writer(memory_name(location), comm).await),
        BackendKind::Json => {
            Box::new(json::open_writer(std::path::Path::new(location), config, comm).await)
        }
    };
    Ok(writer)
}
