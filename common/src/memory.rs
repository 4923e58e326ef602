//! In-memory series storage.
//!
//! A [`MemoryStore`] holds a whole series as a plain tree of [`Node`]s. It backs three things:
//!
//! - `memory://<name>` locations, registered process-wide so a producer and a consumer in the
//!   same process can stream through it;
//! - the JSON backend, which loads or persists the same tree as a document;
//! - synthetic sources and sinks in tests.
//!
//! Writers reserve chunk buffers with `store_chunk` and only scatter them into the dataset
//! when the iteration is closed. Streaming readers only see iterations a writer has closed
//! and wait on a version counter for more.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;

use crate::backend::{SeriesReader, SeriesWriter, WritableSpan};
use crate::chunk::{Chunk, byte_len, volume};
use crate::comm::Communicator;
use crate::config::SeriesConfig;
use crate::hierarchy::{
    Attribute, ContainerKind, DatasetInfo, DatasetLayout, Datatype, NodeKind, NodePath,
    PARTICLE_PATCHES, Scalar,
};
use crate::json::Document;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Attribute>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<Dataset>,
}

impl Node {
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            attributes: BTreeMap::new(),
            children: BTreeMap::new(),
            dataset: None,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: Attribute) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_child(mut self, name: &str, child: Node) -> Self {
        self.children.insert(name.to_string(), child);
        self
    }

    #[must_use]
    pub fn with_dataset(mut self, dataset: Dataset) -> Self {
        self.dataset = Some(dataset);
        self
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum Storage {
    Empty,
    Constant {
        value: Scalar,
    },
    /// Row-major little-endian values of the whole dataset, plus the chunks written so far.
    Dense {
        data: Vec<u8>,
        #[serde(default)]
        chunks: Vec<Chunk>,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Dataset {
    pub dtype: Datatype,
    pub shape: Vec<u64>,
    pub storage: Storage,
}

impl Dataset {
    #[must_use]
    pub fn empty(dtype: Datatype, shape: &[u64]) -> Self {
        Self {
            dtype,
            shape: shape.to_vec(),
            storage: Storage::Empty,
        }
    }

    #[must_use]
    pub fn constant(value: Scalar, shape: &[u64]) -> Self {
        Self {
            dtype: value.datatype(),
            shape: shape.to_vec(),
            storage: Storage::Constant { value },
        }
    }

    /// Dataset holding `values` in row-major order, written as the given chunks.
    pub fn dense(
        dtype: Datatype,
        shape: &[u64],
        values: &[Scalar],
        chunks: Vec<Chunk>,
    ) -> anyhow::Result<Self> {
        if values.len() as u64 != volume(shape) {
            bail!(
                "{} values do not fill a dataset of shape {:?}",
                values.len(),
                shape
            );
        }
        if let Some(value) = values.iter().find(|value| value.datatype() != dtype) {
            bail!("value {value:?} is not of type {dtype}");
        }
        Ok(Self {
            dtype,
            shape: shape.to_vec(),
            storage: Storage::Dense {
                data: values.iter().flat_map(Scalar::to_le_bytes).collect(),
                chunks,
            },
        })
    }

    /// Bytes the whole dataset occupies, an error if that does not fit in memory.
    fn data_len(&self) -> anyhow::Result<usize> {
        byte_len(&self.shape, self.dtype.size())
    }

    #[must_use]
    pub fn info(&self) -> DatasetInfo {
        DatasetInfo {
            dtype: self.dtype,
            shape: self.shape.clone(),
            layout: match &self.storage {
                Storage::Empty => DatasetLayout::Empty,
                Storage::Constant { value } => DatasetLayout::Constant(*value),
                Storage::Dense { .. } => DatasetLayout::Chunked,
            },
        }
    }

    fn check_region(&self, offset: &[u64], extent: &[u64]) -> anyhow::Result<()> {
        let region = Chunk::new(offset.to_vec(), extent.to_vec(), 0);
        if !region.fits(&self.shape) {
            bail!(
                "region {} lies outside dataset of shape {:?}",
                region,
                self.shape
            );
        }
        Ok(())
    }

    /// Bytes of the region `offset..offset+extent`.
    pub fn read(&self, offset: &[u64], extent: &[u64]) -> anyhow::Result<Vec<u8>> {
        self.check_region(offset, extent)?;
        let elem = self.dtype.size();
        let region_len = byte_len(extent, elem)?;
        match &self.storage {
            Storage::Empty => bail!("dataset has no data"),
            Storage::Constant { value } => Ok(value.to_le_bytes().repeat(region_len / elem)),
            Storage::Dense { data, .. } => {
                let len = self.data_len()?;
                if data.len() != len {
                    bail!(
                        "dataset holds {} bytes, shape {:?} of {} needs {}",
                        data.len(),
                        self.shape,
                        self.dtype,
                        len
                    );
                }
                let mut out = vec![0; region_len];
                for_each_run(&self.shape, offset, extent, elem, |at, region_at, len| {
                    out[region_at..region_at + len].copy_from_slice(&data[at..at + len]);
                });
                Ok(out)
            }
        }
    }

    /// Every element, decoded.
    pub fn values(&self) -> anyhow::Result<Vec<Scalar>> {
        if matches!(self.storage, Storage::Empty) {
            return Ok(Vec::new());
        }
        let bytes = self.read(&vec![0; self.shape.len()], &self.shape)?;
        bytes
            .chunks_exact(self.dtype.size())
            .map(|element| Scalar::from_le_bytes(self.dtype, element))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| anyhow!("failed decoding {} values", self.dtype))
    }

    /// Storage converted to dense form, constants expanded.
    fn take_dense(&mut self) -> anyhow::Result<(Vec<u8>, Vec<Chunk>)> {
        let len = self.data_len()?;
        let count = len / self.dtype.size();
        Ok(match std::mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Dense { data, chunks } if data.len() == len => (data, chunks),
            Storage::Constant { value } => (value.to_le_bytes().repeat(count), Vec::new()),
            _ => (vec![0; len], Vec::new()),
        })
    }

    /// Writes the region `offset..offset+extent` and records it as written by `rank`.
    pub fn commit(
        &mut self,
        offset: &[u64],
        extent: &[u64],
        bytes: &[u8],
        rank: usize,
    ) -> anyhow::Result<()> {
        self.check_region(offset, extent)?;
        let elem = self.dtype.size();
        if bytes.len() != byte_len(extent, elem)? {
            bail!(
                "{} bytes do not fill region of extent {:?} of {}",
                bytes.len(),
                extent,
                self.dtype
            );
        }
        let (mut data, mut chunks) = self.take_dense()?;
        for_each_run(&self.shape, offset, extent, elem, |at, region_at, len| {
            data[at..at + len].copy_from_slice(&bytes[region_at..region_at + len]);
        });
        chunks.retain(|chunk| chunk.offset != offset || chunk.extent != extent);
        chunks.push(Chunk::new(offset.to_vec(), extent.to_vec(), rank));
        self.storage = Storage::Dense { data, chunks };
        Ok(())
    }

    /// Stores entry `index` of a one-dimensional dataset.
    pub fn store_entry(&mut self, index: u64, value: Scalar) -> anyhow::Result<()> {
        if value.datatype() != self.dtype {
            bail!("cannot store {} into dataset of {}", value.datatype(), self.dtype);
        }
        match self.shape.as_slice() {
            [len] if index < *len => {}
            _ => bail!("entry {index} outside dataset of shape {:?}", self.shape),
        }
        let elem = self.dtype.size();
        let (mut data, chunks) = self.take_dense()?;
        let at = index as usize * elem;
        data[at..at + elem].copy_from_slice(&value.to_le_bytes());
        self.storage = Storage::Dense { data, chunks };
        Ok(())
    }

    /// Chunks a reader should report.
    #[must_use]
    pub fn available_chunks(&self) -> Vec<Chunk> {
        match &self.storage {
            Storage::Empty => Vec::new(),
            Storage::Constant { .. } => vec![Chunk::whole(&self.shape, 0)],
            Storage::Dense { chunks, .. } if chunks.is_empty() => {
                vec![Chunk::whole(&self.shape, 0)]
            }
            Storage::Dense { chunks, .. } => chunks.clone(),
        }
    }
}

fn strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1; shape.len()];
    let mut step = 1;
    for (stride, len) in strides.iter_mut().zip(shape).rev() {
        *stride = step;
        step *= len;
    }
    strides
}

/// Walks the region `offset..offset+extent` of a row-major dataset of `shape` one contiguous
/// run at a time. Calls `f(dataset_byte_offset, region_byte_offset, run_bytes)`.
fn for_each_run(
    shape: &[u64],
    offset: &[u64],
    extent: &[u64],
    elem: usize,
    mut f: impl FnMut(usize, usize, usize),
) {
    let Some(last) = shape.len().checked_sub(1) else {
        f(0, 0, elem);
        return;
    };
    if extent.contains(&0) {
        return;
    }
    let dataset_strides = strides(shape);
    let region_strides = strides(extent);
    let run = extent[last] as usize * elem;
    // position within the outer dimensions of the region
    let mut counter = vec![0u64; last];
    loop {
        let mut at = offset[last];
        let mut region_at = 0;
        for (((position, start), stride), region_stride) in counter
            .iter()
            .zip(offset)
            .zip(&dataset_strides)
            .zip(&region_strides)
        {
            at += (start + position) * stride;
            region_at += position * region_stride;
        }
        f(at as usize * elem, region_at as usize * elem, run);
        let mut carried = true;
        for (position, bound) in counter.iter_mut().zip(&extent[..last]).rev() {
            *position += 1;
            if *position < *bound {
                carried = false;
                break;
            }
            *position = 0;
        }
        if carried {
            return;
        }
    }
}

/// A whole series: root attributes and iterations keyed by index.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SeriesData {
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    #[serde(default)]
    pub iterations: BTreeMap<u64, Node>,
    /// Iterations a writer has closed.
    #[serde(default)]
    pub closed: BTreeSet<u64>,
    /// Set once the writer closed the series.
    #[serde(default)]
    pub finished: bool,
}

impl SeriesData {
    fn lookup(&self, path: &NodePath) -> Option<&Node> {
        let (first, rest) = path.segments().split_first()?;
        let mut node = self.iterations.get(&first.parse().ok()?)?;
        for name in rest {
            node = node.children.get(name)?;
        }
        Some(node)
    }

    fn lookup_mut(&mut self, path: &NodePath) -> Option<&mut Node> {
        let (first, rest) = path.segments().split_first()?;
        let mut node = self.iterations.get_mut(&first.parse().ok()?)?;
        for name in rest {
            node = node.children.get_mut(name)?;
        }
        Some(node)
    }

    pub fn node(&self, path: &NodePath) -> anyhow::Result<&Node> {
        self.lookup(path).ok_or_else(|| anyhow!("no node at {path}"))
    }

    pub fn node_mut(&mut self, path: &NodePath) -> anyhow::Result<&mut Node> {
        self.lookup_mut(path).ok_or_else(|| anyhow!("no node at {path}"))
    }

    pub fn dataset(&self, path: &NodePath) -> anyhow::Result<&Dataset> {
        self.node(path)?
            .dataset
            .as_ref()
            .ok_or_else(|| anyhow!("no dataset at {path}"))
    }

    pub fn dataset_mut(&mut self, path: &NodePath) -> anyhow::Result<&mut Dataset> {
        self.node_mut(path)?
            .dataset
            .as_mut()
            .ok_or_else(|| anyhow!("no dataset at {path}"))
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    data: tokio::sync::Mutex<SeriesData>,
    version: tokio::sync::watch::Sender<u64>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(data: SeriesData) -> Self {
        let (version, _) = tokio::sync::watch::channel(0);
        Self {
            data: tokio::sync::Mutex::new(data),
            version,
        }
    }

    pub async fn snapshot(&self) -> SeriesData {
        self.data.lock().await.clone()
    }

    /// Replaces the whole series and wakes waiting readers.
    pub async fn replace(&self, data: SeriesData) {
        *self.data.lock().await = data;
        self.notify();
    }

    fn notify(&self) {
        self.version.send_modify(|version| *version += 1);
    }
}

static NAMED: tokio::sync::Mutex<BTreeMap<String, Arc<MemoryStore>>> =
    tokio::sync::Mutex::const_new(BTreeMap::new());

/// The store registered under `name`, created empty if absent.
pub async fn named(name: &str) -> Arc<MemoryStore> {
    NAMED
        .lock()
        .await
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(MemoryStore::new(SeriesData::default())))
        .clone()
}

pub async fn lookup(name: &str) -> Option<Arc<MemoryStore>> {
    NAMED.lock().await.get(name).cloned()
}

pub async fn remove(name: &str) -> Option<Arc<MemoryStore>> {
    NAMED.lock().await.remove(name)
}

/// Opens a named series for reading. A streaming reader may open a series no producer
/// has created yet.
pub async fn open_reader(name: &str, config: &SeriesConfig) -> anyhow::Result<MemoryReader> {
    let store = if config.streaming {
        named(name).await
    } else {
        lookup(name)
            .await
            .ok_or_else(|| anyhow!("no in-memory series named {name:?}"))?
    };
    Ok(MemoryReader::new(store, config.streaming))
}

/// Opens a named series for writing, keeping whatever it already holds.
pub async fn open_writer(name: &str, comm: Arc<dyn Communicator>) -> MemoryWriter {
    MemoryWriter::new(named(name).await, comm, None)
}

pub struct MemoryReader {
    store: Arc<MemoryStore>,
    streaming: bool,
    changes: tokio::sync::watch::Receiver<u64>,
    current: Option<u64>,
    released: BTreeSet<u64>,
}

impl MemoryReader {
    #[must_use]
    pub fn new(store: Arc<MemoryStore>, streaming: bool) -> Self {
        let changes = store.version.subscribe();
        Self {
            store,
            streaming,
            changes,
            current: None,
            released: BTreeSet::new(),
        }
    }

    fn check_open(&self, path: &NodePath) -> anyhow::Result<()> {
        match path.iteration_index() {
            Some(index) if self.released.contains(&index) => {
                bail!("iteration {index} was already closed")
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SeriesReader for MemoryReader {
    async fn next_iteration(&mut self) -> anyhow::Result<Option<u64>> {
        loop {
            self.changes.borrow_and_update();
            {
                let data = self.store.data.lock().await;
                let after = |index: &&u64| self.current.is_none_or(|current| **index > current);
                let next = if self.streaming {
                    data.closed.iter().find(after).copied()
                } else {
                    data.iterations.keys().find(after).copied()
                };
                if let Some(index) = next {
                    self.current = Some(index);
                    return Ok(Some(index));
                }
                if !self.streaming || data.finished {
                    return Ok(None);
                }
            }
            tracing::debug!("waiting for the producer to close another iteration");
            self.changes
                .changed()
                .await
                .context("in-memory series went away")?;
        }
    }

    async fn close_iteration(&mut self, index: u64) -> anyhow::Result<()> {
        self.released.insert(index);
        Ok(())
    }

    async fn contains(&self, path: &NodePath) -> anyhow::Result<bool> {
        Ok(path.is_root() || self.store.data.lock().await.lookup(path).is_some())
    }

    async fn kind(&self, path: &NodePath) -> anyhow::Result<NodeKind> {
        if path.is_root() {
            return Ok(NodeKind::Series);
        }
        Ok(self.store.data.lock().await.node(path)?.kind.clone())
    }

    async fn children(&self, path: &NodePath) -> anyhow::Result<Vec<String>> {
        let data = self.store.data.lock().await;
        if path.is_root() {
            return Ok(data.iterations.keys().map(u64::to_string).collect());
        }
        let node = data.node(path)?;
        let species = node.kind == NodeKind::Container(ContainerKind::ParticleSpecies);
        Ok(node
            .children
            .keys()
            .filter(|name| !(species && name.as_str() == PARTICLE_PATCHES))
            .cloned()
            .collect())
    }

    async fn attributes(&self, path: &NodePath) -> anyhow::Result<Vec<(String, Attribute)>> {
        let data = self.store.data.lock().await;
        let attributes = if path.is_root() {
            &data.attributes
        } else {
            &data.node(path)?.attributes
        };
        Ok(attributes
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn dataset(&self, path: &NodePath) -> anyhow::Result<DatasetInfo> {
        let data = self.store.data.lock().await;
        let dataset = data.dataset(path)?;
        dataset.data_len()?;
        Ok(dataset.info())
    }

    async fn available_chunks(&self, path: &NodePath) -> anyhow::Result<Vec<Chunk>> {
        Ok(self
            .store
            .data
            .lock()
            .await
            .dataset(path)?
            .available_chunks())
    }

    async fn load_chunk(
        &self,
        path: &NodePath,
        offset: &[u64],
        extent: &[u64],
        span: &WritableSpan,
    ) -> anyhow::Result<()> {
        self.check_open(path)?;
        let bytes = {
            let data = self.store.data.lock().await;
            let dataset = data.dataset(path)?;
            if dataset.dtype != span.dtype() || extent != span.extent() {
                bail!(
                    "span of {} {:?} does not match {} {:?}",
                    span.dtype(),
                    span.extent(),
                    dataset.dtype,
                    extent
                );
            }
            dataset.read(offset, extent)?
        };
        span.write(&bytes).await
    }

    async fn load_patch(&self, path: &NodePath) -> anyhow::Result<Vec<Scalar>> {
        self.check_open(path)?;
        self.store.data.lock().await.dataset(path)?.values()
    }
}

struct PendingChunk {
    path: NodePath,
    offset: Vec<u64>,
    extent: Vec<u64>,
    span: WritableSpan,
}

pub struct MemoryWriter {
    store: Arc<MemoryStore>,
    comm: Arc<dyn Communicator>,
    pending: Vec<PendingChunk>,
    document: Option<Document>,
}

impl MemoryWriter {
    /// Writer over `store`. With a `document`, every flush also rewrites that file.
    #[must_use]
    pub fn new(
        store: Arc<MemoryStore>,
        comm: Arc<dyn Communicator>,
        document: Option<Document>,
    ) -> Self {
        Self {
            store,
            comm,
            pending: Vec::new(),
            document,
        }
    }

    async fn commit_pending(&mut self) -> anyhow::Result<()> {
        let rank = self.comm.rank();
        let pending = std::mem::take(&mut self.pending);
        let mut data = self.store.data.lock().await;
        for chunk in pending {
            let bytes = chunk.span.contents().await;
            data.dataset_mut(&chunk.path)?
                .commit(&chunk.offset, &chunk.extent, &bytes, rank)
                .with_context(|| format!("failed committing chunk to {}", chunk.path))?;
        }
        Ok(())
    }

    async fn flush(&self, update: impl FnOnce(&mut SeriesData) + Send) -> anyhow::Result<()> {
        let mut data = self.store.data.lock().await;
        update(&mut data);
        let saved = match &self.document {
            Some(document) => document.save(&data).await,
            None => Ok(()),
        };
        drop(data);
        self.store.notify();
        saved
    }

    /// Commit, then let rank 0 apply `update` and flush between two barriers.
    async fn collective_flush(
        &mut self,
        update: impl FnOnce(&mut SeriesData) + Send,
    ) -> anyhow::Result<()> {
        let committed = self.commit_pending().await;
        self.comm.barrier().await?;
        let flushed = if self.comm.rank() == 0 {
            self.flush(update).await
        } else {
            Ok(())
        };
        self.comm.barrier().await?;
        committed.and(flushed)
    }
}

#[async_trait]
impl SeriesWriter for MemoryWriter {
    async fn open_iteration(&mut self, index: u64) -> anyhow::Result<()> {
        self.create_node(&NodePath::iteration(index), NodeKind::Iteration)
            .await
    }

    async fn close_iteration(&mut self, index: u64) -> anyhow::Result<()> {
        self.collective_flush(move |data| {
            data.closed.insert(index);
        })
        .await
    }

    async fn kind(&self, path: &NodePath) -> anyhow::Result<Option<NodeKind>> {
        if path.is_root() {
            return Ok(Some(NodeKind::Series));
        }
        let data = self.store.data.lock().await;
        Ok(data.lookup(path).map(|node| node.kind.clone()))
    }

    async fn create_node(&mut self, path: &NodePath, kind: NodeKind) -> anyhow::Result<()> {
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            bail!("cannot create the series root");
        };
        let mut data = self.store.data.lock().await;
        let node = if parent.is_root() {
            let index = path
                .iteration_index()
                .ok_or_else(|| anyhow!("{path} is not an iteration"))?;
            data.iterations
                .entry(index)
                .or_insert_with(|| Node::new(kind.clone()))
        } else {
            data.node_mut(&parent)?
                .children
                .entry(name.to_string())
                .or_insert_with(|| Node::new(kind.clone()))
        };
        if node.kind != kind {
            bail!("{path} already exists as {}", node.kind);
        }
        Ok(())
    }

    async fn set_attribute(
        &mut self,
        path: &NodePath,
        key: &str,
        value: Attribute,
    ) -> anyhow::Result<()> {
        let mut data = self.store.data.lock().await;
        let attributes = if path.is_root() {
            &mut data.attributes
        } else {
            &mut data.node_mut(path)?.attributes
        };
        attributes.insert(key.to_string(), value);
        Ok(())
    }

    async fn reset_dataset(
        &mut self,
        path: &NodePath,
        dtype: Datatype,
        shape: &[u64],
    ) -> anyhow::Result<()> {
        let mut data = self.store.data.lock().await;
        let node = data.node_mut(path)?;
        let unchanged = node
            .dataset
            .as_ref()
            .is_some_and(|dataset| dataset.dtype == dtype && dataset.shape == shape);
        if !unchanged {
            node.dataset = Some(Dataset::empty(dtype, shape));
        }
        Ok(())
    }

    async fn make_constant(&mut self, path: &NodePath, value: Scalar) -> anyhow::Result<()> {
        let mut data = self.store.data.lock().await;
        let dataset = data.dataset_mut(path)?;
        if dataset.dtype != value.datatype() {
            bail!(
                "constant of {} for dataset of {}",
                value.datatype(),
                dataset.dtype
            );
        }
        dataset.storage = Storage::Constant { value };
        Ok(())
    }

    async fn store_chunk(
        &mut self,
        path: &NodePath,
        offset: &[u64],
        extent: &[u64],
    ) -> anyhow::Result<WritableSpan> {
        let dtype = {
            let data = self.store.data.lock().await;
            let dataset = data.dataset(path)?;
            dataset.check_region(offset, extent)?;
            dataset.dtype
        };
        let span = WritableSpan::zeroed(dtype, extent)?;
        self.pending.push(PendingChunk {
            path: path.clone(),
            offset: offset.to_vec(),
            extent: extent.to_vec(),
            span: span.clone(),
        });
        Ok(span)
    }

    async fn store_patch(
        &mut self,
        path: &NodePath,
        index: u64,
        value: Scalar,
    ) -> anyhow::Result<()> {
        self.store
            .data
            .lock()
            .await
            .dataset_mut(path)?
            .store_entry(index, value)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.collective_flush(|data| data.finished = true).await
    }
}
