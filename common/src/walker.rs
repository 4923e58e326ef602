use std::sync::Arc;

use async_recursion::async_recursion;
use tracing::instrument;

use crate::backend::{SeriesReader, SeriesWriter};
use crate::chunk::ChunkTable;
use crate::comm::Communicator;
use crate::deferred::{DeferredLoad, DeferredPatchStore, TransferQueue};
use crate::error::PipeError;
use crate::hierarchy::{
    ContainerKind, DatasetLayout, MESHES, NodeKind, NodePath, PARTICLE_PATCHES, PARTICLES,
    RANK_META_ATTRIBUTE,
};
use crate::ranks::RankDirectory;
use crate::strategy::StrategySpec;
use crate::timing::TimingLog;

/// Error type for pipe runs that preserves the summary of what was copied before the failure.
///
/// The Display implementation shows the full error chain.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: PipeError,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: PipeError, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub strategy: StrategySpec,
    /// Log every chunk this rank takes over.
    pub debug_chunks: bool,
}

#[derive(Copy, Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub iterations_copied: usize,
    pub record_components: usize,
    pub constant_components: usize,
    pub empty_components: usize,
    pub patch_components: usize,
    pub chunks_loaded: usize,
    pub bytes_loaded: u64,
    pub patch_entries_stored: usize,
    pub attributes_copied: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            iterations_copied: self.iterations_copied.max(other.iterations_copied),
            record_components: self.record_components + other.record_components,
            constant_components: self.constant_components + other.constant_components,
            empty_components: self.empty_components + other.empty_components,
            patch_components: self.patch_components + other.patch_components,
            chunks_loaded: self.chunks_loaded + other.chunks_loaded,
            bytes_loaded: self.bytes_loaded + other.bytes_loaded,
            patch_entries_stored: self.patch_entries_stored + other.patch_entries_stored,
            attributes_copied: self.attributes_copied + other.attributes_copied,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "iterations copied: {}\n\
            record components: {}\n\
            constant components: {}\n\
            empty components: {}\n\
            patch components: {}\n\
            chunks loaded: {}\n\
            bytes loaded: {}\n\
            patch entries stored: {}\n\
            attributes copied: {}",
            self.iterations_copied,
            self.record_components,
            self.constant_components,
            self.empty_components,
            self.patch_components,
            self.chunks_loaded,
            bytesize::ByteSize(self.bytes_loaded),
            self.patch_entries_stored,
            self.attributes_copied,
        )
    }
}

/// Copies a whole series from a source to a destination on one rank.
///
/// Every rank of the communicator runs its own `Pipe` over its own reader and writer; ranks
/// only coordinate through the strategy (which is deterministic) and through the collective
/// destination flush.
#[derive(Debug)]
pub struct Pipe {
    comm: Arc<dyn Communicator>,
    out_ranks: RankDirectory,
    settings: Settings,
}

impl Pipe {
    /// `out_ranks` is the directory of the ranks of `comm`, see [`RankDirectory::collect`].
    #[must_use]
    pub fn new(comm: Arc<dyn Communicator>, out_ranks: RankDirectory, settings: Settings) -> Self {
        Self {
            comm,
            out_ranks,
            settings,
        }
    }

    #[instrument(skip_all, fields(rank = self.comm.rank(), strategy = %self.settings.strategy))]
    pub async fn run(
        &self,
        src: &mut dyn SeriesReader,
        dst: &mut dyn SeriesWriter,
        timing: &mut TimingLog,
    ) -> Result<Summary, Error> {
        let mut summary = Summary::default();
        match self.run_series(src, dst, timing, &mut summary).await {
            Ok(()) => Ok(summary),
            Err(source) => Err(Error::new(source, summary)),
        }
    }

    async fn run_series(
        &self,
        src: &mut dyn SeriesReader,
        dst: &mut dyn SeriesWriter,
        timing: &mut TimingLog,
        summary: &mut Summary,
    ) -> Result<(), PipeError> {
        let root = NodePath::root();
        let in_ranks = source_ranks(src).await?;
        summary.attributes_copied += copy_attributes(src, dst, &root).await?;
        dst.set_attribute(&root, RANK_META_ATTRIBUTE, self.out_ranks.to_attribute())
            .await
            .map_err(|err| PipeError::backend(&root, err))?;
        while let Some(index) = src
            .next_iteration()
            .await
            .map_err(|err| PipeError::backend(&root, err))?
        {
            self.copy_iteration(index, &in_ranks, src, dst, timing, summary)
                .await?;
        }
        dst.close()
            .await
            .map_err(|err| PipeError::backend(&root, err))?;
        tracing::info!("series complete");
        Ok(())
    }

    /// Copies one iteration: structure, then loads, then closes in a fixed order.
    #[instrument(skip(self, in_ranks, src, dst, timing, summary))]
    async fn copy_iteration(
        &self,
        index: u64,
        in_ranks: &RankDirectory,
        src: &mut dyn SeriesReader,
        dst: &mut dyn SeriesWriter,
        timing: &mut TimingLog,
        summary: &mut Summary,
    ) -> Result<(), PipeError> {
        let path = NodePath::iteration(index);
        timing.now(&format!("Received iteration {index}")).await;
        tracing::info!("received iteration {index}");
        if self.comm.rank() == 0 {
            describe_iteration(src, &path).await?;
        }
        dst.open_iteration(index)
            .await
            .map_err(|err| PipeError::backend(&path, err))?;
        let mut queue = TransferQueue::new();
        self.copy_node(src, dst, &path, in_ranks, &mut queue, summary)
            .await?;
        let loaded = queue.resolve_loads(src).await?;
        summary.chunks_loaded += loaded.entries;
        summary.bytes_loaded += loaded.bytes;
        timing
            .now(&format!("Closing incoming iteration {index}"))
            .await;
        src.close_iteration(index)
            .await
            .map_err(|err| PipeError::backend(&path, err))?;
        let stored = queue.run_patch_stores(dst).await?;
        summary.patch_entries_stored += stored.entries;
        timing
            .now(&format!("Closing outgoing iteration {index}"))
            .await;
        dst.close_iteration(index)
            .await
            .map_err(|err| PipeError::backend(&path, err))?;
        timing
            .now(&format!("Closed outgoing iteration {index}"))
            .await;
        timing.flush().await;
        summary.iterations_copied += 1;
        Ok(())
    }

    #[async_recursion]
    async fn copy_node(
        &self,
        src: &dyn SeriesReader,
        dst: &mut dyn SeriesWriter,
        path: &NodePath,
        in_ranks: &RankDirectory,
        queue: &mut TransferQueue,
        summary: &mut Summary,
    ) -> Result<(), PipeError> {
        let kind = src
            .kind(path)
            .await
            .map_err(|err| PipeError::backend(path, err))?;
        tracing::debug!("copying {} {}", &kind, path);
        match kind {
            NodeKind::Iteration => {
                summary.attributes_copied += mirror(src, dst, path, &kind).await?;
                for name in [MESHES, PARTICLES] {
                    let child = path.join(name);
                    if contains(src, &child).await? {
                        self.copy_node(src, dst, &child, in_ranks, queue, summary)
                            .await?;
                    }
                }
                Ok(())
            }
            NodeKind::Container(container) => {
                summary.attributes_copied += mirror(src, dst, path, &kind).await?;
                let children = src
                    .children(path)
                    .await
                    .map_err(|err| PipeError::backend(path, err))?;
                for name in children {
                    self.copy_node(src, dst, &path.join(&name), in_ranks, queue, summary)
                        .await?;
                }
                if container == ContainerKind::ParticleSpecies {
                    let patches = path.join(PARTICLE_PATCHES);
                    if contains(src, &patches).await? {
                        self.copy_node(src, dst, &patches, in_ranks, queue, summary)
                            .await?;
                    }
                }
                Ok(())
            }
            NodeKind::RecordComponent => {
                summary.attributes_copied += mirror(src, dst, path, &kind).await?;
                self.copy_component(src, dst, path, in_ranks, queue, summary)
                    .await
            }
            NodeKind::PatchRecordComponent => {
                summary.attributes_copied += mirror(src, dst, path, &kind).await?;
                self.copy_patch_component(src, dst, path, queue, summary)
                    .await
            }
            NodeKind::Series | NodeKind::Foreign(_) => Err(PipeError::UnsupportedNode {
                path: path.clone(),
                kind: kind.to_string(),
            }),
        }
    }

    async fn copy_component(
        &self,
        src: &dyn SeriesReader,
        dst: &mut dyn SeriesWriter,
        path: &NodePath,
        in_ranks: &RankDirectory,
        queue: &mut TransferQueue,
        summary: &mut Summary,
    ) -> Result<(), PipeError> {
        let backend = |err| PipeError::backend(path, err);
        let info = src.dataset(path).await.map_err(backend)?;
        dst.reset_dataset(path, info.dtype, &info.shape)
            .await
            .map_err(backend)?;
        summary.record_components += 1;
        let empty = info.is_empty();
        match info.layout {
            DatasetLayout::Constant(value) if !empty => {
                dst.make_constant(path, value).await.map_err(backend)?;
                summary.constant_components += 1;
            }
            DatasetLayout::Chunked if !empty => {
                let chunks = src.available_chunks(path).await.map_err(backend)?;
                let table = ChunkTable::new(info.shape, chunks);
                let assigned = self
                    .settings
                    .strategy
                    .assign(&table, in_ranks, &self.out_ranks)
                    .map_err(|err| match err {
                        PipeError::Configuration(message) => {
                            PipeError::Configuration(format!("{path}: {message}"))
                        }
                        other => other,
                    })?;
                let rank = self.comm.rank();
                for piece in assigned.into_iter().filter(|a| a.destination_rank == rank) {
                    if self.settings.debug_chunks {
                        tracing::info!("{}\t{}/{}:\t{}", path, rank, self.comm.size(), &piece.chunk);
                    }
                    let span = dst
                        .store_chunk(path, &piece.chunk.offset, &piece.chunk.extent)
                        .await
                        .map_err(backend)?;
                    queue.push_load(DeferredLoad {
                        source: path.clone(),
                        span,
                        offset: piece.chunk.offset,
                        extent: piece.chunk.extent,
                    });
                }
            }
            _ => summary.empty_components += 1,
        }
        Ok(())
    }

    /// Patch records are small; rank 0 handles them alone.
    async fn copy_patch_component(
        &self,
        src: &dyn SeriesReader,
        dst: &mut dyn SeriesWriter,
        path: &NodePath,
        queue: &mut TransferQueue,
        summary: &mut Summary,
    ) -> Result<(), PipeError> {
        let backend = |err| PipeError::backend(path, err);
        let info = src.dataset(path).await.map_err(backend)?;
        dst.reset_dataset(path, info.dtype, &info.shape)
            .await
            .map_err(backend)?;
        summary.patch_components += 1;
        if self.comm.rank() == 0 {
            let values = src.load_patch(path).await.map_err(backend)?;
            queue.push_patch_store(DeferredPatchStore {
                values,
                destination: path.clone(),
            });
        }
        Ok(())
    }
}

async fn contains(src: &dyn SeriesReader, path: &NodePath) -> Result<bool, PipeError> {
    src.contains(path)
        .await
        .map_err(|err| PipeError::backend(path, err))
}

/// Rank directory of the writer that produced the source, empty if it did not record one.
async fn source_ranks(src: &dyn SeriesReader) -> Result<RankDirectory, PipeError> {
    let root = NodePath::root();
    let attributes = src
        .attributes(&root)
        .await
        .map_err(|err| PipeError::backend(&root, err))?;
    let Some((_, attribute)) = attributes
        .iter()
        .find(|(key, _)| key == RANK_META_ATTRIBUTE)
    else {
        tracing::debug!("source has no rank table, chunks cannot be placed by host");
        return Ok(RankDirectory::default());
    };
    match RankDirectory::from_attribute(attribute) {
        Some(ranks) => Ok(ranks),
        None => {
            tracing::warn!(
                "ignoring {} of unexpected type {}",
                RANK_META_ATTRIBUTE,
                attribute.datatype()
            );
            Ok(RankDirectory::default())
        }
    }
}

/// Makes sure `path` exists on the destination as `kind`, then copies its attributes.
async fn mirror(
    src: &dyn SeriesReader,
    dst: &mut dyn SeriesWriter,
    path: &NodePath,
    kind: &NodeKind,
) -> Result<usize, PipeError> {
    let existing = dst
        .kind(path)
        .await
        .map_err(|err| PipeError::backend(path, err))?;
    match existing {
        Some(existing) if existing != *kind => {
            return Err(PipeError::StructuralMismatch {
                path: path.clone(),
                source_kind: kind.clone(),
                destination_kind: existing,
            });
        }
        Some(_) => {}
        None => dst
            .create_node(path, kind.clone())
            .await
            .map_err(|err| PipeError::backend(path, err))?,
    }
    copy_attributes(src, dst, path).await
}

/// Copies every attribute with its declared type. The source's rank table is not copied.
async fn copy_attributes(
    src: &dyn SeriesReader,
    dst: &mut dyn SeriesWriter,
    path: &NodePath,
) -> Result<usize, PipeError> {
    let attributes = src
        .attributes(path)
        .await
        .map_err(|err| PipeError::backend(path, err))?;
    let mut copied = 0;
    for (key, value) in attributes {
        if path.is_root() && key == RANK_META_ATTRIBUTE {
            continue;
        }
        tracing::trace!("{path}: {key} ({})", value.datatype());
        dst.set_attribute(path, &key, value)
            .await
            .map_err(|err| PipeError::backend(path, err))?;
        copied += 1;
    }
    Ok(copied)
}

async fn list_children(
    src: &dyn SeriesReader,
    path: &NodePath,
) -> Result<Vec<String>, PipeError> {
    if !contains(src, path).await? {
        return Ok(Vec::new());
    }
    src.children(path)
        .await
        .map_err(|err| PipeError::backend(path, err))
}

async fn describe_iteration(src: &dyn SeriesReader, path: &NodePath) -> Result<(), PipeError> {
    let meshes = list_children(src, &path.join(MESHES)).await?;
    tracing::info!(
        "{} contains {} meshes: {}",
        path,
        meshes.len(),
        meshes.join(", ")
    );
    let species = list_children(src, &path.join(PARTICLES)).await?;
    tracing::info!("{} contains {} particle species", path, species.len());
    for name in species {
        let records = list_children(src, &path.join(PARTICLES).join(&name)).await?;
        tracing::info!("  {} with records: {}", name, records.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::comm::{LocalGroup, SingleRank};
    use crate::hierarchy::{Attribute, Datatype, Scalar};
    use crate::memory::{MemoryReader, MemoryStore, MemoryWriter, SeriesData, Storage};
    use crate::ranks::Placement;
    use crate::testutils;
    use tracing_test::traced_test;

    fn single_pipe(strategy: StrategySpec) -> Pipe {
        Pipe::new(
            Arc::new(SingleRank),
            RankDirectory::from_keys(["0".to_string()]),
            Settings {
                strategy,
                debug_chunks: true,
            },
        )
    }

    async fn run_single(
        strategy: StrategySpec,
        source: SeriesData,
        destination: &Arc<MemoryStore>,
    ) -> Result<Summary, Error> {
        let mut reader = MemoryReader::new(Arc::new(MemoryStore::new(source)), false);
        let mut writer = MemoryWriter::new(destination.clone(), Arc::new(SingleRank), None);
        single_pipe(strategy)
            .run(&mut reader, &mut writer, &mut TimingLog::disabled())
            .await
    }

    fn empty_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(SeriesData::default()))
    }

    #[tokio::test]
    #[traced_test]
    async fn attributes_keep_values_and_types() -> Result<(), anyhow::Error> {
        let mut source = SeriesData::default();
        source
            .attributes
            .insert("a".into(), Attribute::Scalar(Scalar::Int32(5)));
        source.attributes.insert(
            "b".into(),
            Attribute::Array {
                dtype: Datatype::Float64,
                values: vec![Scalar::Float64(1.0), Scalar::Float64(2.0)],
            },
        );
        source.iterations.insert(0, crate::memory::Node::new(NodeKind::Iteration));
        let destination = empty_store();
        let summary = run_single(StrategySpec::default(), source.clone(), &destination).await?;
        assert_eq!(summary.attributes_copied, 2);
        assert_eq!(summary.iterations_copied, 1);
        let mut copied = destination.snapshot().await.attributes;
        assert_eq!(
            copied.remove(RANK_META_ATTRIBUTE),
            Some(Attribute::StringArray(vec!["0".into()]))
        );
        assert_eq!(copied, source.attributes);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn single_rank_bin_packing_copies_mesh() -> Result<(), anyhow::Error> {
        let chunks = vec![
            Chunk::new(vec![0, 0], vec![2, 4], 0),
            Chunk::new(vec![2, 0], vec![2, 2], 1),
            Chunk::new(vec![2, 2], vec![2, 2], 2),
        ];
        let source = testutils::mesh_series(&[4, 4], chunks);
        let destination = empty_store();
        let summary = run_single(StrategySpec::BinPacking, source.clone(), &destination).await?;
        assert_eq!(summary.chunks_loaded, 3);
        assert_eq!(summary.bytes_loaded, 64);
        assert!(logs_contain("/data/0/meshes/E/x\t0/1:\t[0, 0] -- [2, 4]"));
        let copied = destination.snapshot().await;
        let path = NodePath::iteration(0).join(MESHES).join("E").join("x");
        assert_eq!(copied.dataset(&path)?.values()?, testutils::int_values(16));
        let mesh = NodePath::iteration(0).join(MESHES).join("E");
        assert_eq!(copied.node(&mesh)?.attributes, source.node(&mesh)?.attributes);
        let iteration = NodePath::iteration(0);
        assert_eq!(
            copied.node(&iteration)?.attributes,
            source.node(&iteration)?.attributes
        );
        assert!(copied.closed.contains(&0));
        assert!(copied.finished);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn two_ranks_slice_dataset() -> Result<(), anyhow::Error> {
        let source = Arc::new(MemoryStore::new(testutils::mesh_series(&[8], vec![])));
        let destination = empty_store();
        let mut join_set = tokio::task::JoinSet::new();
        for member in LocalGroup::new(2) {
            let source = source.clone();
            let destination = destination.clone();
            join_set.spawn(async move {
                let comm: Arc<dyn Communicator> = Arc::new(member);
                let out_ranks = RankDirectory::collect(comm.as_ref(), Placement::Rank).await?;
                let pipe = Pipe::new(
                    comm.clone(),
                    out_ranks,
                    Settings {
                        strategy: StrategySpec::SliceByDimension,
                        debug_chunks: false,
                    },
                );
                let mut reader = MemoryReader::new(source, false);
                let mut writer = MemoryWriter::new(destination, comm.clone(), None);
                let summary = pipe
                    .run(&mut reader, &mut writer, &mut TimingLog::disabled())
                    .await?;
                Ok::<_, anyhow::Error>((comm.rank(), summary))
            });
        }
        while let Some(res) = join_set.join_next().await {
            let (_, summary) = res??;
            assert_eq!(summary.chunks_loaded, 1);
            assert_eq!(summary.bytes_loaded, 16);
        }
        let copied = destination.snapshot().await;
        let path = NodePath::iteration(0).join(MESHES).join("E").join("x");
        let dataset = copied.dataset(&path)?;
        let mut chunks = dataset.available_chunks();
        chunks.sort_by_key(|chunk| chunk.offset.clone());
        assert_eq!(
            chunks,
            vec![
                Chunk::new(vec![0], vec![4], 0),
                Chunk::new(vec![4], vec![4], 1)
            ]
        );
        assert_eq!(dataset.values()?, testutils::int_values(8));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn full_hierarchy_on_two_ranks() -> Result<(), anyhow::Error> {
        let source = Arc::new(MemoryStore::new(testutils::full_series()));
        let destination = empty_store();
        let mut join_set = tokio::task::JoinSet::new();
        for member in LocalGroup::new(2) {
            let source = source.clone();
            let destination = destination.clone();
            join_set.spawn(async move {
                let comm: Arc<dyn Communicator> = Arc::new(member);
                let out_ranks = RankDirectory::from_keys(["n".to_string(), "n".to_string()]);
                let pipe = Pipe::new(comm.clone(), out_ranks, Settings::default());
                let mut reader = MemoryReader::new(source, false);
                let mut writer = MemoryWriter::new(destination, comm.clone(), None);
                let summary = pipe
                    .run(&mut reader, &mut writer, &mut TimingLog::disabled())
                    .await?;
                Ok::<_, anyhow::Error>((comm.rank(), summary))
            });
        }
        let mut total = Summary::default();
        while let Some(res) = join_set.join_next().await {
            let (rank, summary) = res??;
            // patch records are handled by rank 0 only
            assert_eq!(summary.patch_entries_stored, if rank == 0 { 4 } else { 0 });
            assert_eq!(summary.constant_components, 2);
            assert_eq!(summary.empty_components, 2);
            total = total + summary;
        }
        assert_eq!(total.iterations_copied, 2);
        assert_eq!(total.bytes_loaded, 2 * (6 * 4 + 4 * 4));
        let copied = destination.snapshot().await;
        let original = testutils::full_series();
        for index in [0, 10] {
            let mesh = NodePath::iteration(index).join(MESHES).join("B");
            assert_eq!(
                copied.dataset(&mesh.join("x"))?.values()?,
                original.dataset(&mesh.join("x"))?.values()?
            );
            assert_eq!(
                copied.dataset(&mesh.join("y"))?.storage,
                Storage::Constant {
                    value: Scalar::Float64(2.5)
                }
            );
            assert_eq!(copied.dataset(&mesh.join("z"))?.storage, Storage::Empty);
            let species = NodePath::iteration(index).join(PARTICLES).join("electrons");
            assert_eq!(
                copied.node(&species)?.attributes,
                original.node(&species)?.attributes
            );
            let count = species
                .join(PARTICLE_PATCHES)
                .join("numParticles")
                .join("value");
            assert_eq!(
                copied.dataset(&count)?.values()?,
                vec![Scalar::UInt64(3), Scalar::UInt64(1)]
            );
            assert_eq!(
                copied.dataset(&species.join("position").join("x"))?.values()?,
                original.dataset(&species.join("position").join("x"))?.values()?
            );
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn mismatch_leaves_iteration_open() -> Result<(), anyhow::Error> {
        let source = testutils::mesh_series(&[4], vec![]);
        let mut existing = SeriesData::default();
        existing.iterations.insert(
            0,
            crate::memory::Node::new(NodeKind::Iteration).with_child(
                MESHES,
                testutils::container(ContainerKind::Meshes)
                    .with_child("E", testutils::container(ContainerKind::ParticleSpecies)),
            ),
        );
        let destination = Arc::new(MemoryStore::new(existing));
        match run_single(StrategySpec::RoundRobin, source, &destination).await {
            Err(Error {
                source:
                    PipeError::StructuralMismatch {
                        path,
                        source_kind,
                        destination_kind,
                    },
                ..
            }) => {
                assert_eq!(path.to_string(), "/data/0/meshes/E");
                assert_eq!(source_kind, NodeKind::Container(ContainerKind::Mesh));
                assert_eq!(
                    destination_kind,
                    NodeKind::Container(ContainerKind::ParticleSpecies)
                );
            }
            other => panic!("expected structural mismatch, got {other:?}"),
        }
        let data = destination.snapshot().await;
        assert!(data.closed.is_empty());
        assert!(!data.finished);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn foreign_node_is_rejected() -> Result<(), anyhow::Error> {
        let mut source = testutils::mesh_series(&[4], vec![]);
        let meshes = source.node_mut(&NodePath::iteration(0).join(MESHES))?;
        meshes.children.insert(
            "custom".into(),
            crate::memory::Node::new(NodeKind::Foreign("custom_hierarchy".into())),
        );
        let error = run_single(StrategySpec::RoundRobin, source, &empty_store())
            .await
            .unwrap_err();
        assert!(matches!(
            &error.source,
            PipeError::UnsupportedNode { path, kind }
                if path.to_string() == "/data/0/meshes/custom" && kind == "custom_hierarchy"
        ));
        // E sorts before custom, its attributes were already copied
        assert!(error.summary.attributes_copied > 0);
        assert_eq!(error.summary.iterations_copied, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn oversized_shape_is_a_backend_error() -> Result<(), anyhow::Error> {
        let mut source = testutils::mesh_series(&[4], vec![]);
        let mesh = source.node_mut(&NodePath::iteration(0).join(MESHES).join("E"))?;
        mesh.children.insert(
            "rho".into(),
            testutils::component(crate::memory::Dataset {
                dtype: Datatype::Float64,
                shape: vec![1 << 33, 1 << 33],
                storage: Storage::Dense {
                    data: vec![],
                    chunks: vec![],
                },
            }),
        );
        let destination = empty_store();
        let error = run_single(StrategySpec::default(), source, &destination)
            .await
            .unwrap_err();
        match &error.source {
            PipeError::Backend { path, source } => {
                assert_eq!(path.to_string(), "/data/0/meshes/E/rho");
                assert!(source.to_string().contains("too large"), "{source}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(error.summary.iterations_copied, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rerun_on_matching_destination() -> Result<(), anyhow::Error> {
        let source = testutils::full_series();
        let destination = empty_store();
        run_single(StrategySpec::default(), source.clone(), &destination).await?;
        let mut before = destination.snapshot().await;
        before
            .attributes
            .insert("comment".into(), Attribute::String("kept".into()));
        destination.replace(before.clone()).await;
        run_single(StrategySpec::default(), source, &destination).await?;
        let after = destination.snapshot().await;
        assert_eq!(after.attributes, before.attributes);
        assert_eq!(after.iterations, before.iterations);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn host_aware_uses_source_rank_table() -> Result<(), anyhow::Error> {
        let mut source = testutils::mesh_series(
            &[8],
            vec![
                Chunk::new(vec![0], vec![4], 0),
                Chunk::new(vec![4], vec![4], 1),
            ],
        );
        source.attributes.insert(
            RANK_META_ATTRIBUTE.into(),
            Attribute::StringArray(vec!["far".into(), "here".into()]),
        );
        let destination = empty_store();
        let pipe = Pipe::new(
            Arc::new(SingleRank),
            RankDirectory::from_keys(["here".to_string()]),
            Settings {
                strategy: "hostname_roundrobin_roundrobin".parse()?,
                debug_chunks: false,
            },
        );
        let mut reader = MemoryReader::new(Arc::new(MemoryStore::new(source)), false);
        let mut writer = MemoryWriter::new(destination.clone(), Arc::new(SingleRank), None);
        let summary = pipe
            .run(&mut reader, &mut writer, &mut TimingLog::disabled())
            .await?;
        // both chunks end up on the only rank, one through each phase
        assert_eq!(summary.chunks_loaded, 2);
        assert!(logs_contain("1 chunks left for the second phase"));
        assert_eq!(
            destination.snapshot().await.attributes.get(RANK_META_ATTRIBUTE),
            Some(&Attribute::StringArray(vec!["here".into()]))
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn timing_log_records_iteration_steps() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let mut timing = TimingLog::create(tmp_dir.path(), 0, 1).await;
        let mut reader =
            MemoryReader::new(Arc::new(MemoryStore::new(testutils::full_series())), false);
        let mut writer = MemoryWriter::new(empty_store(), Arc::new(SingleRank), None);
        single_pipe(StrategySpec::default())
            .run(&mut reader, &mut writer, &mut timing)
            .await?;
        let text =
            tokio::fs::read_to_string(crate::timing::path_for(tmp_dir.path(), 0)).await?;
        let steps: Vec<&str> = text
            .lines()
            .filter_map(|line| line.rsplit('\t').next())
            .collect();
        assert_eq!(
            steps,
            vec![
                "Received iteration 0",
                "Closing incoming iteration 0",
                "Closing outgoing iteration 0",
                "Closed outgoing iteration 0",
                "Received iteration 10",
                "Closing incoming iteration 10",
                "Closing outgoing iteration 10",
                "Closed outgoing iteration 10",
            ]
        );
        Ok(())
    }
}
