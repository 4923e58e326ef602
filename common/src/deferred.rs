//! Transfers postponed until the end of an iteration.
//!
//! Destination buffers are reserved while the hierarchy is walked, but the matching source
//! reads only happen in [`TransferQueue::resolve_loads`], right before the source iteration
//! is closed. Patch values are read eagerly and stored entry by entry in
//! [`TransferQueue::run_patch_stores`], after the source iteration is closed and before the
//! destination iteration is.
//!
//! Both drains empty their list up front, so nothing leaks into the next iteration even if a
//! transfer fails.

use crate::backend::{SeriesReader, SeriesWriter, WritableSpan};
use crate::error::PipeError;
use crate::hierarchy::{NodePath, Scalar};

/// Read `offset..offset+extent` of `source` into an already reserved destination span.
#[derive(Debug)]
pub struct DeferredLoad {
    pub source: NodePath,
    pub span: WritableSpan,
    pub offset: Vec<u64>,
    pub extent: Vec<u64>,
}

/// Fully materialized patch values waiting to be stored into `destination`.
#[derive(Debug)]
pub struct DeferredPatchStore {
    pub values: Vec<Scalar>,
    pub destination: NodePath,
}

/// How much a drain moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drained {
    pub entries: usize,
    pub bytes: u64,
}

/// Per-iteration queue, owned by the code processing one iteration.
#[derive(Debug, Default)]
pub struct TransferQueue {
    loads: Vec<DeferredLoad>,
    patch_stores: Vec<DeferredPatchStore>,
}

impl TransferQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_load(&mut self, load: DeferredLoad) {
        self.loads.push(load);
    }

    pub fn push_patch_store(&mut self, store: DeferredPatchStore) {
        self.patch_stores.push(store);
    }

    #[must_use]
    pub fn pending_loads(&self) -> usize {
        self.loads.len()
    }

    #[must_use]
    pub fn pending_patch_stores(&self) -> usize {
        self.patch_stores.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty() && self.patch_stores.is_empty()
    }

    /// Performs every queued load. Loads run concurrently and in no particular order.
    pub async fn resolve_loads(&mut self, source: &dyn SeriesReader) -> Result<Drained, PipeError> {
        let loads = std::mem::take(&mut self.loads);
        tracing::debug!("resolving {} deferred loads", loads.len());
        futures::future::try_join_all(loads.iter().map(|load| async move {
            source
                .load_chunk(&load.source, &load.offset, &load.extent, &load.span)
                .await
                .map_err(|err| PipeError::backend(&load.source, err))
        }))
        .await?;
        Ok(Drained {
            entries: loads.len(),
            bytes: loads.iter().map(|load| load.span.len() as u64).sum(),
        })
    }

    /// Stores every queued patch value, index by index.
    pub async fn run_patch_stores(
        &mut self,
        destination: &mut dyn SeriesWriter,
    ) -> Result<Drained, PipeError> {
        let stores = std::mem::take(&mut self.patch_stores);
        let mut drained = Drained::default();
        for store in &stores {
            for (index, value) in store.values.iter().enumerate() {
                destination
                    .store_patch(&store.destination, index as u64, *value)
                    .await
                    .map_err(|err| PipeError::backend(&store.destination, err))?;
                drained.entries += 1;
                drained.bytes += value.datatype().size() as u64;
            }
        }
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::comm::SingleRank;
    use crate::hierarchy::{Datatype, NodeKind};
    use crate::memory::{Dataset, MemoryReader, MemoryStore, MemoryWriter, Node, SeriesData};
    use tracing_test::traced_test;

    fn source_with(path_name: &str, dataset: Dataset) -> MemoryReader {
        let mut data = SeriesData::default();
        data.iterations.insert(
            0,
            Node::new(NodeKind::Iteration)
                .with_child(path_name, Node::new(NodeKind::RecordComponent).with_dataset(dataset)),
        );
        MemoryReader::new(Arc::new(MemoryStore::new(data)), false)
    }

    fn decode(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[tokio::test]
    #[traced_test]
    async fn loads_fill_matching_regions() -> Result<(), anyhow::Error> {
        // value at (row, col) is 100 * row + col
        let values: Vec<Scalar> = (0..4u16)
            .flat_map(|row| (0..6u16).map(move |col| Scalar::UInt16(100 * row + col)))
            .collect();
        let source = source_with(
            "grid",
            Dataset::dense(Datatype::UInt16, &[4, 6], &values, vec![])?,
        );
        let path = NodePath::iteration(0).join("grid");
        let regions = [
            (vec![0, 0], vec![2, 3]),
            (vec![2, 3], vec![2, 3]),
            (vec![1, 5], vec![3, 1]),
        ];
        let mut queue = TransferQueue::new();
        let mut spans = Vec::new();
        for (offset, extent) in &regions {
            let span = WritableSpan::zeroed(Datatype::UInt16, extent)?;
            spans.push(span.clone());
            queue.push_load(DeferredLoad {
                source: path.clone(),
                span,
                offset: offset.clone(),
                extent: extent.clone(),
            });
        }
        let drained = queue.resolve_loads(&source).await?;
        assert_eq!(drained.entries, 3);
        assert_eq!(drained.bytes, 2 * (6 + 6 + 3));
        assert!(queue.is_empty());
        assert_eq!(decode(&spans[0].contents().await), vec![0, 1, 2, 100, 101, 102]);
        assert_eq!(
            decode(&spans[1].contents().await),
            vec![203, 204, 205, 303, 304, 305]
        );
        assert_eq!(decode(&spans[2].contents().await), vec![105, 205, 305]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_load_still_clears() -> Result<(), anyhow::Error> {
        let source = source_with(
            "line",
            Dataset::dense(Datatype::UInt16, &[2], &[Scalar::UInt16(1), Scalar::UInt16(2)], vec![])?,
        );
        let mut queue = TransferQueue::new();
        for name in ["line", "missing"] {
            queue.push_load(DeferredLoad {
                source: NodePath::iteration(0).join(name),
                span: WritableSpan::zeroed(Datatype::UInt16, &[2])?,
                offset: vec![0],
                extent: vec![2],
            });
        }
        match queue.resolve_loads(&source).await {
            Err(PipeError::Backend { path, .. }) => {
                assert_eq!(path.to_string(), "/data/0/missing");
            }
            other => panic!("expected backend error, got {other:?}"),
        }
        assert_eq!(queue.pending_loads(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn patch_stores_write_each_entry() -> Result<(), anyhow::Error> {
        let store = Arc::new(MemoryStore::new(SeriesData::default()));
        let mut writer = MemoryWriter::new(store.clone(), Arc::new(SingleRank), None);
        let path = NodePath::iteration(0).join("numParticles");
        writer.open_iteration(0).await?;
        writer.create_node(&path, NodeKind::PatchRecordComponent).await?;
        writer.reset_dataset(&path, Datatype::UInt64, &[3]).await?;
        let mut queue = TransferQueue::new();
        queue.push_patch_store(DeferredPatchStore {
            values: vec![Scalar::UInt64(4), Scalar::UInt64(0), Scalar::UInt64(9)],
            destination: path.clone(),
        });
        assert_eq!(queue.pending_patch_stores(), 1);
        let drained = queue.run_patch_stores(&mut writer).await?;
        assert_eq!(drained, Drained { entries: 3, bytes: 24 });
        assert!(queue.is_empty());
        assert_eq!(
            store.snapshot().await.dataset(&path)?.values()?,
            vec![Scalar::UInt64(4), Scalar::UInt64(0), Scalar::UInt64(9)]
        );
        Ok(())
    }
}
