//! Communicators connect the cooperating ranks of one run.
//!
//! The engine only ever needs three things from a process group: its own rank, the group
//! size, and two collectives (an all-gather of one string per rank and a barrier). Two
//! implementations are provided:
//!
//! - [`SingleRank`]: a group of one, every collective is trivial.
//! - [`LocalGroup`]: `size` ranks living in one process as tokio tasks.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

#[async_trait]
pub trait Communicator: Send + Sync + std::fmt::Debug {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Every rank contributes `value`; every rank receives all values ordered by rank.
    async fn all_gather(&self, value: String) -> anyhow::Result<Vec<String>>;
    /// Returns once every rank in the group has called it.
    async fn barrier(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SingleRank;

#[async_trait]
impl Communicator for SingleRank {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    async fn all_gather(&self, value: String) -> anyhow::Result<Vec<String>> {
        Ok(vec![value])
    }

    async fn barrier(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    barrier: tokio::sync::Barrier,
    slots: tokio::sync::Mutex<Vec<Option<String>>>,
}

/// One member of an in-process group. Create the whole group with [`LocalGroup::new`] and
/// hand one member to each task.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    #[allow(clippy::new_ret_no_self)]
    #[must_use]
    pub fn new(size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            barrier: tokio::sync::Barrier::new(size),
            slots: tokio::sync::Mutex::new(vec![None; size]),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                size,
                shared: shared.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn all_gather(&self, value: String) -> anyhow::Result<Vec<String>> {
        self.shared.slots.lock().await[self.rank] = Some(value);
        self.shared.barrier.wait().await;
        let gathered = self
            .shared
            .slots
            .lock()
            .await
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.clone()
                    .ok_or_else(|| anyhow!("rank {rank} did not contribute to all-gather"))
            })
            .collect::<anyhow::Result<Vec<_>>>();
        // nobody may overwrite a slot before every rank has read it
        self.shared.barrier.wait().await;
        gathered
    }

    async fn barrier(&self) -> anyhow::Result<()> {
        self.shared.barrier.wait().await;
        Ok(())
    }
}
