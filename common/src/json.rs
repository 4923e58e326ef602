//! JSON document backend.
//!
//! The whole series is one JSON document (see [`SeriesData`]). Readers load it once; writers
//! start from an empty series and rewrite the file at every flush. Writers of the same path
//! within one process share a single in-memory store so that several ranks can cooperate on
//! one document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use anyhow::Context;

use crate::comm::Communicator;
use crate::config::SeriesConfig;
use crate::memory::{MemoryReader, MemoryStore, MemoryWriter, SeriesData};

#[derive(Debug, Clone)]
pub struct Document {
    path: PathBuf,
    pretty: bool,
}

impl Document {
    #[must_use]
    pub fn new(path: &Path, pretty: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            pretty,
        }
    }

    pub async fn load(path: &Path) -> anyhow::Result<SeriesData> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed reading {path:?}"))?;
        serde_json::from_slice(&bytes).with_context(|| format!("failed parsing {path:?}"))
    }

    pub async fn save(&self, data: &SeriesData) -> anyhow::Result<()> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(data)
        } else {
            serde_json::to_vec(data)
        }
        .context("failed serializing series")?;
        tokio::fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("failed writing {:?}", self.path))?;
        tracing::debug!("wrote {:?}", self.path);
        Ok(())
    }
}

static OPEN: tokio::sync::Mutex<BTreeMap<PathBuf, Weak<MemoryStore>>> =
    tokio::sync::Mutex::const_new(BTreeMap::new());

pub async fn open_reader(path: &Path) -> anyhow::Result<MemoryReader> {
    let data = Document::load(path).await?;
    Ok(MemoryReader::new(Arc::new(MemoryStore::new(data)), false))
}

/// Writer for `path`. The first writer of a path starts an empty series, later ones join it
/// for as long as any writer is alive.
pub async fn open_writer(
    path: &Path,
    config: &SeriesConfig,
    comm: Arc<dyn Communicator>,
) -> MemoryWriter {
    let store = {
        let mut open = OPEN.lock().await;
        open.retain(|_, store| store.strong_count() > 0);
        match open.get(path).and_then(Weak::upgrade) {
            Some(store) => store,
            None => {
                let store = Arc::new(MemoryStore::new(SeriesData::default()));
                open.insert(path.to_path_buf(), Arc::downgrade(&store));
                store
            }
        }
    };
    MemoryWriter::new(store, comm, Some(Document::new(path, config.pretty)))
}
