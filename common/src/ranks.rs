use std::collections::BTreeMap;

use anyhow::Context;
use tracing::instrument;

use crate::comm::Communicator;
use crate::hierarchy::Attribute;

/// What a rank publishes as its placement key.
#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Placement {
    /// The host name of the machine the rank runs on.
    #[default]
    Hostname,
    /// The rank's own id, so every rank counts as a separate host.
    Rank,
}

impl Placement {
    /// The key rank `rank` publishes.
    pub fn key(self, rank: usize) -> anyhow::Result<String> {
        match self {
            Placement::Hostname => {
                let name = nix::unistd::gethostname().context("failed reading host name")?;
                Ok(name.to_string_lossy().into_owned())
            }
            Placement::Rank => Ok(rank.to_string()),
        }
    }
}

/// Rank id to placement key, built once per run and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankDirectory(BTreeMap<usize, String>);

impl RankDirectory {
    /// Builds a directory where rank `i` maps to `keys[i]`.
    #[must_use]
    pub fn from_keys<I: IntoIterator<Item = String>>(keys: I) -> Self {
        Self(keys.into_iter().enumerate().collect())
    }

    /// Collective: every rank of `comm` must call this.
    #[instrument(skip(comm))]
    pub async fn collect(comm: &dyn Communicator, placement: Placement) -> anyhow::Result<Self> {
        let key = placement.key(comm.rank())?;
        let keys = comm
            .all_gather(key)
            .await
            .context("failed exchanging placement keys")?;
        tracing::debug!("rank directory: {:?}", &keys);
        Ok(Self::from_keys(keys))
    }

    #[must_use]
    pub fn get(&self, rank: usize) -> Option<&str> {
        self.0.get(&rank).map(String::as_str)
    }

    /// Rank ids in increasing order.
    #[must_use]
    pub fn ranks(&self) -> Vec<usize> {
        self.0.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Placement key to the ranks sharing it, each list in increasing order.
    #[must_use]
    pub fn ranks_per_host(&self) -> BTreeMap<&str, Vec<usize>> {
        let mut hosts: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (rank, host) in &self.0 {
            hosts.entry(host.as_str()).or_default().push(*rank);
        }
        hosts
    }

    /// Sub-directory holding only the given ranks.
    #[must_use]
    pub fn restrict(&self, ranks: &[usize]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(rank, _)| ranks.contains(*rank))
                .map(|(rank, host)| (*rank, host.clone()))
                .collect(),
        )
    }

    /// Stored form: a string array indexed by rank.
    #[must_use]
    pub fn to_attribute(&self) -> Attribute {
        Attribute::StringArray(self.0.values().cloned().collect())
    }

    #[must_use]
    pub fn from_attribute(attribute: &Attribute) -> Option<Self> {
        match attribute {
            Attribute::StringArray(keys) => Some(Self::from_keys(keys.iter().cloned())),
            _ => None,
        }
    }
}
