//! Chunk distribution strategies.
//!
//! A strategy decides, for one dataset, which destination rank transfers which region.
//! Every rank evaluates the same strategy on the same inputs and keeps the assignments
//! addressed to itself, so strategies must be deterministic.
//!
//! # Strategies
//!
//! - `roundrobin`: chunk `i` goes to the `i mod n`-th destination rank.
//! - `binpacking`: largest chunk first, each onto the rank with the smallest running total.
//!   The spread between the most and least loaded rank never exceeds the largest chunk.
//! - `slicedataset`: the dataset is cut into `n` slabs along its longest dimension (the
//!   first `len mod n` slabs are one element longer) and every chunk is intersected with
//!   every slab. For a source reporting one chunk over the whole dataset this is a plain
//!   slab decomposition independent of how the data was written.
//! - `hostname_<inner>_<outer>`: chunks are first grouped by the host of the rank that wrote
//!   them and handed to `inner`, restricted to the destination ranks on that host. Chunks
//!   whose host has no destination rank, or whose writer is unknown, go to `outer` over
//!   all destination ranks.
//!
//! Names are case-insensitive. The default is `hostname_binpacking_slicedataset`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::instrument;

use crate::chunk::{AssignedChunk, Chunk, ChunkTable};
use crate::error::PipeError;
use crate::ranks::RankDirectory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategySpec {
    RoundRobin,
    BinPacking,
    SliceByDimension,
    HostAware {
        inner: Box<StrategySpec>,
        outer: Box<StrategySpec>,
    },
}

impl Default for StrategySpec {
    fn default() -> Self {
        StrategySpec::HostAware {
            inner: Box::new(StrategySpec::BinPacking),
            outer: Box::new(StrategySpec::SliceByDimension),
        }
    }
}

impl fmt::Display for StrategySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategySpec::RoundRobin => f.write_str("roundrobin"),
            StrategySpec::BinPacking => f.write_str("binpacking"),
            StrategySpec::SliceByDimension => f.write_str("slicedataset"),
            StrategySpec::HostAware { inner, outer } => write!(f, "hostname_{inner}_{outer}"),
        }
    }
}

impl FromStr for StrategySpec {
    type Err = PipeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let lowered = name.trim().to_lowercase();
        let mut tokens = lowered.split('_');
        let spec = parse_tokens(&mut tokens, name)?;
        if let Some(rest) = tokens.next() {
            return Err(PipeError::Configuration(format!(
                "unexpected '{rest}' after complete strategy in '{name}'"
            )));
        }
        Ok(spec)
    }
}

fn parse_tokens<'a, I: Iterator<Item = &'a str>>(
    tokens: &mut I,
    name: &str,
) -> Result<StrategySpec, PipeError> {
    match tokens.next() {
        Some("roundrobin") => Ok(StrategySpec::RoundRobin),
        Some("binpacking") => Ok(StrategySpec::BinPacking),
        Some("slicedataset") => Ok(StrategySpec::SliceByDimension),
        Some("hostname") => {
            let inner = parse_tokens(tokens, name)?;
            let outer = parse_tokens(tokens, name)?;
            Ok(StrategySpec::HostAware {
                inner: Box::new(inner),
                outer: Box::new(outer),
            })
        }
        Some("") | None => Err(PipeError::Configuration(format!(
            "incomplete chunk distribution strategy: '{name}'"
        ))),
        Some(other) => Err(PipeError::Configuration(format!(
            "unknown chunk distribution strategy '{other}' in '{name}'"
        ))),
    }
}

impl StrategySpec {
    /// Assigns every chunk of `table` (or every element, for slicing strategies) to exactly
    /// one rank of `outputs`. `inputs` maps the chunks' source ranks to hosts.
    #[instrument(skip_all, fields(strategy = %self, chunks = table.chunks.len()))]
    pub fn assign(
        &self,
        table: &ChunkTable,
        inputs: &RankDirectory,
        outputs: &RankDirectory,
    ) -> Result<Vec<AssignedChunk>, PipeError> {
        if outputs.is_empty() {
            return Err(PipeError::Configuration(format!(
                "strategy {self} has no destination ranks to assign to"
            )));
        }
        let assigned = match self {
            StrategySpec::RoundRobin => round_robin(table, outputs),
            StrategySpec::BinPacking => bin_packing(table, outputs),
            StrategySpec::SliceByDimension => slice_by_dimension(table, outputs),
            StrategySpec::HostAware { inner, outer } => {
                host_aware(inner, outer, table, inputs, outputs)?
            }
        };
        tracing::trace!("assigned {} pieces", assigned.len());
        Ok(assigned)
    }
}

fn round_robin(table: &ChunkTable, outputs: &RankDirectory) -> Vec<AssignedChunk> {
    let ranks = outputs.ranks();
    table
        .chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| AssignedChunk {
            chunk: chunk.clone(),
            destination_rank: ranks[index % ranks.len()],
        })
        .collect()
}

fn bin_packing(table: &ChunkTable, outputs: &RankDirectory) -> Vec<AssignedChunk> {
    let ranks = outputs.ranks();
    let mut order: Vec<usize> = (0..table.chunks.len()).collect();
    // stable: equal-sized chunks keep table order
    order.sort_by_key(|&index| std::cmp::Reverse(table.chunks[index].volume()));
    let mut totals = vec![0u64; ranks.len()];
    let mut destination = vec![0usize; table.chunks.len()];
    for index in order {
        let lightest = totals
            .iter()
            .enumerate()
            .min_by_key(|&(position, total)| (*total, position))
            .map_or(0, |(position, _)| position);
        totals[lightest] += table.chunks[index].volume();
        destination[index] = ranks[lightest];
    }
    table
        .chunks
        .iter()
        .zip(destination)
        .map(|(chunk, destination_rank)| AssignedChunk {
            chunk: chunk.clone(),
            destination_rank,
        })
        .collect()
}

/// Slab of `len` elements owned by the `position`-th of `parts` ranks: `(offset, extent)`.
fn slab(len: u64, parts: u64, position: u64) -> (u64, u64) {
    let base = len / parts;
    let remainder = len % parts;
    let offset = position * base + position.min(remainder);
    let extent = base + u64::from(position < remainder);
    (offset, extent)
}

fn slice_by_dimension(table: &ChunkTable, outputs: &RankDirectory) -> Vec<AssignedChunk> {
    let ranks = outputs.ranks();
    let shape = &table.shape;
    // longest dimension, first one on ties
    let Some(dim) = (0..shape.len()).rev().max_by_key(|&dim| shape[dim]) else {
        // 0-d dataset: a single element, nothing to slice
        return table
            .chunks
            .iter()
            .map(|chunk| AssignedChunk {
                chunk: chunk.clone(),
                destination_rank: ranks[0],
            })
            .collect();
    };
    let mut assigned = Vec::new();
    for (position, &rank) in ranks.iter().enumerate() {
        let (offset, extent) = slab(shape[dim], ranks.len() as u64, position as u64);
        if extent == 0 {
            continue;
        }
        let mut slab_offset = vec![0; shape.len()];
        let mut slab_extent = shape.clone();
        slab_offset[dim] = offset;
        slab_extent[dim] = extent;
        assigned.extend(table.chunks.iter().filter_map(|chunk| {
            chunk
                .intersect(&slab_offset, &slab_extent)
                .map(|piece| AssignedChunk {
                    chunk: piece,
                    destination_rank: rank,
                })
        }));
    }
    assigned
}

fn host_aware(
    inner: &StrategySpec,
    outer: &StrategySpec,
    table: &ChunkTable,
    inputs: &RankDirectory,
    outputs: &RankDirectory,
) -> Result<Vec<AssignedChunk>, PipeError> {
    let mut leftovers: Vec<Chunk> = Vec::new();
    let mut by_host: BTreeMap<&str, Vec<Chunk>> = BTreeMap::new();
    for chunk in &table.chunks {
        match inputs.get(chunk.source_rank) {
            Some(host) => by_host.entry(host).or_default().push(chunk.clone()),
            None => leftovers.push(chunk.clone()),
        }
    }
    let hosts = outputs.ranks_per_host();
    let mut assigned = Vec::new();
    for (host, chunks) in by_host {
        match hosts.get(host) {
            Some(local_ranks) => {
                let local = ChunkTable::new(table.shape.clone(), chunks);
                assigned.extend(inner.assign(&local, inputs, &outputs.restrict(local_ranks))?);
            }
            None => leftovers.extend(chunks),
        }
    }
    if !leftovers.is_empty() {
        tracing::debug!("{} chunks left for the second phase", leftovers.len());
        let rest = ChunkTable::new(table.shape.clone(), leftovers);
        assigned.extend(outer.assign(&rest, inputs, outputs)?);
    }
    Ok(assigned)
}
