use std::fmt;

/// Rectangular region of a dataset, tagged with the rank that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Chunk {
    pub offset: Vec<u64>,
    pub extent: Vec<u64>,
    pub source_rank: usize,
}

impl Chunk {
    #[must_use]
    pub fn new(offset: Vec<u64>, extent: Vec<u64>, source_rank: usize) -> Self {
        Self {
            offset,
            extent,
            source_rank,
        }
    }

    /// A chunk covering the whole of `shape`.
    #[must_use]
    pub fn whole(shape: &[u64], source_rank: usize) -> Self {
        Self::new(vec![0; shape.len()], shape.to_vec(), source_rank)
    }

    #[must_use]
    pub fn volume(&self) -> u64 {
        volume(&self.extent)
    }

    /// Exclusive upper corner.
    #[must_use]
    pub fn end(&self) -> Vec<u64> {
        self.offset
            .iter()
            .zip(&self.extent)
            .map(|(offset, extent)| offset.saturating_add(*extent))
            .collect()
    }

    /// Part of this chunk that lies inside the box `offset..offset+extent`, or `None` if the
    /// intersection has no elements. The source rank is kept.
    #[must_use]
    pub fn intersect(&self, offset: &[u64], extent: &[u64]) -> Option<Chunk> {
        let mut new_offset = Vec::with_capacity(self.offset.len());
        let mut new_extent = Vec::with_capacity(self.offset.len());
        let boxes = self.offset.iter().zip(&self.extent).zip(offset.iter().zip(extent));
        for ((own_offset, own_extent), (offset, extent)) in boxes {
            let begin = (*own_offset).max(*offset);
            let end = own_offset
                .saturating_add(*own_extent)
                .min(offset.saturating_add(*extent));
            if end <= begin {
                return None;
            }
            new_offset.push(begin);
            new_extent.push(end - begin);
        }
        Some(Chunk::new(new_offset, new_extent, self.source_rank))
    }

    /// True if the chunk lies inside a dataset of the given shape.
    #[must_use]
    pub fn fits(&self, shape: &[u64]) -> bool {
        self.offset.len() == shape.len()
            && self.extent.len() == shape.len()
            && self
                .end()
                .iter()
                .zip(shape)
                .all(|(end, bound)| end <= bound)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -- {:?}", self.offset, self.end())
    }
}

/// Number of elements in a box of the given extent. A 0-d extent holds one element.
/// Saturates at `u64::MAX`.
#[must_use]
pub fn volume(extent: &[u64]) -> u64 {
    extent.iter().fold(1, |acc, &len| acc.saturating_mul(len))
}

/// Number of elements in a box of the given extent, `None` on overflow.
#[must_use]
pub fn checked_volume(extent: &[u64]) -> Option<u64> {
    extent.iter().try_fold(1u64, |acc, &len| acc.checked_mul(len))
}

/// Bytes needed for a box of the given extent with elements of `elem` bytes.
pub fn byte_len(extent: &[u64], elem: usize) -> anyhow::Result<usize> {
    checked_volume(extent)
        .and_then(|count| usize::try_from(count).ok())
        .and_then(|count| count.checked_mul(elem))
        .ok_or_else(|| anyhow::anyhow!("extent {extent:?} of {elem} byte elements is too large"))
}

/// Decomposition of one dataset into chunks, as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTable {
    /// Shape of the whole dataset.
    pub shape: Vec<u64>,
    pub chunks: Vec<Chunk>,
}

impl ChunkTable {
    #[must_use]
    pub fn new(shape: Vec<u64>, chunks: Vec<Chunk>) -> Self {
        Self { shape, chunks }
    }

    #[must_use]
    pub fn total_volume(&self) -> u64 {
        self.chunks.iter().map(Chunk::volume).sum()
    }
}

/// A chunk together with the rank that will transfer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedChunk {
    pub chunk: Chunk,
    pub destination_rank: usize,
}
