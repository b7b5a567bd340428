//! Flat, brute-force vector index (spec §4.G): append-only `id -> vector`
//! store keyed by dense position, similarity search dispatched to the GPU
//! orchestrator, little-endian binary persistence.

use crate::error::{Error, Result};
use crate::gpu::GpuOrchestrator;
use crate::persistence::{read_i32, read_u64, write_i32, write_u64};
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    L2 = 0,
    Cosine = 1,
    Dot = 2,
}

impl Metric {
    fn from_i32(v: i32) -> Result<Self> {
        match v {
            0 => Ok(Metric::L2),
            1 => Ok(Metric::Cosine),
            2 => Ok(Metric::Dot),
            other => Err(Error::InvalidModel(format!("unknown metric tag {other}"))),
        }
    }

    /// Shader-side metric selector: `1=cosine, 2=dot`. `L2` is recognized in
    /// persistence for forward compatibility but was never wired to the
    /// similarity kernel in the source this was distilled from (spec §9, open
    /// question) — dispatching it here would silently fall back to cosine,
    /// so it is rejected instead.
    fn shader_code(self) -> Result<u32> {
        match self {
            Metric::Cosine => Ok(1),
            Metric::Dot => Ok(2),
            Metric::L2 => Err(Error::GpuDispatch(
                "L2 metric is recognized in persistence but has no similarity kernel".into(),
            )),
        }
    }
}

/// One scored candidate returned by [`VectorIndex::search`]. A `sentinel`
/// row is padding emitted when fewer than `k` candidates exist; it carries
/// no record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    pub id: u64,
    pub score: f32,
    pub sentinel: bool,
}

pub struct VectorIndex {
    dim: usize,
    metric: Metric,
    capacity: usize,
    ids: Vec<u64>,
    vectors: Vec<f32>,
}

impl VectorIndex {
    pub fn create(dim: usize, metric: Metric, capacity: usize) -> Self {
        Self {
            dim,
            metric,
            capacity,
            ids: Vec::with_capacity(capacity),
            vectors: Vec::with_capacity(capacity * dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Append `v`; the assigned ID equals the position at insertion time.
    /// Returns [`Error::Full`] once `count == capacity`.
    pub fn add(&mut self, v: &[f32]) -> Result<u64> {
        if self.ids.len() >= self.capacity {
            return Err(Error::Full(self.capacity));
        }
        let id = self.ids.len() as u64;
        self.ids.push(id);
        self.vectors.extend_from_slice(v);
        Ok(id)
    }

    /// Replace the vector at `id` in place. Returns [`Error::NotFound`] for
    /// an id outside `0..count`.
    pub fn overwrite(&mut self, id: u64, v: &[f32]) -> Result<()> {
        if id as usize >= self.ids.len() {
            return Err(Error::NotFound(id));
        }
        let base = id as usize * self.dim;
        self.vectors[base..base + self.dim].copy_from_slice(v);
        Ok(())
    }

    /// Search for the top `k` candidates among all records, or only those
    /// flagged in `mask` (one bool per record, same length as `count()`).
    /// Pads the tail with `(id=0, score=-1.0)` sentinels when fewer than `k`
    /// candidates are available.
    pub fn search(&self, gpu: &GpuOrchestrator, q: &[f32], k: usize, mask: Option<&[bool]>) -> Result<Vec<SearchResult>> {
        let candidate_ids: Vec<usize> = match mask {
            Some(m) => (0..self.count()).filter(|&i| m[i]).collect(),
            None => (0..self.count()).collect(),
        };

        let sentinel = SearchResult {
            id: 0,
            score: -1.0,
            sentinel: true,
        };
        if candidate_ids.is_empty() {
            return Ok(vec![sentinel; k]);
        }

        let mut packed = Vec::with_capacity(candidate_ids.len() * self.dim);
        for &i in &candidate_ids {
            packed.extend_from_slice(&self.vectors[i * self.dim..(i + 1) * self.dim]);
        }

        let metric_code = self.metric.shader_code()?;
        let scores = gpu.similarity(&packed, q, candidate_ids.len(), metric_code)?;

        let mut scored: Vec<SearchResult> = candidate_ids
            .iter()
            .zip(scores.iter())
            .map(|(&i, &score)| SearchResult {
                id: self.ids[i],
                score,
                sentinel: false,
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let take = k.min(scored.len());
        let mut out = scored[..take].to_vec();
        out.resize(k, sentinel);
        Ok(out)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut f = std::fs::File::create(path)?;
        write_i32(&mut f, self.dim as i32)?;
        write_i32(&mut f, self.count() as i32)?;
        write_i32(&mut f, self.metric as i32)?;
        for &id in &self.ids {
            write_u64(&mut f, id)?;
        }
        let bytes: Vec<u8> = self.vectors.iter().flat_map(|v| v.to_le_bytes()).collect();
        f.write_all(&bytes)?;
        Ok(())
    }

    /// Load a saved index, extending its writable capacity to `min_capacity`
    /// if the file's record count is smaller (so a reopened database can
    /// still accept new records, not just replay the ones it had on save).
    pub fn load(path: &Path, min_capacity: usize) -> Result<Self> {
        let mut f = std::fs::File::open(path)?;
        let dim = read_i32(&mut f)? as usize;
        let count = read_i32(&mut f)? as usize;
        let metric = Metric::from_i32(read_i32(&mut f)?)?;

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(read_u64(&mut f)?);
        }

        let mut bytes = vec![0u8; count * dim * 4];
        f.read_exact(&mut bytes)?;
        let vectors: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        Ok(Self {
            dim,
            metric,
            capacity: count.max(min_capacity),
            ids,
            vectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_assigns_position_as_id() {
        let mut idx = VectorIndex::create(2, Metric::Cosine, 4);
        let a = idx.add(&[1.0, 0.0]).unwrap();
        let b = idx.add(&[0.0, 1.0]).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn add_past_capacity_is_full() {
        let mut idx = VectorIndex::create(2, Metric::Cosine, 1);
        idx.add(&[1.0, 0.0]).unwrap();
        assert!(matches!(idx.add(&[0.0, 1.0]), Err(Error::Full(1))));
    }

    #[test]
    fn overwrite_unknown_id_is_not_found() {
        let mut idx = VectorIndex::create(2, Metric::Cosine, 4);
        idx.add(&[1.0, 0.0]).unwrap();
        assert!(matches!(idx.overwrite(9, &[0.0, 0.0]), Err(Error::NotFound(9))));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.memo");

        let mut idx = VectorIndex::create(3, Metric::Cosine, 4);
        idx.add(&[1.0, 2.0, 3.0]).unwrap();
        idx.add(&[4.0, 5.0, 6.0]).unwrap();
        idx.save(&path).unwrap();

        let loaded = VectorIndex::load(&path, 4).unwrap();
        assert_eq!(loaded.dim, idx.dim);
        assert_eq!(loaded.ids, idx.ids);
        assert_eq!(loaded.vectors, idx.vectors);
    }
}
