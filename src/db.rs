//! Top-level orchestrator tying the inference engine, GPU compute, and the
//! three on-disk stores together into the single object the CLI drives.
//! Constructed once per invocation; no part of it is a process-wide
//! singleton (spec §9's "global mutable state" redesign flag).

use crate::arena::Arena;
use crate::config::Config;
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::gpu::GpuOrchestrator;
use crate::metadata::MetaStore;
use crate::model::{self, ModelConfig, Weights};
use crate::text_store::TextStore;
use crate::tokenizer::Tokenizer;
use crate::vector_index::{Metric, SearchResult, VectorIndex};
use std::path::{Path, PathBuf};

/// Flat brute-force search is explicitly capped at "roughly 10^5 vectors"
/// (spec §1 non-goals); this is the writable ceiling new databases are
/// created with.
const DEFAULT_CAPACITY: usize = 100_000;

pub struct RecallRow {
    pub id: u64,
    pub score: f32,
    pub text: String,
    pub metadata: String,
    pub sentinel: bool,
}

pub struct AnalyzeSummary {
    pub count: usize,
    pub dim: usize,
    pub metric: Metric,
    pub with_metadata: usize,
}

pub struct Database {
    arena: Arena,
    model_cfg: ModelConfig,
    weights: Weights,
    tokenizer: Tokenizer,
    gpu: GpuOrchestrator,
    vector_index: VectorIndex,
    text_store: TextStore,
    meta_store: MetaStore,
    memo_path: PathBuf,
    txt_path: PathBuf,
    meta_path: PathBuf,
}

fn sidecar_paths(basename: &str) -> (PathBuf, PathBuf, PathBuf) {
    (
        PathBuf::from(format!("{basename}.memo")),
        PathBuf::from(format!("{basename}.txt")),
        PathBuf::from(format!("{basename}.meta")),
    )
}

/// A missing sidecar, or one that fails with an I/O error, is treated as an
/// empty store (spec §7); any other error (corrupt contents) propagates.
fn load_or_empty<T>(path: &Path, load: impl FnOnce(&Path) -> Result<T>, empty: impl FnOnce() -> T) -> Result<T> {
    if !path.exists() {
        return Ok(empty());
    }
    match load(path) {
        Ok(v) => Ok(v),
        Err(Error::Io(e)) => {
            crate::debug_log!("sidecar {path:?} unreadable ({e}), treating as empty");
            Ok(empty())
        }
        Err(other) => Err(other),
    }
}

impl Database {
    /// Load the model and tokenizer (fatal on failure — corrupt required
    /// assets abort the run per spec §7), then open or create the three
    /// sidecars for `config.db_basename`.
    pub fn open(config: &Config) -> Result<Self> {
        let mut arena = Arena::reserve(config.arena_bytes);
        let (model_cfg, weights) = model::load_model(&config.model_path, &mut arena)?;
        let tokenizer = Tokenizer::load(&config.tokenizer_path, model_cfg.vocab_size as usize, &mut arena)?;

        let dim = model_cfg.dim as usize;
        let max_vec_len = dim
            .max(model_cfg.hidden_dim as usize)
            .max(model_cfg.vocab_size as usize);
        let power_preference = crate::gpu::parse_power_preference(&config.gpu_power_preference);
        let gpu = GpuOrchestrator::new(arena.committed().len(), max_vec_len, DEFAULT_CAPACITY, dim, power_preference)?;
        gpu.upload_weights(arena.committed());

        let (memo_path, txt_path, meta_path) = sidecar_paths(&config.db_basename);

        let vector_index = load_or_empty(
            &memo_path,
            |p| VectorIndex::load(p, DEFAULT_CAPACITY),
            || VectorIndex::create(dim, Metric::Cosine, DEFAULT_CAPACITY),
        )?;
        let text_store = load_or_empty(&txt_path, TextStore::load, TextStore::new)?;
        let meta_store = load_or_empty(&meta_path, |p| MetaStore::load(p, &mut arena), MetaStore::new)?;

        Ok(Self {
            arena,
            model_cfg,
            weights,
            tokenizer,
            gpu,
            vector_index,
            text_store,
            meta_store,
            memo_path,
            txt_path,
            meta_path,
        })
    }

    /// Embed `text`, append it to all three stores, and persist them.
    /// Metadata is optional; an absent `metadata` stores an empty raw
    /// string (semantically identical to "missing" — spec §4.I).
    pub fn save_record(&mut self, text: &str, metadata: Option<&str>) -> Result<u64> {
        let mut embedder = Embedder::new(&self.model_cfg, &self.weights, &self.tokenizer, &self.gpu);
        let vector = embedder.embed(&self.arena, text)?;

        let id = self.vector_index.add(&vector)?;
        self.text_store.add(text);
        self.meta_store.add(&mut self.arena, metadata.unwrap_or(""));

        self.persist()?;
        Ok(id)
    }

    /// Overwrite the body (and re-embed the vector) at an existing id. The
    /// record's metadata is left untouched unless `metadata` is given.
    pub fn overwrite_record(&mut self, id: u64, text: &str, metadata: Option<&str>) -> Result<()> {
        let mut embedder = Embedder::new(&self.model_cfg, &self.weights, &self.tokenizer, &self.gpu);
        let vector = embedder.embed(&self.arena, text)?;

        self.vector_index.overwrite(id, &vector)?;
        self.text_store.set(id, text)?;
        if let Some(m) = metadata {
            self.meta_store.set(&mut self.arena, id, m)?;
        }
        self.persist()?;
        Ok(())
    }

    pub fn recall(&mut self, query: &str, k: usize, filter: Option<&str>) -> Result<Vec<RecallRow>> {
        let mut embedder = Embedder::new(&self.model_cfg, &self.weights, &self.tokenizer, &self.gpu);
        let query_vec = embedder.embed(&self.arena, query)?;

        // A malformed filter yields an empty candidate set rather than
        // aborting the command (spec §7: FilterParse is a user-input
        // condition, not a crash).
        let mask = match filter {
            Some(expr) => Some(
                self.meta_store
                    .filter_mask(&mut self.arena, expr)
                    .unwrap_or_else(|_| vec![false; self.meta_store.count()]),
            ),
            None => None,
        };

        let results: Vec<SearchResult> = self
            .vector_index
            .search(&self.gpu, &query_vec, k, mask.as_deref())?;

        Ok(results
            .into_iter()
            .map(|r| RecallRow {
                id: r.id,
                score: r.score,
                text: if r.sentinel {
                    String::new()
                } else {
                    self.text_store.get(r.id).unwrap_or("").to_string()
                },
                metadata: if r.sentinel {
                    String::new()
                } else {
                    self.meta_store.raw(&self.arena, r.id).to_string()
                },
                sentinel: r.sentinel,
            })
            .collect())
    }

    pub fn analyze(&self) -> AnalyzeSummary {
        let with_metadata = (0..self.meta_store.count())
            .filter(|&id| !self.meta_store.raw(&self.arena, id as u64).trim().is_empty())
            .count();
        AnalyzeSummary {
            count: self.vector_index.count(),
            dim: self.vector_index.dim(),
            metric: self.vector_index.metric(),
            with_metadata,
        }
    }

    /// Delete every sidecar for this basename. Missing files are not an
    /// error.
    pub fn clean(&self) -> Result<()> {
        for path in [&self.memo_path, &self.txt_path, &self.meta_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.vector_index.save(&self.memo_path)?;
        self.text_store.save(&self.txt_path)?;
        self.meta_store.save(&self.arena, &self.meta_path)?;
        Ok(())
    }
}
