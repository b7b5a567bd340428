//! Text-to-vector embedding (spec §4.F): tokenize, run the transformer
//! sequentially over every position, take the final residual stream as the
//! embedding, L2-normalize it.

use crate::arena::Arena;
use crate::error::Result;
use crate::forward::{forward_step, RunState};
use crate::gpu::GpuOrchestrator;
use crate::model::{ModelConfig, Weights};
use crate::tokenizer::Tokenizer;

/// Embeddings with a norm below this are degenerate (e.g. empty/unknown
/// input tokenized to nothing) and are returned as the zero vector rather
/// than divided by a near-zero denominator.
const MIN_NORM: f32 = 1e-5;

pub struct Embedder<'a> {
    cfg: &'a ModelConfig,
    weights: &'a Weights,
    tokenizer: &'a Tokenizer,
    gpu: &'a GpuOrchestrator,
    state: RunState,
}

impl<'a> Embedder<'a> {
    pub fn new(
        cfg: &'a ModelConfig,
        weights: &'a Weights,
        tokenizer: &'a Tokenizer,
        gpu: &'a GpuOrchestrator,
    ) -> Self {
        let state = RunState::new(cfg);
        Self {
            cfg,
            weights,
            tokenizer,
            gpu,
            state,
        }
    }

    /// Embed `text` into a dim-`D` unit vector. Returns the zero vector if
    /// `text` tokenizes to nothing or the forward pass collapses to a
    /// near-zero residual.
    pub fn embed(&mut self, arena: &Arena, text: &str) -> Result<Vec<f32>> {
        let tokens = self.tokenizer.encode(arena, text);
        let d = self.cfg.dim as usize;

        if tokens.is_empty() {
            return Ok(vec![0.0; d]);
        }

        // KV cache is sized `seq_len` positions deep; longer input is
        // truncated to the model's context window rather than overflowing it.
        let max_pos = self.cfg.seq_len as usize;
        let tokens = if tokens.len() > max_pos {
            &tokens[..max_pos]
        } else {
            &tokens[..]
        };

        for (pos, &token) in tokens.iter().enumerate() {
            forward_step(
                self.cfg,
                self.weights,
                arena,
                self.gpu,
                &mut self.state,
                token as usize,
                pos,
                false,
            )?;
        }

        let mut out = self.state.x.clone();
        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < MIN_NORM {
            out.iter_mut().for_each(|v| *v = 0.0);
        } else {
            out.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(out)
    }
}
