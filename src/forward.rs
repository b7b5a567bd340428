//! Transformer forward pass (spec §4.E): RMSNorm, QKV projection, RoPE,
//! grouped-query attention over a KV cache, SwiGLU FFN, residual streams.
//! Every matmul is dispatched to the GPU orchestrator; everything else
//! (norms, rotation, softmax, residual add, the gate) runs on the host,
//! since those are small reductions whose dispatch overhead would dwarf
//! their compute time at sequence width 1.

use crate::arena::Arena;
use crate::error::Result;
use crate::gpu::GpuOrchestrator;
use crate::model::{layer_slice, ModelConfig, Weights};

const RMS_EPS: f32 = 1e-5;

/// Per-token scratch buffers. Not arena-backed (see DESIGN.md): these are
/// reused across every `embed()` call and mutated in place, which is the
/// opposite lifetime shape from the arena's append-only, long-lived slabs.
pub struct RunState {
    pub x: Vec<f32>,
    pub xb: Vec<f32>,
    pub xb2: Vec<f32>,
    pub hb: Vec<f32>,
    pub hb2: Vec<f32>,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub att: Vec<f32>,
    pub logits: Vec<f32>,
    pub key_cache: Vec<f32>,
    pub value_cache: Vec<f32>,
}

impl RunState {
    pub fn new(cfg: &ModelConfig) -> Self {
        let d = cfg.dim as usize;
        let h = cfg.hidden_dim as usize;
        let l = cfg.n_layers as usize;
        let s = cfg.seq_len as usize;
        let hq = cfg.n_heads as usize;
        let kv_dim = cfg.kv_dim() as usize;
        let v = cfg.vocab_size as usize;

        Self {
            x: vec![0.0; d],
            xb: vec![0.0; d],
            xb2: vec![0.0; d],
            hb: vec![0.0; h],
            hb2: vec![0.0; h],
            q: vec![0.0; d],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; hq * s],
            logits: vec![0.0; v],
            key_cache: vec![0.0; l * s * kv_dim],
            value_cache: vec![0.0; l * s * kv_dim],
        }
    }
}

fn rmsnorm(out: &mut [f32], x: &[f32], w: &[f32]) {
    let ss: f32 = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let scale = 1.0 / (ss + RMS_EPS).sqrt();
    for i in 0..x.len() {
        out[i] = w[i] * x[i] * scale;
    }
}

fn apply_rope(q: &mut [f32], k: &mut [f32], pos: usize, head_size: usize, kv_dim: usize) {
    let dim = q.len();
    let mut i = 0usize;
    while i < dim {
        let head_dim = (i % head_size) as f32;
        let freq = 1.0f32 / 10000f32.powf(head_dim / head_size as f32);
        let angle = pos as f32 * freq;
        let (fci, fcr) = angle.sin_cos();

        let q0 = q[i];
        let q1 = q[i + 1];
        q[i] = q0 * fcr - q1 * fci;
        q[i + 1] = q0 * fci + q1 * fcr;

        if i < kv_dim {
            let k0 = k[i];
            let k1 = k[i + 1];
            k[i] = k0 * fcr - k1 * fci;
            k[i + 1] = k0 * fci + k1 * fcr;
        }
        i += 2;
    }
}

fn softmax_in_place(x: &mut [f32]) {
    let max = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x.iter_mut() {
            *v /= sum;
        }
    }
}

fn silu(u: f32) -> f32 {
    u / (1.0 + (-u).exp())
}

/// Run one token through every layer, leaving `state.x` holding the
/// post-final-RMSNorm residual. `want_logits` additionally runs the
/// classifier matmul into `state.logits` — the embedder never needs this
/// and leaves it `false`.
pub fn forward_step(
    cfg: &ModelConfig,
    weights: &Weights,
    arena: &Arena,
    gpu: &GpuOrchestrator,
    state: &mut RunState,
    token: usize,
    pos: usize,
    want_logits: bool,
) -> Result<()> {
    let d = cfg.dim as usize;
    let h = cfg.hidden_dim as usize;
    let kv_dim = cfg.kv_dim() as usize;
    let head_size = cfg.head_size() as usize;
    let n_heads = cfg.n_heads as usize;
    let kv_mul = cfg.kv_mul() as usize;
    let seq_len = cfg.seq_len as usize;

    let embed_row = layer_slice(weights.token_embedding, token, d);
    state.x.copy_from_slice(arena.f32_slice(embed_row));

    for l in 0..cfg.n_layers as usize {
        let rms_att_w = arena.f32_slice(layer_slice(weights.rms_att, l, d));
        rmsnorm(&mut state.xb, &state.x, rms_att_w);

        let wq = layer_slice(weights.wq, l, d * d);
        let wk = layer_slice(weights.wk, l, d * kv_dim);
        let wv = layer_slice(weights.wv, l, d * kv_dim);

        state
            .q
            .copy_from_slice(&gpu.matmul(wq.offset / 4, &state.xb, d, d)?);
        state
            .k
            .copy_from_slice(&gpu.matmul(wk.offset / 4, &state.xb, d, kv_dim)?);
        state
            .v
            .copy_from_slice(&gpu.matmul(wv.offset / 4, &state.xb, d, kv_dim)?);

        apply_rope(&mut state.q, &mut state.k, pos, head_size, kv_dim);

        let cache_base = l * seq_len * kv_dim + pos * kv_dim;
        state.key_cache[cache_base..cache_base + kv_dim].copy_from_slice(&state.k);
        state.value_cache[cache_base..cache_base + kv_dim].copy_from_slice(&state.v);

        for hd in 0..n_heads {
            let q_h = &state.q[hd * head_size..(hd + 1) * head_size];
            let kv_head = hd / kv_mul;
            let att_row = &mut state.att[hd * seq_len..hd * seq_len + pos + 1];

            for t in 0..=pos {
                let key_base = l * seq_len * kv_dim + t * kv_dim + kv_head * head_size;
                let key = &state.key_cache[key_base..key_base + head_size];
                let score: f32 = q_h.iter().zip(key.iter()).map(|(a, b)| a * b).sum();
                att_row[t] = score / (head_size as f32).sqrt();
            }
            softmax_in_place(att_row);

            let xb_h = &mut state.xb[hd * head_size..(hd + 1) * head_size];
            xb_h.fill(0.0);
            for t in 0..=pos {
                let val_base = l * seq_len * kv_dim + t * kv_dim + kv_head * head_size;
                let val = &state.value_cache[val_base..val_base + head_size];
                let weight = att_row[t];
                for i in 0..head_size {
                    xb_h[i] += weight * val[i];
                }
            }
        }

        let wo = layer_slice(weights.wo, l, d * d);
        state.xb2.copy_from_slice(&gpu.matmul(wo.offset / 4, &state.xb, d, d)?);
        for i in 0..d {
            state.x[i] += state.xb2[i];
        }

        let rms_ffn_w = arena.f32_slice(layer_slice(weights.rms_ffn, l, d));
        rmsnorm(&mut state.xb, &state.x, rms_ffn_w);

        let w1 = layer_slice(weights.w1, l, h * d);
        let w3 = layer_slice(weights.w3, l, h * d);
        state.hb.copy_from_slice(&gpu.matmul(w1.offset / 4, &state.xb, d, h)?);
        state.hb2.copy_from_slice(&gpu.matmul(w3.offset / 4, &state.xb, d, h)?);

        for i in 0..h {
            state.hb[i] = silu(state.hb[i]) * state.hb2[i];
        }

        let w2 = layer_slice(weights.w2, l, d * h);
        state.xb.copy_from_slice(&gpu.matmul(w2.offset / 4, &state.hb, h, d)?);
        for i in 0..d {
            state.x[i] += state.xb[i];
        }
    }

    let rms_final_w = arena.f32_slice(weights.rms_final);
    let x_snapshot = state.x.clone();
    rmsnorm(&mut state.x, &x_snapshot, rms_final_w);

    if want_logits {
        let v = cfg.vocab_size as usize;
        state
            .logits
            .copy_from_slice(&gpu.matmul(weights.wcls.offset / 4, &state.x, d, v)?);
    }

    Ok(())
}
