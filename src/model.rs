//! Model file parsing and the in-arena weight layout (spec §3, §4.C).

use crate::arena::{Arena, Handle};
use crate::error::{Error, Result};
use std::io::Read;
use std::path::Path;

/// The packed model header: seven signed 32-bit dimensions.
#[derive(Debug, Clone, Copy)]
pub struct ModelConfig {
    pub dim: i32,
    pub hidden_dim: i32,
    pub n_layers: i32,
    pub n_heads: i32,
    pub n_kv_heads: i32,
    pub vocab_size: i32,
    pub seq_len: i32,
}

impl ModelConfig {
    /// Per-head size: `dim / n_heads`.
    pub fn head_size(&self) -> i32 {
        self.dim / self.n_heads
    }

    /// Combined key/value projection width: `dim * n_kv_heads / n_heads`.
    pub fn kv_dim(&self) -> i32 {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Query-heads-per-kv-head group size for grouped-query attention.
    pub fn kv_mul(&self) -> i32 {
        self.n_heads / self.n_kv_heads
    }

    fn validate(&self) -> Result<()> {
        if self.dim <= 0
            || self.hidden_dim <= 0
            || self.n_layers <= 0
            || self.n_heads <= 0
            || self.n_kv_heads <= 0
            || self.vocab_size <= 0
            || self.seq_len <= 0
        {
            return Err(Error::InvalidModel("non-positive config dimension".into()));
        }
        if self.dim % self.n_heads != 0 {
            return Err(Error::InvalidModel("dim is not a multiple of n_heads".into()));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(Error::InvalidModel(
                "n_heads is not a multiple of n_kv_heads".into(),
            ));
        }
        Ok(())
    }
}

/// Arena handles for every weight slab, laid out in the exact order spec §3
/// requires. `wcls` aliases `token_embedding` when the file carries no
/// separate classifier slab ("tied weights").
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub token_embedding: Handle,
    pub rms_att: Handle,
    pub wq: Handle,
    pub wk: Handle,
    pub wv: Handle,
    pub wo: Handle,
    pub rms_ffn: Handle,
    pub w1: Handle,
    pub w2: Handle,
    pub w3: Handle,
    pub rms_final: Handle,
    pub wcls: Handle,
}

/// Narrow a whole-stack handle (e.g. `wq`, spanning all layers) down to the
/// slice for one layer. Pure offset arithmetic — no arena access needed.
pub fn layer_slice(stack: Handle, layer: usize, per_layer_len: usize) -> Handle {
    Handle {
        offset: stack.offset + layer * per_layer_len * 4,
        len: per_layer_len,
    }
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| Error::InvalidModel("truncated header".into()))?;
    Ok(i32::from_le_bytes(buf))
}

fn read_slab<R: Read>(r: &mut R, arena: &mut Arena, count: usize) -> Result<Handle> {
    let mut bytes = vec![0u8; count * 4];
    r.read_exact(&mut bytes)
        .map_err(|_| Error::InvalidModel("truncated weight slab".into()))?;
    Ok(arena.push_bytes(&bytes))
}

/// Parse the `Config` header and every weight slab directly into `arena`,
/// in the order spec §3 mandates. The classifier slab is present iff the
/// remaining file bytes equal exactly `vocab_size * dim * 4`; otherwise the
/// classifier is tied to the token embedding table.
pub fn load_model(path: &Path, arena: &mut Arena) -> Result<(ModelConfig, Weights)> {
    let mut file = std::fs::File::open(path)?;

    let cfg = ModelConfig {
        dim: read_i32(&mut file)?,
        hidden_dim: read_i32(&mut file)?,
        n_layers: read_i32(&mut file)?,
        n_heads: read_i32(&mut file)?,
        n_kv_heads: read_i32(&mut file)?,
        vocab_size: read_i32(&mut file)?,
        seq_len: read_i32(&mut file)?,
    };
    cfg.validate()?;

    let d = cfg.dim as usize;
    let h = cfg.hidden_dim as usize;
    let l = cfg.n_layers as usize;
    let v = cfg.vocab_size as usize;
    let kv_dim = cfg.kv_dim() as usize;

    let token_embedding = read_slab(&mut file, arena, v * d)?;
    let rms_att = read_slab(&mut file, arena, l * d)?;
    let wq = read_slab(&mut file, arena, l * d * d)?;
    let wk = read_slab(&mut file, arena, l * d * kv_dim)?;
    let wv = read_slab(&mut file, arena, l * d * kv_dim)?;
    let wo = read_slab(&mut file, arena, l * d * d)?;
    let rms_ffn = read_slab(&mut file, arena, l * d)?;
    let w1 = read_slab(&mut file, arena, l * h * d)?;
    let w2 = read_slab(&mut file, arena, l * d * h)?;
    let w3 = read_slab(&mut file, arena, l * h * d)?;
    let rms_final = read_slab(&mut file, arena, d)?;

    let mut remainder = Vec::new();
    file.read_to_end(&mut remainder)?;

    let wcls = if remainder.len() == v * d * 4 {
        arena.push_bytes(&remainder)
    } else if remainder.is_empty() {
        token_embedding
    } else {
        return Err(Error::InvalidModel(format!(
            "unexpected trailing bytes after required slabs: {} (expected 0 or {})",
            remainder.len(),
            v * d * 4
        )));
    };

    Ok((
        cfg,
        Weights {
            token_embedding,
            rms_att,
            wq,
            wk,
            wv,
            wo,
            rms_ffn,
            w1,
            w2,
            w3,
            rms_final,
            wcls,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_model(path: &Path, cfg: [i32; 7], with_classifier: bool) {
        let [dim, hidden, layers, heads, kv_heads, vocab, seq] = cfg;
        let mut f = std::fs::File::create(path).unwrap();
        for v in [dim, hidden, layers, heads, kv_heads, vocab, seq] {
            f.write_all(&v.to_le_bytes()).unwrap();
        }
        let d = dim as usize;
        let h = hidden as usize;
        let l = layers as usize;
        let v = vocab as usize;
        let kv_dim = (dim * kv_heads / heads) as usize;

        let mut write_floats = |count: usize| {
            let zeros = vec![0.0f32; count];
            let bytes: Vec<u8> = zeros.iter().flat_map(|x| x.to_le_bytes()).collect();
            f.write_all(&bytes).unwrap();
        };

        write_floats(v * d); // token embedding
        write_floats(l * d); // rms_att
        write_floats(l * d * d); // wq
        write_floats(l * d * kv_dim); // wk
        write_floats(l * d * kv_dim); // wv
        write_floats(l * d * d); // wo
        write_floats(l * d); // rms_ffn
        write_floats(l * h * d); // w1
        write_floats(l * d * h); // w2
        write_floats(l * h * d); // w3
        write_floats(d); // rms_final

        if with_classifier {
            write_floats(v * d);
        }
    }

    #[test]
    fn tied_classifier_when_slab_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        write_test_model(&path, [8, 16, 2, 2, 2, 10, 4], false);

        let mut arena = Arena::reserve(1 << 20);
        let (_cfg, weights) = load_model(&path, &mut arena).unwrap();
        assert_eq!(weights.wcls.offset, weights.token_embedding.offset);
    }

    #[test]
    fn separate_classifier_when_slab_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        write_test_model(&path, [8, 16, 2, 2, 2, 10, 4], true);

        let mut arena = Arena::reserve(1 << 20);
        let (_cfg, weights) = load_model(&path, &mut arena).unwrap();
        assert_ne!(weights.wcls.offset, weights.token_embedding.offset);
    }

    #[test]
    fn rejects_dim_not_multiple_of_heads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        write_test_model(&path, [9, 16, 2, 2, 2, 10, 4], false);

        let mut arena = Arena::reserve(1 << 20);
        assert!(load_model(&path, &mut arena).is_err());
    }

    #[test]
    fn rejects_truncated_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        std::fs::write(&path, [0u8; 3]).unwrap();

        let mut arena = Arena::reserve(1024);
        assert!(load_model(&path, &mut arena).is_err());
    }
}
