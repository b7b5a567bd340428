//! Byte-pair tokenizer (spec §4.B): loads a scored-merge vocabulary and
//! encodes/decodes against it.

use crate::arena::{Arena, Handle};
use crate::error::{Error, Result};
use std::io::Read;
use std::path::Path;

/// One vocabulary entry: its merge score and arena-backed raw bytes.
#[derive(Debug, Clone, Copy)]
struct VocabEntry {
    score: f32,
    bytes: Handle,
}

pub struct Tokenizer {
    #[allow(dead_code)]
    max_token_length: i32,
    /// Vocabulary entries, indexed by token id.
    vocab: Vec<VocabEntry>,
    /// `(string, id)` pairs sorted lexicographically by byte content, for
    /// binary-search lookup during encoding.
    sorted_index: Vec<(Vec<u8>, i32)>,
}

fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| Error::InvalidModel("truncated tokenizer file".into()))?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| Error::InvalidModel("truncated tokenizer file".into()))?;
    Ok(f32::from_le_bytes(buf))
}

impl Tokenizer {
    /// Load the tokenizer file. `vocab_size` comes from the model's
    /// `Config.vocab_size` — the tokenizer file itself carries no count, only
    /// `max_token_length` followed by exactly `vocab_size` records.
    pub fn load(path: &Path, vocab_size: usize, arena: &mut Arena) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let max_token_length = read_i32(&mut file)?;

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut sorted_index = Vec::with_capacity(vocab_size);

        for id in 0..vocab_size {
            let score = read_f32(&mut file)?;
            let length = read_i32(&mut file)?;
            if length < 0 {
                return Err(Error::InvalidModel("negative token length".into()));
            }
            let mut bytes = vec![0u8; length as usize];
            file.read_exact(&mut bytes)
                .map_err(|_| Error::InvalidModel("truncated tokenizer file".into()))?;

            let handle = arena.push_bytes(&bytes);
            vocab.push(VocabEntry {
                score,
                bytes: handle,
            });
            sorted_index.push((bytes, id as i32));
        }
        sorted_index.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            max_token_length,
            vocab,
            sorted_index,
        })
    }

    fn lookup_id(&self, needle: &[u8]) -> Option<i32> {
        self.sorted_index
            .binary_search_by(|(s, _)| s.as_slice().cmp(needle))
            .ok()
            .map(|i| self.sorted_index[i].1)
    }

    /// Raw vocabulary bytes for a token id. Spacing convention is the
    /// caller's concern per spec §4.B.
    pub fn decode_piece(&self, arena: &Arena, id: i32) -> Vec<u8> {
        arena.bytes(self.vocab[id as usize].bytes).to_vec()
    }

    /// Encode `text` into a token-id sequence: seed with single-byte
    /// vocabulary entries (discarding unrepresentable bytes), then greedily
    /// merge the highest-scoring adjacent pair until no pair merges.
    pub fn encode(&self, arena: &Arena, text: &str) -> Vec<i32> {
        let mut tokens: Vec<i32> = Vec::with_capacity(text.len());
        for &b in text.as_bytes() {
            if let Some(id) = self.lookup_id(&[b]) {
                tokens.push(id);
            }
        }

        if tokens.is_empty() {
            return tokens;
        }

        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best_id = -1i32;
            let mut best_pos: Option<usize> = None;

            for i in 0..tokens.len() - 1 {
                let mut merged = self.decode_piece(arena, tokens[i]);
                merged.extend_from_slice(&self.decode_piece(arena, tokens[i + 1]));
                if let Some(id) = self.lookup_id(&merged) {
                    let score = self.vocab[id as usize].score;
                    if score > best_score {
                        best_score = score;
                        best_id = id;
                        best_pos = Some(i);
                    }
                }
            }

            let Some(pos) = best_pos else { break };
            tokens[pos] = best_id;
            tokens.remove(pos + 1);
        }

        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a tiny tokenizer file: single bytes 'a','b','c' plus the merged
    /// pair "ab" with a high score so it always wins.
    fn write_test_tokenizer(path: &Path) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(&4i32.to_le_bytes()).unwrap(); // max_token_length

        let entries: &[(f32, &[u8])] = &[
            (0.0, b"a"),
            (0.0, b"b"),
            (0.0, b"c"),
            (100.0, b"ab"),
        ];
        for (score, bytes) in entries {
            f.write_all(&score.to_le_bytes()).unwrap();
            f.write_all(&(bytes.len() as i32).to_le_bytes()).unwrap();
            f.write_all(bytes).unwrap();
        }
    }

    #[test]
    fn merges_highest_scoring_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tok.bin");
        write_test_tokenizer(&path);

        let mut arena = Arena::reserve(4096);
        let tok = Tokenizer::load(&path, 4, &mut arena).unwrap();

        let ids = tok.encode(&arena, "abc");
        // "ab" merges to id 3, then no further merge ("ab"+"c" not in vocab).
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn unrepresentable_bytes_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tok.bin");
        write_test_tokenizer(&path);

        let mut arena = Arena::reserve(4096);
        let tok = Tokenizer::load(&path, 4, &mut arena).unwrap();

        // 'z' has no vocabulary entry at all.
        let ids = tok.encode(&arena, "z");
        assert_eq!(ids.len(), 0);
    }

    #[test]
    fn rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tok.bin");
        std::fs::write(&path, [0u8; 2]).unwrap();

        let mut arena = Arena::reserve(1024);
        assert!(Tokenizer::load(&path, 4, &mut arena).is_err());
    }
}
