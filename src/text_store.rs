//! Parallel body-text array keyed by the same dense ID space as the vector
//! index (spec §4.H).

use crate::error::{Error, Result};
use crate::persistence::{read_i32, read_lp_string, write_i32, write_lp_string};
use std::path::Path;

pub struct TextStore {
    lines: Vec<String>,
}

impl TextStore {
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    pub fn count(&self) -> usize {
        self.lines.len()
    }

    /// Append `text`, returning its position (which is also its id, shared
    /// with the vector index it's inserted alongside).
    pub fn add(&mut self, text: &str) -> usize {
        self.lines.push(text.to_string());
        self.lines.len() - 1
    }

    /// Replace the body at `id`. Returns [`Error::NotFound`] for an id past
    /// the current count.
    pub fn set(&mut self, id: u64, text: &str) -> Result<()> {
        let idx = id as usize;
        if idx >= self.lines.len() {
            return Err(Error::NotFound(id));
        }
        self.lines[idx] = text.to_string();
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<&str> {
        self.lines.get(id as usize).map(|s| s.as_str())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut f = std::fs::File::create(path)?;
        write_i32(&mut f, self.lines.len() as i32)?;
        for line in &self.lines {
            write_lp_string(&mut f, line)?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut f = std::fs::File::open(path)?;
        let count = read_i32(&mut f)?;
        let mut lines = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            lines.push(read_lp_string(&mut f)?);
        }
        Ok(Self { lines })
    }
}

impl Default for TextStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get() {
        let mut store = TextStore::new();
        let id = store.add("hello");
        assert_eq!(store.get(id as u64), Some("hello"));
    }

    #[test]
    fn set_unknown_id_is_not_found() {
        let mut store = TextStore::new();
        store.add("hello");
        assert!(matches!(store.set(9, "x"), Err(Error::NotFound(9))));
    }

    #[test]
    fn overwrite_preserves_count() {
        let mut store = TextStore::new();
        let id = store.add("old body") as u64;
        store.set(id, "new body").unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.get(id), Some("new body"));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.txt");

        let mut store = TextStore::new();
        store.add("my name is Bob");
        store.add("cake is for birthdays");
        store.save(&path).unwrap();

        let loaded = TextStore::load(&path).unwrap();
        assert_eq!(loaded.lines, store.lines);
    }
}
