//! Integration tests over the components that need neither a GPU adapter
//! nor a model/tokenizer asset: the metadata filter engine, the arena's
//! snapshot/restore discipline, and the on-disk sidecar formats.

use neuromemo::arena::Arena;
use neuromemo::metadata::MetaStore;
use neuromemo::text_store::TextStore;
use neuromemo::vector_index::{Metric, VectorIndex};

#[test]
fn metadata_filter_matches_only_tagged_records() {
    let mut arena = Arena::reserve(1 << 16);
    let mut meta = MetaStore::new();
    meta.add(&mut arena, "source: user, tags: [medical, allergy]");
    meta.add(&mut arena, "source: chat");
    meta.add(&mut arena, "");
    meta.add(&mut arena, "source: user, priority: 3");

    let mask = meta.filter_mask(&mut arena, "source: user").unwrap();
    assert_eq!(mask, vec![true, false, false, true]);

    let tagged = meta.filter_mask(&mut arena, "tags: {$contains: allergy}").unwrap();
    assert_eq!(tagged, vec![true, false, false, false]);

    // Records with no metadata never match, even a filter with no fields
    // that would otherwise vacuously pass.
    let empty_always_excluded = meta.filter_mask(&mut arena, "priority: {$gte: 0}").unwrap();
    assert!(!empty_always_excluded[2]);
}

#[test]
fn filter_conjunction_is_subset_of_either_clause() {
    let mut arena = Arena::reserve(1 << 16);
    let mut meta = MetaStore::new();
    meta.add(&mut arena, "source: user, priority: 3");
    meta.add(&mut arena, "source: user, priority: 1");
    meta.add(&mut arena, "source: chat, priority: 3");

    let a = meta.filter_mask(&mut arena, "source: user").unwrap();
    let conjunction = meta
        .filter_mask(&mut arena, "$and: [{source: user}, {priority: {$gte: 2}}]")
        .unwrap();

    for i in 0..a.len() {
        assert!(!conjunction[i] || a[i], "conjunction bit set where clause A is false at {i}");
    }
    assert_eq!(conjunction, vec![true, false, false]);
}

#[test]
fn arena_high_water_mark_is_unchanged_by_a_filter_pass() {
    let mut arena = Arena::reserve(1 << 16);
    let mut meta = MetaStore::new();
    meta.add(&mut arena, "source: user");
    meta.add(&mut arena, "source: chat");

    let before = arena.committed().len();
    meta.filter_mask(&mut arena, "source: user").unwrap();
    assert_eq!(arena.committed().len(), before);
}

#[test]
fn text_store_overwrite_preserves_record_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");

    let mut store = TextStore::new();
    let id = store.add("original body") as u64;
    store.add("second body");
    store.save(&path).unwrap();

    let mut reloaded = TextStore::load(&path).unwrap();
    reloaded.set(id, "revised body").unwrap();
    assert_eq!(reloaded.count(), 2);
    assert_eq!(reloaded.get(id), Some("revised body"));
}

#[test]
fn vector_index_save_load_is_byte_exact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.memo");

    let mut idx = VectorIndex::create(4, Metric::Cosine, 8);
    let a = idx.add(&[1.0, 0.0, 0.0, 0.0]).unwrap();
    let b = idx.add(&[0.0, 1.0, 0.0, 0.0]).unwrap();
    assert_eq!((a, b), (0, 1));
    idx.save(&path).unwrap();

    let loaded = VectorIndex::load(&path, 8).unwrap();
    assert_eq!(loaded.count(), 2);
    assert_eq!(loaded.dim(), 4);
}
