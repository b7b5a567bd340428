//! Metadata store and flow-style filter engine (spec §4.I): a parallel
//! array of raw per-record flow strings, a small recursive-descent parser
//! for the inline `{key: value}` subset, and an operator evaluator that
//! reduces a filter expression against every record into a bitmask.
//!
//! The arena owns every record's raw string (pushed once, at `add` time).
//! Evaluating a filter re-parses each record's raw text fresh rather than
//! caching a parsed form — parsing is O(field count) and this keeps the
//! store itself free of any lifetime tied to a parse pass. No transient
//! bytes are written to the arena during evaluation (the parser borrows
//! directly from the already-resident raw string), but `filter_mask` still
//! brackets the pass with `snapshot`/`restore` to honor the arena's general
//! contract for "scratch allocations made during filter evaluation" —
//! a future parser that builds an intermediate AST in the arena can rely on
//! that bracket already being in place.

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::persistence::{read_i32, read_lp_string, write_i32, write_lp_string};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    String(String),
    Int64(i64),
    Array(Vec<String>),
    RawSubmap(String),
}

#[derive(Debug, Clone)]
struct MetaField {
    key: String,
    raw: String,
}

pub struct MetaStore {
    handles: Vec<crate::arena::Handle>,
}

impl MetaStore {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.handles.len()
    }

    /// Append a record's raw flow-string (may be empty — a missing and an
    /// empty slot behave identically: neither ever matches a filter).
    pub fn add(&mut self, arena: &mut Arena, raw: &str) -> usize {
        let h = arena.push_bytes(raw.as_bytes());
        self.handles.push(h);
        self.handles.len() - 1
    }

    pub fn raw<'a>(&self, arena: &'a Arena, id: u64) -> &'a str {
        let h = self.handles[id as usize];
        std::str::from_utf8(arena.bytes(h)).unwrap_or("")
    }

    /// Replace the raw flow-string at `id` with a freshly arena-pushed copy.
    /// The old bytes are left in place (the arena never reclaims); only the
    /// handle is repointed. Returns [`Error::NotFound`] for an unknown id.
    pub fn set(&mut self, arena: &mut Arena, id: u64, raw: &str) -> Result<()> {
        let idx = id as usize;
        if idx >= self.handles.len() {
            return Err(Error::NotFound(id));
        }
        self.handles[idx] = arena.push_bytes(raw.as_bytes());
        Ok(())
    }

    pub fn save(&self, arena: &Arena, path: &Path) -> Result<()> {
        let mut f = std::fs::File::create(path)?;
        write_i32(&mut f, self.count() as i32)?;
        for i in 0..self.count() {
            write_lp_string(&mut f, self.raw(arena, i as u64))?;
        }
        Ok(())
    }

    pub fn load(path: &Path, arena: &mut Arena) -> Result<Self> {
        let mut f = std::fs::File::open(path)?;
        let count = read_i32(&mut f)?;
        let mut store = Self::new();
        for _ in 0..count {
            let s = read_lp_string(&mut f)?;
            store.add(arena, &s);
        }
        Ok(store)
    }

    /// Evaluate `filter_expr` against every record, producing one bit per
    /// record. Brackets the pass with an arena snapshot/restore (see module
    /// doc). Returns [`Error::FilterParse`] only for structurally malformed
    /// expressions (unbalanced brackets); a well-formed but semantically
    /// empty filter simply matches nothing.
    pub fn filter_mask(&self, arena: &mut Arena, filter_expr: &str) -> Result<Vec<bool>> {
        check_balanced(filter_expr)?;
        let mark = arena.snapshot();
        let mut mask = Vec::with_capacity(self.count());
        for id in 0..self.count() {
            let raw = self.raw(arena, id as u64);
            mask.push(eval_filter(filter_expr, raw));
        }
        arena.restore(mark);
        Ok(mask)
    }
}

impl Default for MetaStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_balanced(s: &str) -> Result<()> {
    let mut depth = 0i32;
    for c in s.chars() {
        match c {
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::FilterParse(format!("unbalanced brackets in `{s}`")));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::FilterParse(format!("unbalanced brackets in `{s}`")));
    }
    Ok(())
}

fn strip_outer_braces(s: &str) -> &str {
    let t = s.trim();
    if t.len() >= 2 && (t.starts_with('{') && t.ends_with('}') || t.starts_with('[') && t.ends_with(']')) {
        &t[1..t.len() - 1]
    } else {
        t
    }
}

/// Split on commas at bracket depth 0.
fn split_top_level_commas(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' | '[' => depth += 1,
            '}' | ']' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn find_top_level_colon(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '{' | '[' => depth += 1,
            '}' | ']' => depth -= 1,
            ':' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

/// Parse top-level `key: value` pairs out of a (possibly brace-wrapped)
/// flow-style fragment. Values are kept as raw trimmed text; [`parse_value`]
/// types them lazily at the point of use.
fn parse_fields(text: &str) -> Vec<MetaField> {
    let inner = strip_outer_braces(text);
    split_top_level_commas(inner)
        .into_iter()
        .filter_map(|item| {
            let item = item.trim();
            if item.is_empty() {
                return None;
            }
            let colon = find_top_level_colon(item)?;
            let key = item[..colon].trim().to_string();
            let raw = item[colon + 1..].trim().to_string();
            Some(MetaField { key, raw })
        })
        .collect()
}

/// True only if `s` parses as an `i64` — not just digit-shaped. A literal
/// that overflows `i64` (e.g. from a hand-typed `--filter` or `-m` value)
/// falls through to `ValueKind::String` instead of panicking.
fn is_int_literal(s: &str) -> bool {
    s.parse::<i64>().is_ok()
}

fn parse_value(raw: &str) -> ValueKind {
    let t = raw.trim();
    if t.starts_with('{') && t.ends_with('}') {
        ValueKind::RawSubmap(t.to_string())
    } else if t.starts_with('[') && t.ends_with(']') {
        let items = split_top_level_commas(&t[1..t.len() - 1])
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        ValueKind::Array(items)
    } else if is_int_literal(t) {
        ValueKind::Int64(t.parse().unwrap())
    } else {
        ValueKind::String(t.to_string())
    }
}

fn value_as_str(v: &ValueKind) -> String {
    match v {
        ValueKind::String(s) => s.clone(),
        ValueKind::Int64(i) => i.to_string(),
        ValueKind::Array(a) => a.join(","),
        ValueKind::RawSubmap(s) => s.clone(),
    }
}

fn values_equal(operand_raw: &str, field_value: &ValueKind) -> bool {
    match field_value {
        ValueKind::Int64(v) => is_int_literal(operand_raw) && operand_raw.parse::<i64>().ok() == Some(*v),
        ValueKind::String(s) => s == operand_raw,
        ValueKind::Array(arr) => arr.iter().any(|x| x == operand_raw),
        ValueKind::RawSubmap(_) => false,
    }
}

fn eval_equality(filter_val: &ValueKind, record_val: &ValueKind) -> bool {
    match (filter_val, record_val) {
        (ValueKind::Array(_), _) | (_, ValueKind::RawSubmap(_)) => false,
        (scalar, ValueKind::Array(arr)) => {
            let s = value_as_str(scalar);
            arr.iter().any(|x| *x == s)
        }
        (a, b) => value_as_str(a) == value_as_str(b),
    }
}

fn ordered_compare(op: &str, operand_raw: &str, field_value: &ValueKind) -> bool {
    let ordering = match (is_int_literal(operand_raw), field_value) {
        (true, ValueKind::Int64(fv)) => {
            let ov: i64 = operand_raw.parse().unwrap();
            fv.cmp(&ov)
        }
        _ => value_as_str(field_value).as_str().cmp(operand_raw),
    };
    match op {
        "$gte" => ordering.is_ge(),
        "$lte" => ordering.is_le(),
        _ => false,
    }
}

fn eval_operator(submap_raw: &str, record_field: &MetaField) -> bool {
    let fields = parse_fields(submap_raw);
    let Some(op_field) = fields.first() else {
        return false;
    };
    let operand_raw = op_field.raw.trim();
    let field_value = parse_value(&record_field.raw);

    match op_field.key.as_str() {
        "$gte" | "$lte" => ordered_compare(&op_field.key, operand_raw, &field_value),
        "$ne" => !values_equal(operand_raw, &field_value),
        "$prefix" => match &field_value {
            ValueKind::String(s) => s.starts_with(operand_raw),
            _ => false,
        },
        "$contains" => match &field_value {
            ValueKind::Array(arr) => arr.iter().any(|x| x == operand_raw),
            _ => false,
        },
        _ => false,
    }
}

fn eval_field(field: &MetaField, record_fields: &[MetaField]) -> bool {
    if field.key == "$and" {
        let items = split_top_level_commas(strip_outer_braces(&field.raw));
        return items
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .all(|sub| eval_against_fields(sub, record_fields));
    }
    if field.key == "$or" {
        let items = split_top_level_commas(strip_outer_braces(&field.raw));
        let items: Vec<&str> = items.into_iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
        if items.is_empty() {
            return false;
        }
        return items.iter().any(|sub| eval_against_fields(sub, record_fields));
    }

    let Some(record_field) = record_fields.iter().find(|r| r.key == field.key) else {
        return false;
    };

    match parse_value(&field.raw) {
        ValueKind::RawSubmap(sub) => eval_operator(&sub, record_field),
        filter_val => eval_equality(&filter_val, &parse_value(&record_field.raw)),
    }
}

fn eval_against_fields(filter_text: &str, record_fields: &[MetaField]) -> bool {
    let filter_fields = parse_fields(filter_text);
    filter_fields.iter().all(|f| eval_field(f, record_fields))
}

/// Top-level entry point: `record_text` empty means "no metadata", which
/// never matches any filter (spec §4.I).
fn eval_filter(filter_text: &str, record_text: &str) -> bool {
    if record_text.trim().is_empty() {
        return false;
    }
    let record_fields = parse_fields(record_text);
    eval_against_fields(filter_text, &record_fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_record_never_matches() {
        assert!(!eval_filter("source: user", ""));
    }

    #[test]
    fn bare_string_equality() {
        assert!(eval_filter("source: user", "source: user"));
        assert!(!eval_filter("source: user", "source: chat"));
    }

    #[test]
    fn array_contains_operator() {
        assert!(eval_filter(
            "tags: {$contains: allergy}",
            "tags: [medical, allergy]"
        ));
        assert!(!eval_filter(
            "tags: {$contains: peanut}",
            "tags: [medical, allergy]"
        ));
    }

    #[test]
    fn array_bare_equality_is_contains_fallback() {
        assert!(eval_filter("tags: allergy", "tags: [medical, allergy]"));
    }

    #[test]
    fn integer_gte_operator() {
        assert!(eval_filter("priority: {$gte: 2}", "priority: 3"));
        assert!(!eval_filter("priority: {$gte: 2}", "priority: 1"));
    }

    #[test]
    fn and_combinator_on_date_range() {
        let filter = "$and: [{ts: {$gte: 2026-01-01}}, {ts: {$lte: 2026-01-31}}]";
        assert!(eval_filter(filter, "ts: 2026-01-15"));
        assert!(!eval_filter(filter, "ts: 2026-02-15"));
    }

    #[test]
    fn or_combinator_matches_any() {
        let filter = "$or: [{source: user}, {source: admin}]";
        assert!(eval_filter(filter, "source: admin"));
        assert!(!eval_filter(filter, "source: chat"));
    }

    #[test]
    fn prefix_and_ne_operators() {
        assert!(eval_filter("name: {$prefix: Bob}", "name: Bobby"));
        assert!(eval_filter("source: {$ne: chat}", "source: user"));
        assert!(!eval_filter("source: {$ne: user}", "source: user"));
    }

    #[test]
    fn overflowing_integer_literal_falls_back_to_string() {
        assert_eq!(
            parse_value("99999999999999999999"),
            ValueKind::String("99999999999999999999".to_string())
        );
        // A filter comparing it never panics, it just doesn't match as an int.
        assert!(!eval_filter("priority: {$gte: 99999999999999999999}", "priority: 3"));
    }

    #[test]
    fn malformed_filter_rejected() {
        let mut arena = Arena::reserve(4096);
        let mut store = MetaStore::new();
        store.add(&mut arena, "source: user");
        assert!(store.filter_mask(&mut arena, "source: {$gte: 1").is_err());
    }

    #[test]
    fn set_overwrites_raw_and_preserves_count() {
        let mut arena = Arena::reserve(4096);
        let mut store = MetaStore::new();
        let id = store.add(&mut arena, "source: user") as u64;
        store.set(&mut arena, id, "source: admin").unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.raw(&arena, id), "source: admin");
    }

    #[test]
    fn set_unknown_id_is_not_found() {
        let mut arena = Arena::reserve(4096);
        let mut store = MetaStore::new();
        store.add(&mut arena, "source: user");
        assert!(matches!(store.set(&mut arena, 9, "x"), Err(Error::NotFound(9))));
    }

    #[test]
    fn store_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.meta");

        let mut arena = Arena::reserve(4096);
        let mut store = MetaStore::new();
        store.add(&mut arena, "source: user");
        store.add(&mut arena, "");
        store.save(&arena, &path).unwrap();

        let mut arena2 = Arena::reserve(4096);
        let loaded = MetaStore::load(&path, &mut arena2).unwrap();
        assert_eq!(loaded.count(), 2);
        assert_eq!(loaded.raw(&arena2, 0), "source: user");
        assert_eq!(loaded.raw(&arena2, 1), "");
    }

    #[test]
    fn filter_mask_matches_subset_of_records() {
        let mut arena = Arena::reserve(4096);
        let mut store = MetaStore::new();
        store.add(&mut arena, "source: user");
        store.add(&mut arena, "source: chat");
        store.add(&mut arena, "source: user");

        let mask = store.filter_mask(&mut arena, "source: user").unwrap();
        assert_eq!(mask, vec![true, false, true]);
    }
}
