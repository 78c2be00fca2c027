//! C3: the storage map (spec section 4.3).
//!
//! A single ordered map keyed by the C1-encoded byte string
//! (`table_id || user_key`), mirroring the teacher's
//! `storage::memory::Memory` (`BTreeMap<Vec<u8>, Vec<u8>>`) but carrying a
//! per-row `metadata` field whose meaning is owned by whichever concurrency
//! backend (C5 2PL or C6 OCC) is running - this module doesn't interpret it.

mod entry;

pub use entry::Entry;

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::key;

/// The result of a range scan: the rows found, and whether `limit` cut the
/// scan short while more rows remained (spec section 4.4, `SCAN_LIMIT_REACHED`).
pub struct RangeResult {
    pub rows: Vec<(Vec<u8>, Entry)>,
    pub limit_reached: bool,
}

/// The ordered per-table map, addressed through encoded keys. Internally a
/// single `BTreeMap` spans every table, since the key codec guarantees
/// distinct tables never interleave in sort order.
pub struct Storage {
    map: Mutex<BTreeMap<Vec<u8>, Entry>>,
}

impl Storage {
    pub fn new() -> Self {
        Storage { map: Mutex::new(BTreeMap::new()) }
    }

    pub fn get(&self, encoded_key: &[u8]) -> Option<Entry> {
        self.map.lock().unwrap().get(encoded_key).cloned()
    }

    pub fn set(&self, encoded_key: Vec<u8>, entry: Entry) {
        self.map.lock().unwrap().insert(encoded_key, entry);
    }

    pub fn remove(&self, encoded_key: &[u8]) -> Option<Entry> {
        self.map.lock().unwrap().remove(encoded_key)
    }

    /// Updates a row's metadata in place without touching its data, used by
    /// 2PL to release a lock (`metadata = 0`) at commit/rollback.
    pub fn set_metadata(&self, encoded_key: &[u8], metadata: i32) {
        if let Some(entry) = self.map.lock().unwrap().get_mut(encoded_key) {
            entry.metadata = metadata;
        }
    }

    /// Ordered range scan over `[start, end)` for one table, capped at
    /// `limit` rows (0 means unlimited). `start`/`end` are already-resolved
    /// encoded keys (the caller turns empty user-key sentinels into
    /// `key::table_lower_bound`/`table_upper_bound` first).
    pub fn range(&self, start: Vec<u8>, end: Vec<u8>, limit: usize) -> RangeResult {
        let map = self.map.lock().unwrap();
        let mut rows = Vec::new();
        let mut limit_reached = false;
        for (k, v) in map.range(start..end) {
            if limit != 0 && rows.len() == limit {
                limit_reached = true;
                break;
            }
            rows.push((k.clone(), v.clone()));
        }
        RangeResult { rows, limit_reached }
    }

    /// All entries belonging to one table, in key order, for checkpointing.
    pub fn table_entries(&self, table_id: u64) -> Vec<(Vec<u8>, Entry)> {
        let start = key::table_lower_bound(table_id);
        let end = key::table_upper_bound(table_id);
        let map = self.map.lock().unwrap();
        map.range(start..end).map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Removes every row belonging to one table (spec section 4.2, drop_table).
    pub fn drop_table_rows(&self, table_id: u64) {
        let start = key::table_lower_bound(table_id);
        let end = key::table_upper_bound(table_id);
        let mut map = self.map.lock().unwrap();
        let doomed: Vec<Vec<u8>> = map.range(start..end).map(|(k, _)| k.clone()).collect();
        for k in doomed {
            map.remove(&k);
        }
    }

    pub fn insert_raw(&self, encoded_key: Vec<u8>, entry: Entry) {
        self.map.lock().unwrap().insert(encoded_key, entry);
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops() {
        let s = Storage::new();
        let k = key::encode(1, b"a");
        assert!(s.get(&k).is_none());
        s.set(k.clone(), Entry::new(vec![1], 0));
        assert_eq!(s.get(&k).unwrap().data, vec![1]);
        s.remove(&k);
        assert!(s.get(&k).is_none());
    }

    #[test]
    fn range_respects_table_boundaries() {
        let s = Storage::new();
        for (t, k) in [(1u64, "a"), (1, "b"), (1, "c"), (2, "a")] {
            s.set(key::encode(t, k.as_bytes()), Entry::new(vec![0], 0));
        }
        let start = key::table_lower_bound(1);
        let end = key::table_upper_bound(1);
        let result = s.range(start, end, 0);
        assert_eq!(result.rows.len(), 3);
        assert!(!result.limit_reached);
    }

    #[test]
    fn range_limit_reports_truncation() {
        let s = Storage::new();
        for k in ["a", "b", "c"] {
            s.set(key::encode(1, k.as_bytes()), Entry::new(vec![0], 0));
        }
        let result = s.range(key::table_lower_bound(1), key::table_upper_bound(1), 2);
        assert_eq!(result.rows.len(), 2);
        assert!(result.limit_reached);
    }
}
