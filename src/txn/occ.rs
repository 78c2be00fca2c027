//! C6: the optimistic (OCC) concurrency backend (spec section 4.6).
//!
//! Reads never block: each key read is stamped with the version it was read
//! at (`Entry::metadata`, per `storage::entry::Entry`'s doc - `-1` marks a
//! tombstone left behind by a committed delete, distinguishing "deleted" from
//! "never existed"). Writes and deletes are buffered locally, exactly like
//! `two_pl::TwoPl`. At commit, every read is revalidated against the current
//! stored version under a single global commit lock; any mismatch aborts
//! with `TRANSACTION_HAS_STALE_DATA` and applies nothing. This validate,
//! then apply sequencing is grounded on the `TransactionManager` sketch in
//! the pack's concurrency-manager reference file (`version: AtomicU64`,
//! `commit_lock: Mutex<()>`, validate before apply).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::catalog::Catalog;
use crate::error::{CResult, Error};
use crate::key;
use crate::storage::{Entry, Storage};

use super::{
    bump_counter, LocalView, ProcessFn, ProcessOutcome, RangeProcessCall, RangeProcessFn,
    RangeProcessRow, ReadSnapshot, ScanOutcome, TransactionManager, TxId, TxnState,
};

/// Sentinel recorded in a `ReadSnapshot` when the key did not exist at read
/// time, distinct from the `-1` tombstone version a committed delete leaves.
const ABSENT_VERSION: i32 = -2;

pub struct Occ {
    catalog: Arc<Catalog>,
    storage: Arc<Storage>,
    next_tx_id: AtomicU64,
    txns: Mutex<HashMap<TxId, TxnState>>,
    commit_lock: Mutex<()>,
}

impl Occ {
    pub fn new(catalog: Arc<Catalog>, storage: Arc<Storage>) -> Self {
        Occ {
            catalog,
            storage,
            next_tx_id: AtomicU64::new(1),
            txns: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    fn resolve(&self, table: &str, key: &[u8]) -> CResult<Vec<u8>> {
        let table_id = self.catalog.get_table_id(table)?;
        Ok(key::encode(table_id, key))
    }

    fn with_txn<R>(&self, tx: TxId, f: impl FnOnce(&mut TxnState) -> CResult<R>) -> CResult<R> {
        let mut txns = self.txns.lock().unwrap();
        let state = txns.get_mut(&tx).ok_or(Error::TransactionNotFound(tx))?;
        f(state)
    }

    fn read_and_record(state: &mut TxnState, storage: &Storage, ekey: &[u8]) -> CResult<Vec<u8>> {
        if let Some(view) = state.local_view(ekey) {
            return match view {
                LocalView::Deleted => Err(Error::KeyIsDeleted),
                LocalView::Written(v) => Ok(v.to_vec()),
            };
        }
        match storage.get(ekey) {
            Some(entry) if entry.metadata == -1 => {
                state
                    .read_set
                    .insert(ekey.to_vec(), ReadSnapshot { data: Vec::new(), version: -1 });
                Err(Error::KeyIsDeleted)
            }
            Some(entry) => {
                state.read_set.insert(
                    ekey.to_vec(),
                    ReadSnapshot { data: entry.data.clone(), version: entry.metadata },
                );
                Ok(entry.data)
            }
            None => {
                state
                    .read_set
                    .insert(ekey.to_vec(), ReadSnapshot { data: Vec::new(), version: ABSENT_VERSION });
                Err(Error::KeyNotFound)
            }
        }
    }
}

impl TransactionManager for Occ {
    fn begin(&self) -> TxId {
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        self.txns.lock().unwrap().insert(tx_id, TxnState::new(tx_id));
        tx_id
    }

    fn begin_with_id(&self, tx_id: TxId) {
        self.txns.lock().unwrap().insert(tx_id, TxnState::new(tx_id));
        bump_counter(&self.next_tx_id, tx_id + 1);
    }

    fn next_tx_id(&self) -> TxId {
        self.next_tx_id.load(Ordering::SeqCst)
    }

    fn bump_next_tx_id(&self, min: TxId) {
        bump_counter(&self.next_tx_id, min);
    }

    fn get(&self, tx: TxId, table: &str, key: &[u8]) -> CResult<Vec<u8>> {
        let ekey = self.resolve(table, key)?;
        self.with_txn(tx, |state| Self::read_and_record(state, &self.storage, &ekey))
    }

    fn set(&self, tx: TxId, table: &str, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let ekey = self.resolve(table, key)?;
        self.with_txn(tx, |state| {
            state.record_write(ekey, value);
            Ok(())
        })
    }

    /// A delete must leave a pre-image in `read_set` so its version can be
    /// validated at commit (spec section 3 / 4.6). A key this transaction
    /// hasn't touched yet is loaded into `read_set` here, the same way
    /// `read_and_record` would for a plain read; a key this transaction
    /// already wrote (without reading) still needs the pre-image that
    /// existed before this transaction touched it.
    fn del(&self, tx: TxId, table: &str, key: &[u8]) -> CResult<()> {
        let ekey = self.resolve(table, key)?;
        self.with_txn(tx, |state| {
            match state.local_view(&ekey) {
                Some(LocalView::Deleted) => return Err(Error::KeyIsDeleted),
                Some(LocalView::Written(_)) => {
                    if !state.read_set.contains_key(&ekey) {
                        let snapshot = match self.storage.get(&ekey) {
                            Some(entry) => {
                                ReadSnapshot { data: entry.data.clone(), version: entry.metadata }
                            }
                            None => ReadSnapshot { data: Vec::new(), version: ABSENT_VERSION },
                        };
                        state.read_set.insert(ekey.clone(), snapshot);
                    }
                    state.record_delete(ekey);
                }
                None => match self.storage.get(&ekey) {
                    // Deleting a non-existent key is not an error (spec
                    // section 4.4); a tombstoned key is likewise already gone.
                    None => {}
                    Some(entry) if entry.metadata == -1 => {}
                    Some(entry) => {
                        state.read_set.insert(
                            ekey.clone(),
                            ReadSnapshot { data: entry.data.clone(), version: entry.metadata },
                        );
                        state.record_delete(ekey);
                    }
                },
            }
            Ok(())
        })
    }

    fn scan(
        &self,
        tx: TxId,
        table: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> CResult<ScanOutcome> {
        let table_id = self.catalog.get_table_id(table)?;
        let start_ekey =
            if start.is_empty() { key::table_lower_bound(table_id) } else { key::encode(table_id, start) };
        let end_ekey =
            if end.is_empty() { key::table_upper_bound(table_id) } else { key::encode(table_id, end) };

        self.with_txn(tx, |state| {
            let range = self.storage.range(start_ekey.clone(), end_ekey.clone(), 0);
            let mut merged: std::collections::BTreeMap<Vec<u8>, Vec<u8>> = std::collections::BTreeMap::new();
            for (k, e) in range.rows {
                if e.metadata != -1 {
                    merged.insert(k.clone(), e.data.clone());
                }
                state.read_set.insert(k, ReadSnapshot { data: e.data, version: e.metadata });
            }
            for (k, v) in &state.write_set {
                if k >= &start_ekey && k < &end_ekey {
                    merged.insert(k.clone(), v.clone());
                }
            }
            for k in &state.delete_set {
                merged.remove(k);
            }

            let mut rows = Vec::new();
            let mut limit_reached = false;
            for (k, v) in merged {
                if limit != 0 && rows.len() == limit {
                    limit_reached = true;
                    break;
                }
                let (_, user_key) = key::decode(&k);
                rows.push((user_key, v));
            }
            Ok(ScanOutcome { rows, limit_reached })
        })
    }

    fn process(
        &self,
        tx: TxId,
        table: &str,
        key: &[u8],
        f: &mut ProcessFn<'_>,
        param: &[u8],
    ) -> CResult<Option<Vec<u8>>> {
        let ekey = self.resolve(table, key)?;
        self.with_txn(tx, |state| {
            let current = match Self::read_and_record(state, &self.storage, &ekey) {
                Ok(v) => Some(v),
                Err(Error::KeyNotFound) | Err(Error::KeyIsDeleted) => None,
                Err(e) => return Err(e),
            };
            let outcome: ProcessOutcome = f(key, current.as_deref(), param);
            if !outcome.success {
                return Err(Error::ExtFuncError(outcome.error.unwrap_or_default()));
            }
            if outcome.delete {
                state.record_delete(ekey);
            } else if let Some(update) = outcome.update {
                state.record_write(ekey, update);
            }
            Ok(outcome.return_value)
        })
    }

    fn range_process(
        &self,
        tx: TxId,
        table: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
        f: &mut RangeProcessFn<'_>,
        param: &[u8],
    ) -> CResult<Vec<RangeProcessRow>> {
        let table_id = self.catalog.get_table_id(table)?;
        let start_ekey =
            if start.is_empty() { key::table_lower_bound(table_id) } else { key::encode(table_id, start) };
        let end_ekey =
            if end.is_empty() { key::table_upper_bound(table_id) } else { key::encode(table_id, end) };

        self.with_txn(tx, |state| {
            let range = self.storage.range(start_ekey.clone(), end_ekey.clone(), 0);
            let mut merged: std::collections::BTreeMap<Vec<u8>, Vec<u8>> = std::collections::BTreeMap::new();
            for (k, e) in range.rows {
                if e.metadata != -1 {
                    merged.insert(k.clone(), e.data.clone());
                }
                state.read_set.insert(k, ReadSnapshot { data: e.data, version: e.metadata });
            }
            for (k, v) in &state.write_set {
                if k >= &start_ekey && k < &end_ekey {
                    merged.insert(k.clone(), v.clone());
                }
            }
            for k in &state.delete_set {
                merged.remove(k);
            }

            let mut out = Vec::new();
            let mut is_first = true;
            for (idx, (k, v)) in merged.into_iter().enumerate() {
                if limit != 0 && idx == limit {
                    break;
                }
                let (_, user_key) = key::decode(&k);
                let call = RangeProcessCall {
                    key: Some(&user_key),
                    value: Some(&v),
                    range_first: is_first,
                    last: false,
                };
                is_first = false;
                let outcome = f(call, param);
                if !outcome.success {
                    return Err(Error::ExtFuncError(outcome.error.unwrap_or_default()));
                }
                if outcome.delete {
                    state.record_delete(k.clone());
                } else if let Some(update) = outcome.update {
                    state.record_write(k.clone(), update.clone());
                }
                out.push((user_key, outcome.return_value));
            }
            let last_call = RangeProcessCall { key: None, value: None, range_first: false, last: true };
            let final_outcome = f(last_call, param);
            if let Some(rv) = final_outcome.return_value {
                out.push((Vec::new(), Some(rv)));
            }
            Ok(out)
        })
    }

    fn commit(&self, tx: TxId) -> CResult<()> {
        let state = {
            let mut txns = self.txns.lock().unwrap();
            txns.remove(&tx).ok_or(Error::TransactionNotFound(tx))?
        };

        let _guard = self.commit_lock.lock().unwrap();
        // Validate every key this transaction observed, whether through a
        // plain read or as the pre-image behind a pending delete (spec
        // section 4.6: "for every key in read_set ∪ delete_set compare the
        // captured version against the current storage version").
        let mut validated: std::collections::HashSet<&Vec<u8>> = std::collections::HashSet::new();
        for k in state.read_set.keys().chain(state.delete_set.iter()) {
            if !validated.insert(k) {
                continue;
            }
            let snapshot_version = state.read_set.get(k).map(|s| s.version).unwrap_or(ABSENT_VERSION);
            let current_version = match self.storage.get(k) {
                Some(entry) => entry.metadata,
                None => ABSENT_VERSION,
            };
            if current_version != snapshot_version {
                return Err(Error::TransactionHasStaleData);
            }
        }

        for (k, v) in &state.write_set {
            let new_version = match self.storage.get(k) {
                Some(entry) => entry.metadata.saturating_add(1),
                None => 1,
            };
            self.storage.set(k.clone(), Entry::new(v.clone(), new_version));
        }
        for k in &state.delete_set {
            self.storage.set(k.clone(), Entry::new(Vec::new(), -1));
        }
        Ok(())
    }

    fn rollback(&self, tx: TxId) -> CResult<()> {
        let mut txns = self.txns.lock().unwrap();
        txns.remove(&tx).ok_or(Error::TransactionNotFound(tx))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<Catalog>, Arc<Storage>, Occ) {
        let catalog = Arc::new(Catalog::new());
        let storage = Arc::new(Storage::new());
        catalog.create_table("t", "hash").unwrap();
        let occ = Occ::new(catalog.clone(), storage.clone());
        (catalog, storage, occ)
    }

    #[test]
    fn non_conflicting_transactions_both_commit() {
        let (_, _, occ) = setup();
        let tx1 = occ.begin();
        occ.set(tx1, "t", b"a", b"1".to_vec()).unwrap();
        occ.commit(tx1).unwrap();

        let tx2 = occ.begin();
        occ.set(tx2, "t", b"b", b"2".to_vec()).unwrap();
        occ.commit(tx2).unwrap();

        let tx3 = occ.begin();
        assert_eq!(occ.get(tx3, "t", b"a").unwrap(), b"1".to_vec());
        assert_eq!(occ.get(tx3, "t", b"b").unwrap(), b"2".to_vec());
    }

    #[test]
    fn stale_read_aborts_commit() {
        let (_, _, occ) = setup();
        let tx0 = occ.begin();
        occ.set(tx0, "t", b"a", b"0".to_vec()).unwrap();
        occ.commit(tx0).unwrap();

        let tx1 = occ.begin();
        let tx2 = occ.begin();
        assert_eq!(occ.get(tx1, "t", b"a").unwrap(), b"0".to_vec());
        assert_eq!(occ.get(tx2, "t", b"a").unwrap(), b"0".to_vec());

        occ.set(tx1, "t", b"a", b"1".to_vec()).unwrap();
        occ.commit(tx1).unwrap();

        occ.set(tx2, "t", b"a", b"2".to_vec()).unwrap();
        assert!(matches!(occ.commit(tx2), Err(Error::TransactionHasStaleData)));
    }

    #[test]
    fn delete_then_read_elsewhere_sees_tombstone() {
        let (_, _, occ) = setup();
        let tx0 = occ.begin();
        occ.set(tx0, "t", b"a", b"0".to_vec()).unwrap();
        occ.commit(tx0).unwrap();

        let tx1 = occ.begin();
        occ.del(tx1, "t", b"a").unwrap();
        occ.commit(tx1).unwrap();

        let tx2 = occ.begin();
        assert!(matches!(occ.get(tx2, "t", b"a"), Err(Error::KeyIsDeleted)));
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let (_, _, occ) = setup();
        let tx = occ.begin();
        occ.set(tx, "t", b"a", b"1".to_vec()).unwrap();
        occ.rollback(tx).unwrap();

        let tx2 = occ.begin();
        assert!(matches!(occ.get(tx2, "t", b"a"), Err(Error::KeyNotFound)));
    }

    #[test]
    fn blind_delete_is_validated_against_concurrent_write() {
        let (_, _, occ) = setup();
        let tx0 = occ.begin();
        occ.set(tx0, "t", b"k", b"v0".to_vec()).unwrap();
        occ.commit(tx0).unwrap();

        // tx1 deletes "k" without ever reading it first.
        let tx1 = occ.begin();
        occ.del(tx1, "t", b"k").unwrap();

        // Concurrently, tx2 reads-and-writes "k", advancing its version.
        let tx2 = occ.begin();
        occ.set(tx2, "t", b"k", b"v1".to_vec()).unwrap();
        occ.commit(tx2).unwrap();

        // tx1's blind delete must now be rejected as stale, not silently
        // destroy tx2's committed write.
        assert!(matches!(occ.commit(tx1), Err(Error::TransactionHasStaleData)));

        let tx3 = occ.begin();
        assert_eq!(occ.get(tx3, "t", b"k").unwrap(), b"v1".to_vec());
    }

    #[test]
    fn deleting_a_nonexistent_key_is_not_an_error() {
        let (_, _, occ) = setup();
        let tx = occ.begin();
        occ.del(tx, "t", b"missing").unwrap();
        occ.commit(tx).unwrap();
    }
}
