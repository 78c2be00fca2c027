//! C4: the transaction manager contract (spec section 4.4), plus the C7
//! process/range_process callback types (spec section 4.7) that both
//! concurrency backends share verbatim.

pub mod occ;
pub mod two_pl;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CResult, Error};

pub type TxId = u64;

/// Raises an atomic counter to at least `min`, retrying on concurrent
/// update. Shared by both backends' `begin_with_id` (advance past a
/// replayed tx_id) and `bump_next_tx_id` (restore the counter floor from a
/// checkpoint).
pub(crate) fn bump_counter(counter: &AtomicU64, min: u64) {
    let mut current = counter.load(Ordering::SeqCst);
    while current < min {
        match counter.compare_exchange(current, min, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// Reserved transaction id meaning "auto-commit / one-shot" (spec section 3).
pub const AUTO_COMMIT: TxId = 0;

/// Per-transaction bookkeeping shared by both backends: `read_set` captures a
/// snapshot at first-read time (data + whatever metadata the backend cares
/// about), `write_set` holds pending values, `delete_set` holds pending
/// deletions. A key is never in both `write_set` and `delete_set` at once.
#[derive(Default)]
pub struct TxnState {
    pub tx_id: TxId,
    pub read_set: HashMap<Vec<u8>, ReadSnapshot>,
    pub write_set: HashMap<Vec<u8>, Vec<u8>>,
    pub delete_set: HashSet<Vec<u8>>,
}

#[derive(Clone)]
pub struct ReadSnapshot {
    pub data: Vec<u8>,
    /// 2PL: unused. OCC: the version observed at read time.
    pub version: i32,
}

impl TxnState {
    pub fn new(tx_id: TxId) -> Self {
        TxnState { tx_id, ..Default::default() }
    }

    /// Applies the invariant from spec section 3: "a `set` after a `del`
    /// removes the key from `delete_set`; a `del` after a `set` removes it
    /// from `write_set`."
    pub fn record_write(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.delete_set.remove(&key);
        self.write_set.insert(key, value);
    }

    pub fn record_delete(&mut self, key: Vec<u8>) {
        self.write_set.remove(&key);
        self.delete_set.insert(key);
    }

    /// A transaction's own prior writes/deletes shadow committed state on
    /// subsequent reads (spec section 4.4).
    pub fn local_view(&self, key: &[u8]) -> Option<LocalView<'_>> {
        if self.delete_set.contains(key) {
            return Some(LocalView::Deleted);
        }
        if let Some(v) = self.write_set.get(key) {
            return Some(LocalView::Written(v));
        }
        None
    }
}

pub enum LocalView<'a> {
    Written(&'a [u8]),
    Deleted,
}

/// The result of a `scan`: rows found, plus whether the cap was hit with
/// more rows available (informational, not an error - spec section 4.4/7).
pub struct ScanOutcome {
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
    pub limit_reached: bool,
}

/// One `batch_execute` operation (spec section 4.4).
pub enum BatchOp {
    Get { table: String, key: Vec<u8> },
    Set { table: String, key: Vec<u8>, value: Vec<u8> },
    Del { table: String, key: Vec<u8> },
}

/// The per-op result of a `batch_execute` operation.
pub enum BatchOpValue {
    Get(Vec<u8>),
    Set,
    Del,
}

/// `batch_execute` never hard-fails the way `?` would: spec section 4.4
/// guarantees every op-level result is returned even when the batch as a
/// whole is reported as `BATCH_NOT_FULLY_SUCCESS`, so the outcome carries
/// both rather than collapsing to a single `Result`.
pub struct BatchOutcome {
    pub results: Vec<CResult<BatchOpValue>>,
}

impl BatchOutcome {
    pub fn is_fully_successful(&self) -> bool {
        self.results.iter().all(|r| r.is_ok())
    }

    /// `Some(combined message)` when at least one op failed, matching
    /// `BATCH_NOT_FULLY_SUCCESS`'s "combined error string".
    pub fn as_error(&self) -> Option<Error> {
        if self.is_fully_successful() {
            return None;
        }
        let messages: Vec<String> = self
            .results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| format!("op[{i}]: {e}")))
            .collect();
        Some(Error::BatchNotFullySuccess(messages.join("; ")))
    }
}

/// The callback output record for `process`/`range_process` (spec section
/// 4.7): up to three fields - a value to `set`, a `delete` flag, and a value
/// to surface back to the caller.
#[derive(Default, Clone)]
pub struct ProcessOutcome {
    pub success: bool,
    pub update: Option<Vec<u8>>,
    pub delete: bool,
    pub return_value: Option<Vec<u8>>,
    /// Populated by the callback on failure; surfaced as `EXT_FUNC_ERROR`.
    pub error: Option<String>,
}

impl ProcessOutcome {
    pub fn ok(return_value: Option<Vec<u8>>) -> Self {
        ProcessOutcome { success: true, return_value, ..Default::default() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        ProcessOutcome { success: false, error: Some(message.into()), ..Default::default() }
    }
}

/// One invocation of a `range_process` callback: either a real row, or the
/// final sentinel call (`last = true`, no key/value) used for aggregator
/// finalisation (spec section 4.7).
pub struct RangeProcessCall<'a> {
    pub key: Option<&'a [u8]>,
    pub value: Option<&'a [u8]>,
    pub range_first: bool,
    pub last: bool,
}

pub type ProcessFn<'a> =
    dyn FnMut(&[u8], Option<&[u8]>, &[u8]) -> ProcessOutcome + 'a;
pub type RangeProcessFn<'a> = dyn FnMut(RangeProcessCall<'_>, &[u8]) -> ProcessOutcome + 'a;

/// A `(key, return_value)` row produced by `range_process`.
pub type RangeProcessRow = (Vec<u8>, Option<Vec<u8>>);

/// The contract every concurrency backend implements (spec section 4.4).
/// `table` is a table *name*; each op resolves it through the catalog, so
/// `TABLE_NOT_FOUND` is uniform across backends.
pub trait TransactionManager {
    fn begin(&self) -> TxId;

    /// Registers a transaction under a caller-chosen id, advancing the
    /// backend's own id counter past it if necessary. Used exclusively by
    /// WAL replay, which must preserve the exact `tx_id` a `START_TRANSACTION`
    /// record carries (spec section 4.9, "replayed verbatim").
    fn begin_with_id(&self, tx_id: TxId);

    /// The next id `begin()` would hand out. Exposed so a checkpoint can
    /// record it (spec section 6 on-disk layout, `next_tx_id`).
    fn next_tx_id(&self) -> TxId;

    /// Advances the backend's id counter so the next `begin()` returns at
    /// least `min`, without registering a transaction. Used when restoring
    /// `next_tx_id` from a checkpoint at startup (spec section 4.9 step 1),
    /// where there is no transaction to preserve, only a counter floor.
    fn bump_next_tx_id(&self, min: TxId);

    fn get(&self, tx: TxId, table: &str, key: &[u8]) -> CResult<Vec<u8>>;

    fn set(&self, tx: TxId, table: &str, key: &[u8], value: Vec<u8>) -> CResult<()>;

    fn del(&self, tx: TxId, table: &str, key: &[u8]) -> CResult<()>;

    fn scan(
        &self,
        tx: TxId,
        table: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> CResult<ScanOutcome>;

    fn process(
        &self,
        tx: TxId,
        table: &str,
        key: &[u8],
        f: &mut ProcessFn<'_>,
        param: &[u8],
    ) -> CResult<Option<Vec<u8>>>;

    fn range_process(
        &self,
        tx: TxId,
        table: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
        f: &mut RangeProcessFn<'_>,
        param: &[u8],
    ) -> CResult<Vec<RangeProcessRow>>;

    fn batch_execute(&self, tx: TxId, ops: Vec<BatchOp>) -> BatchOutcome {
        let results = ops
            .into_iter()
            .map(|op| -> CResult<BatchOpValue> {
                match op {
                    BatchOp::Get { table, key } => {
                        self.get(tx, &table, &key).map(BatchOpValue::Get)
                    }
                    BatchOp::Set { table, key, value } => {
                        self.set(tx, &table, &key, value).map(|_| BatchOpValue::Set)
                    }
                    BatchOp::Del { table, key } => {
                        self.del(tx, &table, &key).map(|_| BatchOpValue::Del)
                    }
                }
            })
            .collect();
        BatchOutcome { results }
    }

    fn commit(&self, tx: TxId) -> CResult<()>;

    fn rollback(&self, tx: TxId) -> CResult<()>;
}
