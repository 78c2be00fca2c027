//! The top-level engine (`Kvt`): wires C2 (catalog), C3 (storage), C4/C5/C6
//! (the chosen concurrency backend), C8 (WAL) and C9 (checkpoint/recovery)
//! together behind the operation surface of spec section 4.4.
//!
//! Every mutating logical op logged through C8 is appended *after* the
//! corresponding concurrency-backend call succeeds, so a WAL append failure
//! never lets an op appear to have happened when it didn't, and so replay
//! never re-applies an op this process itself never actually performed.

use std::cell::RefCell;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::catalog::Catalog;
use crate::checkpoint;
use crate::config::{ConcurrencyMode, Config};
use crate::error::{CResult, Error};
use crate::key;
use crate::storage::Storage;
use crate::txn::occ::Occ;
use crate::txn::two_pl::TwoPl;
use crate::txn::{
    BatchOp, BatchOutcome, ProcessFn, ProcessOutcome, RangeProcessCall, RangeProcessFn,
    RangeProcessRow, ScanOutcome, TransactionManager, TxId, AUTO_COMMIT,
};
use crate::wal::frame::LogOp;
use crate::wal::{self, WalWriter};

fn make_txm(
    mode: ConcurrencyMode,
    catalog: Arc<Catalog>,
    storage: Arc<Storage>,
) -> Box<dyn TransactionManager + Send + Sync> {
    match mode {
        ConcurrencyMode::TwoPl => Box::new(TwoPl::new(catalog, storage)),
        ConcurrencyMode::Occ => Box::new(Occ::new(catalog, storage)),
    }
}

/// The engine. Cheap to share across threads behind an `Arc<Kvt>`: every
/// field is already internally synchronized (spec section 5 - the catalog
/// and storage map are each guarded by their own mutex; the WAL writer by
/// its own; the concurrency backend manages its own transaction table).
pub struct Kvt {
    config: Config,
    catalog: Arc<Catalog>,
    storage: Arc<Storage>,
    txm: Box<dyn TransactionManager + Send + Sync>,
    wal: Mutex<Option<WalWriter>>,
    next_checkpoint_id: AtomicU64,
}

impl Kvt {
    /// Runs the recovery sequence of spec section 4.9 and opens the engine
    /// for use. With `config.persist == false` this skips the data
    /// directory entirely and starts from an empty, pure in-memory state.
    pub fn open(config: Config) -> CResult<Self> {
        config.validate()?;

        if !config.persist {
            let catalog = Arc::new(Catalog::new());
            let storage = Arc::new(Storage::new());
            let txm = make_txm(config.concurrency_mode, catalog.clone(), storage.clone());
            return Ok(Kvt {
                config,
                catalog,
                storage,
                txm,
                wal: Mutex::new(None),
                next_checkpoint_id: AtomicU64::new(1),
            });
        }

        let plan = checkpoint::plan_recovery(&config.data_path)?;

        let (catalog, storage, seed_next_tx_id) = match plan.checkpoint_id {
            Some(n) => {
                let path = checkpoint::checkpoint_path(&config.data_path, n);
                let loaded = checkpoint::read_checkpoint(&path)?;
                let storage = Storage::new();
                for (table_id, user_key, entry) in loaded.rows {
                    storage.insert_raw(key::encode(table_id, &user_key), entry);
                }
                let catalog = Catalog::from_snapshot(loaded.next_table_id, loaded.tables);
                (catalog, storage, loaded.next_tx_id)
            }
            None => (Catalog::new(), Storage::new(), 1),
        };
        let catalog = Arc::new(catalog);
        let storage = Arc::new(storage);
        let txm = make_txm(config.concurrency_mode, catalog.clone(), storage.clone());
        txm.bump_next_tx_id(seed_next_tx_id);

        let log_path = checkpoint::log_path(&config.data_path, plan.log_id);
        let next_log_id = if log_path.exists() {
            let (records, next_log_id) = wal::read_all(&log_path, config.text_log)?;
            replay(&catalog, &storage, txm.as_ref(), records)?;
            next_log_id
        } else {
            1
        };
        let writer = WalWriter::open_for_append(log_path, config.text_log, next_log_id)?;

        Ok(Kvt {
            config,
            catalog,
            storage,
            txm,
            wal: Mutex::new(Some(writer)),
            next_checkpoint_id: AtomicU64::new(plan.next_checkpoint_id),
        })
    }

    pub fn data_path(&self) -> &Path {
        &self.config.data_path
    }

    // ----- C2: table catalog ------------------------------------------

    pub fn create_table(&self, name: &str, partition: &str) -> CResult<u64> {
        let id = self.catalog.create_table(name, partition)?;
        if let Err(e) = self.log(LogOp::CreateTable {
            name: name.to_string(),
            partition: partition.to_string(),
            expected_id: id,
        }) {
            log::error!("failed to log CREATE_TABLE({name}): {e}");
        }
        Ok(id)
    }

    pub fn drop_table(&self, id: u64) -> CResult<()> {
        self.catalog.drop_table(id)?;
        self.storage.drop_table_rows(id);
        if let Err(e) = self.log(LogOp::DropTable { table_id: id }) {
            log::error!("failed to log DROP_TABLE({id}): {e}");
        }
        Ok(())
    }

    pub fn get_table_name(&self, id: u64) -> CResult<String> {
        self.catalog.get_table_name(id)
    }

    pub fn get_table_id(&self, name: &str) -> CResult<u64> {
        self.catalog.get_table_id(name)
    }

    pub fn list_tables(&self) -> Vec<(String, u64)> {
        self.catalog.list_tables()
    }

    // ----- C4: transaction lifecycle -----------------------------------

    /// Begins a new transaction. Never fails (spec section 4.4): a WAL
    /// append failure here is logged, not propagated.
    pub fn begin(&self) -> TxId {
        let tx = self.txm.begin();
        if let Err(e) = self.log(LogOp::StartTransaction { tx_id: tx }) {
            log::error!("failed to log START_TRANSACTION({tx}): {e}");
        }
        tx
    }

    pub fn commit(&self, tx: TxId) -> CResult<()> {
        self.txm.commit(tx)?;
        if let Err(e) = self.log(LogOp::CommitTransaction { tx_id: tx }) {
            log::error!("failed to log COMMIT_TRANSACTION({tx}): {e}");
        }
        // The transaction itself already committed and was logged above; an
        // opportunistic checkpoint failure (e.g. disk full) must not turn
        // into a false report that the commit failed.
        if let Err(e) = self.maybe_checkpoint() {
            log::error!("checkpoint after commit({tx}) failed: {e}");
        }
        Ok(())
    }

    pub fn rollback(&self, tx: TxId) -> CResult<()> {
        self.txm.rollback(tx)?;
        if let Err(e) = self.log(LogOp::RollbackTransaction { tx_id: tx }) {
            log::error!("failed to log ROLLBACK_TRANSACTION({tx}): {e}");
        }
        if let Err(e) = self.maybe_checkpoint() {
            log::error!("checkpoint after rollback({tx}) failed: {e}");
        }
        Ok(())
    }

    /// Runs `body` inside a fresh transaction, committing on success and
    /// rolling back on failure - the "auto-commit" behavior `tx_id = 0`
    /// triggers for every data op (spec section 3).
    fn one_shot<R>(&self, body: impl FnOnce(TxId) -> CResult<R>) -> CResult<R> {
        let tx = self.begin();
        match body(tx) {
            Ok(value) => {
                self.commit(tx)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.rollback(tx);
                Err(e)
            }
        }
    }

    // ----- C4 data ops ---------------------------------------------------

    pub fn get(&self, tx: TxId, table: &str, key: &[u8]) -> CResult<Vec<u8>> {
        if tx == AUTO_COMMIT {
            return self.one_shot(|t| self.txm.get(t, table, key));
        }
        self.txm.get(tx, table, key)
    }

    pub fn set(&self, tx: TxId, table: &str, key: &[u8], value: Vec<u8>) -> CResult<()> {
        if tx == AUTO_COMMIT {
            if self.config.strict_one_shot {
                return Err(Error::OneShotWriteNotAllowed);
            }
            return self.one_shot(|t| self.set_inner(t, table, key, value));
        }
        self.set_inner(tx, table, key, value)
    }

    fn set_inner(&self, tx: TxId, table: &str, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.txm.set(tx, table, key, value.clone())?;
        let table_id = self.catalog.get_table_id(table)?;
        if let Err(e) = self.log(LogOp::Set { tx_id: tx, table_id, key: key.to_vec(), value }) {
            log::error!("failed to log SET(tx={tx}, table={table_id}): {e}");
        }
        Ok(())
    }

    pub fn del(&self, tx: TxId, table: &str, key: &[u8]) -> CResult<()> {
        if tx == AUTO_COMMIT {
            if self.config.strict_one_shot {
                return Err(Error::OneShotDeleteNotAllowed);
            }
            return self.one_shot(|t| self.del_inner(t, table, key));
        }
        self.del_inner(tx, table, key)
    }

    fn del_inner(&self, tx: TxId, table: &str, key: &[u8]) -> CResult<()> {
        self.txm.del(tx, table, key)?;
        let table_id = self.catalog.get_table_id(table)?;
        if let Err(e) = self.log(LogOp::Del { tx_id: tx, table_id, key: key.to_vec() }) {
            log::error!("failed to log DEL(tx={tx}, table={table_id}): {e}");
        }
        Ok(())
    }

    pub fn scan(
        &self,
        tx: TxId,
        table: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> CResult<ScanOutcome> {
        if tx == AUTO_COMMIT {
            return self.one_shot(|t| self.txm.scan(t, table, start, end, limit));
        }
        self.txm.scan(tx, table, start, end, limit)
    }

    /// Read-modify-write (spec section 4.7). `f`'s decision (update/delete)
    /// is logged through the same SET/DEL records a plain `set`/`del` call
    /// would produce, since the effect on storage is identical.
    pub fn process(
        &self,
        tx: TxId,
        table: &str,
        key: &[u8],
        f: &mut ProcessFn<'_>,
        param: &[u8],
    ) -> CResult<Option<Vec<u8>>> {
        let auto = tx == AUTO_COMMIT;
        let active = if auto { self.begin() } else { tx };

        let decision: RefCell<Option<ProcessOutcome>> = RefCell::new(None);
        let mut wrapped = |k: &[u8], cur: Option<&[u8]>, p: &[u8]| {
            let outcome = f(k, cur, p);
            *decision.borrow_mut() = Some(outcome.clone());
            outcome
        };

        let result = self.txm.process(active, table, key, &mut wrapped, param);
        match result {
            Ok(rv) => {
                if let Some(outcome) = decision.into_inner() {
                    self.log_process_effect(active, table, key, &outcome);
                }
                if auto {
                    self.commit(active)?;
                }
                Ok(rv)
            }
            Err(e) => {
                if auto {
                    let _ = self.rollback(active);
                }
                Err(e)
            }
        }
    }

    fn log_process_effect(&self, tx: TxId, table: &str, key: &[u8], outcome: &ProcessOutcome) {
        let table_id = match self.catalog.get_table_id(table) {
            Ok(id) => id,
            Err(_) => return,
        };
        let op = if outcome.delete {
            Some(LogOp::Del { tx_id: tx, table_id, key: key.to_vec() })
        } else {
            outcome
                .update
                .clone()
                .map(|value| LogOp::Set { tx_id: tx, table_id, key: key.to_vec(), value })
        };
        if let Some(op) = op {
            if let Err(e) = self.log(op) {
                log::error!("failed to log process effect (tx={tx}, table={table_id}): {e}");
            }
        }
    }

    /// Scan-driven read-modify-write loop (spec section 4.7).
    pub fn range_process(
        &self,
        tx: TxId,
        table: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
        f: &mut RangeProcessFn<'_>,
        param: &[u8],
    ) -> CResult<Vec<RangeProcessRow>> {
        let auto = tx == AUTO_COMMIT;
        let active = if auto { self.begin() } else { tx };

        let effects: RefCell<Vec<(Vec<u8>, ProcessOutcome)>> = RefCell::new(Vec::new());
        let mut wrapped = |call: RangeProcessCall<'_>, p: &[u8]| {
            let key = call.key.map(|k| k.to_vec());
            let outcome = f(call, p);
            if let Some(key) = key {
                effects.borrow_mut().push((key, outcome.clone()));
            }
            outcome
        };

        let result = self.txm.range_process(active, table, start, end, limit, &mut wrapped, param);
        match result {
            Ok(rows) => {
                for (key, outcome) in effects.into_inner() {
                    self.log_process_effect(active, table, &key, &outcome);
                }
                if auto {
                    self.commit(active)?;
                }
                Ok(rows)
            }
            Err(e) => {
                if auto {
                    let _ = self.rollback(active);
                }
                Err(e)
            }
        }
    }

    pub fn batch_execute(&self, tx: TxId, ops: Vec<BatchOp>) -> BatchOutcome {
        let auto = tx == AUTO_COMMIT;
        let active = if auto { self.begin() } else { tx };

        let results = ops
            .into_iter()
            .map(|op| -> CResult<crate::txn::BatchOpValue> {
                match op {
                    BatchOp::Get { table, key } => {
                        self.txm.get(active, &table, &key).map(crate::txn::BatchOpValue::Get)
                    }
                    BatchOp::Set { table, key, value } => {
                        if auto && self.config.strict_one_shot {
                            return Err(Error::OneShotWriteNotAllowed);
                        }
                        self.set_inner(active, &table, &key, value)
                            .map(|_| crate::txn::BatchOpValue::Set)
                    }
                    BatchOp::Del { table, key } => {
                        if auto && self.config.strict_one_shot {
                            return Err(Error::OneShotDeleteNotAllowed);
                        }
                        self.del_inner(active, &table, &key).map(|_| crate::txn::BatchOpValue::Del)
                    }
                }
            })
            .collect();
        let outcome = BatchOutcome { results };

        if auto {
            if outcome.is_fully_successful() {
                let _ = self.commit(active);
            } else {
                let _ = self.rollback(active);
            }
        }
        outcome
    }

    // ----- C9: checkpoint -----------------------------------------------

    /// Forces an out-of-cycle checkpoint in addition to the automatic one
    /// fired after a commit/rollback that pushes the open log past
    /// `log_size_limit` (SPEC_FULL section 9.5).
    pub fn checkpoint_now(&self) -> CResult<()> {
        if !self.config.persist {
            return Ok(());
        }
        let n = self.next_checkpoint_id.fetch_add(1, Ordering::SeqCst);
        let (next_table_id, tables) = self.catalog.snapshot();
        let next_tx_id = self.txm.next_tx_id();
        checkpoint::write_checkpoint(
            &checkpoint::checkpoint_path(&self.config.data_path, n),
            next_table_id,
            next_tx_id,
            &tables,
            &self.storage,
        )?;
        {
            let mut guard = self.wal.lock().unwrap();
            *guard = Some(WalWriter::create_new(
                checkpoint::log_path(&self.config.data_path, n),
                self.config.text_log,
            )?);
        }
        checkpoint::prune_history(&self.config.data_path, n, self.config.keep_history);
        Ok(())
    }

    fn maybe_checkpoint(&self) -> CResult<()> {
        if !self.config.persist {
            return Ok(());
        }
        let exceeded = {
            let guard = self.wal.lock().unwrap();
            guard.as_ref().map(|w| w.bytes_written() >= self.config.log_size_limit).unwrap_or(false)
        };
        if exceeded {
            self.checkpoint_now()?;
        }
        Ok(())
    }

    fn log(&self, op: LogOp) -> CResult<()> {
        if !self.config.persist {
            return Ok(());
        }
        let mut guard = self.wal.lock().unwrap();
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Internal("WAL writer missing while persist is enabled".into()))?;
        writer.append(&op, self.config.fsync_each_write)?;
        Ok(())
    }
}

/// Replays a log's records through the same transaction-manager path online
/// operations use (spec section 4.9, "Replay rules"): `SET`/`DEL` are
/// applied via the concurrency backend so its bookkeeping stays consistent;
/// `CREATE_TABLE`/`DROP_TABLE`/`START_TRANSACTION`/`COMMIT`/`ROLLBACK` are
/// replayed verbatim, preserving the ids the log recorded; read-shaped ops
/// are no-ops.
fn replay(
    catalog: &Catalog,
    storage: &Storage,
    txm: &dyn TransactionManager,
    records: Vec<wal::Record>,
) -> CResult<()> {
    for record in records {
        match record.op {
            LogOp::CreateTable { name, partition, expected_id } => {
                catalog.create_table_with_id(&name, &partition, expected_id)?;
            }
            LogOp::DropTable { table_id } => {
                catalog.drop_table(table_id)?;
                storage.drop_table_rows(table_id);
            }
            LogOp::StartTransaction { tx_id } => {
                txm.begin_with_id(tx_id);
            }
            LogOp::CommitTransaction { tx_id } => {
                txm.commit(tx_id)?;
            }
            LogOp::RollbackTransaction { tx_id } => {
                txm.rollback(tx_id)?;
            }
            LogOp::Set { tx_id, table_id, key, value } => {
                let name = catalog.get_table_name(table_id)?;
                txm.set(tx_id, &name, &key, value)?;
            }
            LogOp::Del { tx_id, table_id, key } => {
                let name = catalog.get_table_name(table_id)?;
                txm.del(tx_id, &name, &key)?;
            }
            LogOp::Get | LogOp::Scan | LogOp::Process | LogOp::RangeProcess | LogOp::BatchExecute => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg(dir: &Path) -> Config {
        Config { data_path: dir.to_path_buf(), ..Config::default() }
    }

    #[test]
    fn auto_commit_one_shot_write_then_read() {
        let dir = tempdir().unwrap();
        let kvt = Kvt::open(cfg(dir.path())).unwrap();
        kvt.create_table("t", "hash").unwrap();
        kvt.set(AUTO_COMMIT, "t", b"k", b"v".to_vec()).unwrap();
        assert_eq!(kvt.get(AUTO_COMMIT, "t", b"k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn strict_one_shot_rejects_auto_commit_writes() {
        let dir = tempdir().unwrap();
        let config = Config { strict_one_shot: true, ..cfg(dir.path()) };
        let kvt = Kvt::open(config).unwrap();
        kvt.create_table("t", "hash").unwrap();
        assert!(matches!(
            kvt.set(AUTO_COMMIT, "t", b"k", b"v".to_vec()),
            Err(Error::OneShotWriteNotAllowed)
        ));
        assert!(matches!(
            kvt.del(AUTO_COMMIT, "t", b"k"),
            Err(Error::OneShotDeleteNotAllowed)
        ));
    }

    #[test]
    fn batch_execute_reports_partial_failure_with_all_results() {
        let dir = tempdir().unwrap();
        let kvt = Kvt::open(cfg(dir.path())).unwrap();
        kvt.create_table("t", "hash").unwrap();

        let tx = kvt.begin();
        let outcome = kvt.batch_execute(
            tx,
            vec![
                BatchOp::Set { table: "t".into(), key: b"a".to_vec(), value: b"1".to_vec() },
                BatchOp::Get { table: "t".into(), key: b"missing".to_vec() },
            ],
        );
        kvt.commit(tx).unwrap();

        assert!(!outcome.is_fully_successful());
        assert!(matches!(outcome.as_error(), Some(Error::BatchNotFullySuccess(_))));
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results[0].is_ok());
        assert!(matches!(outcome.results[1], Err(Error::KeyNotFound)));
    }

    #[test]
    fn process_applies_update_through_transaction() {
        let dir = tempdir().unwrap();
        let kvt = Kvt::open(cfg(dir.path())).unwrap();
        kvt.create_table("t", "hash").unwrap();
        kvt.set(AUTO_COMMIT, "t", b"counter", b"1".to_vec()).unwrap();

        let mut bump = |_key: &[u8], current: Option<&[u8]>, _param: &[u8]| {
            let n: u64 = current
                .map(|v| std::str::from_utf8(v).unwrap().parse().unwrap())
                .unwrap_or(0);
            let next = (n + 1).to_string().into_bytes();
            ProcessOutcome {
                success: true,
                update: Some(next.clone()),
                return_value: Some(next),
                ..Default::default()
            }
        };
        let rv = kvt.process(AUTO_COMMIT, "t", b"counter", &mut bump, b"").unwrap();
        assert_eq!(rv, Some(b"2".to_vec()));
        assert_eq!(kvt.get(AUTO_COMMIT, "t", b"counter").unwrap(), b"2".to_vec());

        // The effect survives a restart, proving it was logged.
        drop(kvt);
        let kvt = Kvt::open(cfg(dir.path())).unwrap();
        assert_eq!(kvt.get(AUTO_COMMIT, "t", b"counter").unwrap(), b"2".to_vec());
    }
}
