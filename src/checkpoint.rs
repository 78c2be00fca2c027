//! C9: checkpoint snapshotting and the recovery sequence (spec section 4.9
//! / 6).
//!
//! A checkpoint is a full binary snapshot of the catalog and every table's
//! entries, named `kvt_checkpoint_<N>` under the data directory. Checkpoint
//! `N` represents the state produced by replaying log `N-1`; taking it opens
//! `kvt_log_<N>` for subsequent writes (spec section 9, "checkpoint/log
//! numbering"). OCC tombstones (`metadata = -1`) are dropped when writing a
//! checkpoint (DESIGN.md Open Question #3: no live OCC transaction survives
//! a checkpoint-then-restart, so there's nothing left to validate against).

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::catalog::TableMeta;
use crate::error::{CResult, Error};
use crate::key;
use crate::storage::{Entry, Storage};

pub fn checkpoint_path(data_path: &Path, n: u64) -> PathBuf {
    data_path.join(format!("kvt_checkpoint_{n}"))
}

pub fn log_path(data_path: &Path, n: u64) -> PathBuf {
    data_path.join(format!("kvt_log_{n}"))
}

fn write_u64(w: &mut impl Write, v: u64) -> CResult<()> {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, v);
    w.write_all(&buf)?;
    Ok(())
}

fn write_i32(w: &mut impl Write, v: i32) -> CResult<()> {
    let mut buf = [0u8; 4];
    LittleEndian::write_i32(&mut buf, v);
    w.write_all(&buf)?;
    Ok(())
}

fn write_bytes(w: &mut impl Write, bytes: &[u8]) -> CResult<()> {
    write_u64(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

fn read_u64(r: &mut impl Read) -> CResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(LittleEndian::read_u64(&buf))
}

fn read_i32(r: &mut impl Read) -> CResult<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(LittleEndian::read_i32(&buf))
}

fn read_bytes(r: &mut impl Read) -> CResult<Vec<u8>> {
    let len = read_u64(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes a full snapshot to `path`: the table list plus every table's live
/// (non-tombstoned) entries.
pub fn write_checkpoint(
    path: &Path,
    next_table_id: u64,
    next_tx_id: u64,
    tables: &[TableMeta],
    storage: &Storage,
) -> CResult<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    write_u64(&mut w, tables.len() as u64)?;
    write_u64(&mut w, next_table_id)?;
    write_u64(&mut w, next_tx_id)?;

    for table in tables {
        write_bytes(&mut w, table.name.as_bytes())?;
        write_u64(&mut w, table.id)?;
        write_bytes(&mut w, table.partition.as_str().as_bytes())?;

        let live: Vec<(Vec<u8>, Entry)> = storage
            .table_entries(table.id)
            .into_iter()
            .filter(|(_, entry)| entry.metadata != -1)
            .collect();
        write_u64(&mut w, live.len() as u64)?;
        for (encoded_key, entry) in &live {
            let (_, user_key) = key::decode(encoded_key);
            write_bytes(&mut w, &user_key)?;
            write_bytes(&mut w, &entry.data)?;
            write_i32(&mut w, entry.metadata)?;
        }
    }

    w.flush()?;
    w.get_ref().sync_all()?;
    Ok(())
}

pub struct LoadedCheckpoint {
    pub next_table_id: u64,
    pub next_tx_id: u64,
    pub tables: Vec<TableMeta>,
    /// `(table_id, user_key, entry)`, ready to be re-encoded and inserted
    /// into `Storage`.
    pub rows: Vec<(u64, Vec<u8>, Entry)>,
}

pub fn read_checkpoint(path: &Path) -> CResult<LoadedCheckpoint> {
    use crate::catalog::Partition;

    let file = File::open(path)?;
    let mut r = BufReader::new(file);

    let num_tables = read_u64(&mut r)?;
    let next_table_id = read_u64(&mut r)?;
    let next_tx_id = read_u64(&mut r)?;

    let mut tables = Vec::with_capacity(num_tables as usize);
    let mut rows = Vec::new();

    for _ in 0..num_tables {
        let name = String::from_utf8(read_bytes(&mut r)?)
            .map_err(|e| Error::Internal(format!("checkpoint table name is not utf-8: {e}")))?;
        let id = read_u64(&mut r)?;
        let partition_str = String::from_utf8(read_bytes(&mut r)?)
            .map_err(|e| Error::Internal(format!("checkpoint partition tag is not utf-8: {e}")))?;
        let partition = Partition::parse(&partition_str)?;
        tables.push(TableMeta { id, name, partition });

        let num_entries = read_u64(&mut r)?;
        for _ in 0..num_entries {
            let user_key = read_bytes(&mut r)?;
            let data = read_bytes(&mut r)?;
            let metadata = read_i32(&mut r)?;
            rows.push((id, user_key, Entry::new(data, metadata)));
        }
    }

    Ok(LoadedCheckpoint { next_table_id, next_tx_id, tables, rows })
}

/// What recovery found on disk and what it needs to do next (spec section
/// 4.9 steps 1-5).
pub struct RecoveryPlan {
    /// `Some(n)` if `kvt_checkpoint_<n>` was found and should be loaded.
    pub checkpoint_id: Option<u64>,
    /// The id the next checkpoint taken should use.
    pub next_checkpoint_id: u64,
    /// The log file to replay (and keep appending to) after loading the
    /// checkpoint, if any.
    pub log_id: u64,
}

/// Scans the data directory and determines the recovery plan without
/// touching any file contents (spec section 4.9 steps 1, 3, 4).
pub fn plan_recovery(data_path: &Path) -> CResult<RecoveryPlan> {
    let mut max_checkpoint: Option<u64> = None;
    let mut max_log: Option<u64> = None;

    if data_path.exists() {
        for entry in fs::read_dir(data_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix("kvt_checkpoint_") {
                if let Ok(n) = suffix.parse::<u64>() {
                    max_checkpoint = Some(max_checkpoint.map_or(n, |m| m.max(n)));
                }
            } else if let Some(suffix) = name.strip_prefix("kvt_log_") {
                if let Ok(n) = suffix.parse::<u64>() {
                    max_log = Some(max_log.map_or(n, |m| m.max(n)));
                }
            }
        }
    }

    match max_checkpoint {
        Some(n) => {
            if let Some(log_n) = max_log {
                if log_n > n + 1 {
                    return Err(Error::Internal(format!(
                        "log id {log_n} is inconsistent with checkpoint id {n} (expected at most {})",
                        n + 1
                    )));
                }
            }
            Ok(RecoveryPlan { checkpoint_id: Some(n), next_checkpoint_id: n + 1, log_id: n })
        }
        None => {
            // No checkpoint: only kvt_log_0 is a legitimate find (spec
            // section 4.9 step 3). Anything else is inconsistent.
            if let Some(log_n) = max_log {
                if log_n > 0 {
                    return Err(Error::Internal(format!(
                        "log id {log_n} found with no checkpoint present; expected kvt_log_0 at most"
                    )));
                }
            }
            Ok(RecoveryPlan { checkpoint_id: None, next_checkpoint_id: 1, log_id: 0 })
        }
    }
}

/// Removes checkpoints and logs older than `keep_history` generations behind
/// `current_checkpoint_id` (spec section 4.9, "retains... back to N -
/// keep_history").
pub fn prune_history(data_path: &Path, current_checkpoint_id: u64, keep_history: u32) {
    let oldest_kept = current_checkpoint_id.saturating_sub(keep_history as u64);
    if oldest_kept == 0 {
        return;
    }
    for n in 0..oldest_kept {
        let _ = fs::remove_file(checkpoint_path(data_path, n));
        let _ = fs::remove_file(log_path(data_path, n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Partition;
    use tempfile::tempdir;

    #[test]
    fn checkpoint_round_trips_tables_and_entries() {
        let dir = tempdir().unwrap();
        let path = checkpoint_path(dir.path(), 1);

        let storage = Storage::new();
        storage.set(key::encode(1, b"a"), Entry::new(b"1".to_vec(), 0));
        storage.set(key::encode(1, b"b"), Entry::new(b"2".to_vec(), 5));
        storage.set(key::encode(1, b"tombstoned"), Entry::new(Vec::new(), -1));

        let tables = vec![TableMeta { id: 1, name: "t".into(), partition: Partition::Hash }];
        write_checkpoint(&path, 2, 7, &tables, &storage).unwrap();

        let loaded = read_checkpoint(&path).unwrap();
        assert_eq!(loaded.next_table_id, 2);
        assert_eq!(loaded.next_tx_id, 7);
        assert_eq!(loaded.tables.len(), 1);
        assert_eq!(loaded.tables[0].name, "t");
        // The tombstoned row was dropped.
        assert_eq!(loaded.rows.len(), 2);
    }

    #[test]
    fn plan_recovery_finds_largest_checkpoint_and_matching_log() {
        let dir = tempdir().unwrap();
        File::create(checkpoint_path(dir.path(), 1)).unwrap();
        File::create(checkpoint_path(dir.path(), 2)).unwrap();
        File::create(log_path(dir.path(), 2)).unwrap();

        let plan = plan_recovery(dir.path()).unwrap();
        assert_eq!(plan.checkpoint_id, Some(2));
        assert_eq!(plan.log_id, 2);
        assert_eq!(plan.next_checkpoint_id, 3);
    }

    #[test]
    fn plan_recovery_with_no_checkpoint_uses_log_zero() {
        let dir = tempdir().unwrap();
        File::create(log_path(dir.path(), 0)).unwrap();

        let plan = plan_recovery(dir.path()).unwrap();
        assert_eq!(plan.checkpoint_id, None);
        assert_eq!(plan.log_id, 0);
        assert_eq!(plan.next_checkpoint_id, 1);
    }

    #[test]
    fn plan_recovery_rejects_inconsistent_log_id() {
        let dir = tempdir().unwrap();
        File::create(checkpoint_path(dir.path(), 1)).unwrap();
        File::create(log_path(dir.path(), 5)).unwrap();

        assert!(plan_recovery(dir.path()).is_err());
    }
}
