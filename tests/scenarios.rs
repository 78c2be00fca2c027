//! End-to-end scenarios from spec section 8, driven through the public
//! `kvt::{Config, Kvt}` surface rather than any single module's internals.

use pretty_assertions::assert_eq;
use serial_test::serial;
use tempfile::tempdir;

use kvt::config::ConcurrencyMode;
use kvt::error::Error;
use kvt::txn::AUTO_COMMIT;
use kvt::{checkpoint, Config, Kvt};

fn cfg(dir: &std::path::Path, mode: ConcurrencyMode) -> Config {
    Config {
        data_path: dir.to_path_buf(),
        concurrency_mode: mode,
        ..Config::default()
    }
}

#[test]
fn s1_single_writer_round_trip() {
    let dir = tempdir().unwrap();
    let kvt = Kvt::open(cfg(dir.path(), ConcurrencyMode::TwoPl)).unwrap();

    let table_id = kvt.create_table("t", "hash").unwrap();
    assert_eq!(table_id, 1);

    let tx1 = kvt.begin();
    kvt.set(tx1, "t", b"k", b"v".to_vec()).unwrap();
    kvt.commit(tx1).unwrap();

    let tx2 = kvt.begin();
    assert_eq!(kvt.get(tx2, "t", b"k").unwrap(), b"v".to_vec());
}

#[test]
fn s2_two_pl_conflict_then_retry() {
    let dir = tempdir().unwrap();
    let kvt = Kvt::open(cfg(dir.path(), ConcurrencyMode::TwoPl)).unwrap();
    kvt.create_table("t", "hash").unwrap();

    let tx1 = kvt.begin();
    kvt.set(tx1, "t", b"k", b"a".to_vec()).unwrap();

    let tx2 = kvt.begin();
    assert!(matches!(
        kvt.set(tx2, "t", b"k", b"b".to_vec()),
        Err(Error::KeyIsLocked(owner)) if owner == tx1
    ));

    kvt.commit(tx1).unwrap();

    kvt.set(tx2, "t", b"k", b"b".to_vec()).unwrap();
    kvt.commit(tx2).unwrap();

    assert_eq!(kvt.get(AUTO_COMMIT, "t", b"k").unwrap(), b"b".to_vec());
}

#[test]
fn s3_occ_stale_read_aborts_commit() {
    let dir = tempdir().unwrap();
    let kvt = Kvt::open(cfg(dir.path(), ConcurrencyMode::Occ)).unwrap();
    kvt.create_table("t", "hash").unwrap();
    kvt.set(AUTO_COMMIT, "t", b"k", b"v0".to_vec()).unwrap();

    let tx1 = kvt.begin();
    assert_eq!(kvt.get(tx1, "t", b"k").unwrap(), b"v0".to_vec());

    let tx2 = kvt.begin();
    kvt.set(tx2, "t", b"k", b"v1".to_vec()).unwrap();
    kvt.commit(tx2).unwrap();

    assert!(matches!(kvt.commit(tx1), Err(Error::TransactionHasStaleData)));
    assert_eq!(kvt.get(AUTO_COMMIT, "t", b"k").unwrap(), b"v1".to_vec());
}

#[test]
fn s4_range_scan_with_sentinel() {
    let dir = tempdir().unwrap();
    let kvt = Kvt::open(cfg(dir.path(), ConcurrencyMode::TwoPl)).unwrap();
    kvt.create_table("t", "hash").unwrap();

    for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
        kvt.set(AUTO_COMMIT, "t", k, v.to_vec()).unwrap();
    }

    let tx = kvt.begin();

    let all = kvt.scan(tx, "t", b"", b"", 10).unwrap();
    assert_eq!(
        all.rows.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );

    let from_b = kvt.scan(tx, "t", b"b", b"", 10).unwrap();
    assert_eq!(
        from_b.rows.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
        vec![b"b".to_vec(), b"c".to_vec()]
    );

    let up_to_b = kvt.scan(tx, "t", b"", b"b", 10).unwrap();
    assert_eq!(
        up_to_b.rows.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
        vec![b"a".to_vec()]
    );

    kvt.commit(tx).unwrap();
}

#[test]
#[serial]
fn s5_crash_recovery_replays_committed_write() {
    let dir = tempdir().unwrap();
    {
        let kvt = Kvt::open(cfg(dir.path(), ConcurrencyMode::TwoPl)).unwrap();
        kvt.create_table("t", "hash").unwrap();
        let tx = kvt.begin();
        kvt.set(tx, "t", b"k", b"v".to_vec()).unwrap();
        kvt.commit(tx).unwrap();
        // No checkpoint_now(): only the WAL survives, as if the process died here.
    }

    let kvt = Kvt::open(cfg(dir.path(), ConcurrencyMode::TwoPl)).unwrap();
    let tx = kvt.begin();
    assert_eq!(kvt.get(tx, "t", b"k").unwrap(), b"v".to_vec());
}

#[test]
#[serial]
fn s6_checkpoint_rotation_survives_restart() {
    let dir = tempdir().unwrap();
    let config = Config {
        log_size_limit: 64,
        keep_history: 1,
        ..cfg(dir.path(), ConcurrencyMode::TwoPl)
    };

    {
        let kvt = Kvt::open(config.clone()).unwrap();
        kvt.create_table("t", "hash").unwrap();
        for i in 0..200u32 {
            kvt.set(AUTO_COMMIT, "t", format!("k{i}").as_bytes(), b"v".to_vec())
                .unwrap();
        }
    }

    let rotated = (1..=300).any(|n| checkpoint::checkpoint_path(dir.path(), n).exists());
    assert!(rotated, "expected at least one checkpoint rotation to have occurred");

    let kvt = Kvt::open(config).unwrap();
    assert_eq!(kvt.get(AUTO_COMMIT, "t", b"k0").unwrap(), b"v".to_vec());
    assert_eq!(kvt.get(AUTO_COMMIT, "t", b"k199").unwrap(), b"v".to_vec());
}
