//! `kvt` is an embedded transactional key-value engine: an ordered map of
//! typed tables, a transaction manager with a pluggable concurrency backend
//! (strict two-phase locking or optimistic concurrency control), and a
//! durability subsystem built from an append-only write-ahead log plus
//! periodic checkpoints. [Author fengyang]
//!
//! It is meant to sit inside a larger system (a graph database, in the
//! original design this crate is drawn from) as one of several pluggable
//! storage backends - the graph/query/schema layers, host-language
//! bindings, and any CLI or wire protocol are all out of scope here; this
//! crate only implements the core engine they would sit on top of.
//!
//! ## Getting started
//!
//! ```rust
//! use tempfile::tempdir;
//! use kvt::{Config, Kvt};
//! use kvt::txn::AUTO_COMMIT;
//!
//! fn main() -> Result<(), kvt::Error> {
//!     let dir = tempdir().unwrap();
//!     let kvt = Kvt::open(Config { data_path: dir.path().to_path_buf(), ..Config::default() })?;
//!
//!     kvt.create_table("accounts", "hash")?;
//!
//!     let tx = kvt.begin();
//!     kvt.set(tx, "accounts", b"alice", b"100".to_vec())?;
//!     kvt.commit(tx)?;
//!
//!     assert_eq!(kvt.get(AUTO_COMMIT, "accounts", b"alice")?, b"100".to_vec());
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod storage;
pub mod txn;
pub mod wal;

pub use config::{ConcurrencyMode, Config};
pub use engine::Kvt;
pub use error::{CResult, Error};
