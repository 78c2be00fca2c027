//! The closed error taxonomy for the engine (spec section 7).
//!
//! Every public operation returns `CResult<T> = Result<T, Error>`. Unlike a
//! `thiserror`-style crate, this is hand-rolled: the teacher crate never
//! pulled in an error-derive macro, so `Error` keeps that convention -
//! a plain enum with manual `Display`/`std::error::Error` impls.

use std::fmt;

/// A stable, closed taxonomy of error codes. `Success` is never constructed
/// as an `Error` - callers observe it as `Ok(_)` - but the variant name is
/// kept here in spirit via the absence of a "general failure" catch-all for
/// any condition spec section 7 gives a name to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    KvtNotInitialized,
    TableAlreadyExists(String),
    TableNotFound(String),
    InvalidPartitionMethod(String),
    TransactionNotFound(u64),
    TransactionAlreadyRunning(u64),
    KeyNotFound,
    KeyIsDeleted,
    KeyIsLocked(u64),
    TransactionHasStaleData,
    OneShotWriteNotAllowed,
    OneShotDeleteNotAllowed,
    /// Carries every per-op result so the caller can still inspect which ops
    /// of a `batch_execute` succeeded.
    BatchNotFullySuccess(String),
    ExtFuncError(String),
    /// Corruption or inconsistency detected while replaying the log/checkpoint.
    Internal(String),
    Io(String),
}

pub type CResult<T> = Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KvtNotInitialized => write!(f, "KVT_NOT_INITIALIZED"),
            Error::TableAlreadyExists(name) => write!(f, "TABLE_ALREADY_EXISTS: {name}"),
            Error::TableNotFound(name) => write!(f, "TABLE_NOT_FOUND: {name}"),
            Error::InvalidPartitionMethod(m) => write!(f, "INVALID_PARTITION_METHOD: {m}"),
            Error::TransactionNotFound(tx) => write!(f, "TRANSACTION_NOT_FOUND: {tx}"),
            Error::TransactionAlreadyRunning(tx) => write!(f, "TRANSACTION_ALREADY_RUNNING: {tx}"),
            Error::KeyNotFound => write!(f, "KEY_NOT_FOUND"),
            Error::KeyIsDeleted => write!(f, "KEY_IS_DELETED"),
            Error::KeyIsLocked(owner) => write!(f, "KEY_IS_LOCKED: held by tx {owner}"),
            Error::TransactionHasStaleData => write!(f, "TRANSACTION_HAS_STALE_DATA"),
            Error::OneShotWriteNotAllowed => write!(f, "ONE_SHOT_WRITE_NOT_ALLOWED"),
            Error::OneShotDeleteNotAllowed => write!(f, "ONE_SHOT_DELETE_NOT_ALLOWED"),
            Error::BatchNotFullySuccess(msg) => write!(f, "BATCH_NOT_FULLY_SUCCESS: {msg}"),
            Error::ExtFuncError(msg) => write!(f, "EXT_FUNC_ERROR: {msg}"),
            Error::Internal(msg) => write!(f, "UNKNOWN_ERROR: {msg}"),
            Error::Io(msg) => write!(f, "UNKNOWN_ERROR (io): {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
