//! Engine configuration (spec section 6). This crate never reads a config
//! *file* - that belongs to the embedding application - it just defines the
//! shape of the options and their defaults.

use std::path::PathBuf;

use crate::error::{CResult, Error};

/// Which of the two closed concurrency-control variants (spec section 9,
/// "Polymorphism") the transaction manager runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcurrencyMode {
    TwoPl,
    Occ,
}

/// Tunable engine behavior. Constructed by the caller; `Default` matches the
/// conservative defaults spec section 9 recommends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Where checkpoints and log files live.
    pub data_path: PathBuf,

    /// Which concurrency backend drives the transaction manager.
    pub concurrency_mode: ConcurrencyMode,

    /// If false, log writes are skipped entirely (pure in-memory mode).
    pub persist: bool,

    /// If true, every log append is forced to stable storage with `fsync`.
    pub fsync_each_write: bool,

    /// Trigger a checkpoint once the open log exceeds this many bytes.
    pub log_size_limit: u64,

    /// Number of old checkpoints/logs retained during rotation.
    pub keep_history: u32,

    /// Text (human-inspectable) vs binary WAL framing.
    pub text_log: bool,

    /// Diagnostic verbosity, 0 (quiet) to 3 (noisy). Gates this crate's own
    /// `log::debug!`/`log::trace!` call sites; never installs a logger.
    pub verbosity: u8,

    /// Internal assertion aggressiveness, 0 (none) to 3 (paranoid).
    pub sanity_check_level: u8,

    /// Open Question resolution (see DESIGN.md #1): when true, `tx_id = 0`
    /// one-shot writes/deletes are rejected with
    /// `ONE_SHOT_WRITE_NOT_ALLOWED`/`ONE_SHOT_DELETE_NOT_ALLOWED` instead of
    /// being silently performed as an internal begin+op+commit.
    pub strict_one_shot: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_path: PathBuf::from("."),
            concurrency_mode: ConcurrencyMode::TwoPl,
            persist: true,
            fsync_each_write: false,
            log_size_limit: 4 * 1024 * 1024,
            keep_history: 2,
            text_log: false,
            verbosity: 0,
            sanity_check_level: 1,
            strict_one_shot: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> CResult<()> {
        if self.persist && self.log_size_limit == 0 {
            return Err(Error::Internal(
                "log_size_limit must be > 0 when persist is enabled".into(),
            ));
        }
        if self.verbosity > 3 {
            return Err(Error::Internal("verbosity must be 0..=3".into()));
        }
        if self.sanity_check_level > 3 {
            return Err(Error::Internal("sanity_check_level must be 0..=3".into()));
        }
        Ok(())
    }
}
