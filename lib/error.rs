//! Error taxonomy for the metadata engine.
//!
//! Transient conditions (lock contention, sequence races) never surface
//! here — they are retried internally. Everything below is either a clean
//! failure of the requested operation or a loudly-reported invariant
//! violation.

use thiserror::Error;

/// Failures from the persistent item store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No item exists under the requested key.
    #[error("item not found")]
    NotFound,

    /// `create` collided with an existing item.
    #[error("item already exists")]
    Exists,

    /// No room for new or grown items.
    #[error("out of space for items")]
    NoSpace,

    /// The backing device failed.
    #[error("item store i/o error: {0}")]
    Io(String),
}

/// Failures from the cluster lock facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock service could not be reached.
    #[error("lock service unavailable: {0}")]
    Unavailable(String),

    /// The request was torn down before a grant arrived.
    #[error("lock request canceled")]
    Canceled,
}

/// Engine-level errors returned to callers of metadata operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The inode (or item) does not exist. During deletion this is
    /// success — someone else finished first.
    #[error("no such inode or item")]
    NotFound,

    /// A creation path collided with existing persistent state.
    #[error("already exists")]
    Exists,

    /// Persistent space or the inode-number space is exhausted.
    #[error("out of space")]
    NoSpace,

    /// A required cluster service (authority, lock service) is down.
    /// The operation failed cleanly and can be retried later.
    #[error("cluster service unavailable: {0}")]
    Unavailable(String),

    /// A caller-supplied expectation (data version, size) no longer
    /// matches current state. Callers retry with fresh state rather than
    /// treating this as a hard failure.
    #[error("stale {what}: expected {expected}, found {found}")]
    Stale {
        /// Which field went stale.
        what: &'static str,
        /// The caller's expectation.
        expected: u64,
        /// What the engine actually found.
        found: u64,
    },

    /// An on-disk or cross-structure invariant is broken. Always logged
    /// with context before being returned; never silently tolerated.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// An I/O failure from a delegated subsystem (content, xattrs).
    #[error("i/o error: {0}")]
    Io(String),

    /// A data wait was aborted through the error-injection path.
    #[error("operation aborted by administrative request")]
    Aborted,

    /// The engine is shutting down; background-facing calls bail out.
    #[error("engine shutting down")]
    ShuttingDown,
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::Exists => Self::Exists,
            StoreError::NoSpace => Self::NoSpace,
            StoreError::Io(msg) => Self::Io(msg),
        }
    }
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Unavailable(msg) => Self::Unavailable(msg),
            LockError::Canceled => Self::ShuttingDown,
        }
    }
}
