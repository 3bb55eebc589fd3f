use thiserror::Error;

/// Errors surfaced to the protocol front-end.
///
/// Transient backing-store failures never appear here; the flusher absorbs
/// them by requeueing keys and retrying commits.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("key not found")]
    KeyNotFound,
    /// A CAS mutation lost its race or presented a stale stamp.
    #[error("key exists")]
    KeyExists,
    /// The entry is locked and the caller is not the holder.
    #[error("resource locked")]
    Locked,
    /// `add` on a present key, `replace`/`append`/`prepend` on an absent one.
    #[error("not stored")]
    NotStored,
    #[error("out of memory")]
    OutOfMemory,
    #[error("operation not supported")]
    Unsupported,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
