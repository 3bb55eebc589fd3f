use thiserror::Error;

use crate::item::Item;

/// Failure reported by a backing store operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store is momentarily unable to make progress; retrying is
    /// expected to succeed.
    #[error("backing store busy")]
    Busy,
    #[error("backing store failure: {0}")]
    Failure(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The persistence seam between the engine and its durable layer.
///
/// The engine assumes `commit` makes the preceding `set`/`del` batch atomic,
/// but not that the batch is ordered against concurrent in-memory mutations;
/// the flusher requeues keys and reinstates dirty state when an operation
/// fails, so implementations are free to fail transiently.
pub trait KVStore: Send {
    /// Start a transaction covering the following `set`/`del` calls.
    fn begin(&mut self) -> StorageResult<()>;

    /// Write one item.
    fn set(&mut self, item: &Item) -> StorageResult<()>;

    /// Remove the key, if present.
    fn del(&mut self, key: &str) -> StorageResult<()>;

    /// Make the batch durable. The flusher retries until this succeeds.
    fn commit(&mut self) -> StorageResult<()>;

    /// Yield every stored item; used once at warmup.
    fn dump(&mut self, load: &mut dyn FnMut(Item)) -> StorageResult<()>;
}
