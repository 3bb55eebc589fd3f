use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Default write-coalescing window: values younger than this are deferred.
pub const DEFAULT_MIN_DATA_AGE: u64 = 120;
/// Default ceiling on how long a key may sit queued before it is flushed
/// regardless of its data age.
pub const DEFAULT_QUEUE_AGE_CAP: u64 = 900;

/// Engine-wide counters and gauges. All fields are atomics so request
/// threads, the flusher, and stats readers never contend on a lock.
#[derive(Debug, Default)]
pub struct EPStats {
    /// Live items in the hash table.
    pub curr_items: AtomicU64,
    /// Keys ever pushed onto the write queue.
    pub total_enqueued: AtomicU64,
    /// Items handed to the backing store (counted at intent; a failed write
    /// requeues the key and counts again when retried).
    pub total_persisted: AtomicU64,
    /// Per-item write failures reported by the backing store.
    pub flush_failed: AtomicU64,
    /// Failed commit attempts.
    pub commit_failed: AtomicU64,
    /// Keys deferred because their data age was below `min_data_age`.
    pub too_young: AtomicU64,
    /// Keys force-flushed because they out-sat `queue_age_cap`.
    pub too_old: AtomicU64,
    /// Keys waiting in the producer-side queue.
    pub queue_size: AtomicU64,
    /// Keys remaining in the current flush cycle.
    pub flusher_todo: AtomicU64,
    pub dirty_age: AtomicU64,
    pub dirty_age_highwat: AtomicU64,
    pub data_age: AtomicU64,
    pub data_age_highwat: AtomicU64,
    pub flush_duration: AtomicU64,
    pub flush_duration_highwat: AtomicU64,
    /// Seconds the most recent commit took, including retries.
    pub commit_time: AtomicU64,
    /// Minimum data age before a value is admitted to persistence.
    pub min_data_age: AtomicU64,
    /// Maximum time a key may sit queued before being force-flushed.
    pub queue_age_cap: AtomicU64,
    /// Items loaded during warmup.
    pub warmed_up: AtomicU64,
    pub warmup_time: AtomicU64,
    pub warmup_complete: AtomicBool,
}

impl EPStats {
    pub fn new(min_data_age: u64, queue_age_cap: u64) -> Self {
        let stats = Self::default();
        stats.min_data_age.store(min_data_age, Ordering::SeqCst);
        stats.queue_age_cap.store(queue_age_cap, Ordering::SeqCst);
        stats
    }

    /// Clear the gauges and rejection counters; configuration values and
    /// lifetime totals are left alone.
    pub fn reset(&self) {
        self.too_young.store(0, Ordering::SeqCst);
        self.too_old.store(0, Ordering::SeqCst);
        self.dirty_age.store(0, Ordering::SeqCst);
        self.dirty_age_highwat.store(0, Ordering::SeqCst);
        self.flush_duration.store(0, Ordering::SeqCst);
        self.flush_duration_highwat.store(0, Ordering::SeqCst);
        self.commit_time.store(0, Ordering::SeqCst);
    }
}

/// Per-entry diagnostics surfaced by `key_stats`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyStats {
    pub dirty: bool,
    pub exptime: u64,
    pub flags: u32,
    pub cas: u64,
    pub dirtied: u64,
    pub data_age: u64,
}
