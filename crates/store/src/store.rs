use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use everstore_common::{CasCounter, Clock, ShardedQueue};
use tracing::{debug, warn};

use crate::hash_table::HashTable;
use crate::item::Item;
use crate::kvstore::KVStore;
use crate::stats::{EPStats, KeyStats};
use crate::stored_value::{MutationType, StoredValue};

/// Default ceiling on items per backing-store transaction.
pub const DEFAULT_TXN_SIZE: u64 = 2500;

const COMMIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Sanity bound: no key should ever have been dirty for a month.
const MAX_SANE_DIRTY_AGE: u64 = 86_400 * 30;

/// Result of a `get_locked` attempt.
#[derive(Debug)]
pub enum GetLockedOutcome {
    /// The lock was taken; the returned item carries the freshly advanced
    /// CAS that identifies the holder.
    Acquired(Item),
    /// Someone else holds the lock.
    AlreadyLocked,
    NotFound,
}

/// The eventually-persistent store: authoritative in-memory state plus the
/// write-behind queueing that feeds the flusher.
///
/// Producers mutate the hash table and enqueue dirty keys into `towrite`
/// without contending with each other; each flush cycle steals the whole of
/// `towrite` into the single-consumer `writing` queue and drains it in
/// transactional batches.
pub struct EventuallyPersistentStore {
    table: HashTable,
    stats: Arc<EPStats>,
    clock: Arc<dyn Clock>,
    cas: Arc<CasCounter>,
    towrite: ShardedQueue<String>,
    writing: Mutex<VecDeque<String>>,
    underlying: Mutex<Box<dyn KVStore>>,
    txn_size: AtomicU64,
    do_persistence: bool,
}

impl EventuallyPersistentStore {
    pub fn new(
        underlying: Box<dyn KVStore>,
        clock: Arc<dyn Clock>,
        cas: Arc<CasCounter>,
        stats: Arc<EPStats>,
        do_persistence: bool,
    ) -> Self {
        Self {
            table: HashTable::new(cas.clone()),
            stats,
            clock,
            cas,
            towrite: ShardedQueue::new(),
            writing: Mutex::new(VecDeque::new()),
            underlying: Mutex::new(underlying),
            txn_size: AtomicU64::new(DEFAULT_TXN_SIZE),
            do_persistence,
        }
    }

    pub fn stats(&self) -> &Arc<EPStats> {
        &self.stats
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn txn_size(&self) -> u64 {
        self.txn_size.load(Ordering::SeqCst)
    }

    pub fn set_txn_size(&self, to: u64) {
        self.txn_size.store(to.max(1), Ordering::SeqCst);
    }

    pub fn set_min_data_age(&self, to: u64) {
        self.stats.min_data_age.store(to, Ordering::SeqCst);
    }

    pub fn set_queue_age_cap(&self, to: u64) {
        self.stats.queue_age_cap.store(to, Ordering::SeqCst);
    }

    /// Store `item`, enqueueing its key for persistence when the mutation
    /// took effect. The item's CAS is advanced in place on success.
    pub fn set(&self, item: &mut Item) -> MutationType {
        let mutation = self.table.set(item, self.clock.now());
        match mutation {
            MutationType::NotFound => {
                self.queue_dirty(item.key());
                self.stats.curr_items.fetch_add(1, Ordering::SeqCst);
            }
            MutationType::WasClean => self.queue_dirty(item.key()),
            // A still-dirty entry is already queued; the dirty bit is the
            // queue's dedup.
            MutationType::WasDirty
            | MutationType::InvalidCas
            | MutationType::IsLocked => {}
        }
        mutation
    }

    /// Insert only if absent. Warmup loads pass `dirty = false` so restored
    /// entries do not immediately flow back out to the store they came from.
    pub fn add(&self, item: &mut Item, dirty: bool) -> bool {
        let added = self.table.add(item, dirty, self.clock.now());
        if added {
            if dirty {
                self.queue_dirty(item.key());
            }
            self.stats.curr_items.fetch_add(1, Ordering::SeqCst);
        }
        added
    }

    /// Read a copy of the item. A read against an entry locked by someone
    /// else reports `u64::MAX` as the CAS so the caller cannot use it for a
    /// CAS mutation.
    pub fn get(&self, key: &str) -> Option<Item> {
        let now = self.clock.now();
        self.table.with_value(key, |value| {
            value.map(|v| {
                let mut item = v.item().clone();
                if v.is_locked(now) {
                    item.set_cas(u64::MAX);
                }
                item
            })
        })
    }

    /// Read the item and take its lock until `now + lock_timeout`. The
    /// entry's CAS advances so only the holder can mutate it while locked.
    pub fn get_locked(&self, key: &str, now: u64, lock_timeout: u64) -> GetLockedOutcome {
        self.table.with_value(key, |value| match value {
            None => GetLockedOutcome::NotFound,
            Some(v) if v.is_locked(now) => GetLockedOutcome::AlreadyLocked,
            Some(v) => {
                v.lock(now + lock_timeout);
                v.set_cas(self.cas.next());
                GetLockedOutcome::Acquired(v.item().clone())
            }
        })
    }

    /// Remove the key, enqueueing a tombstone for persistence if it existed.
    pub fn del(&self, key: &str) -> bool {
        let existed = self.table.del(key);
        if existed {
            self.queue_dirty(key);
            self.stats.curr_items.fetch_sub(1, Ordering::SeqCst);
        }
        existed
    }

    pub fn key_stats(&self, key: &str) -> Option<KeyStats> {
        self.table.with_value(key, |value| {
            value.map(|v| KeyStats {
                dirty: v.is_dirty(),
                exptime: v.item().exptime(),
                flags: v.item().flags(),
                cas: v.item().cas(),
                dirtied: v.dirtied(),
                data_age: v.data_age(),
            })
        })
    }

    pub fn visit<F: FnMut(&StoredValue)>(&self, f: F) {
        self.table.visit(f);
    }

    /// Keys whose in-memory state has not reached the backing store.
    pub fn dirty_keys(&self) -> Vec<String> {
        let mut dirty = Vec::new();
        self.table.visit(|value| {
            if value.is_dirty() {
                dirty.push(value.item().key().to_string());
            }
        });
        dirty
    }

    /// Blow away all in-memory state and pending writes.
    pub fn reset(&self) {
        debug!("resetting in-memory state");
        self.table.clear();
        let mut discarded = VecDeque::new();
        self.towrite.drain_all(&mut discarded);
        self.writing.lock().unwrap().clear();
        self.stats.curr_items.store(0, Ordering::SeqCst);
        self.stats.queue_size.store(0, Ordering::SeqCst);
        self.stats.flusher_todo.store(0, Ordering::SeqCst);
    }

    /// Load the whole backing store into the hash table. Loaded entries are
    /// clean. Returns how many rows arrived.
    pub fn warmup(&self) -> Result<u64, crate::kvstore::StorageError> {
        let now = self.clock.now();
        let mut loaded = 0u64;
        {
            let mut kv = self.underlying.lock().unwrap();
            kv.dump(&mut |item| {
                let mut item = item;
                if self.table.add(&mut item, false, now) {
                    loaded += 1;
                }
            })?;
        }
        self.stats.warmed_up.store(loaded, Ordering::SeqCst);
        self.stats.curr_items.fetch_add(loaded, Ordering::SeqCst);
        debug!(loaded, "warmup loaded backing store");
        Ok(loaded)
    }

    /// Steal the producer queue into the flush queue. Returns whether there
    /// is anything to flush.
    pub fn begin_flush(&self) -> bool {
        let mut writing = self.writing.lock().unwrap();
        if self.towrite.is_empty() && writing.is_empty() {
            self.stats.dirty_age.store(0, Ordering::SeqCst);
            return false;
        }
        self.towrite.drain_all(&mut writing);
        self.stats.flusher_todo.store(writing.len() as u64, Ordering::SeqCst);
        self.stats.queue_size.store(self.towrite.len() as u64, Ordering::SeqCst);
        debug!(
            flushing = writing.len(),
            still_queued = self.towrite.len(),
            "starting flush cycle"
        );
        true
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.writing.lock().unwrap().is_empty()
    }

    /// Flush up to `txn_size` keys inside one backing-store transaction,
    /// retrying the commit until it lands. Returns the smallest non-zero
    /// deferral suggested by the batch (or `min_data_age` if none was).
    pub fn flush_some(&self, reject: &mut VecDeque<String>) -> u64 {
        if let Err(error) = self.underlying.lock().unwrap().begin() {
            warn!(%error, "failed to open a backing-store transaction");
        }
        let mut oldest = self.stats.min_data_age.load(Ordering::SeqCst);
        for _ in 0..self.txn_size() {
            if !self.has_pending_writes() {
                break;
            }
            let deferral = self.flush_one(reject);
            if deferral != 0 && deferral < oldest {
                oldest = deferral;
            }
        }

        let commit_start = self.clock.now();
        loop {
            match self.underlying.lock().unwrap().commit() {
                Ok(()) => break,
                Err(error) => {
                    self.stats.commit_failed.fetch_add(1, Ordering::SeqCst);
                    warn!(%error, "commit failed; retrying");
                    thread::sleep(COMMIT_RETRY_DELAY);
                }
            }
        }
        self.stats
            .commit_time
            .store(self.clock.now().saturating_sub(commit_start), Ordering::SeqCst);
        oldest
    }

    /// Flush the next queued key. Returns 0 when the key was handled (or the
    /// queue was empty), or the number of seconds the key was deferred by
    /// for being too young.
    pub fn flush_one(&self, reject: &mut VecDeque<String>) -> u64 {
        let Some(key) = self.writing.lock().unwrap().pop_front() else {
            return 0;
        };

        enum Action {
            Store { item: Item, dirtied: u64, data_age: u64 },
            Tombstone,
            Skip,
            Defer(u64),
        }

        let now = self.clock.now();
        let min_data_age = self.stats.min_data_age.load(Ordering::SeqCst);
        let queue_age_cap = self.stats.queue_age_cap.load(Ordering::SeqCst);

        let action = self.table.with_value(&key, |value| match value {
            None => Action::Tombstone,
            Some(v) if v.is_dirty() => {
                let (dirtied, last_mutated) = v.mark_clean();
                debug_assert!(dirtied > 0);
                let data_age = now.saturating_sub(last_mutated);
                let dirty_age = now.saturating_sub(dirtied);

                if dirty_age > queue_age_cap {
                    self.stats.too_old.fetch_add(1, Ordering::SeqCst);
                } else if data_age < min_data_age {
                    self.stats.too_young.fetch_add(1, Ordering::SeqCst);
                    v.re_dirty(dirtied, last_mutated);
                    return Action::Defer(min_data_age - data_age);
                }

                debug_assert!(dirty_age < MAX_SANE_DIRTY_AGE);
                debug_assert!(data_age <= dirty_age);
                self.stats.dirty_age.store(dirty_age, Ordering::SeqCst);
                self.stats.data_age.store(data_age, Ordering::SeqCst);
                self.stats
                    .dirty_age_highwat
                    .fetch_max(dirty_age, Ordering::SeqCst);
                self.stats
                    .data_age_highwat
                    .fetch_max(data_age, Ordering::SeqCst);
                // Counted at intent; a failed write requeues the key below.
                self.stats.total_persisted.fetch_add(1, Ordering::SeqCst);
                Action::Store {
                    item: v.item().clone(),
                    dirtied,
                    data_age: last_mutated,
                }
            }
            // Clean: an earlier cycle already handled this key.
            Some(_) => Action::Skip,
        });

        let _ = self
            .stats
            .flusher_todo
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));

        match action {
            Action::Defer(secs) => {
                reject.push_back(key);
                secs
            }
            Action::Skip => 0,
            Action::Tombstone => {
                if let Err(error) = self.underlying.lock().unwrap().del(&key) {
                    warn!(key = %key, %error, "tombstone write failed; requeueing");
                    self.stats.flush_failed.fetch_add(1, Ordering::SeqCst);
                    reject.push_back(key);
                }
                0
            }
            Action::Store {
                item,
                dirtied,
                data_age,
            } => {
                if let Err(error) = self.underlying.lock().unwrap().set(&item) {
                    warn!(key = %key, %error, "item write failed; requeueing");
                    self.stats.flush_failed.fetch_add(1, Ordering::SeqCst);
                    self.table.with_value(&key, |value| {
                        if let Some(v) = value {
                            v.re_dirty(dirtied, data_age);
                        }
                    });
                    reject.push_back(key);
                }
                0
            }
        }
    }

    /// Push the cycle's rejects back onto the flush queue and record the
    /// flush duration.
    pub fn complete_flush(&self, reject: &mut VecDeque<String>, flush_start: u64) {
        let mut writing = self.writing.lock().unwrap();
        writing.append(reject);
        self.stats.queue_size.store(
            (self.towrite.len() + writing.len()) as u64,
            Ordering::SeqCst,
        );
        drop(writing);

        let duration = self.clock.now().saturating_sub(flush_start);
        self.stats.flush_duration.store(duration, Ordering::SeqCst);
        self.stats
            .flush_duration_highwat
            .fetch_max(duration, Ordering::SeqCst);
    }

    fn queue_dirty(&self, key: &str) {
        if self.do_persistence {
            self.towrite.push(key.to_string());
            self.stats.total_enqueued.fetch_add(1, Ordering::SeqCst);
            self.stats
                .queue_size
                .store(self.towrite.len() as u64, Ordering::SeqCst);
        }
    }
}
