use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

/// Shard count chosen to keep collisions between producer threads rare
/// without burning memory on idle queues.
pub const DEFAULT_QUEUE_SHARDS: usize = 11;

/// A multi-producer queue sharded by producer thread.
///
/// Each producing thread lands on a fixed shard derived from its thread
/// identity, so concurrent producers on distinct shards never contend.
/// The single consumer sweeps every shard with [`ShardedQueue::drain_all`],
/// swapping each shard's contents out from under its producers.
pub struct ShardedQueue<T> {
    shards: Vec<Mutex<VecDeque<T>>>,
    len: AtomicUsize,
}

impl<T> ShardedQueue<T> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_QUEUE_SHARDS)
    }

    pub fn with_shards(n_shards: usize) -> Self {
        assert!(n_shards > 0, "queue must have at least one shard");
        Self {
            shards: (0..n_shards).map(|_| Mutex::new(VecDeque::new())).collect(),
            len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, value: T) {
        let shard = &self.shards[self.shard_index()];
        shard.lock().unwrap().push_back(value);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Move the contents of every shard into `out`, in shard order.
    pub fn drain_all(&self, out: &mut VecDeque<T>) {
        let mut drained = 0;
        for shard in &self.shards {
            let mut queue = std::mem::take(&mut *shard.lock().unwrap());
            drained += queue.len();
            out.append(&mut queue);
        }
        self.len.fetch_sub(drained, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_index(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        thread::current().id().hash(&mut hasher);
        hasher.finish() as usize % self.shards.len()
    }
}

impl<T> Default for ShardedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
