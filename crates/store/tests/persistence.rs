//! End-to-end behavior of the persistence core, driven through a mock
//! backing store with failure injection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use everstore_common::{CasCounter, Clock, ManualClock};
use everstore_dispatcher::Dispatcher;
use everstore_store::{
    EPStats, EventuallyPersistentStore, Flusher, FlusherState, GetLockedOutcome, Item, KVStore,
    MutationType, StorageError, StorageResult,
};

enum PendingOp {
    Set(Item),
    Del(String),
}

#[derive(Default)]
struct MockState {
    rows: HashMap<String, Item>,
    pending: Vec<PendingOp>,
    commit_failures_remaining: u32,
    set_failures: HashMap<String, u32>,
    begins: u32,
    commits: u32,
    sets: u32,
    deletes: Vec<String>,
}

/// In-memory `KVStore` with injectable per-key set failures and commit
/// failures. Pending operations only reach `rows` on a successful commit.
#[derive(Clone, Default)]
struct MockKVStore {
    state: Arc<Mutex<MockState>>,
}

impl MockKVStore {
    fn rows_contain(&self, key: &str, data: &[u8]) -> bool {
        self.state
            .lock()
            .unwrap()
            .rows
            .get(key)
            .is_some_and(|item| item.data() == data)
    }

    fn row_count(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }
}

impl KVStore for MockKVStore {
    fn begin(&mut self) -> StorageResult<()> {
        self.state.lock().unwrap().begins += 1;
        Ok(())
    }

    fn set(&mut self, item: &Item) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.set_failures.get_mut(item.key()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Failure("injected write failure".into()));
            }
        }
        state.sets += 1;
        state.pending.push(PendingOp::Set(item.clone()));
        Ok(())
    }

    fn del(&mut self, key: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.deletes.push(key.to_string());
        state.pending.push(PendingOp::Del(key.to_string()));
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.commit_failures_remaining > 0 {
            state.commit_failures_remaining -= 1;
            return Err(StorageError::Busy);
        }
        state.commits += 1;
        let pending = std::mem::take(&mut state.pending);
        for op in pending {
            match op {
                PendingOp::Set(item) => {
                    state.rows.insert(item.key().to_string(), item);
                }
                PendingOp::Del(key) => {
                    state.rows.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn dump(&mut self, load: &mut dyn FnMut(Item)) -> StorageResult<()> {
        for item in self.state.lock().unwrap().rows.values() {
            load(item.clone());
        }
        Ok(())
    }
}

struct Fixture {
    store: Arc<EventuallyPersistentStore>,
    clock: Arc<ManualClock>,
    mock: MockKVStore,
}

fn fixture(min_data_age: u64, queue_age_cap: u64) -> Fixture {
    fixture_with_persistence(min_data_age, queue_age_cap, true)
}

fn fixture_with_persistence(
    min_data_age: u64,
    queue_age_cap: u64,
    do_persistence: bool,
) -> Fixture {
    let clock = Arc::new(ManualClock::new(1_000));
    let mock = MockKVStore::default();
    let store = Arc::new(EventuallyPersistentStore::new(
        Box::new(mock.clone()),
        clock.clone(),
        Arc::new(CasCounter::new(1)),
        Arc::new(EPStats::new(min_data_age, queue_age_cap)),
        do_persistence,
    ));
    Fixture { store, clock, mock }
}

/// Mirror of the flusher's drain loop, for direct-drive tests.
fn flush_cycle(store: &EventuallyPersistentStore) -> u64 {
    if !store.begin_flush() {
        return 0;
    }
    let start = store.now();
    let mut reject = VecDeque::new();
    let mut oldest = store.stats().min_data_age.load(Ordering::SeqCst);
    while store.has_pending_writes() {
        oldest = oldest.min(store.flush_some(&mut reject));
    }
    store.complete_flush(&mut reject, start);
    oldest
}

fn set(store: &EventuallyPersistentStore, key: &str, data: &[u8]) -> Item {
    let mut item = Item::new(key, data, 0, 0);
    assert!(matches!(
        store.set(&mut item),
        MutationType::NotFound | MutationType::WasClean | MutationType::WasDirty
    ));
    item
}

fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn set_then_flush_persists_the_item() {
    let f = fixture(0, 3600);
    f.store.set_txn_size(1);
    set(&f.store, "foo", b"bar");

    let stats = f.store.stats();
    assert_eq!(stats.queue_size.load(Ordering::SeqCst), 1);
    assert!(f.store.key_stats("foo").unwrap().dirty);

    flush_cycle(&f.store);

    assert!(f.mock.rows_contain("foo", b"bar\r\n"));
    assert_eq!(stats.total_persisted.load(Ordering::SeqCst), 1);
    assert_eq!(stats.curr_items.load(Ordering::SeqCst), 1);
    assert!(!f.store.key_stats("foo").unwrap().dirty);
}

#[test]
fn young_keys_are_deferred_until_min_data_age() {
    let f = fixture(5, 3600);
    set(&f.store, "foo", b"v1");
    f.clock.set(1_001);

    assert!(f.store.begin_flush());
    let mut reject = VecDeque::new();
    assert_eq!(f.store.flush_one(&mut reject), 4);
    assert_eq!(reject.len(), 1);
    assert_eq!(f.store.stats().too_young.load(Ordering::SeqCst), 1);

    // The dirty bookkeeping is exactly as if the attempt never happened.
    let ks = f.store.key_stats("foo").unwrap();
    assert!(ks.dirty);
    assert_eq!(ks.dirtied, 1_000);
    assert_eq!(ks.data_age, 1_000);

    f.store.complete_flush(&mut reject, f.store.now());
    assert_eq!(f.mock.row_count(), 0);

    f.clock.set(1_005);
    flush_cycle(&f.store);
    assert!(f.mock.rows_contain("foo", b"v1\r\n"));
}

#[test]
fn queue_age_cap_forces_out_hot_keys() {
    let f = fixture(60, 10);
    set(&f.store, "foo", b"v0");
    for t in 1..=10u64 {
        f.clock.set(1_000 + t);
        set(&f.store, "foo", format!("v{t}").as_bytes());
    }
    f.clock.set(1_011);

    flush_cycle(&f.store);

    assert_eq!(f.store.stats().too_old.load(Ordering::SeqCst), 1);
    assert!(f.mock.rows_contain("foo", b"v10\r\n"));
    assert!(!f.store.key_stats("foo").unwrap().dirty);
}

#[test]
fn commit_failures_are_retried_until_success() {
    let f = fixture(0, 3600);
    f.mock.state.lock().unwrap().commit_failures_remaining = 2;
    set(&f.store, "foo", b"bar");

    flush_cycle(&f.store);

    let state = f.mock.state.lock().unwrap();
    assert_eq!(state.sets, 1);
    assert!(state.begins >= 1);
    assert_eq!(state.commits, 1);
    assert!(state.rows.contains_key("foo"));
    drop(state);
    assert_eq!(f.store.stats().commit_failed.load(Ordering::SeqCst), 2);
}

#[test]
fn failed_write_reinstates_the_original_dirty_ages() {
    let f = fixture(0, 3600);
    f.mock.state.lock().unwrap().set_failures.insert("k1".to_string(), 1);
    set(&f.store, "k1", b"v1");
    f.clock.set(1_002);

    flush_cycle(&f.store);

    assert_eq!(f.store.stats().flush_failed.load(Ordering::SeqCst), 1);
    let ks = f.store.key_stats("k1").unwrap();
    assert!(ks.dirty);
    assert_eq!(ks.dirtied, 1_000);
    assert_eq!(ks.data_age, 1_000);
    // The rejected key is already queued for the next cycle.
    assert!(f.store.has_pending_writes());

    flush_cycle(&f.store);
    assert!(f.mock.rows_contain("k1", b"v1\r\n"));
    assert!(!f.store.key_stats("k1").unwrap().dirty);
}

#[test]
fn delete_persists_a_tombstone() {
    let f = fixture(0, 3600);
    set(&f.store, "foo", b"bar");
    flush_cycle(&f.store);
    assert_eq!(f.mock.row_count(), 1);

    assert!(f.store.del("foo"));
    assert!(f.store.get("foo").is_none());
    assert_eq!(f.store.stats().curr_items.load(Ordering::SeqCst), 0);

    flush_cycle(&f.store);
    assert_eq!(f.mock.row_count(), 0);
    assert!(f.mock.state.lock().unwrap().deletes.contains(&"foo".to_string()));
}

#[test]
fn set_del_get_round_trip_reports_not_found() {
    let f = fixture(0, 3600);
    set(&f.store, "foo", b"bar");
    assert!(f.store.del("foo"));
    assert!(f.store.get("foo").is_none());
}

#[test]
fn quiescent_flush_loses_nothing() {
    let f = fixture(0, 3600);
    for i in 0..100 {
        set(&f.store, &format!("key-{i}"), format!("value-{i}").as_bytes());
    }
    flush_cycle(&f.store);

    assert_eq!(f.mock.row_count(), 100);
    for i in 0..100 {
        assert!(f
            .mock
            .rows_contain(&format!("key-{i}"), format!("value-{i}\r\n").as_bytes()));
    }
    assert!(f.store.dirty_keys().is_empty());
}

#[test]
fn cas_stamps_increase_across_mutations() {
    let f = fixture(0, 3600);
    let mut last = 0;
    for i in 0..10 {
        let item = set(&f.store, "key", format!("v{i}").as_bytes());
        assert!(item.cas() > last);
        last = item.cas();
    }
}

#[test]
fn dirty_state_matches_queue_membership() {
    let f = fixture(0, 3600);
    set(&f.store, "a", b"1");
    set(&f.store, "b", b"2");
    assert!(f.store.key_stats("a").unwrap().dirty);
    assert_eq!(f.store.stats().queue_size.load(Ordering::SeqCst), 2);

    // Overwriting a dirty entry does not enqueue a duplicate.
    set(&f.store, "a", b"1b");
    assert_eq!(f.store.stats().total_enqueued.load(Ordering::SeqCst), 2);

    flush_cycle(&f.store);
    assert!(!f.store.key_stats("a").unwrap().dirty);
    assert!(!f.store.key_stats("b").unwrap().dirty);
    assert_eq!(f.store.stats().queue_size.load(Ordering::SeqCst), 0);

    // A clean entry re-dirtied is enqueued again.
    set(&f.store, "a", b"1c");
    assert_eq!(f.store.stats().total_enqueued.load(Ordering::SeqCst), 3);
}

#[test]
fn warmup_restores_the_backing_store_as_clean_entries() {
    let f = fixture(0, 3600);
    {
        let mut state = f.mock.state.lock().unwrap();
        state
            .rows
            .insert("a".into(), Item::from_stored("a", b"1\r\n".to_vec(), 3, 0, 7));
        state
            .rows
            .insert("b".into(), Item::from_stored("b", b"2\r\n".to_vec(), 0, 0, 8));
    }

    assert_eq!(f.store.warmup().unwrap(), 2);
    assert_eq!(f.store.stats().warmed_up.load(Ordering::SeqCst), 2);
    assert_eq!(f.store.stats().curr_items.load(Ordering::SeqCst), 2);
    let a = f.store.get("a").unwrap();
    assert_eq!(a.data(), b"1\r\n");
    assert_eq!(a.flags(), 3);
    assert!(!f.store.key_stats("a").unwrap().dirty);
    // Nothing to flush after a warm start.
    assert!(!f.store.begin_flush());
}

#[test]
fn read_only_mode_never_queues() {
    let f = fixture_with_persistence(0, 3600, false);
    set(&f.store, "foo", b"bar");
    assert_eq!(f.store.stats().queue_size.load(Ordering::SeqCst), 0);
    assert!(!f.store.begin_flush());
    // Reads still come from memory.
    assert_eq!(f.store.get("foo").unwrap().data(), b"bar\r\n");
}

#[test]
fn get_locked_excludes_other_lockers() {
    let f = fixture(0, 3600);
    set(&f.store, "foo", b"bar");

    let locked = match f.store.get_locked("foo", f.clock.now(), 10) {
        GetLockedOutcome::Acquired(item) => item,
        other => panic!("expected lock acquisition, got {other:?}"),
    };
    assert!(matches!(
        f.store.get_locked("foo", f.clock.now(), 10),
        GetLockedOutcome::AlreadyLocked
    ));
    assert!(matches!(
        f.store.get_locked("missing", f.clock.now(), 10),
        GetLockedOutcome::NotFound
    ));

    // A plain read reports an unusable CAS while the lock is held.
    assert_eq!(f.store.get("foo").unwrap().cas(), u64::MAX);

    // Only the holder's CAS can mutate the entry.
    let mut intruder = Item::new("foo", b"stolen", 0, 0);
    assert_eq!(f.store.set(&mut intruder), MutationType::IsLocked);
    let mut holder = Item::new("foo", b"updated", 0, 0);
    holder.set_cas(locked.cas());
    assert_eq!(f.store.set(&mut holder), MutationType::WasDirty);

    // The lock expires with the clock.
    let locked = f.store.get_locked("foo", f.clock.now(), 10);
    assert!(matches!(locked, GetLockedOutcome::Acquired(_)));
    f.clock.advance(11);
    let mut late = Item::new("foo", b"later", 0, 0);
    assert_eq!(f.store.set(&mut late), MutationType::WasDirty);
}

#[test]
fn reset_discards_state_and_queues() {
    let f = fixture(0, 3600);
    set(&f.store, "foo", b"bar");
    f.store.reset();
    assert!(f.store.get("foo").is_none());
    assert_eq!(f.store.stats().curr_items.load(Ordering::SeqCst), 0);
    assert!(!f.store.begin_flush());
}

#[test]
fn flusher_warms_up_then_runs() {
    let f = fixture(0, 3600);
    f.mock
        .state
        .lock()
        .unwrap()
        .rows
        .insert("a".into(), Item::from_stored("a", b"1\r\n".to_vec(), 0, 0, 5));

    let dispatcher = Dispatcher::new();
    dispatcher.start();
    let flusher = Flusher::new(f.store.clone(), dispatcher.clone(), true);
    flusher.start();
    flusher.wait_until(|s| s == FlusherState::Running);

    assert_eq!(f.store.stats().warmed_up.load(Ordering::SeqCst), 1);
    assert!(f.store.stats().warmup_complete.load(Ordering::SeqCst));
    assert_eq!(f.store.get("a").unwrap().data(), b"1\r\n");

    assert!(flusher.stop());
    flusher.wait_until(|s| s == FlusherState::Stopped);
    dispatcher.stop();
}

#[test]
fn flusher_persists_in_the_background() {
    let f = fixture(0, 3600);
    let dispatcher = Dispatcher::new();
    dispatcher.start();
    let flusher = Flusher::new(f.store.clone(), dispatcher.clone(), true);
    flusher.start();
    flusher.wait_until(|s| s == FlusherState::Running);

    set(&f.store, "foo", b"bar");
    assert!(wait_for(
        || f.mock.rows_contain("foo", b"bar\r\n"),
        Duration::from_secs(5)
    ));

    assert!(flusher.stop());
    flusher.wait_until(|s| s == FlusherState::Stopped);
    dispatcher.stop();
}

#[test]
fn stopping_flusher_drains_young_items() {
    let f = fixture(600, 3600);
    let dispatcher = Dispatcher::new();
    dispatcher.start();
    let flusher = Flusher::new(f.store.clone(), dispatcher.clone(), true);
    flusher.start();
    flusher.wait_until(|s| s == FlusherState::Running);

    set(&f.store, "foo", b"bar");
    // Far too young to be admitted by a normal cycle.
    assert!(!f.mock.rows_contain("foo", b"bar\r\n"));

    assert!(flusher.stop());
    flusher.wait_until(|s| s == FlusherState::Stopped);
    assert!(f.mock.rows_contain("foo", b"bar\r\n"));
    assert!(f.store.dirty_keys().is_empty());
    dispatcher.stop();
}

#[test]
fn paused_flusher_holds_writes_until_resumed() {
    let f = fixture(0, 3600);
    let dispatcher = Dispatcher::new();
    dispatcher.start();
    let flusher = Flusher::new(f.store.clone(), dispatcher.clone(), true);
    flusher.start();
    flusher.wait_until(|s| s == FlusherState::Running);

    assert!(flusher.pause());
    flusher.wait_until(|s| s == FlusherState::Paused);

    set(&f.store, "foo", b"bar");
    thread::sleep(Duration::from_millis(1_200));
    assert!(!f.mock.rows_contain("foo", b"bar\r\n"));

    assert!(flusher.resume());
    flusher.wait_until(|s| s == FlusherState::Running);
    assert!(wait_for(
        || f.mock.rows_contain("foo", b"bar\r\n"),
        Duration::from_secs(5)
    ));

    assert!(flusher.stop());
    flusher.wait_until(|s| s == FlusherState::Stopped);
    dispatcher.stop();
}

#[test]
fn invalid_flusher_transitions_are_rejected() {
    let f = fixture(0, 3600);
    let dispatcher = Dispatcher::new();
    dispatcher.start();
    let flusher = Flusher::new(f.store.clone(), dispatcher.clone(), true);
    flusher.start();
    flusher.wait_until(|s| s == FlusherState::Running);

    // Resuming a running flusher is a no-op.
    assert!(!flusher.resume());

    assert!(flusher.stop());
    flusher.wait_until(|s| s == FlusherState::Stopped);
    // Everything is refused once stopped.
    assert!(!flusher.pause());
    assert!(!flusher.resume());
    assert!(!flusher.stop());
    dispatcher.stop();
}
