//! Tap: the live-mutation replication stream.
//!
//! Every accepted mutation lands on each subscriber's deduplicated key
//! queue; subscribers pull keys and receive the value as it is at walk
//! time. A subscriber that drains its queue is marked paused, and a
//! dedicated notifier thread wakes paused subscribers through the host's
//! I/O-completion hook when new events arrive for them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use everstore_common::{Clock, SyncObject};
use everstore_store::{EventuallyPersistentStore, Item};
use tracing::{debug, info, instrument};

/// Opaque per-connection token chosen by the host front-end.
pub type Cookie = u64;

/// Subscriber wants the current key-set streamed before live events.
pub const TAP_CONNECT_FLAG_BACKFILL: u32 = 0x01;
/// Subscriber is disconnected once its queue drains instead of pausing.
pub const TAP_CONNECT_FLAG_DUMP: u32 = 0x02;

/// Connections are retained "forever" until a disconnect stamps a real
/// expiry.
const NEVER: u64 = u64::MAX;

/// What a subscriber gets from walking its queue.
#[derive(Debug)]
pub enum TapEvent {
    /// The key exists; here is its current value.
    Mutation(Item),
    /// The key vanished between enqueue and walk; a key-only stub.
    Deletion(Item),
    /// The engine was flushed; the subscriber should drop its copy.
    Flush,
    /// Nothing queued; the subscriber will be woken when something is.
    Pause,
    Disconnect,
}

/// Host hook used by the notifier thread to wake a paused subscriber.
pub trait TapNotifier: Send + Sync {
    fn notify_io_complete(&self, cookie: Cookie);
}

struct TapConnection {
    client: String,
    queue: VecDeque<String>,
    queue_set: HashSet<String>,
    records_fetched: u64,
    pending_flush: bool,
    expiry_time: u64,
    reconnects: u32,
    connected: bool,
    paused: bool,
    backfill_age: u64,
    dump_queue: bool,
}

impl TapConnection {
    fn new(client: String, flags: u32) -> Self {
        Self {
            client,
            queue: VecDeque::new(),
            queue_set: HashSet::new(),
            records_fetched: 0,
            pending_flush: false,
            expiry_time: NEVER,
            reconnects: 0,
            connected: true,
            paused: false,
            backfill_age: 0,
            dump_queue: flags & TAP_CONNECT_FLAG_DUMP != 0,
        }
    }

    /// Queue a key, deduplicating. Returns whether the queue was empty
    /// beforehand.
    fn add_event(&mut self, key: &str) -> bool {
        let was_empty = self.queue.is_empty();
        if self.queue_set.insert(key.to_string()) {
            self.queue.push_back(key.to_string());
        }
        was_empty
    }

    fn next(&mut self) -> Option<String> {
        let key = self.queue.pop_front()?;
        self.queue_set.remove(&key);
        self.records_fetched += 1;
        Some(key)
    }

    /// A flush supersedes every queued event.
    fn flush(&mut self) {
        self.pending_flush = true;
        self.queue.clear();
        self.queue_set.clear();
    }

    fn should_flush(&mut self) -> bool {
        std::mem::take(&mut self.pending_flush)
    }
}

/// Per-connection counters for the stats surface.
pub struct TapConnectionStats {
    pub client: String,
    pub queue_length: usize,
    pub records_fetched: u64,
    pub reconnects: u32,
    pub backfill_age: u64,
}

struct TapRegistry {
    conns: HashMap<String, TapConnection>,
    cookies: HashMap<Cookie, String>,
    shutdown: bool,
}

/// Owns every tap connection and the notifier machinery. All registry state
/// is guarded by one sync object; the condition variable doubles as the
/// notifier thread's wakeup.
pub struct TapManager {
    sync: SyncObject<TapRegistry>,
    keepalive: u64,
    clock: Arc<dyn Clock>,
    self_ref: Weak<TapManager>,
}

impl TapManager {
    pub fn new(keepalive: u64, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sync: SyncObject::new(TapRegistry {
                conns: HashMap::new(),
                cookies: HashMap::new(),
                shutdown: false,
            }),
            keepalive,
            clock,
            self_ref: weak.clone(),
        })
    }

    pub fn keepalive(&self) -> u64 {
        self.keepalive
    }

    /// Register (or re-bind) the subscriber behind `cookie`.
    ///
    /// An existing connection with the same name is reclaimed: its expiry is
    /// cleared and its reconnect count bumped. When `tap_keepalive` is zero
    /// the stale connection is discarded instead. A new connection that
    /// requests backfill with an age already in the past is seeded with
    /// every key currently in the store; without the backfill flag it sees
    /// live events only.
    #[instrument(name = "everstore.tap_connect", skip(self, store))]
    pub fn create_tap_queue(
        &self,
        cookie: Cookie,
        client: &str,
        flags: u32,
        backfill_age: Option<u64>,
        store: &EventuallyPersistentStore,
    ) {
        let now = self.clock.now();
        let mut registry = self.sync.lock();
        Self::purge_expired(&mut registry, now);

        let name = if client.is_empty() {
            format!("eq_tapq:anon_{cookie}")
        } else {
            format!("eq_tapq:{client}")
        };

        let mut existing = false;
        if let Some(conn) = registry.conns.get_mut(&name) {
            conn.expiry_time = NEVER;
            conn.reconnects += 1;
            existing = true;
        }

        // With no keepalive there is nothing worth re-binding; the old
        // queue's contents belong to a dead session.
        if existing && self.keepalive == 0 {
            info!(name = %name, "forcing close of tap client");
            registry.cookies.retain(|_, bound| *bound != name);
            registry.conns.remove(&name);
            existing = false;
        }

        if existing {
            registry.cookies.insert(cookie, name.clone());
            if let Some(conn) = registry.conns.get_mut(&name) {
                conn.connected = true;
            }
            return;
        }

        let mut conn = TapConnection::new(name.clone(), flags);
        if flags & TAP_CONNECT_FLAG_BACKFILL != 0 {
            conn.backfill_age = backfill_age.unwrap_or(0);
            if conn.backfill_age < now {
                store.visit(|value| {
                    conn.add_event(value.item().key());
                });
                debug!(name = %name, queued = conn.queue.len(), "backfilled tap queue");
            }
        }
        registry.cookies.insert(cookie, name.clone());
        registry.conns.insert(name, conn);
    }

    /// Pull the next event for the subscriber behind `cookie`. The value is
    /// read outside the registry lock, so it reflects the key's state at
    /// walk time.
    #[instrument(name = "everstore.tap_walk", skip(self, store))]
    pub fn walk(&self, cookie: Cookie, store: &EventuallyPersistentStore) -> TapEvent {
        let mut registry = self.sync.lock();
        let Some(name) = registry.cookies.get(&cookie).cloned() else {
            return TapEvent::Disconnect;
        };
        let Some(conn) = registry.conns.get_mut(&name) else {
            return TapEvent::Disconnect;
        };
        conn.paused = false;

        if let Some(key) = conn.next() {
            drop(registry);
            match store.get(&key) {
                Some(item) => TapEvent::Mutation(item),
                None => TapEvent::Deletion(Item::stub(key)),
            }
        } else if conn.should_flush() {
            TapEvent::Flush
        } else {
            conn.paused = true;
            if conn.dump_queue {
                TapEvent::Disconnect
            } else {
                TapEvent::Pause
            }
        }
    }

    /// Fan a mutation out to every live (non-dump) subscriber, waking the
    /// notifier when a paused subscriber gained its first pending event.
    pub fn add_event(&self, key: &str) {
        let mut registry = self.sync.lock();
        let mut notify = false;
        for conn in registry.conns.values_mut() {
            if !conn.dump_queue && conn.add_event(key) && conn.paused {
                notify = true;
            }
        }
        drop(registry);
        if notify {
            self.sync.notify_all();
        }
    }

    /// Broadcast a flush: every live subscriber drops its queue and will see
    /// a single `Flush` event.
    pub fn add_flush_event(&self) {
        let mut registry = self.sync.lock();
        let mut notify = false;
        for conn in registry.conns.values_mut() {
            if !conn.dump_queue {
                conn.flush();
                notify = true;
            }
        }
        drop(registry);
        if notify {
            self.sync.notify_all();
        }
    }

    /// The front-end lost the connection: stamp an expiry so the queue
    /// survives `tap_keepalive` seconds for a reconnect.
    pub fn handle_disconnect(&self, cookie: Cookie) {
        let now = self.clock.now();
        let mut registry = self.sync.lock();
        if let Some(name) = registry.cookies.remove(&cookie) {
            if let Some(conn) = registry.conns.get_mut(&name) {
                conn.expiry_time = now.saturating_add(self.keepalive);
                conn.connected = false;
            }
        }
        Self::purge_expired(&mut registry, now);
    }

    pub fn connection_stats(&self) -> Vec<TapConnectionStats> {
        let registry = self.sync.lock();
        registry
            .conns
            .values()
            .map(|conn| TapConnectionStats {
                client: conn.client.clone(),
                queue_length: conn.queue.len(),
                records_fetched: conn.records_fetched,
                reconnects: conn.reconnects,
                backfill_age: conn.backfill_age,
            })
            .collect()
    }

    /// Spawn the notifier thread: it sleeps on the tap condition until some
    /// paused subscriber has pending events, then wakes each through the
    /// host hook.
    pub fn start_notifier(&self, notifier: Arc<dyn TapNotifier>) -> JoinHandle<()> {
        let manager = self.self_ref.upgrade().expect("tap manager was dropped");
        thread::Builder::new()
            .name("everstore-tap-notifier".to_string())
            .spawn(move || manager.notifier_loop(notifier))
            .expect("failed to spawn tap notifier thread")
    }

    /// Stop the notifier thread; the caller joins the handle returned by
    /// [`TapManager::start_notifier`].
    pub fn shutdown(&self) {
        let mut registry = self.sync.lock();
        registry.shutdown = true;
        drop(registry);
        self.sync.notify_all();
    }

    fn notifier_loop(&self, notifier: Arc<dyn TapNotifier>) {
        debug!("tap notifier starting");
        let mut registry = self.sync.lock();
        loop {
            if registry.shutdown {
                break;
            }
            let now = self.clock.now();
            Self::purge_expired(&mut registry, now);

            let to_wake: Vec<(Cookie, String)> = registry
                .cookies
                .iter()
                .filter(|(_, name)| {
                    registry.conns.get(*name).is_some_and(|conn| {
                        conn.paused && (!conn.queue.is_empty() || conn.pending_flush)
                    })
                })
                .map(|(cookie, name)| (*cookie, name.clone()))
                .collect();

            if to_wake.is_empty() {
                registry = self.sync.wait(registry);
                continue;
            }

            // Clearing the pause before the callback keeps a slow consumer
            // from being woken twice for the same batch of events.
            for (_, name) in &to_wake {
                if let Some(conn) = registry.conns.get_mut(name) {
                    conn.paused = false;
                }
            }
            drop(registry);
            for (cookie, _) in to_wake {
                notifier.notify_io_complete(cookie);
            }
            registry = self.sync.lock();
        }
        debug!("tap notifier exited");
    }

    /// A connection may be collected once its expiry passed, no cookie maps
    /// to it, and it is not connected.
    fn purge_expired(registry: &mut TapRegistry, now: u64) {
        let mapped: HashSet<String> = registry.cookies.values().cloned().collect();
        registry.conns.retain(|name, conn| {
            let dead = conn.expiry_time <= now && !mapped.contains(name) && !conn.connected;
            if dead {
                debug!(name = %name, "purging expired tap connection");
            }
            !dead
        });
    }
}
