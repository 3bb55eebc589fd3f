//! The everstore engine: an eventually-persistent key/value store.
//!
//! The engine serves reads and writes from a striped in-memory hash table,
//! queues dirty keys for a background flusher that batches them into a
//! SQLite backing store, and multiplexes live mutations to tap subscribers.
//! Writes are acknowledged before they are durable; the dirty-bit protocol
//! guarantees they eventually become so.

mod config;
mod error;
mod tap;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Context as _;
use tracing::{error, info, instrument, Level};

use everstore_common::{CasCounter, Clock, SystemClock};
use everstore_dispatcher::Dispatcher;
use everstore_kvstore_sqlite::{DatabaseLocation, SqliteKVStore};
use everstore_store::{
    EPStats, EventuallyPersistentStore, Flusher, FlusherState, GetLockedOutcome, Item, KeyStats,
    MutationType, MAX_ITEM_BYTES,
};

pub use config::{EngineConfig, ENV_NO_PERSISTENCE, ENV_VERIFY_SHUTDOWN_FLUSH};
pub use error::{EngineError, EngineResult};
pub use tap::{
    Cookie, TapConnectionStats, TapEvent, TapManager, TapNotifier, TAP_CONNECT_FLAG_BACKFILL,
    TAP_CONNECT_FLAG_DUMP,
};

/// Opaque protocol command slots the host maps onto the engine's
/// operational commands.
pub const CMD_STOP_PERSISTENCE: u8 = 0x80;
pub const CMD_START_PERSISTENCE: u8 = 0x81;
pub const CMD_SET_FLUSH_PARAM: u8 = 0x82;

/// Bound on optimistic-concurrency retries in compound operations; beyond
/// this the caller sees `KeyExists` instead of the engine spinning.
const MAX_CAS_RETRIES: usize = 10;

/// Storage verbs of the cache protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOperation {
    Set,
    /// `Set` that requires the request CAS to match.
    Cas,
    Add,
    Replace,
    Append,
    Prepend,
}

/// The assembled engine: store, dispatcher, flusher, and tap machinery.
pub struct EventuallyPersistentEngine {
    config: EngineConfig,
    store: Arc<EventuallyPersistentStore>,
    dispatcher: Arc<Dispatcher>,
    flusher: Arc<Flusher>,
    tap: Arc<TapManager>,
    notifier_thread: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
    database_init_time: u64,
    verify_shutdown_flush: bool,
    shut_down: AtomicBool,
}

impl EventuallyPersistentEngine {
    /// Build and start the engine: open the backing store, spin up the
    /// dispatcher, flusher, and tap notifier, and (by default) wait for
    /// warmup to finish.
    pub fn new(config: EngineConfig, notifier: Arc<dyn TapNotifier>) -> anyhow::Result<Self> {
        let do_persistence = std::env::var_os(ENV_NO_PERSISTENCE).is_none();
        let verify_shutdown_flush = std::env::var_os(ENV_VERIFY_SHUTDOWN_FLUSH).is_some();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let db_start = clock.now();
        let location = if config.dbname == ":memory:" {
            DatabaseLocation::InMemory
        } else {
            DatabaseLocation::Path(PathBuf::from(&config.dbname))
        };
        let init_script = config
            .initfile
            .as_ref()
            .map(|path| {
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading init file {}", path.display()))
            })
            .transpose()?;
        let kvstore = SqliteKVStore::open(location, config.db_shards, init_script.as_deref())
            .with_context(|| format!("opening backing store {:?}", config.dbname))?;
        let database_init_time = clock.now().saturating_sub(db_start);

        let cas = Arc::new(CasCounter::new(1));
        let stats = Arc::new(EPStats::new(config.min_data_age, config.queue_age_cap));
        let store = Arc::new(EventuallyPersistentStore::new(
            Box::new(kvstore),
            clock.clone(),
            cas,
            stats,
            do_persistence,
        ));
        store.set_txn_size(config.txn_size);

        let dispatcher = Dispatcher::new();
        dispatcher.start();
        let flusher = Flusher::new(store.clone(), dispatcher.clone(), config.warmup);
        flusher.start();

        let tap = TapManager::new(config.tap_keepalive, clock.clone());
        let notifier_thread = tap.start_notifier(notifier);

        if config.waitforwarmup {
            flusher.wait_until(|state| state != FlusherState::Initializing);
        }
        info!(dbname = %config.dbname, "engine initialized");

        Ok(Self {
            config,
            store,
            dispatcher,
            flusher,
            tap,
            notifier_thread: Mutex::new(Some(notifier_thread)),
            clock,
            database_init_time,
            verify_shutdown_flush,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Stop the flusher (draining every dirty item), the dispatcher, and
    /// the tap notifier. Honors `EP_VERIFY_SHUTDOWN_FLUSH`.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("engine shutting down");
        if self.flusher.stop() {
            self.flusher.wait_until(|state| state == FlusherState::Stopped);
        }
        self.dispatcher.stop();
        self.tap.shutdown();
        if let Some(handle) = self.notifier_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        if self.verify_shutdown_flush {
            let dirty = self.store.dirty_keys();
            if !dirty.is_empty() {
                for key in &dirty {
                    error!(key = %key, "object dirty after shutdown flush");
                }
                anyhow::bail!("{} objects remained dirty after the shutdown flush", dirty.len());
            }
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<EventuallyPersistentStore> {
        &self.store
    }

    pub fn flusher_state(&self) -> FlusherState {
        self.flusher.state()
    }

    /// Allocate an item for a subsequent store operation.
    pub fn item_allocate(
        &self,
        key: &str,
        data: &[u8],
        flags: u32,
        exptime: u64,
    ) -> EngineResult<Item> {
        if data.len() > MAX_ITEM_BYTES {
            return Err(EngineError::OutOfMemory);
        }
        Ok(Item::new(key, data, flags, exptime))
    }

    #[instrument(name = "everstore.get", skip(self), err(level = Level::INFO))]
    pub fn get(&self, key: &str) -> EngineResult<Item> {
        self.store.get(key).ok_or(EngineError::KeyNotFound)
    }

    /// Read the value and lock the entry for `lock_timeout` seconds. The
    /// returned item's CAS identifies the holder.
    pub fn get_locked(&self, key: &str, lock_timeout: u64) -> EngineResult<Item> {
        match self.store.get_locked(key, self.clock.now(), lock_timeout) {
            GetLockedOutcome::Acquired(item) => Ok(item),
            GetLockedOutcome::AlreadyLocked => Err(EngineError::Locked),
            GetLockedOutcome::NotFound => Err(EngineError::KeyNotFound),
        }
    }

    #[instrument(name = "everstore.delete", skip(self), err(level = Level::INFO))]
    pub fn delete(&self, key: &str) -> EngineResult<()> {
        if self.store.del(key) {
            self.tap.add_event(key);
            Ok(())
        } else {
            Err(EngineError::KeyNotFound)
        }
    }

    /// Run a storage verb. On success the item's CAS has been advanced and
    /// is returned for the response.
    #[instrument(
        name = "everstore.store",
        skip(self, item),
        err(level = Level::INFO),
        fields(key = %item.key())
    )]
    pub fn store_item(&self, item: &mut Item, operation: StoreOperation) -> EngineResult<u64> {
        match operation {
            StoreOperation::Cas => {
                // A CAS with the wildcard stamp makes no sense.
                if item.cas() == 0 {
                    return Err(EngineError::NotStored);
                }
                self.apply_set(item)
            }
            StoreOperation::Set => self.apply_set(item),
            StoreOperation::Add => {
                if self.store.add(item, true) {
                    self.tap.add_event(item.key());
                    Ok(item.cas())
                } else {
                    Err(EngineError::NotStored)
                }
            }
            StoreOperation::Replace => {
                if self.store.get(item.key()).is_some() {
                    self.apply_set(item)
                } else {
                    Err(EngineError::NotStored)
                }
            }
            StoreOperation::Append | StoreOperation::Prepend => self.concat(item, operation),
        }
    }

    /// Numeric increment/decrement over the stored decimal value.
    /// Decrements clamp at zero. With `create`, a missing key starts at
    /// `initial`. Returns the new CAS and the resulting value.
    #[instrument(name = "everstore.arithmetic", skip(self), err(level = Level::INFO))]
    pub fn arithmetic(
        &self,
        key: &str,
        increment: bool,
        create: bool,
        delta: u64,
        initial: u64,
        exptime: u64,
    ) -> EngineResult<(u64, u64)> {
        for _ in 0..MAX_CAS_RETRIES {
            match self.store.get(key) {
                Some(existing) => {
                    let text = std::str::from_utf8(existing.trimmed())
                        .map_err(|_| non_numeric(key))?;
                    let current: u64 = text.trim().parse().map_err(|_| non_numeric(key))?;
                    let value = if increment {
                        current.wrapping_add(delta)
                    } else {
                        current.saturating_sub(delta)
                    };

                    let mut updated = Item::new(
                        key,
                        format!("{value}\r\n").as_bytes(),
                        existing.flags(),
                        exptime,
                    );
                    updated.set_cas(existing.cas());
                    match self.store.set(&mut updated) {
                        MutationType::InvalidCas => continue,
                        MutationType::IsLocked => return Err(EngineError::Locked),
                        _ => {
                            self.tap.add_event(key);
                            return Ok((updated.cas(), value));
                        }
                    }
                }
                None if create => {
                    let mut fresh = Item::new(key, format!("{initial}\r\n").as_bytes(), 0, exptime);
                    if self.store.add(&mut fresh, true) {
                        self.tap.add_event(key);
                        return Ok((fresh.cas(), initial));
                    }
                    // Lost a race with a concurrent create; re-read.
                    continue;
                }
                None => return Err(EngineError::KeyNotFound),
            }
        }
        Err(EngineError::KeyExists)
    }

    /// Flush the whole store. Only an immediate flush is supported: the
    /// in-memory state is reset and every tap subscriber sees a flush
    /// event.
    pub fn flush_all(&self, when: u64) -> EngineResult<()> {
        if when != 0 {
            return Err(EngineError::Unsupported);
        }
        self.store.reset();
        self.tap.add_flush_event();
        Ok(())
    }

    pub fn key_stats(&self, key: &str) -> EngineResult<KeyStats> {
        self.store.key_stats(key).ok_or(EngineError::KeyNotFound)
    }

    /// Apply an event received from another node's tap stream.
    pub fn tap_notify(&self, event: TapEvent) -> EngineResult<()> {
        match event {
            TapEvent::Mutation(mut item) => {
                // Peer CAS stamps have no meaning here.
                item.set_cas(0);
                self.store_item(&mut item, StoreOperation::Set).map(drop)
            }
            TapEvent::Deletion(item) => self.delete(item.key()),
            TapEvent::Flush => self.flush_all(0),
            TapEvent::Pause | TapEvent::Disconnect => Ok(()),
        }
    }

    pub fn create_tap_queue(
        &self,
        cookie: Cookie,
        client: &str,
        flags: u32,
        backfill_age: Option<u64>,
    ) {
        self.tap
            .create_tap_queue(cookie, client, flags, backfill_age, &self.store);
    }

    pub fn walk_tap_queue(&self, cookie: Cookie) -> TapEvent {
        self.tap.walk(cookie, &self.store)
    }

    pub fn handle_disconnect(&self, cookie: Cookie) {
        self.tap.handle_disconnect(cookie);
    }

    /// Pause the flusher (protocol command 0x80).
    pub fn stop_persistence(&self) -> EngineResult<()> {
        if self.flusher.pause() {
            Ok(())
        } else {
            Err(EngineError::InvalidArgument(format!(
                "flusher not running (state: {})",
                self.flusher.state().name()
            )))
        }
    }

    /// Resume the flusher (protocol command 0x81).
    pub fn start_persistence(&self) -> EngineResult<()> {
        if self.flusher.resume() {
            Ok(())
        } else {
            Err(EngineError::InvalidArgument(format!(
                "flusher not paused (state: {})",
                self.flusher.state().name()
            )))
        }
    }

    /// Adjust a persistence tunable at runtime (protocol command 0x82).
    pub fn set_flush_param(&self, key: &str, value: &str) -> EngineResult<()> {
        let parsed: u64 = value
            .parse()
            .map_err(|_| EngineError::InvalidArgument(format!("{value:?} is not a number")))?;
        match key {
            "min_data_age" => self.store.set_min_data_age(parsed),
            "queue_age_cap" => self.store.set_queue_age_cap(parsed),
            "max_txn_size" => self.store.set_txn_size(parsed),
            _ => {
                return Err(EngineError::InvalidArgument(format!(
                    "unknown flush parameter {key:?}"
                )))
            }
        }
        Ok(())
    }

    /// Snapshot the statistics surface as `(name, value)` pairs.
    pub fn stats(&self) -> Vec<(String, String)> {
        let stats = self.store.stats();
        let load = |value: &std::sync::atomic::AtomicU64| value.load(Ordering::SeqCst);

        let mut out: Vec<(String, String)> = vec![
            ("ep_version".into(), env!("CARGO_PKG_VERSION").into()),
            ("ep_storage_age".into(), load(&stats.dirty_age).to_string()),
            (
                "ep_storage_age_highwat".into(),
                load(&stats.dirty_age_highwat).to_string(),
            ),
            ("ep_min_data_age".into(), load(&stats.min_data_age).to_string()),
            ("ep_queue_age_cap".into(), load(&stats.queue_age_cap).to_string()),
            ("ep_max_txn_size".into(), self.store.txn_size().to_string()),
            ("ep_data_age".into(), load(&stats.data_age).to_string()),
            (
                "ep_data_age_highwat".into(),
                load(&stats.data_age_highwat).to_string(),
            ),
            ("ep_too_young".into(), load(&stats.too_young).to_string()),
            ("ep_too_old".into(), load(&stats.too_old).to_string()),
            ("ep_total_enqueued".into(), load(&stats.total_enqueued).to_string()),
            ("ep_total_persisted".into(), load(&stats.total_persisted).to_string()),
            (
                "ep_item_flush_failed".into(),
                load(&stats.flush_failed).to_string(),
            ),
            ("ep_commit_failed".into(), load(&stats.commit_failed).to_string()),
            ("ep_queue_size".into(), load(&stats.queue_size).to_string()),
            ("ep_flusher_todo".into(), load(&stats.flusher_todo).to_string()),
            (
                "ep_flusher_state".into(),
                self.flusher.state().name().to_string(),
            ),
            ("ep_commit_time".into(), load(&stats.commit_time).to_string()),
            ("ep_flush_duration".into(), load(&stats.flush_duration).to_string()),
            (
                "ep_flush_duration_highwat".into(),
                load(&stats.flush_duration_highwat).to_string(),
            ),
            ("curr_items".into(), load(&stats.curr_items).to_string()),
            ("ep_dbname".into(), self.config.dbname.clone()),
            ("ep_dbinit".into(), self.database_init_time.to_string()),
            ("ep_warmup".into(), self.config.warmup.to_string()),
        ];

        if self.config.warmup {
            let thread_state = if stats.warmup_complete.load(Ordering::SeqCst) {
                "complete"
            } else {
                "running"
            };
            out.push(("ep_warmup_thread".into(), thread_state.into()));
            out.push(("ep_warmed_up".into(), load(&stats.warmed_up).to_string()));
            if stats.warmup_complete.load(Ordering::SeqCst) {
                out.push(("ep_warmup_time".into(), load(&stats.warmup_time).to_string()));
            }
        }

        let mut total_queue = 0;
        let mut total_fetched = 0;
        for conn in self.tap.connection_stats() {
            total_queue += conn.queue_length;
            total_fetched += conn.records_fetched;
            out.push((format!("{}:qlen", conn.client), conn.queue_length.to_string()));
            out.push((
                format!("{}:rec_fetched", conn.client),
                conn.records_fetched.to_string(),
            ));
            if conn.reconnects > 0 {
                out.push((
                    format!("{}:reconnects", conn.client),
                    conn.reconnects.to_string(),
                ));
            }
            if conn.backfill_age != 0 {
                out.push((
                    format!("{}:backfill_age", conn.client),
                    conn.backfill_age.to_string(),
                ));
            }
        }
        out.push(("ep_tap_total_queue".into(), total_queue.to_string()));
        out.push(("ep_tap_total_fetched".into(), total_fetched.to_string()));
        out.push(("ep_tap_keepalive".into(), self.tap.keepalive().to_string()));

        out
    }

    pub fn reset_stats(&self) {
        self.store.stats().reset();
    }

    fn apply_set(&self, item: &mut Item) -> EngineResult<u64> {
        match self.store.set(item) {
            MutationType::InvalidCas => Err(EngineError::KeyExists),
            MutationType::IsLocked => Err(EngineError::Locked),
            _ => {
                self.tap.add_event(item.key());
                Ok(item.cas())
            }
        }
    }

    /// Append/prepend via read-modify-CAS, retrying lost races a bounded
    /// number of times.
    fn concat(&self, item: &Item, operation: StoreOperation) -> EngineResult<u64> {
        for _ in 0..MAX_CAS_RETRIES {
            let Some(mut existing) = self.store.get(item.key()) else {
                return Err(EngineError::NotStored);
            };
            let grown = match operation {
                StoreOperation::Append => existing.append(item),
                StoreOperation::Prepend => existing.prepend(item),
                _ => unreachable!("concat only handles append/prepend"),
            };
            if !grown {
                return Err(EngineError::OutOfMemory);
            }
            match self.store.set(&mut existing) {
                MutationType::InvalidCas => continue,
                MutationType::IsLocked => return Err(EngineError::Locked),
                _ => {
                    self.tap.add_event(existing.key());
                    return Ok(existing.cas());
                }
            }
        }
        Err(EngineError::KeyExists)
    }
}

impl Drop for EventuallyPersistentEngine {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            error!(%error, "engine shutdown reported a failure");
        }
    }
}

fn non_numeric(key: &str) -> EngineError {
    EngineError::InvalidArgument(format!("value for {key:?} is not a number"))
}
