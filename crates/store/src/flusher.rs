use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use everstore_common::SyncObject;
use everstore_dispatcher::{Dispatcher, TaskId};
use tracing::{debug, warn};

use crate::store::EventuallyPersistentStore;

/// How long the flusher sleeps between cycles when a cycle suggested no
/// deferral of its own.
const IDLE_SLEEP_SECS: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlusherState {
    Initializing,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
}

impl FlusherState {
    pub fn name(self) -> &'static str {
        match self {
            FlusherState::Initializing => "initializing",
            FlusherState::Running => "running",
            FlusherState::Pausing => "pausing",
            FlusherState::Paused => "paused",
            FlusherState::Stopping => "stopping",
            FlusherState::Stopped => "stopped",
        }
    }
}

fn valid_transition(from: FlusherState, to: FlusherState) -> bool {
    use FlusherState::*;
    matches!(
        (from, to),
        (Initializing, Running)
            | (Running, Pausing)
            | (Running, Stopping)
            | (Pausing, Paused)
            | (Pausing, Stopping)
            | (Paused, Running)
            | (Paused, Stopping)
            | (Stopping, Stopped)
    )
}

struct FlusherInner {
    state: FlusherState,
    task: Option<TaskId>,
}

/// The background actor that drains the write queue.
///
/// One dispatcher task steps the state machine: warm up while
/// `Initializing`, drain-and-snooze while `Running`, and write everything
/// out (with `min_data_age` forced to zero) on the way to `Stopped`. State
/// transitions that need a fresh step kill the old task and schedule a new
/// one, so stale task handles never step a reconfigured flusher.
pub struct Flusher {
    store: Arc<EventuallyPersistentStore>,
    dispatcher: Arc<Dispatcher>,
    warmup: bool,
    sync: SyncObject<FlusherInner>,
    self_ref: Weak<Flusher>,
}

impl Flusher {
    pub fn new(
        store: Arc<EventuallyPersistentStore>,
        dispatcher: Arc<Dispatcher>,
        warmup: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            dispatcher,
            warmup,
            sync: SyncObject::new(FlusherInner {
                state: FlusherState::Initializing,
                task: None,
            }),
            self_ref: weak.clone(),
        })
    }

    pub fn start(&self) {
        self.schedule_step();
    }

    pub fn stop(&self) -> bool {
        self.transition(FlusherState::Stopping)
    }

    pub fn pause(&self) -> bool {
        self.transition(FlusherState::Pausing)
    }

    pub fn resume(&self) -> bool {
        self.transition(FlusherState::Running)
    }

    pub fn state(&self) -> FlusherState {
        self.sync.lock().state
    }

    /// Block until the state satisfies `pred`.
    pub fn wait_until(&self, pred: impl Fn(FlusherState) -> bool) {
        let mut inner = self.sync.lock();
        while !pred(inner.state) {
            inner = self.sync.wait(inner);
        }
    }

    fn transition(&self, to: FlusherState) -> bool {
        let mut inner = self.sync.lock();
        if !valid_transition(inner.state, to) {
            return false;
        }
        debug!(from = inner.state.name(), to = to.name(), "flusher state change");
        inner.state = to;
        let old_task = inner.task.take();
        drop(inner);
        self.sync.notify_all();

        if let Some(task) = old_task {
            self.dispatcher.kill(&task);
        }
        self.schedule_step();
        true
    }

    fn schedule_step(&self) {
        let flusher = self.self_ref.upgrade().expect("flusher was dropped");
        // The handle must land in `inner.task` before the new task can step
        // and transition, so it is stored with the state lock held.
        let mut inner = self.sync.lock();
        let task = self.dispatcher.schedule(
            "flusher",
            0,
            0.0,
            Box::new(move |dispatcher, task| flusher.step(dispatcher, task)),
        );
        inner.task = Some(task);
    }

    fn step(&self, dispatcher: &Dispatcher, task: &TaskId) -> bool {
        match self.state() {
            FlusherState::Initializing => {
                self.initialize();
                true
            }
            FlusherState::Running => {
                let deferral = self.do_flush();
                if self.state() == FlusherState::Running {
                    let sleep = if deferral > 0 {
                        deferral as f64
                    } else {
                        IDLE_SLEEP_SECS
                    };
                    dispatcher.snooze(task, sleep);
                }
                true
            }
            FlusherState::Pausing => {
                self.transition(FlusherState::Paused);
                false
            }
            FlusherState::Paused | FlusherState::Stopped => false,
            FlusherState::Stopping => {
                debug!("flusher shutting down; writing all dirty items");
                self.store.stats().min_data_age.store(0, Ordering::SeqCst);
                self.do_flush();
                self.transition(FlusherState::Stopped);
                false
            }
        }
    }

    fn initialize(&self) {
        let stats = self.store.stats().clone();
        let start = self.store.now();
        if self.warmup {
            match self.store.warmup() {
                Ok(loaded) => debug!(loaded, "warmup complete"),
                Err(error) => warn!(%error, "warmup failed; starting empty"),
            }
        } else {
            self.store.reset();
        }
        stats
            .warmup_time
            .store(self.store.now().saturating_sub(start), Ordering::SeqCst);
        stats.warmup_complete.store(true, Ordering::SeqCst);
        self.transition(FlusherState::Running);
    }

    /// Run flush batches until the flush queue is empty. Returns the
    /// smallest deferral any batch suggested, which is how long there is
    /// nothing worth waking up for.
    fn do_flush(&self) -> u64 {
        if !self.store.begin_flush() {
            return 0;
        }
        let flush_start = self.store.now();
        let mut reject = VecDeque::new();
        let mut oldest = self.store.stats().min_data_age.load(Ordering::SeqCst);
        while self.store.has_pending_writes() {
            let deferral = self.store.flush_some(&mut reject);
            if self.state() == FlusherState::Pausing {
                self.transition(FlusherState::Paused);
            }
            oldest = oldest.min(deferral);
        }
        debug!(rejected = reject.len(), "flush cycle drained");
        self.store.complete_flush(&mut reject, flush_start);
        oldest
    }
}
