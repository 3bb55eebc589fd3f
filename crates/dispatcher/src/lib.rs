//! A single-threaded task dispatcher.
//!
//! Tasks are scheduled callbacks ordered ready-before-sleeping, ready tasks
//! by priority, sleeping tasks by waketime. A callback's return value decides
//! its fate: `true` re-enqueues it (keeping any sleep it set on itself during
//! the run), `false` retires it. Handles are weak: once a task is killed and
//! collected, stale handles simply stop resolving.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use everstore_common::SyncObject;
use tracing::{debug, error};

/// The work a task performs on each step. Returning `true` keeps the task
/// scheduled; `false` retires it.
pub type TaskCallback = Box<dyn FnMut(&Dispatcher, &TaskId) -> bool + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskState {
    Running,
    Sleeping(Instant),
    Dead,
}

struct Task {
    name: String,
    priority: i32,
    state: Mutex<TaskState>,
    // Taken for the duration of a step so the callback can re-enter the
    // dispatcher (snooze, schedule) without holding any task lock.
    callback: Mutex<Option<TaskCallback>>,
}

impl Task {
    fn order_key(&self) -> Option<OrderKey> {
        match *self.state.lock().unwrap() {
            TaskState::Running => Some(OrderKey::Ready {
                priority: self.priority,
            }),
            TaskState::Sleeping(wake) => Some(OrderKey::Asleep { wake }),
            TaskState::Dead => None,
        }
    }
}

/// Weak handle to a scheduled task.
///
/// Killing a task and scheduling a replacement gives the replacement a fresh
/// identity; handles to the old task fail to resolve once it is collected.
#[derive(Clone)]
pub struct TaskId(Weak<Task>);

impl TaskId {
    fn upgrade(&self) -> Option<Arc<Task>> {
        self.0.upgrade()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OrderKey {
    Ready { priority: i32 },
    Asleep { wake: Instant },
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        use OrderKey::*;
        match (self, other) {
            // Max-heap: the "greatest" entry runs next.
            (Ready { priority: a }, Ready { priority: b }) => a.cmp(b),
            (Ready { .. }, Asleep { .. }) => CmpOrdering::Greater,
            (Asleep { .. }, Ready { .. }) => CmpOrdering::Less,
            (Asleep { wake: a }, Asleep { wake: b }) => b.cmp(a),
        }
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Entry {
    key: OrderKey,
    task: Arc<Task>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key.cmp(&other.key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Running,
    Stopping,
    Stopped,
}

struct DispatcherState {
    queue: BinaryHeap<Entry>,
    run_state: RunState,
}

/// Runs scheduled tasks on one background worker thread.
pub struct Dispatcher {
    sync: SyncObject<DispatcherState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sync: SyncObject::new(DispatcherState {
                queue: BinaryHeap::new(),
                run_state: RunState::Running,
            }),
            worker: Mutex::new(None),
            self_ref: weak.clone(),
        })
    }

    /// Spawn the worker thread. Tasks scheduled before `start` run once the
    /// worker comes up.
    pub fn start(&self) {
        let dispatcher = self.self_ref.upgrade().expect("dispatcher was dropped");
        let handle = thread::Builder::new()
            .name("everstore-dispatcher".to_string())
            .spawn(move || dispatcher.run())
            .expect("failed to spawn dispatcher thread");
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Schedule `callback` with the given priority, optionally delayed by
    /// `delay` seconds.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        priority: i32,
        delay: f64,
        callback: TaskCallback,
    ) -> TaskId {
        let state = if delay > 0.0 {
            TaskState::Sleeping(Instant::now() + Duration::from_secs_f64(delay))
        } else {
            TaskState::Running
        };
        let task = Arc::new(Task {
            name: name.into(),
            priority,
            state: Mutex::new(state),
            callback: Mutex::new(Some(callback)),
        });
        let key = task.order_key().expect("freshly created task cannot be dead");
        let mut guard = self.sync.lock();
        guard.queue.push(Entry {
            key,
            task: task.clone(),
        });
        drop(guard);
        self.sync.notify_all();
        TaskId(Arc::downgrade(&task))
    }

    /// Put the task to sleep until `secs` seconds from now. A task that
    /// snoozes itself during a step and returns `true` stays asleep until
    /// its waketime.
    pub fn snooze(&self, task: &TaskId, secs: f64) {
        if let Some(task) = task.upgrade() {
            let mut state = task.state.lock().unwrap();
            if *state != TaskState::Dead {
                *state = TaskState::Sleeping(Instant::now() + Duration::from_secs_f64(secs));
            }
            drop(state);
            self.sync.notify_all();
        }
    }

    /// Mark the task dead; it is dropped the next time the scheduler sees it.
    pub fn kill(&self, task: &TaskId) {
        if let Some(task) = task.upgrade() {
            *task.state.lock().unwrap() = TaskState::Dead;
            self.sync.notify_all();
        }
    }

    /// Ask the worker to stop and wait for it to exit. Pending tasks are
    /// dropped.
    pub fn stop(&self) {
        let mut guard = self.sync.lock();
        if guard.run_state == RunState::Stopped {
            return;
        }
        debug!("stopping dispatcher");
        guard.run_state = RunState::Stopping;
        self.sync.notify_all();
        while guard.run_state != RunState::Stopped {
            guard = self.sync.wait(guard);
        }
        drop(guard);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        debug!("dispatcher stopped");
    }

    fn run(&self) {
        debug!("dispatcher starting");
        let mut guard = self.sync.lock();
        while guard.run_state == RunState::Running {
            let Some(head) = guard.queue.peek() else {
                guard = self.sync.wait(guard);
                continue;
            };

            let task = head.task.clone();
            let entry_key = head.key;
            match task.order_key() {
                None => {
                    guard.queue.pop();
                }
                Some(key) if key != entry_key => {
                    // The task was resnoozed or woken while queued; repair
                    // its position.
                    guard.queue.pop();
                    guard.queue.push(Entry { key, task });
                }
                Some(OrderKey::Asleep { wake }) => {
                    let now = Instant::now();
                    if wake <= now {
                        *task.state.lock().unwrap() = TaskState::Running;
                        guard.queue.pop();
                        guard.queue.push(Entry {
                            key: OrderKey::Ready {
                                priority: task.priority,
                            },
                            task,
                        });
                    } else {
                        let (reacquired, _) = self.sync.wait_timeout(guard, wake - now);
                        guard = reacquired;
                    }
                }
                Some(OrderKey::Ready { .. }) => {
                    guard.queue.pop();
                    drop(guard);
                    let keep = self.run_task(&task);
                    guard = self.sync.lock();
                    if keep {
                        if let Some(key) = task.order_key() {
                            guard.queue.push(Entry { key, task });
                        }
                    }
                }
            }
        }

        guard.run_state = RunState::Stopped;
        drop(guard);
        self.sync.notify_all();
        debug!("dispatcher exited");
    }

    fn run_task(&self, task: &Arc<Task>) -> bool {
        let Some(mut callback) = task.callback.lock().unwrap().take() else {
            return false;
        };
        let id = TaskId(Arc::downgrade(task));
        let result = panic::catch_unwind(AssertUnwindSafe(|| callback(self, &id)));
        *task.callback.lock().unwrap() = Some(callback);
        match result {
            Ok(keep) => keep,
            Err(_) => {
                error!(task = %task.name, "task panicked; retiring it");
                false
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // The worker holds an Arc of this dispatcher, so by the time Drop
        // runs the thread has already exited or was never started.
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
