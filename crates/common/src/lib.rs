//! Shared building blocks for the everstore engine: a condvar-backed sync
//! object, a thread-sharded queue, and the injected clock and CAS-stamp
//! capabilities.

mod cas;
mod clock;
mod queue;
mod sync;

pub use cas::{CasCounter, CasNotifier, DEFAULT_CAS_NOTIFICATION_FREQUENCY};
pub use clock::{Clock, ManualClock, SystemClock};
pub use queue::{ShardedQueue, DEFAULT_QUEUE_SHARDS};
pub use sync::SyncObject;
