use std::sync::Mutex;

/// Invoked with the most recently allocated stamp so the seed can be
/// persisted and restored across restarts.
pub type CasNotifier = Box<dyn Fn(u64) + Send + Sync>;

pub const DEFAULT_CAS_NOTIFICATION_FREQUENCY: u64 = 10_000;

/// Process-wide allocator for compare-and-set version stamps.
///
/// Stamps are strictly increasing. Zero is never allocated; a zero CAS in a
/// request means "no CAS check". Every `frequency`th allocation reports the
/// stamp through the notifier.
pub struct CasCounter {
    counter: Mutex<u64>,
    notifier: CasNotifier,
    frequency: u64,
}

impl CasCounter {
    pub fn new(initial: u64) -> Self {
        Self::with_notifier(initial, DEFAULT_CAS_NOTIFICATION_FREQUENCY, Box::new(|_| {}))
    }

    pub fn with_notifier(initial: u64, frequency: u64, notifier: CasNotifier) -> Self {
        assert!(frequency > 0, "notification frequency must be non-zero");
        Self {
            counter: Mutex::new(initial.max(1)),
            notifier,
            frequency,
        }
    }

    pub fn next(&self) -> u64 {
        let stamp = {
            let mut counter = self.counter.lock().unwrap();
            let stamp = *counter;
            *counter += 1;
            stamp
        };
        if stamp % self.frequency == 0 {
            (self.notifier)(stamp);
        }
        stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn stamps_are_strictly_increasing() {
        let counter = CasCounter::new(1);
        let mut last = 0;
        for _ in 0..100 {
            let stamp = counter.next();
            assert!(stamp > last);
            last = stamp;
        }
    }

    #[test]
    fn zero_is_never_allocated() {
        let counter = CasCounter::new(0);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn notifier_fires_on_frequency_multiples() {
        let fired = Arc::new(AtomicU64::new(0));
        let observed = fired.clone();
        let counter = CasCounter::with_notifier(
            1,
            10,
            Box::new(move |stamp| {
                observed.store(stamp, Ordering::SeqCst);
            }),
        );
        for _ in 0..10 {
            counter.next();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }
}
