//! Connection Limiting
//!
//! Caps the number of concurrently open sockets. Each accepted socket holds a
//! [`ConnectionGuard`] for its lifetime; dropping the guard frees the slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter of open connections with a fixed ceiling.
#[derive(Clone)]
pub struct ConnectionLimiter {
    slots: Arc<Slots>,
}

struct Slots {
    active: AtomicUsize,
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        ConnectionLimiter {
            slots: Arc::new(Slots {
                active: AtomicUsize::new(0),
                max: max_connections,
            }),
        }
    }

    /// Claims a slot, or returns `None` when the limiter is full.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let max = self.slots.max;
        self.slots
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                slots: self.slots.clone(),
            })
    }

    /// Number of slots currently held.
    pub fn active_count(&self) -> usize {
        self.slots.active.load(Ordering::Acquire)
    }

    /// The configured ceiling.
    pub fn max_connections(&self) -> usize {
        self.slots.max
    }
}

/// Holds one connection slot until dropped.
pub struct ConnectionGuard {
    slots: Arc<Slots>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.slots.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_up_to_limit() {
        let limiter = ConnectionLimiter::new(2);

        let _a = limiter.try_acquire().expect("first slot");
        let _b = limiter.try_acquire().expect("second slot");
        assert_eq!(limiter.active_count(), 2);
        assert!(limiter.try_acquire().is_none());
    }

    #[test]
    fn test_drop_frees_slot() {
        let limiter = ConnectionLimiter::new(1);
        let guard = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());

        drop(guard);
        assert_eq!(limiter.active_count(), 0);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let limiter = ConnectionLimiter::new(0);
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.max_connections(), 0);
    }

    #[test]
    fn test_never_exceeds_limit_under_contention() {
        let limiter = ConnectionLimiter::new(8);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                thread::spawn(move || {
                    let guard = limiter.try_acquire();
                    assert!(limiter.active_count() <= 8);
                    thread::sleep(Duration::from_millis(5));
                    guard.is_some()
                })
            })
            .collect();

        let acquired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert!(acquired >= 8);
        assert_eq!(limiter.active_count(), 0);
    }

    #[test]
    fn test_guard_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ConnectionGuard>();
    }
}
