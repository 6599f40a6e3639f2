//! Message-id assignment for outgoing requests.

use std::sync::atomic::{AtomicI64, Ordering};

/// Thread-safe, monotonically increasing counter for message ids.
///
/// The transport holds one of these and stamps every outgoing non-response
/// request on first emission; responses inherit the request's id at
/// construction. Ids start at 0 and only ever go up, so `-1` stays free as
/// the "unassigned" sentinel.
///
/// Uses a relaxed atomic: ids only need to be unique and increasing, not to
/// order memory between threads.
#[derive(Debug, Default)]
pub struct MessageIdCounter {
    next: AtomicI64,
}

impl MessageIdCounter {
    /// Creates a counter starting at 0.
    #[must_use]
    pub fn new() -> Self {
        Self { next: AtomicI64::new(0) }
    }

    /// Returns the next id and advances the counter.
    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next call to [`next`](Self::next) would hand
    /// out. Diagnostic only; another thread may claim it first.
    pub fn current(&self) -> i64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counter_starts_at_zero() {
        let counter = MessageIdCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let counter = MessageIdCounter::new();
        let values: Vec<i64> = (0..100).map(|_| counter.next()).collect();
        for window in values.windows(2) {
            assert!(window[1] > window[0]);
        }
    }

    #[test]
    fn ids_are_never_negative() {
        let counter = MessageIdCounter::new();
        for _ in 0..1000 {
            assert!(counter.next() >= 0);
        }
    }

    #[test]
    fn current_does_not_advance() {
        let counter = MessageIdCounter::new();
        counter.next();
        assert_eq!(counter.current(), 1);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let counter = Arc::new(MessageIdCounter::new());
        let threads = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || (0..per_thread).map(|_| counter.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), threads * per_thread);
    }
}
