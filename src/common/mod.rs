pub(crate) mod log;

use std::sync::atomic::{AtomicU32, Ordering};

/// A monotonically increasing `u32` counter.
///
/// Wraps past `u32::MAX` back to 1, never to 0, so that 0 can serve as an
/// "unset" sentinel wherever the counter's values are stored.
#[derive(Debug, Default)]
pub(crate) struct Counter {
    n: AtomicU32,
}

impl Counter {
    pub(crate) fn new() -> Counter {
        Counter { n: AtomicU32::new(0) }
    }

    /// Returns the next value in the sequence.
    pub(crate) fn next(&self) -> u32 {
        let prev = self
            .n
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(if v == u32::MAX { 1 } else { v + 1 })
            })
            .expect("counter update never fails");
        if prev == u32::MAX {
            1
        } else {
            prev + 1
        }
    }

    /// The most recently issued value, or 0 if none has been issued yet.
    pub(crate) fn last(&self) -> u32 {
        self.n.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::Counter;
    use std::sync::atomic::Ordering;

    #[test]
    fn counter_starts_at_one() {
        let c = Counter::new();
        assert_eq!(c.last(), 0);
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        assert_eq!(c.last(), 2);
    }

    #[test]
    fn counter_wraps_to_one() {
        let c = Counter::new();
        c.n.store(u32::MAX - 1, Ordering::Release);
        assert_eq!(c.next(), u32::MAX);
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
    }
}
