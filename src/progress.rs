//! Progress reporting for batch validation.
//!
//! Callbacks are purely observational and never affect results.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Receives coarse progress updates from the batch validator.
pub trait ValidationProgressCallback: Send + Sync {
    /// Called with groups completed so far, the total and a readable message.
    fn on_progress(&self, completed: usize, total: usize, message: &str);
}

/// Discards all updates.
pub struct NoopProgress;

impl ValidationProgressCallback for NoopProgress {
    fn on_progress(&self, _completed: usize, _total: usize, _message: &str) {}
}

impl<F> ValidationProgressCallback for F
where
    F: Fn(usize, usize, &str) + Send + Sync,
{
    fn on_progress(&self, completed: usize, total: usize, message: &str) {
        self(completed, total, message)
    }
}

/// Thread-safe counter that forwards every `interval`-th completion.
///
/// The interval is the smaller of 100 groups and 5% of the total.
pub(crate) struct ProgressTracker<'a> {
    callback: &'a dyn ValidationProgressCallback,
    total: usize,
    interval: usize,
    completed: AtomicUsize,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(callback: &'a dyn ValidationProgressCallback, total: usize) -> Self {
        let interval = (total / 20).clamp(1, 100);
        Self {
            callback,
            total,
            interval,
            completed: AtomicUsize::new(0),
        }
    }

    /// Record `n` finished groups.
    pub(crate) fn advance(&self, n: usize) {
        if n == 0 {
            return;
        }
        let before = self.completed.fetch_add(n, Ordering::Relaxed);
        let after = before + n;
        if after / self.interval > before / self.interval || after == self.total {
            let pct = if self.total > 0 {
                after as f64 / self.total as f64 * 100.0
            } else {
                100.0
            };
            let message = format!("Validated {}/{} groups ({:.1}%)", after, self.total, pct);
            self.callback.on_progress(after, self.total, &message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_tracker_reports_coarsely() {
        let seen = Mutex::new(Vec::new());
        let callback = |done: usize, _total: usize, msg: &str| {
            seen.lock().unwrap().push((done, msg.to_string()));
        };
        let tracker = ProgressTracker::new(&callback, 1000);
        for _ in 0..1000 {
            tracker.advance(1);
        }
        let seen = seen.into_inner().unwrap();
        // 5% of 1000 = 50 groups per report
        assert_eq!(seen.len(), 20);
        assert_eq!(seen.last().unwrap().0, 1000);
        assert!(seen.last().unwrap().1.contains("100.0%"));
    }

    #[test]
    fn test_tracker_caps_interval_at_100() {
        let count = AtomicUsize::new(0);
        let callback = |_: usize, _: usize, _: &str| {
            count.fetch_add(1, Ordering::Relaxed);
        };
        let tracker = ProgressTracker::new(&callback, 10_000);
        for _ in 0..10_000 {
            tracker.advance(1);
        }
        assert_eq!(count.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_noop() {
        let tracker = ProgressTracker::new(&NoopProgress, 3);
        tracker.advance(3);
    }
}
