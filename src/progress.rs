use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Simulation,
    Mcmc,
}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Progress {
    pub phase: Phase,
    pub finished: usize,
    pub total: usize,
    pub elapsed: Duration,
}

/// Receives progress reports at most once per `rate`, plus one final report
/// when a phase completes.
pub struct ProgressCallback {
    pub callback: Box<dyn Fn(&Progress) + Send + Sync>,
    pub rate: Duration,
}

/// Thread safe progress counter for one phase.
pub(crate) struct ProgressTracker<'a> {
    callback: Option<&'a ProgressCallback>,
    phase: Phase,
    total: usize,
    finished: AtomicUsize,
    start: Instant,
    last_report: Mutex<Instant>,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(callback: Option<&'a ProgressCallback>, phase: Phase, total: usize) -> Self {
        let start = Instant::now();
        Self {
            callback,
            phase,
            total,
            finished: AtomicUsize::new(0),
            start,
            last_report: Mutex::new(start),
        }
    }

    fn report(&self, callback: &ProgressCallback, finished: usize) {
        (callback.callback)(&Progress {
            phase: self.phase,
            finished,
            total: self.total,
            elapsed: self.start.elapsed(),
        });
    }

    pub(crate) fn advance(&self) {
        let finished = self.finished.fetch_add(1, Ordering::Relaxed) + 1;
        let Some(callback) = self.callback else {
            return;
        };
        // Skip instead of waiting if another worker is reporting right now.
        if let Ok(mut last) = self.last_report.try_lock() {
            if last.elapsed() >= callback.rate {
                *last = Instant::now();
                drop(last);
                self.report(callback, finished);
            }
        }
    }

    pub(crate) fn finish(&self) {
        if let Some(callback) = self.callback {
            self.report(callback, self.finished.load(Ordering::Relaxed));
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn final_report_counts_everything() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_inner = seen.clone();
        let callback = ProgressCallback {
            callback: Box::new(move |progress: &Progress| {
                seen_inner.lock().unwrap().push(progress.finished)
            }),
            rate: Duration::ZERO,
        };
        let tracker = ProgressTracker::new(Some(&callback), Phase::Simulation, 5);
        for _ in 0..5 {
            tracker.advance();
        }
        tracker.finish();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&5));
        assert!(seen.len() >= 2);
    }
}
