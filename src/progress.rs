//! Progress reporting and cooperative cancellation.
//!
//! Long-running ingestion and upload operations publish a stream of
//! [`ProgressSnapshot`]s through a [`ProgressTracker`], and check a shared
//! [`CancellationToken`] between bounded units of work.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// A cancellation token that can be shared across tasks.
/// When cancelled, scans and uploads stop at their next suspension point.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The phase an ingestion or upload is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Reading,
    Parsing,
    Normalizing,
    Uploading,
    Complete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Reading => "reading",
            Stage::Parsing => "parsing",
            Stage::Normalizing => "normalizing",
            Stage::Uploading => "uploading",
            Stage::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// An immutable snapshot of operation progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Bytes (or rows) processed so far.
    pub processed: u64,
    /// Total bytes (or rows), 0 when unknown.
    pub total: u64,
    /// 0.0 to 100.0; never decreases within one operation.
    pub percentage: f64,
    pub stage: Stage,
}

impl ProgressSnapshot {
    fn initial(total: u64) -> Self {
        Self {
            processed: 0,
            total,
            percentage: 0.0,
            stage: Stage::Reading,
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} | {}/{} ({:.1}%)",
            self.stage, self.processed, self.total, self.percentage
        )
    }
}

/// Publishes monotonic progress for one ingestion or upload operation.
///
/// Cloning the tracker shares the same underlying counters and channel.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    processed: AtomicU64,
    total: AtomicU64,
    started_at: Instant,
    sender: watch::Sender<ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        let (sender, _) = watch::channel(ProgressSnapshot::initial(total));
        Self {
            inner: Arc::new(TrackerInner {
                processed: AtomicU64::new(0),
                total: AtomicU64::new(total),
                started_at: Instant::now(),
                sender,
            }),
        }
    }

    /// Subscribe to snapshots. The receiver always holds the latest one.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.inner.sender.subscribe()
    }

    /// Set the total once it becomes known. Only ever grows.
    pub fn set_total(&self, total: u64) {
        self.inner.total.fetch_max(total, Ordering::AcqRel);
    }

    /// Report that `processed` units are done, in `stage`.
    ///
    /// A value lower than the last one reported is ignored so the published
    /// sequence stays non-decreasing.
    pub fn update(&self, processed: u64, stage: Stage) {
        let previous = self.inner.processed.fetch_max(processed, Ordering::AcqRel);
        let processed = previous.max(processed);
        self.publish(processed, stage);
    }

    /// Advance the processed counter by `delta`.
    pub fn advance(&self, delta: u64, stage: Stage) {
        let processed = self.inner.processed.fetch_add(delta, Ordering::AcqRel) + delta;
        self.publish(processed, stage);
    }

    /// Mark the operation complete at 100%.
    pub fn finish(&self) {
        let total = self.inner.total.load(Ordering::Acquire);
        let processed = self.inner.processed.load(Ordering::Acquire).max(total);
        self.inner.processed.store(processed, Ordering::Release);
        self.inner.sender.send_modify(|snap| {
            snap.processed = processed;
            snap.total = total.max(processed);
            snap.percentage = 100.0;
            snap.stage = Stage::Complete;
        });
    }

    /// Start a fresh pass on the same channel, e.g. a re-read after a failed
    /// attempt. Subscribers see progress restart from zero.
    pub fn restart(&self, total: u64) {
        self.inner.processed.store(0, Ordering::Release);
        self.inner.total.store(total, Ordering::Release);
        self.inner
            .sender
            .send_modify(|snap| *snap = ProgressSnapshot::initial(total));
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.inner.sender.borrow()
    }

    /// Time since the tracker was created.
    pub fn elapsed(&self) -> std::time::Duration {
        self.inner.started_at.elapsed()
    }

    fn publish(&self, processed: u64, stage: Stage) {
        let total = self.inner.total.load(Ordering::Acquire);
        let fraction = if total == 0 {
            0.0
        } else {
            (processed as f64 / total as f64).min(1.0) * 100.0
        };
        self.inner.sender.send_modify(|snap| {
            snap.processed = snap.processed.max(processed);
            snap.total = total;
            snap.percentage = snap.percentage.max(fraction);
            snap.stage = stage;
        });
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_visible_to_every_clone() {
        let upload = CancellationToken::default();
        let worker = upload.clone();
        assert!(!worker.is_cancelled());

        upload.cancel();
        upload.cancel();
        assert!(worker.is_cancelled() && upload.is_cancelled());
    }

    #[test]
    fn test_progress_percentage() {
        let progress = ProgressTracker::new(1000);
        progress.update(250, Stage::Parsing);
        let snap = progress.snapshot();
        assert_eq!(snap.processed, 250);
        assert!((snap.percentage - 25.0).abs() < 0.01);
        assert_eq!(snap.stage, Stage::Parsing);
    }

    #[test]
    fn test_progress_never_decreases() {
        let progress = ProgressTracker::new(100);
        let rx = progress.subscribe();
        progress.update(60, Stage::Parsing);
        progress.update(40, Stage::Normalizing);
        let snap = *rx.borrow();
        assert_eq!(snap.processed, 60);
        assert!((snap.percentage - 60.0).abs() < 0.01);
        assert_eq!(snap.stage, Stage::Normalizing);
    }

    #[test]
    fn test_progress_unknown_total() {
        let progress = ProgressTracker::default();
        progress.advance(10, Stage::Reading);
        assert_eq!(progress.snapshot().percentage, 0.0);
        progress.set_total(20);
        progress.advance(5, Stage::Parsing);
        assert!((progress.snapshot().percentage - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_progress_finish() {
        let progress = ProgressTracker::new(100);
        progress.update(90, Stage::Uploading);
        progress.finish();
        let snap = progress.snapshot();
        assert_eq!(snap.stage, Stage::Complete);
        assert_eq!(snap.percentage, 100.0);
        assert_eq!(snap.processed, 100);
    }

    #[test]
    fn test_restart_begins_new_pass() {
        let progress = ProgressTracker::new(100);
        let rx = progress.subscribe();
        progress.update(80, Stage::Normalizing);

        progress.restart(0);
        assert_eq!(rx.borrow().processed, 0);
        assert_eq!(rx.borrow().stage, Stage::Reading);

        progress.set_total(200);
        progress.update(20, Stage::Parsing);
        let snap = *rx.borrow();
        assert_eq!(snap.processed, 20);
        assert!((snap.percentage - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_snapshot_display() {
        let progress = ProgressTracker::new(1000);
        progress.update(500, Stage::Uploading);
        let display = progress.snapshot().to_string();
        assert!(display.contains("uploading"));
        assert!(display.contains("500/1000"));
    }
}
