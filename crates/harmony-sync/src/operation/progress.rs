//! # Progress
//!
//! Hierarchical unit counter with cooperative cancellation.
//!
//! ```text
//! sync pass              total 5
//! ├── fetch              pending 1
//! ├── conflict batch     pending 1   total 3
//! │   ├── record A       pending 1
//! │   ├── record B       pending 1
//! │   └── record C       pending 1
//! ├── delete batch       pending 1   total 1
//! │   └── record D       pending 1   total 3
//! │       ├── files      pending 2
//! │       └── remote     pending 1
//! ...
//! ```
//!
//! A parent's fraction is its own completed units plus each child's
//! fraction weighted by the units the child stands for. Cancelling a parent
//! cancels every child, including children attached later.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct ProgressInner {
    total: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicBool,
    children: Mutex<Vec<(Progress, u64)>>,
    notify: Notify,
}

/// Shared progress handle. Clones observe and control the same progress.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

impl Progress {
    pub fn new(total_unit_count: u64) -> Self {
        let progress = Progress::default();
        progress.set_total_unit_count(total_unit_count);
        progress
    }

    pub fn total_unit_count(&self) -> u64 {
        self.inner.total.load(Ordering::Acquire)
    }

    pub fn set_total_unit_count(&self, total: u64) {
        self.inner.total.store(total, Ordering::Release);
    }

    pub fn completed_unit_count(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn set_completed_unit_count(&self, completed: u64) {
        self.inner.completed.store(completed, Ordering::Release);
    }

    /// Adds `units` to the completed count.
    pub fn advance(&self, units: u64) {
        self.inner.completed.fetch_add(units, Ordering::AcqRel);
    }

    /// Marks every unit completed.
    pub fn complete(&self) {
        self.set_completed_unit_count(self.total_unit_count());
    }

    /// Attaches `child` as standing for `pending_unit_count` of this
    /// progress's units. A child attached to a cancelled parent is cancelled
    /// immediately.
    pub fn add_child(&self, child: &Progress, pending_unit_count: u64) {
        self.children()
            .push((child.clone(), pending_unit_count));

        if self.is_cancelled() {
            child.cancel();
        }
    }

    /// Completed fraction in `0.0..=1.0`.
    pub fn fraction_completed(&self) -> f64 {
        let total = self.total_unit_count();
        if total == 0 {
            return if self.completed_unit_count() > 0 { 1.0 } else { 0.0 };
        }

        let children: f64 = self
            .children()
            .iter()
            .map(|(child, pending)| child.fraction_completed() * *pending as f64)
            .sum();

        ((self.completed_unit_count() as f64 + children) / total as f64).min(1.0)
    }

    pub fn is_finished(&self) -> bool {
        self.fraction_completed() >= 1.0
    }

    /// Requests cancellation of this progress and all of its children.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.notify.notify_waiters();

        let children: Vec<Progress> = self
            .children()
            .iter()
            .map(|(child, _)| child.clone())
            .collect();
        for child in children {
            child.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once this progress is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn children(&self) -> std::sync::MutexGuard<'_, Vec<(Progress, u64)>> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_weighted_fraction() {
        let parent = Progress::new(3);
        let files = Progress::new(4);
        let remote = Progress::new(1);
        parent.add_child(&files, 2);
        parent.add_child(&remote, 1);

        files.advance(2);
        assert!((parent.fraction_completed() - 1.0 / 3.0).abs() < 1e-9);

        files.complete();
        remote.complete();
        assert!(parent.is_finished());
    }

    #[test]
    fn test_cancel_cascades_to_children() {
        let parent = Progress::new(2);
        let child = Progress::new(1);
        parent.add_child(&child, 1);

        parent.cancel();
        assert!(child.is_cancelled());

        let late = Progress::new(1);
        parent.add_child(&late, 1);
        assert!(late.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_cancel_parent() {
        let parent = Progress::new(1);
        let child = Progress::new(1);
        parent.add_child(&child, 1);

        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let progress = Progress::new(1);
        let waiter = {
            let progress = progress.clone();
            tokio::spawn(async move { progress.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        progress.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
