//! Debounced one-shot tasks.
//!
//! A [`ScheduledTask`] holds at most one pending timer. Scheduling while a
//! timer is pending is a no-op, which is what turns a burst of watcher
//! events into a single flush. The pending flag is cleared just before the
//! task body runs, so events that arrive during a flush arm the next one.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    pending: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Run `task` after `delay` unless a run is already pending.
    /// Returns whether this call armed the timer.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let pending = self.pending.clone();
        let name = self.name;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.store(false, Ordering::Release);
            debug!(task = name, "scheduled task firing");
            task.await;
        });
        let mut slot = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(handle);
        true
    }

    /// Drop a pending run. A body that already started is aborted at its
    /// next await point.
    pub fn cancel(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.pending.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_burst_arms_once() {
        let task = ScheduledTask::new("flush");
        let runs = Arc::new(AtomicUsize::new(0));

        let mut armed = 0;
        for _ in 0..5 {
            let runs = runs.clone();
            if task.schedule(Duration::from_millis(20), async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }) {
                armed += 1;
            }
        }
        assert_eq!(armed, 1);
        assert!(task.is_pending());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!task.is_pending());

        // Re-armable once fired.
        let again = runs.clone();
        assert!(task.schedule(Duration::from_millis(10), async move {
            again.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_prevents_run() {
        let task = ScheduledTask::new("flush");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        task.schedule(Duration::from_millis(30), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        assert!(!task.is_pending());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
