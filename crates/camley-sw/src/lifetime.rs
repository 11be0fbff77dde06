//! Keeping a worker alive until background work started by an event
//! handler has finished.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::warn;

/// Collects tasks an event handler starts but does not await.
///
/// The host calls [`ExtendLifetime::settle`] before it considers the event
/// done. Clones share the same task set.
#[derive(Debug, Clone, Default)]
pub struct ExtendLifetime {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl ExtendLifetime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `work` and hold the event open until it completes. Tasks that
    /// already finished are collected first.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        reap(&mut tasks);
        tasks.spawn(work);
    }

    /// Number of tasks still running.
    pub fn pending(&self) -> usize {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        reap(&mut tasks);
        tasks.len()
    }

    /// Wait for every task registered so far, including tasks registered
    /// while waiting. Returns how many completed.
    pub async fn settle(&self) -> usize {
        let mut completed = 0;
        loop {
            let mut batch = match self.tasks.lock() {
                Ok(mut tasks) => std::mem::take(&mut *tasks),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            if batch.is_empty() {
                return completed;
            }
            while let Some(result) = batch.join_next().await {
                match result {
                    Ok(()) => completed += 1,
                    Err(e) => warn!(error = %e, "Background task did not finish"),
                }
            }
        }
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            warn!(error = %e, "Background task did not finish");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_settle_waits_for_work() {
        let lifetime = ExtendLifetime::new();
        let done = Arc::new(AtomicUsize::new(0));

        for delay in [5u64, 1, 10] {
            let done = Arc::clone(&done);
            lifetime.wait_until(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(lifetime.pending(), 3);

        assert_eq!(lifetime.settle().await, 3);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(lifetime.pending(), 0);
    }

    #[tokio::test]
    async fn test_settle_picks_up_nested_work() {
        let lifetime = ExtendLifetime::new();
        let done = Arc::new(AtomicUsize::new(0));

        let inner = lifetime.clone();
        let counter = Arc::clone(&done);
        lifetime.wait_until(async move {
            let counter = Arc::clone(&counter);
            inner.wait_until(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        assert_eq!(lifetime.settle().await, 2);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settle_empty() {
        assert_eq!(ExtendLifetime::new().settle().await, 0);
    }

    #[tokio::test]
    async fn test_finished_work_is_collected() {
        let lifetime = ExtendLifetime::new();
        for _ in 0..100 {
            lifetime.wait_until(async {});
            tokio::task::yield_now().await;
            assert!(lifetime.pending() <= 1);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(lifetime.pending(), 0);
    }
}
