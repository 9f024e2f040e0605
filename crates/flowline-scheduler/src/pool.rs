//! Bounded task pool.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::warn;

/// Runs at most `size` tasks at once; further tasks wait for a permit.
#[derive(Clone)]
pub struct TaskPool {
    name: &'static str,
    permits: Arc<Semaphore>,
}

impl TaskPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Returns `None` from the handle when the pool was closed before the
    /// task got a permit.
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let name = self.name;
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(pool = name, "Task pool closed, task dropped");
                return None;
            };
            Some(task.await)
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = TaskPool::new("test", 2);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                pool.spawn(async move {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }
        assert!(max_inside.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_closed_pool_drops_tasks() {
        let pool = TaskPool::new("test", 1);
        pool.close();
        assert_eq!(pool.spawn(async { 1 }).await.unwrap(), None);
    }
}
