//! A per-path async mutex with FIFO waiters (§4.I), backing [`crate::locked_fs::LockedFs`].
//!
//! Keyed by path string rather than one mutex per filesystem: `lock` either
//! finds no entry (grants immediately) or joins the existing waiter queue.
//! `unlock` hands the lock to the next waiter, scheduled across a task
//! boundary via `tokio::task::yield_now` so a lock re-acquired immediately
//! after release runs after the releasing task has actually finished,
//! rather than reentrantly on its own stack.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::oneshot;

/// A guard that releases its path's lock on drop.
#[must_use]
pub struct PathGuard {
    path: String,
    mutex: Arc<PathMutexInner>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.mutex.unlock(&self.path);
    }
}

struct PathMutexInner {
    queues: SyncMutex<HashMap<String, VecDeque<oneshot::Sender<()>>>>,
}

impl PathMutexInner {
    fn unlock(&self, path: &str) {
        let next = {
            let mut queues = self.queues.lock();
            match queues.get_mut(path) {
                Some(queue) => {
                    let next = queue.pop_front();
                    if queue.is_empty() {
                        queues.remove(path);
                    }
                    next
                }
                None => None,
            }
        };
        if let Some(waiter) = next {
            let _ = waiter.send(());
        }
    }
}

/// Keyed per-path mutex.
#[derive(Clone)]
pub struct PathMutex {
    inner: Arc<PathMutexInner>,
}

impl Default for PathMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl PathMutex {
    /// A fresh, empty mutex table.
    pub fn new() -> Self {
        PathMutex {
            inner: Arc::new(PathMutexInner { queues: SyncMutex::new(HashMap::new()) }),
        }
    }

    /// Acquire the lock on `path`, waiting in FIFO order behind any
    /// current holder and queued waiters.
    pub async fn lock(&self, path: &str) -> PathGuard {
        let wait = {
            let mut queues = self.inner.queues.lock();
            match queues.get_mut(path) {
                Some(queue) => {
                    let (tx, rx) = oneshot::channel();
                    queue.push_back(tx);
                    Some(rx)
                }
                None => {
                    queues.insert(path.to_string(), VecDeque::new());
                    None
                }
            }
        };
        if let Some(rx) = wait {
            let _ = rx.await;
            // Yield once so a releaser's own `unlock` call (and anything
            // else queued on its task) completes before we run, per §4.I.
            tokio::task::yield_now().await;
        }
        PathGuard { path: path.to_string(), mutex: self.inner.clone() }
    }

    /// Acquire `path` only if it is not already held; does not wait.
    pub fn try_lock(&self, path: &str) -> Option<PathGuard> {
        let mut queues = self.inner.queues.lock();
        if queues.contains_key(path) {
            None
        } else {
            queues.insert(path.to_string(), VecDeque::new());
            Some(PathGuard { path: path.to_string(), mutex: self.inner.clone() })
        }
    }

    /// Whether `path` is currently held (or has waiters queued on it).
    pub fn is_locked(&self, path: &str) -> bool {
        self.inner.queues.lock().contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn second_lock_waits_for_first_to_drop() {
        let mutex = PathMutex::new();
        let order = Arc::new(SyncMutex::new(Vec::new()));

        let guard = mutex.lock("/a").await;
        assert!(mutex.is_locked("/a"));

        let mutex2 = mutex.clone();
        let order2 = order.clone();
        let waiter = tokio::spawn(async move {
            let _g = mutex2.lock("/a").await;
            order2.lock().push(2);
        });

        tokio::task::yield_now().await;
        order.lock().push(1);
        drop(guard);
        waiter.await.unwrap();

        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unrelated_paths_do_not_contend() {
        let mutex = PathMutex::new();
        let _a = mutex.lock("/a").await;
        let b = mutex.lock("/b").await;
        drop(b);
        assert!(mutex.is_locked("/a"));
        assert!(!mutex.is_locked("/b"));
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let mutex = PathMutex::new();
        let _guard = mutex.lock("/a").await;
        assert!(mutex.try_lock("/a").is_none());
    }

    #[tokio::test]
    async fn lock_is_released_after_drop() {
        let mutex = PathMutex::new();
        let counter = Arc::new(AtomicU32::new(0));
        {
            let _guard = mutex.lock("/a").await;
            counter.fetch_add(1, Ordering::SeqCst);
        }
        assert!(!mutex.is_locked("/a"));
    }
}
