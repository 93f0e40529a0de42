//! Coroutine-style synchronization primitives, ported from the original's
//! stackful-coroutine runtime (spec.md §4.9) onto `tokio`.
//!
//! `WaitCondition`/`SuccessCondition` are scoped lock handles: a caller
//! takes one [Lock] per spawned attempt before the attempt starts, and
//! releases it either implicitly as a failure (drop) or explicitly via
//! [Lock::release]. `wait_for_success` resolves as soon as any lock
//! releases `true`, or once every lock has released. `AsyncQueue` is a
//! bounded MPMC queue with a per-item error channel, the shape the original
//! uses between the multiplexer's receive task and its consumer loops.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};

struct Shared {
    notify: Notify,
    outstanding: AtomicUsize,
    succeeded: AtomicBool,
}

/// A scoped lock taken before spawning one attempt under a
/// [SuccessCondition]. Dropping without calling [Lock::release] counts as a
/// failed attempt.
pub struct Lock {
    shared: Arc<Shared>,
    released: bool,
}

impl Lock {
    /// Release this lock, reporting whether the guarded attempt succeeded.
    pub fn release(mut self, success: bool) {
        self.release_inner(success);
    }

    fn release_inner(&mut self, success: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if success {
            self.shared.succeeded.store(true, Ordering::SeqCst);
        }
        self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.release_inner(false);
    }
}

/// Coordinates N concurrently-spawned attempts at the same goal: resolves
/// as soon as one releases its [Lock] with `true`, or once every
/// outstanding lock has released.
pub struct SuccessCondition {
    shared: Arc<Shared>,
}

impl SuccessCondition {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                notify: Notify::new(),
                outstanding: AtomicUsize::new(0),
                succeeded: AtomicBool::new(false),
            }),
        }
    }

    /// Take a lock before spawning one attempt.
    pub fn lock(&self) -> Lock {
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        Lock { shared: Arc::clone(&self.shared), released: false }
    }

    /// Resolve once any outstanding lock releases `true`, or once all have
    /// released; returns whether any attempt succeeded.
    pub async fn wait_for_success(&self) -> bool {
        loop {
            // Register as a waiter before checking state, so a release()
            // that runs concurrently can't notify_waiters() into a gap
            // between our check and our await (tokio::sync::Notify's
            // documented safe-ordering pattern).
            let notified = self.shared.notify.notified();
            if self.shared.succeeded.load(Ordering::SeqCst) {
                return true;
            }
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return false;
            }
            notified.await;
        }
    }
}

impl Default for SuccessCondition {
    fn default() -> Self {
        Self::new()
    }
}

/// `WaitCondition` is the degenerate case of [SuccessCondition] that only
/// cares about every attempt having finished, not whether any succeeded.
pub type WaitCondition = SuccessCondition;

/// Bounded MPMC queue with a per-item error channel: each pushed item
/// carries its own oneshot a consumer uses to report back whether handling
/// it failed.
pub struct AsyncQueue<T> {
    tx: mpsc::Sender<(T, oneshot::Sender<Result<(), String>>)>,
    rx: AsyncMutex<mpsc::Receiver<(T, oneshot::Sender<Result<(), String>>)>>,
}

impl<T> AsyncQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { tx, rx: AsyncMutex::new(rx) }
    }

    /// Push an item, returning a receiver that resolves with whatever
    /// outcome a consumer reports after processing it.
    pub async fn push(&self, item: T) -> oneshot::Receiver<Result<(), String>> {
        let (err_tx, err_rx) = oneshot::channel();
        let _ = self.tx.send((item, err_tx)).await;
        err_rx
    }

    /// Pop the next item along with the channel to report its outcome on.
    pub async fn pop(&self) -> Option<(T, oneshot::Sender<Result<(), String>>)> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn success_condition_resolves_on_first_success() {
        let cond = Arc::new(SuccessCondition::new());

        let a = cond.lock();
        let b = cond.lock();

        let waiter = {
            let cond = Arc::clone(&cond);
            tokio::spawn(async move { cond.wait_for_success().await })
        };

        a.release(false);
        b.release(true);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn success_condition_resolves_false_once_all_fail() {
        let cond = Arc::new(SuccessCondition::new());
        let a = cond.lock();
        let b = cond.lock();

        let waiter = {
            let cond = Arc::clone(&cond);
            tokio::spawn(async move { cond.wait_for_success().await })
        };

        drop(a);
        drop(b);

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn async_queue_roundtrips_and_reports_error() {
        let queue = Arc::new(AsyncQueue::new(4));

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let (item, err_tx): (u32, _) = queue.pop().await.unwrap();
                assert_eq!(item, 7);
                let _ = err_tx.send(Err("boom".to_string()));
            })
        };

        let err_rx = queue.push(7u32).await;
        consumer.await.unwrap();
        assert_eq!(err_rx.await.unwrap(), Err("boom".to_string()));
    }
}
