//! Bounded admission gate for server-mode sessions.
//!
//! A long-lived process can run many encrypt sessions, but each session
//! pins provider quota (an instance, several disks) for its whole life, so
//! admission is bounded by a counting semaphore: at most N sessions
//! provision concurrently, and the (N+1)-th submission waits for a slot.
//! Closing the pool stops admitting new sessions while in-flight ones run
//! to their natural cleanup.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Errors raised when submitting a session to the pool.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PoolError {
    /// Raised when the pool has been closed to new sessions.
    #[error("session pool is closed to new sessions")]
    Closed,
}

/// Counting admission gate over concurrently running sessions.
pub struct SessionPool {
    permits: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
}

impl SessionPool {
    /// Creates a pool admitting at most `size` concurrent sessions.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Submits a session, waiting for a free slot when the pool is
    /// saturated, then runs it on a worker task.
    ///
    /// The returned handle resolves to the session's own output; the permit
    /// is held until the session future completes, cleanup included.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] when [`SessionPool::close`] has been
    /// called.
    pub async fn submit<F, T>(&self, session_id: String, work: F) -> Result<JoinHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        debug!("session {session_id}: waiting for a pool slot");
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        info!("session {session_id}: admitted");
        Ok(tokio::spawn(async move {
            let result = work.await;
            drop(permit);
            result
        }))
    }

    /// Stops admitting new sessions. In-flight sessions are unaffected.
    pub fn close(&self) {
        info!("session pool closed to new sessions");
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Number of free slots right now.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn pool_never_exceeds_its_size() {
        let pool = SessionPool::new(2);
        let (release_tx1, release_rx1) = oneshot::channel::<()>();
        let (release_tx2, release_rx2) = oneshot::channel::<()>();

        let first = pool
            .submit(String::from("s1"), async move {
                release_rx1.await.ok();
            })
            .await
            .expect("first admitted");
        let second = pool
            .submit(String::from("s2"), async move {
                release_rx2.await.ok();
            })
            .await
            .expect("second admitted");
        assert_eq!(pool.available_slots(), 0);

        // A third submission must block until a slot frees.
        let third = tokio::time::timeout(
            Duration::from_millis(50),
            pool.submit(String::from("s3"), async {}),
        )
        .await;
        assert!(third.is_err(), "third session should wait for a slot");

        release_tx1.send(()).ok();
        first.await.expect("first finishes");
        let admitted = tokio::time::timeout(
            Duration::from_secs(1),
            pool.submit(String::from("s3"), async {}),
        )
        .await
        .expect("slot should free up")
        .expect("admitted");
        admitted.await.expect("third finishes");

        release_tx2.send(()).ok();
        second.await.expect("second finishes");
    }

    #[tokio::test]
    async fn closed_pool_rejects_new_sessions() {
        let pool = SessionPool::new(1);
        pool.close();
        let err = pool
            .submit(String::from("s1"), async {})
            .await
            .expect_err("closed pool rejects");
        assert_eq!(err, PoolError::Closed);
    }

    #[tokio::test]
    async fn in_flight_sessions_survive_close() {
        let pool = SessionPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let handle = pool
            .submit(String::from("s1"), async move {
                release_rx.await.ok();
                42
            })
            .await
            .expect("admitted");
        pool.close();
        release_tx.send(()).ok();
        assert_eq!(handle.await.expect("join"), 42);
    }
}
