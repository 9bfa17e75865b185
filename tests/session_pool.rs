//! Concurrency-bound tests for the server-mode session pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use brkt_imager::SessionPool;

#[tokio::test]
async fn concurrent_sessions_never_exceed_the_pool_size() {
    const POOL_SIZE: usize = 3;
    const SESSIONS: usize = 12;

    let pool = SessionPool::new(POOL_SIZE);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for index in 0..SESSIONS {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let handle = pool
            .submit(format!("s{index}"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await
            .expect("session admitted");
        handles.push(handle);
    }
    for handle in handles {
        handle.await.expect("session finishes");
    }

    assert!(
        peak.load(Ordering::SeqCst) <= POOL_SIZE,
        "observed {} concurrent sessions with a pool of {POOL_SIZE}",
        peak.load(Ordering::SeqCst)
    );
    assert_eq!(pool.available_slots(), POOL_SIZE);
}
