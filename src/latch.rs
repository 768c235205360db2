//! Countdown latch for observing pipeline throughput.
//!
//! A [`CountDownLatch`] starts at a fixed count; every call to
//! [`CountDownLatch::count_down`] decrements it until it reaches zero, at
//! which point all waiters are released.
//!
//! # Examples
//!
//! ```
//! use cdc_interceptor::latch::CountDownLatch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let latch = CountDownLatch::new(2);
//! latch.count_down();
//! latch.count_down();
//! latch.wait().await;
//! assert_eq!(latch.count(), 0);
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
pub struct CountDownLatch {
    count: AtomicUsize,
    released: Notify,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            released: Notify::new(),
        }
    }

    /// Decrements the count, saturating at zero.
    pub fn count_down(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        if previous == Ok(1) {
            self.released.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Waits until the count reaches zero.
    pub async fn wait(&self) {
        loop {
            let released = self.released.notified();
            if self.count() == 0 {
                return;
            }
            released.await;
        }
    }

    /// Waits at most `timeout`; returns whether the latch was released.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_count_down_saturates() {
        let latch = CountDownLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_released_from_other_task() {
        let latch = Arc::new(CountDownLatch::new(3));
        let worker = latch.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                worker.count_down();
            }
        });
        assert!(latch.wait_timeout(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_wait_timeout_expires() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(20)).await);
        assert_eq!(latch.count(), 1);
    }

    #[tokio::test]
    async fn test_zero_latch_is_open() {
        CountDownLatch::new(0).wait().await;
    }
}
