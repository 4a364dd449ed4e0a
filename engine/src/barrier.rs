//! Counting join barrier over scan delegates.
//!
//! The orchestrator creates one barrier per transfer, initialized to the
//! number of top-level delegates it dispatched. Every delegate arrives
//! exactly once, whether it finished, failed, timed out or was cancelled.
//! `wait` suspends until the count reaches zero.

use tokio::sync::watch;

#[derive(Debug)]
pub struct DelegateBarrier {
    expected: usize,
    remaining: watch::Sender<usize>,
}

impl DelegateBarrier {
    pub fn new(expected: usize) -> Self {
        let (remaining, _) = watch::channel(expected);
        DelegateBarrier {
            expected,
            remaining,
        }
    }

    /// Mark one delegate as done. Returns how many are still outstanding.
    /// Arrivals past zero are ignored.
    pub fn arrive(&self) -> usize {
        let mut left = 0;
        self.remaining.send_modify(|remaining| {
            *remaining = remaining.saturating_sub(1);
            left = *remaining;
        });
        left
    }

    /// Suspend until every expected delegate has arrived.
    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        // The sender is owned by `self`, so the channel cannot close here.
        let _ = rx.wait_for(|remaining| *remaining == 0).await;
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    pub fn completed(&self) -> usize {
        self.expected - self.remaining()
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_for_zero_delegates() {
        let barrier = DelegateBarrier::new(0);
        tokio::time::timeout(Duration::from_secs(1), barrier.wait())
            .await
            .expect("barrier with no delegates should not block");
        assert!(barrier.is_complete());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_delegates_arrive() {
        let barrier = Arc::new(DelegateBarrier::new(3));

        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait().await })
        };

        assert_eq!(barrier.arrive(), 2);
        assert_eq!(barrier.arrive(), 1);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert_eq!(barrier.completed(), 2);

        assert_eq!(barrier.arrive(), 0);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .expect("waiter task panicked");
    }

    #[test]
    fn test_extra_arrivals_saturate() {
        let barrier = DelegateBarrier::new(1);
        assert_eq!(barrier.arrive(), 0);
        assert_eq!(barrier.arrive(), 0);
        assert_eq!(barrier.completed(), 1);
    }
}
