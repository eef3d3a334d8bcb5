//! Bounded worker pool

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Runs a closed batch of jobs with at most `width` in flight and returns
/// exactly one result per job
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    width: usize,
}

impl WorkerPool {
    pub fn new(width: usize) -> Self {
        Self { width: width.max(1) }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Results arrive in completion order, not submission order
    pub async fn run<I, F, Fut>(&self, items: I, job: F) -> Vec<Fut::Output>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future,
    {
        stream::iter(items)
            .map(job)
            .buffer_unordered(self.width)
            .collect()
            .await
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded_and_complete() {
        let pool = WorkerPool::new(3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = pool
            .run(0..20u64, |i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    i * 2
                }
            })
            .await;

        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let mut sorted = results;
        sorted.sort();
        assert_eq!(sorted, (0..20u64).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_width_is_clamped() {
        assert_eq!(WorkerPool::new(0).width(), 1);
    }
}
