use std::future::Future;

use futures::{StreamExt, TryStreamExt};

use crate::error::Result;

/// Concurrency used by adapters while enumerating repositories.
pub const MAX_CONCURRENCY: usize = 8;

/// Runs at most `limit` tasks at a time, keeping input order and stopping at
/// the first error.
#[derive(Debug, Clone, Copy)]
pub struct LimitedRunner {
    limit: usize,
}

impl Default for LimitedRunner {
    fn default() -> Self {
        LimitedRunner::new(MAX_CONCURRENCY)
    }
}

impl LimitedRunner {
    pub fn new(limit: usize) -> LimitedRunner {
        LimitedRunner {
            limit: limit.max(1),
        }
    }

    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, task: F) -> Result<Vec<R>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        futures::stream::iter(items.into_iter().map(task))
            .buffered(self.limit)
            .try_collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runner_bounds_concurrency_and_keeps_order() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runner = LimitedRunner::new(2);
        let out = runner
            .run((0..6).collect(), |i: u64| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10 * (6 - i))).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i * 10)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, vec![0, 10, 20, 30, 40, 50]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_runner_returns_first_error() {
        let runner = LimitedRunner::default();
        let r = runner
            .run(vec![1, 2, 3], |i: u32| async move {
                if i == 2 {
                    Err(Error::Internal("boom".to_string()))
                } else {
                    Ok(i)
                }
            })
            .await;
        assert!(matches!(r, Err(Error::Internal(_))));
    }
}
