//! Fan-out helper for independent async operations.
//!
//! Tasks are spawned onto the tokio runtime together, at most
//! [`MAX_CONCURRENT_TASKS`] running at once, and all of them are awaited
//! before returning. Results come back in submission order, so callers can
//! zip them with whatever produced the tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Upper bound on tasks running at the same time.
pub const MAX_CONCURRENT_TASKS: usize = 16;

/// A boxed, spawnable unit of work.
pub type Task<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Box a future into a [`Task`].
pub fn task<T, F>(future: F) -> Task<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
{
    Box::pin(future)
}

/// Run all tasks concurrently. The first failure (in submission order) is
/// returned, but only after every task has finished.
pub async fn run_in_parallel<T>(tasks: Vec<Task<T>>) -> Result<Vec<T>>
where
    T: Send + 'static,
{
    run_all(tasks).await.into_iter().collect()
}

/// Run all tasks concurrently, turning failures into `None`.
pub async fn run_in_parallel_allow_failures<T>(tasks: Vec<Task<T>>) -> Vec<Option<T>>
where
    T: Send + 'static,
{
    run_all(tasks)
        .await
        .into_iter()
        .enumerate()
        .map(|(i, result)| match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(task = i, error = %e, "parallel task failed");
                None
            }
        })
        .collect()
}

async fn run_all<T>(tasks: Vec<Task<T>>) -> Vec<Result<T>>
where
    T: Send + 'static,
{
    let count = tasks.len();
    let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_TASKS));
    let mut set = JoinSet::new();
    for (i, t) in tasks.into_iter().enumerate() {
        let permits = Arc::clone(&permits);
        set.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => t.await,
                Err(e) => Err(e.into()),
            };
            (i, result)
        });
    }

    let mut slots: Vec<Option<Result<T>>> = (0..count).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((i, result)) => slots[i] = Some(result),
            // The slot stays empty and is reported below.
            Err(e) => warn!(error = %e, "parallel task did not complete"),
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(anyhow!("parallel task panicked or was cancelled"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let tasks: Vec<Task<u64>> = (0..5u64)
            .map(|i| {
                task(async move {
                    // Later tasks finish first.
                    tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                    Ok(i)
                })
            })
            .collect();
        let results = run_in_parallel(tasks).await.unwrap();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_any_failure_aborts() {
        let tasks: Vec<Task<u32>> = vec![
            task(async { Ok(1) }),
            task(async { Err(anyhow!("boom")) }),
            task(async { Ok(3) }),
        ];
        let err = run_in_parallel(tasks).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_allow_failures_keeps_positions() {
        let tasks: Vec<Task<u32>> = vec![
            task(async { Ok(1) }),
            task(async { Err(anyhow!("boom")) }),
            task(async { Ok(3) }),
        ];
        let results = run_in_parallel_allow_failures(tasks).await;
        assert_eq!(results, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test]
    async fn test_panicking_task_reported_as_failure() {
        let tasks: Vec<Task<u32>> = vec![
            task(async { Ok(1) }),
            task(async {
                if true {
                    panic!("task exploded");
                }
                Ok(2)
            }),
        ];
        let results = run_in_parallel_allow_failures(tasks).await;
        assert_eq!(results, vec![Some(1), None]);
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task<usize>> = (0..MAX_CONCURRENT_TASKS * 3)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                task(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
            })
            .collect();
        let results = run_in_parallel(tasks).await.unwrap();
        assert_eq!(results.len(), MAX_CONCURRENT_TASKS * 3);
        assert_eq!(results[7], 7);
        assert!(peak.load(Ordering::SeqCst) <= MAX_CONCURRENT_TASKS);
    }

    #[tokio::test]
    async fn test_empty_task_list() {
        let results: Vec<u32> = run_in_parallel(Vec::new()).await.unwrap();
        assert!(results.is_empty());
    }
}
