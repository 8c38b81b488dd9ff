use std::{future::Future, sync::Arc, time::Duration};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{CancelReason, MintlabError, MintlabResult, SystemError};

/// Bounded pool for per-alert and per-mint jobs.
///
/// Concurrency is a semaphore; the external-API budget is shared separately
/// through [`crate::market_data::budget::ApiBudget`], so workers park on an
/// empty budget rather than fail. Cancellation propagates from the
/// experiment root: a fired token aborts every in-flight task with a
/// distinguished `Cancelled` error, and per-task timeouts cancel only the
/// task that overran.
///
/// Results come back in task-submission order regardless of completion
/// order, so downstream aggregation is independent of the worker count.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(workers: usize, cancel: CancellationToken) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every task under the concurrency bound with a per-task timeout.
    ///
    /// The first hard error aborts the run (sibling tasks are cancelled via
    /// the shared token when the caller drops/cancels); per-task timeouts
    /// surface as `Cancelled { AlertTimeout }`.
    pub async fn run_all<T, F, Fut>(
        &self,
        tasks: Vec<F>,
        per_task_timeout: Duration,
    ) -> MintlabResult<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = MintlabResult<T>> + Send + 'static,
    {
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let semaphore = self.semaphore.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| SystemError::WorkerPool("semaphore closed".to_string()))?;

                if cancel.is_cancelled() {
                    return Err(MintlabError::Cancelled {
                        reason: CancelReason::UserRequested,
                    });
                }

                let work = task(cancel.clone());
                tokio::select! {
                    result = tokio::time::timeout(per_task_timeout, work) => {
                        match result {
                            Ok(inner) => inner,
                            Err(_) => {
                                warn!("per-task timeout hit");
                                Err(MintlabError::Cancelled {
                                    reason: CancelReason::AlertTimeout,
                                })
                            }
                        }
                    }
                    _ = cancel.cancelled() => Err(MintlabError::Cancelled {
                        reason: CancelReason::UserRequested,
                    }),
                }
            }));
        }

        // Join in submission order: output order is deterministic.
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = handle
                .await
                .map_err(|e| SystemError::WorkerPool(format!("worker panicked: {e}")))??;
            results.push(result);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn results_keep_submission_order() {
        let pool = WorkerPool::new(4, CancellationToken::new());
        let tasks: Vec<_> = (0..8u64)
            .map(|i| {
                move |_cancel: CancellationToken| async move {
                    // Later tasks finish earlier.
                    tokio::time::sleep(Duration::from_millis(80 - i * 10)).await;
                    Ok(i)
                }
            })
            .collect();

        let results = pool
            .run_all(tasks, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(results, (0..8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(2, CancellationToken::new());
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let live = live.clone();
                let peak = peak.clone();
                move |_cancel: CancellationToken| async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();

        pool.run_all(tasks, Duration::from_secs(5)).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn per_task_timeout_is_cancelled_with_reason() {
        let pool = WorkerPool::new(2, CancellationToken::new());
        let tasks = vec![|_cancel: CancellationToken| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }];

        let err = pool
            .run_all(tasks, Duration::from_millis(20))
            .await
            .unwrap_err();
        match err {
            MintlabError::Cancelled { reason } => {
                assert_eq!(reason, CancelReason::AlertTimeout)
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn root_cancellation_aborts_in_flight_tasks() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(2, cancel.clone());
        let tasks: Vec<_> = (0..3)
            .map(|_| {
                |task_cancel: CancellationToken| async move {
                    task_cancel.cancelled().await;
                    Err::<(), _>(MintlabError::Cancelled {
                        reason: CancelReason::UserRequested,
                    })
                }
            })
            .collect();

        let pool_run = pool.run_all(tasks, Duration::from_secs(30));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = pool_run.await.unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }
}
