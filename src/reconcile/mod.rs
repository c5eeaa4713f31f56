//! Convergence of the remote directory to the desired state.
//!
//! Stages run in dependency order: the role/principal catalog is resolved
//! first, then activation policies, eligibility grants and access reviews.

pub mod catalog;
pub mod eligibility;
pub mod orchestrator;
pub mod policy;
pub mod report;
pub mod review;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::desired::DesiredState;
use crate::directory::{DirectoryClient, RetryPolicy};
use crate::error::DirectoryError;

pub use catalog::Catalog;
pub use orchestrator::Orchestrator;
pub use report::{Detail, EntityKind, ItemReport, Outcome, RunReport};

/// Results that finished, plus the fatal error that stopped the rest.
#[derive(Debug)]
pub struct Batch<T> {
    pub done: Vec<T>,
    pub fatal: Option<DirectoryError>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            done: Vec::new(),
            fatal: None,
        }
    }
}

impl<T> From<Result<T, DirectoryError>> for Batch<T> {
    fn from(result: Result<T, DirectoryError>) -> Self {
        match result {
            Ok(value) => Self {
                done: vec![value],
                fatal: None,
            },
            Err(err) => Self {
                done: Vec::new(),
                fatal: Some(err),
            },
        }
    }
}

impl<T> Batch<T> {
    /// Drop the finished results if anything failed.
    pub fn into_result(self) -> Result<Vec<T>, DirectoryError> {
        match self.fatal {
            Some(err) => Err(err),
            None => Ok(self.done),
        }
    }
}

/// Per-run settings shared by every stage.
pub struct RunContext {
    /// Timestamp grant expirations and review start dates are computed from.
    pub now: DateTime<Utc>,
    pub retry: RetryPolicy,
    pub max_concurrency: usize,
    pool: Semaphore,
}

impl RunContext {
    pub fn new(retry: RetryPolicy, max_concurrency: usize, now: DateTime<Utc>) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            now,
            retry,
            max_concurrency,
            pool: Semaphore::new(max_concurrency),
        }
    }

    /// Run `tasks` with at most `max_concurrency` in flight.
    ///
    /// Results keep input order. After the first error no further task starts;
    /// tasks already running finish and their results are kept.
    pub async fn bounded<T, Fut>(&self, tasks: impl IntoIterator<Item = Fut>) -> Batch<T>
    where
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        self.bounded_batches(
            tasks
                .into_iter()
                .map(|task| async move { Batch::from(task.await) }),
        )
        .await
    }

    /// Like [`bounded`](Self::bounded) for tasks that each yield several results.
    pub async fn bounded_batches<T, Fut>(&self, tasks: impl IntoIterator<Item = Fut>) -> Batch<T>
    where
        Fut: Future<Output = Batch<T>>,
    {
        let stopped = AtomicBool::new(false);
        let stopped = &stopped;

        let batches = join_all(tasks.into_iter().map(|task| async move {
            let Ok(_permit) = self.pool.acquire().await else {
                return Batch::from(Err(DirectoryError::Unknown(
                    "worker pool closed".to_string(),
                )));
            };
            if stopped.load(Ordering::SeqCst) {
                return Batch::default();
            }
            let batch = task.await;
            if batch.fatal.is_some() {
                stopped.store(true, Ordering::SeqCst);
            }
            batch
        }))
        .await;

        let mut merged = Batch::default();
        for batch in batches {
            merged.done.extend(batch.done);
            if merged.fatal.is_none() {
                merged.fatal = batch.fatal;
            }
        }
        merged
    }
}

/// One reconciliation stage.
///
/// Item-level failures are reported as `ItemReport`s; `Batch::fatal` is
/// reserved for errors that must stop the whole run.
#[async_trait]
pub trait Reconcile: Send + Sync {
    fn kind(&self) -> EntityKind;

    async fn reconcile(
        &self,
        directory: &dyn DirectoryClient,
        desired: &DesiredState,
        catalog: &Catalog,
        ctx: &RunContext,
    ) -> Batch<ItemReport>;
}

/// Split a directory error into "stop the run" and "fail this item".
pub(crate) fn item_failure(err: DirectoryError) -> Result<String, DirectoryError> {
    if err.is_fatal() {
        Err(err)
    } else {
        Ok(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_bounded_keeps_order_and_limit() {
        let ctx = RunContext::new(RetryPolicy::immediate(1), 2, Utc::now());
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let results = ctx
            .bounded((0..6).map(|i| {
                let in_flight = &in_flight;
                let peak = &peak;
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, DirectoryError>(i * 10)
                }
            }))
            .await
            .into_result()
            .unwrap();

        assert_eq!(results, vec![0, 10, 20, 30, 40, 50]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_bounded_keeps_finished_results_on_error() {
        let ctx = RunContext::new(RetryPolicy::immediate(1), 1, Utc::now());
        let started = AtomicUsize::new(0);

        let batch = ctx
            .bounded((0..4).map(|i| {
                let started = &started;
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if i == 2 {
                        Err(DirectoryError::Unauthorized("HTTP 403".into()))
                    } else {
                        Ok(i)
                    }
                }
            }))
            .await;

        assert_eq!(batch.done, vec![0, 1]);
        assert!(matches!(batch.fatal, Some(DirectoryError::Unauthorized(_))));
        assert_eq!(started.load(Ordering::SeqCst), 3, "no task starts after the error");
    }

    #[test]
    fn test_item_failure_split() {
        assert_eq!(
            item_failure(DirectoryError::Validation("bad".into())).unwrap(),
            "Validation failed: bad"
        );
        assert!(item_failure(DirectoryError::Unauthorized("no".into())).is_err());
    }
}
