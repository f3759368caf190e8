//! Bounded, rate-limit-aware queue for remote calls
//!
//! One queue exists per request. Admission is first come, first served
//! (tokio's semaphore is fair); completion order is whatever the remote
//! gives us. An error from one task is returned only to the caller that
//! submitted it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::rate_limit::RateLimitGuard;
use crate::error::{Error, Result};

/// Default number of remote calls in flight per request.
pub const DEFAULT_CONCURRENCY: usize = 8;

pub struct RequestQueue {
    permits: Semaphore,
    concurrency: usize,
    guard: Arc<RateLimitGuard>,
    cancel: CancellationToken,
    completed: AtomicU64,
}

impl RequestQueue {
    pub fn new(concurrency: usize, guard: Arc<RateLimitGuard>, cancel: CancellationToken) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Semaphore::new(concurrency),
            concurrency,
            guard,
            cancel,
            completed: AtomicU64::new(0),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn guard(&self) -> &RateLimitGuard {
        &self.guard
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Tasks that ran to completion (successfully or not).
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Run `task` once a slot is free and the quota allows it.
    ///
    /// Returns `Cancelled` without running the task when the request has
    /// been cancelled, including while waiting for a slot.
    pub async fn add<T, F, Fut>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.permits.acquire() => {
                permit.map_err(|_| Error::Internal("request queue closed".to_string()))?
            }
        };

        self.guard.admit(&self.cancel).await?;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = task().await;
        self.guard.consume(1).await;
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Err(e) = &result {
            debug!("Queued remote call {} failed: {}", done, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::rate_limit::{RateLimitSettings, WaitPolicy};
    use crate::remote::testing::ScriptedRemote;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn queue(concurrency: usize, remote: Arc<ScriptedRemote>, policy: WaitPolicy) -> Arc<RequestQueue> {
        let guard = Arc::new(RateLimitGuard::new(
            remote,
            RateLimitSettings {
                policy,
                max_wait: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        Arc::new(RequestQueue::new(concurrency, guard, CancellationToken::new()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() -> anyhow::Result<()> {
        let q = queue(3, Arc::new(ScriptedRemote::new(vec![])), WaitPolicy::Wait);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..12u64 {
            let (q, running, peak) = (q.clone(), running.clone(), peak.clone());
            tasks.spawn(async move {
                q.add(|| async {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
                .await
            });
        }

        let mut sum = 0;
        while let Some(joined) = tasks.join_next().await {
            sum += joined??;
        }
        assert_eq!(sum, (0..12).sum::<u64>());
        assert_eq!(q.concurrency(), 3);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(q.completed(), 12);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_reaches_only_its_caller() -> anyhow::Result<()> {
        let q = queue(2, Arc::new(ScriptedRemote::new(vec![])), WaitPolicy::Wait);
        let failed: Result<()> = q
            .add(|| async { Err(Error::UpstreamUnavailable("boom".to_string())) })
            .await;
        assert!(matches!(failed, Err(Error::UpstreamUnavailable(_))));

        let ok = q.add(|| async { Ok(7) }).await?;
        assert_eq!(ok, 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_queue_runs_nothing() -> anyhow::Result<()> {
        let q = queue(2, Arc::new(ScriptedRemote::new(vec![])), WaitPolicy::Wait);
        q.cancellation().cancel();
        let ran = AtomicUsize::new(0);
        let result = q
            .add(|| async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_waiting_tasks_are_released_on_cancel() -> anyhow::Result<()> {
        let q = queue(1, Arc::new(ScriptedRemote::new(vec![])), WaitPolicy::Wait);
        let blocker = q.clone();
        let holding = tokio::spawn(async move {
            blocker
                .add(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = q.clone();
        let waiting = tokio::spawn(async move { waiter.add(|| async { Ok(()) }).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.cancellation().cancel();

        assert!(matches!(waiting.await?, Err(Error::Cancelled)));
        // the running task is allowed to finish
        assert!(holding.await?.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_policy_rejects_below_margin() -> anyhow::Result<()> {
        let remote = Arc::new(ScriptedRemote::new(vec![]).with_remaining(49));
        let q = queue(2, remote, WaitPolicy::Abort);
        let result = q.add(|| async { Ok(()) }).await;
        match result {
            Err(Error::RateLimited { remaining, .. }) => assert_eq!(remaining, 49),
            other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
        }
        Ok(())
    }
}
