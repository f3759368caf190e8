//! Remote quota tracking
//!
//! [`RateLimitGuard`] holds the quota snapshot for one request. The snapshot
//! is taken with the free `/rate_limit` call, invalidated before every batch
//! of remote calls and decremented locally as calls complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{blocking, RemoteApi};
use crate::error::{Error, Result};

/// Quota snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// `remaining` is below the safety margin
    pub should_wait: bool,
}

/// What to do when the quota is below the safety margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    /// Sleep (bounded) until the reset, re-check, then reject if still low
    #[default]
    Wait,
    /// Reject immediately; used while streaming
    Abort,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub safety_margin: u64,
    pub max_wait: Duration,
    pub policy: WaitPolicy,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            safety_margin: 50,
            max_wait: Duration::from_secs(60),
            policy: WaitPolicy::Wait,
        }
    }
}

pub struct RateLimitGuard {
    api: Arc<dyn RemoteApi>,
    settings: RateLimitSettings,
    snapshot: Mutex<Option<RateLimitState>>,
}

impl RateLimitGuard {
    pub fn new(api: Arc<dyn RemoteApi>, settings: RateLimitSettings) -> Self {
        Self {
            api,
            settings,
            snapshot: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Current quota, probing the remote when no snapshot is held.
    pub async fn check(&self) -> Result<RateLimitState> {
        let mut snapshot = self.snapshot.lock().await;
        if let Some(state) = snapshot.as_ref() {
            return Ok(state.clone());
        }

        let api = Arc::clone(&self.api);
        let mut state = blocking(move || api.rate_limit()).await?;
        state.should_wait = state.remaining < self.settings.safety_margin;
        debug!(
            "Rate limit check: {}/{} remaining, resets {}",
            state.remaining, state.limit, state.reset_at
        );
        *snapshot = Some(state.clone());
        Ok(state)
    }

    /// Force the next [`check`](Self::check) to query the API again.
    pub async fn invalidate(&self) {
        *self.snapshot.lock().await = None;
    }

    /// Record `n` completed calls against the snapshot.
    pub async fn consume(&self, n: u64) {
        if let Some(state) = self.snapshot.lock().await.as_mut() {
            state.remaining = state.remaining.saturating_sub(n);
            state.should_wait = state.remaining < self.settings.safety_margin;
        }
    }

    /// Gate one remote call on the quota.
    ///
    /// Under [`WaitPolicy::Wait`] a low quota sleeps until the reset (capped
    /// at `max_wait`) and checks again; the call is rejected with
    /// `RateLimited` if the quota is still below the margin.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<()> {
        let state = self.check().await?;
        if !state.should_wait {
            return Ok(());
        }

        if self.settings.policy == WaitPolicy::Abort {
            warn!(
                "Rate limit below safety margin ({} < {}), aborting",
                state.remaining, self.settings.safety_margin
            );
            return Err(rate_limited(&state));
        }

        let until_reset = (state.reset_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let delay = until_reset.min(self.settings.max_wait);
        info!(
            "Rate limit low ({} remaining), waiting {:?} before retrying",
            state.remaining, delay
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        self.invalidate().await;
        let state = self.check().await?;
        if state.should_wait {
            return Err(rate_limited(&state));
        }
        Ok(())
    }
}

fn rate_limited(state: &RateLimitState) -> Error {
    Error::RateLimited {
        remaining: state.remaining,
        reset_at: state.reset_at,
    }
}
