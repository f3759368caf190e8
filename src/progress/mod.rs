//! Request-scoped progress reporting
//!
//! A [`ProgressEmitter`] is handed to every stage of a request. It publishes
//! [`ProgressEvent`]s to a single [`ProgressSubscriber`] (usually the SSE
//! writer or the CLI progress bar).
//!
//! Contract:
//! - zero or more `progress` events with non-decreasing `percent`
//! - exactly one terminal `complete` or `error` event
//! - nothing after the terminal event
//!
//! Dropping the subscriber cancels the request's cancellation token, which
//! stops the request queue from submitting further remote calls.

pub mod sse;

pub use sse::{encode_event, keep_alive_frame, SseWriter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;

/// Optional counters attached to a `progress` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_commits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_files: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u64>,
}

impl ProgressDetails {
    pub fn pages(current: u32, total: Option<u32>, commits: usize) -> Self {
        Self {
            current_page: Some(current),
            total_pages: total,
            processed_commits: Some(commits as u64),
            ..Default::default()
        }
    }

    pub fn commits(processed: usize) -> Self {
        Self {
            processed_commits: Some(processed as u64),
            ..Default::default()
        }
    }

    pub fn files(processed: usize, total: usize) -> Self {
        Self {
            processed_files: Some(processed as u64),
            total_files: Some(total as u64),
            ..Default::default()
        }
    }
}

/// One event on the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress {
        percent: u8,
        message: String,
        #[serde(flatten)]
        details: ProgressDetails,
    },
    Complete {
        percent: u8,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reset_at: Option<DateTime<Utc>>,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }

    pub fn percent(&self) -> Option<u8> {
        match self {
            ProgressEvent::Progress { percent, .. } | ProgressEvent::Complete { percent, .. } => {
                Some(*percent)
            }
            ProgressEvent::Error { .. } => None,
        }
    }
}

struct EmitterState {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    last_percent: u8,
    finished: bool,
}

/// Publishing half of a request's progress stream. Cheap to clone.
#[derive(Clone)]
pub struct ProgressEmitter {
    state: Arc<Mutex<EmitterState>>,
    cancel: CancellationToken,
}

impl ProgressEmitter {
    /// Create a connected emitter/subscriber pair bound to `cancel`.
    pub fn channel(cancel: CancellationToken) -> (ProgressEmitter, ProgressSubscriber) {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = ProgressEmitter {
            state: Arc::new(Mutex::new(EmitterState {
                tx: Some(tx),
                last_percent: 0,
                finished: false,
            })),
            cancel: cancel.clone(),
        };
        (emitter, ProgressSubscriber { rx, cancel })
    }

    /// Emitter with no subscriber; events are only tracked, never delivered.
    pub fn detached(cancel: CancellationToken) -> Self {
        ProgressEmitter {
            state: Arc::new(Mutex::new(EmitterState {
                tx: None,
                last_percent: 0,
                finished: false,
            })),
            cancel,
        }
    }

    fn state(&self) -> MutexGuard<'_, EmitterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    pub fn last_percent(&self) -> u8 {
        self.state().last_percent
    }

    /// Report progress. `percent` is clamped to `[last, 100]`; ignored once finished.
    pub fn progress(&self, percent: u8, message: impl Into<String>, details: ProgressDetails) {
        let mut state = self.state();
        if state.finished {
            return;
        }
        let percent = percent.min(100).max(state.last_percent);
        state.last_percent = percent;
        let event = ProgressEvent::Progress {
            percent,
            message: message.into(),
            details,
        };
        self.send(&mut state, event);
    }

    /// Emit the terminal `complete` event and freeze.
    pub fn complete(&self, message: impl Into<String>, result: Option<serde_json::Value>) {
        let mut state = self.state();
        if state.finished {
            return;
        }
        state.finished = true;
        state.last_percent = 100;
        let event = ProgressEvent::Complete {
            percent: 100,
            message: message.into(),
            result,
        };
        self.send(&mut state, event);
        state.tx = None;
    }

    /// Emit the terminal `error` event for `err` and freeze.
    pub fn error(&self, err: &Error) {
        let mut state = self.state();
        if state.finished {
            return;
        }
        state.finished = true;
        let event = ProgressEvent::Error {
            message: err.to_string(),
            code: err.code().to_string(),
            reset_at: err.reset_at(),
        };
        self.send(&mut state, event);
        state.tx = None;
    }

    fn send(&self, state: &mut EmitterState, event: ProgressEvent) {
        if let Some(tx) = &state.tx {
            if tx.send(event).is_err() {
                debug!("Progress subscriber went away; cancelling request");
                state.tx = None;
                self.cancel.cancel();
            }
        }
    }

    /// A slice `[start, start + span]` of the overall bar.
    pub fn stage(&self, start: u8, span: u8) -> Stage {
        Stage {
            emitter: self.clone(),
            start: start.min(100),
            span: span.min(100 - start.min(100)),
        }
    }

    /// Split the bar into consecutive stages proportional to `weights`.
    pub fn stages(&self, weights: &[u32]) -> Vec<Stage> {
        let total: u32 = weights.iter().sum::<u32>().max(1);
        let mut stages = Vec::with_capacity(weights.len());
        let mut acc = 0u32;
        for w in weights {
            let start = (acc * 100 / total) as u8;
            acc += w;
            let end = (acc * 100 / total) as u8;
            stages.push(self.stage(start, end - start));
        }
        stages
    }
}

/// A weighted share of the overall progress bar.
#[derive(Clone)]
pub struct Stage {
    emitter: ProgressEmitter,
    start: u8,
    span: u8,
}

impl Stage {
    /// Report `local` percent (0-100) of this stage.
    pub fn report(&self, local: f64, message: impl Into<String>, details: ProgressDetails) {
        let local = local.clamp(0.0, 100.0);
        let overall = self.start as f64 + self.span as f64 * local / 100.0;
        self.emitter.progress(overall.floor() as u8, message, details);
    }

    pub fn bounds(&self) -> (u8, u8) {
        (self.start, self.start + self.span)
    }
}

/// Receiving half. Dropping it cancels the request.
pub struct ProgressSubscriber {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    cancel: CancellationToken,
}

impl ProgressSubscriber {
    /// Next event, or `None` once the terminal event has been delivered.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

impl Drop for ProgressSubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut sub: ProgressSubscriber) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Some(e) = sub.next().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_percent_is_monotonic() {
        let (emitter, sub) = ProgressEmitter::channel(CancellationToken::new());
        emitter.progress(10, "a", ProgressDetails::default());
        emitter.progress(40, "b", ProgressDetails::default());
        emitter.progress(25, "c", ProgressDetails::default());
        emitter.progress(250, "d", ProgressDetails::default());
        emitter.complete("done", None);

        let percents: Vec<u8> = drain(sub)
            .await
            .iter()
            .filter_map(|e| e.percent())
            .collect();
        assert_eq!(percents, vec![10, 40, 40, 100, 100]);
    }

    #[tokio::test]
    async fn test_nothing_after_terminal_event() {
        let (emitter, sub) = ProgressEmitter::channel(CancellationToken::new());
        emitter.progress(50, "halfway", ProgressDetails::default());
        emitter.complete("done", None);
        emitter.progress(60, "late", ProgressDetails::default());
        emitter.error(&Error::Cancelled);
        emitter.complete("again", None);

        let events = drain(sub).await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
        assert!(emitter.is_finished());
    }

    #[tokio::test]
    async fn test_error_event_carries_code_and_reset() {
        let (emitter, sub) = ProgressEmitter::channel(CancellationToken::new());
        let reset_at = Utc::now();
        emitter.error(&Error::RateLimited {
            remaining: 3,
            reset_at,
        });
        let events = drain(sub).await;
        match &events[0] {
            ProgressEvent::Error {
                code,
                reset_at: got,
                ..
            } => {
                assert_eq!(code, "rate_limited");
                assert_eq!(*got, Some(reset_at));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropping_subscriber_cancels() {
        let cancel = CancellationToken::new();
        let (emitter, sub) = ProgressEmitter::channel(cancel.clone());
        emitter.progress(5, "start", ProgressDetails::default());
        assert!(!cancel.is_cancelled());
        drop(sub);
        assert!(cancel.is_cancelled());
        // still safe to report into a closed stream
        emitter.progress(10, "more", ProgressDetails::default());
        emitter.complete("done", None);
    }

    #[tokio::test]
    async fn test_stages_map_onto_overall_bar() {
        let (emitter, sub) = ProgressEmitter::channel(CancellationToken::new());
        let stages = emitter.stages(&[50, 30, 20]);
        assert_eq!(stages[0].bounds(), (0, 50));
        assert_eq!(stages[1].bounds(), (50, 80));
        assert_eq!(stages[2].bounds(), (80, 100));

        stages[0].report(50.0, "blame", ProgressDetails::default());
        stages[1].report(100.0, "commits", ProgressDetails::default());
        stages[2].report(50.0, "metadata", ProgressDetails::default());
        emitter.complete("done", None);

        let percents: Vec<u8> = drain(sub)
            .await
            .iter()
            .filter_map(|e| e.percent())
            .collect();
        assert_eq!(percents, vec![25, 80, 90, 100]);
    }

    #[test]
    fn test_progress_event_wire_shape() -> anyhow::Result<()> {
        let event = ProgressEvent::Progress {
            percent: 50,
            message: "Fetching commits page 5...".to_string(),
            details: ProgressDetails {
                current_page: Some(5),
                total_pages: Some(10),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&event)?;
        assert_eq!(
            json,
            serde_json::json!({
                "type": "progress",
                "percent": 50,
                "message": "Fetching commits page 5...",
                "currentPage": 5,
                "totalPages": 10
            })
        );

        let complete = ProgressEvent::Complete {
            percent: 100,
            message: "Analysis complete. Processed 842 commits.".to_string(),
            result: None,
        };
        assert_eq!(
            serde_json::to_string(&complete)?,
            r#"{"type":"complete","percent":100,"message":"Analysis complete. Processed 842 commits."}"#
        );
        Ok(())
    }
}
