//! Text event stream encoding
//!
//! ```text
//! data: {"type":"progress","percent":50,"message":"Fetching commits page 5...","currentPage":5,"totalPages":10}
//!
//! : keep-alive 1699999999999
//!
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::{ProgressEvent, ProgressSubscriber};
use crate::error::Result;

/// `data: <json>` frame for one event.
pub fn encode_event(event: &ProgressEvent) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// Comment frame that keeps idle connections open.
pub fn keep_alive_frame(now: DateTime<Utc>) -> String {
    format!(": keep-alive {}\n\n", now.timestamp_millis())
}

/// Writes a progress stream to an async sink.
pub struct SseWriter<W> {
    writer: W,
    keepalive: Duration,
}

impl<W: AsyncWrite + Unpin> SseWriter<W> {
    pub fn new(writer: W, keepalive: Duration) -> Self {
        Self { writer, keepalive }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Forward events until the terminal one, interleaving keep-alives.
    ///
    /// Returns the terminal event, or `None` if the emitter went away
    /// without one. A failed write drops `subscriber`, which cancels the
    /// request.
    pub async fn pump(&mut self, mut subscriber: ProgressSubscriber) -> Result<Option<ProgressEvent>> {
        let mut ticker = interval_at(Instant::now() + self.keepalive, self.keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = subscriber.next() => {
                    let Some(event) = event else {
                        debug!("Progress stream closed without a terminal event");
                        return Ok(None);
                    };
                    self.write(&encode_event(&event)?).await?;
                    if event.is_terminal() {
                        return Ok(Some(event));
                    }
                }
                _ = ticker.tick() => {
                    self.write(&keep_alive_frame(Utc::now())).await?;
                }
            }
        }
    }

    async fn write(&mut self, frame: &str) -> Result<()> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
