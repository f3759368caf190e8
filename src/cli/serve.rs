//! Serve command - JSON requests on stdin, event streams on stdout
//!
//! Each non-empty input line is one `AnalysisRequest`. Requests are handled
//! one at a time; each is answered with its progress events and a terminal
//! `complete` or `error` event. Rate limits are never waited out while
//! streaming: they end the request with a `rate_limited` error event.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AttributionConfig;
use crate::pipeline::{AnalysisRequest, ModeDispatcher};
use crate::progress::{ProgressEmitter, SseWriter};
use crate::remote::{RemoteApi, WaitPolicy};

/// Run the serve loop on stdin/stdout
pub fn run(base: AttributionConfig, workers: Option<usize>) -> Result<()> {
    let rt = Runtime::new().context("Failed to create tokio runtime")?;
    let keepalive = base.keepalive();
    rt.block_on(serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        keepalive,
        move |request| {
            let mut config = match &request.repo_path {
                Some(path) => AttributionConfig::load(Some(path)),
                None => base.clone(),
            };
            super::apply_workers(&mut config, workers);
            let remote: Option<Arc<dyn RemoteApi>> = request
                .mode
                .is_some_and(|m| m.needs_remote())
                .then(|| Arc::new(config.github_client()) as Arc<dyn RemoteApi>);
            ModeDispatcher::new(config, remote)
        },
    ))
}

/// Answer every request line from `input` with an event stream on `output`.
///
/// `make_dispatcher` builds a fresh dispatcher per request. Returns when
/// input ends or output can no longer be written.
pub async fn serve<R, W, F>(
    input: R,
    output: W,
    keepalive: std::time::Duration,
    make_dispatcher: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(&AnalysisRequest) -> ModeDispatcher,
{
    let mut lines = BufReader::new(input).lines();
    let mut writer = SseWriter::new(output, keepalive);
    let mut handled = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read from stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        handled += 1;
        let (emitter, subscriber) = ProgressEmitter::channel(CancellationToken::new());

        let request = match AnalysisRequest::from_json(&line) {
            Ok(request) => request,
            Err(e) => {
                emitter.error(&e);
                writer.pump(subscriber).await?;
                continue;
            }
        };

        let dispatcher = make_dispatcher(&request).with_wait_policy(WaitPolicy::Abort);
        let task = tokio::spawn(async move { dispatcher.dispatch(&request, &emitter).await });
        let pumped = writer.pump(subscriber).await;
        match task.await? {
            Ok(_) => debug!("Request {} complete", handled),
            Err(e) => debug!("Request {} failed: {}", handled, e),
        }
        pumped.context("Failed to write event stream")?;
    }

    info!("Input closed after {} requests", handled);
    Ok(())
}
