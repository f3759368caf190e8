//! Analysis pipeline
//!
//! [`ModeDispatcher`] runs one [`AnalysisRequest`]:
//! 1. Validate the request against its mode (before any work starts)
//! 2. Run the sub-computations the mode needs, concurrently for hybrid
//! 3. Merge their results into one [`AnalysisResponse`]
//! 4. Emit exactly one terminal progress event
//!
//! | mode            | runs                                   |
//! |-----------------|----------------------------------------|
//! | blame           | BlameEngine                            |
//! | commits         | CommitStatsEngine                      |
//! | remote-metadata | pull request / issue / contributor lists |
//! | hybrid          | all three, merged by author identity   |
//! | legacy          | remote commit listing + stat hydration |

mod request;
mod response;

pub use request::{
    parse_date, AnalysisMode, AnalysisRequest, BlameRequestOptions, CommitRequestOptions,
    GithubRequestOptions, ValidRequest,
};
pub use response::{aggregate_remote, merge_hybrid, AnalysisResponse, HybridReport, LegacyReport};

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AttributionConfig;
use crate::error::{Error, Result};
use crate::git::{AttributionResult, BlameEngine, CommitStatsEngine, CommitStatsResult};
use crate::progress::{ProgressDetails, ProgressEmitter, Stage};
use crate::remote::{
    CommitFetcher, FetchProgress, RateLimitGuard, RemoteApi, RemoteMetadata,
    RemoteMetadataCollector, RepoSlug, RequestQueue, WaitPolicy,
};

/// Lifecycle of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Runs exactly one analysis request.
pub struct ModeDispatcher {
    config: AttributionConfig,
    remote: Option<Arc<dyn RemoteApi>>,
    policy: WaitPolicy,
    state: Mutex<DispatchState>,
}

impl ModeDispatcher {
    pub fn new(config: AttributionConfig, remote: Option<Arc<dyn RemoteApi>>) -> Self {
        Self {
            config,
            remote,
            policy: WaitPolicy::default(),
            state: Mutex::new(DispatchState::Idle),
        }
    }

    /// Rate-limit policy for remote calls. Streaming callers use `Abort`.
    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> DispatchState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn transition(&self, from: DispatchState, to: DispatchState) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    /// Run `request`, reporting through `emitter`.
    ///
    /// The emitter receives the terminal `complete` (carrying the response)
    /// or `error` event before this returns.
    pub async fn dispatch(
        &self,
        request: &AnalysisRequest,
        emitter: &ProgressEmitter,
    ) -> Result<AnalysisResponse> {
        if !self.transition(DispatchState::Idle, DispatchState::Running) {
            let err = Error::InvalidRequest(
                "This dispatcher has already run a request; create a new one".to_string(),
            );
            emitter.error(&err);
            return Err(err);
        }

        let request_id = Uuid::new_v4();
        let mode = request.mode.map(|m| m.as_str()).unwrap_or("unknown");
        let span = info_span!("analysis", %request_id, mode);
        let outcome = self.run(request, emitter).instrument(span).await;

        match &outcome {
            Ok(response) => {
                self.transition(DispatchState::Running, DispatchState::Succeeded);
                for warning in response.warnings() {
                    warn!("{}", warning);
                }
                let result = serde_json::to_value(response).ok();
                emitter.complete(response.summary(), result);
            }
            Err(e) => {
                self.transition(DispatchState::Running, DispatchState::Failed);
                warn!("Analysis {} failed: {}", request_id, e);
                emitter.error(e);
            }
        }
        outcome
    }

    async fn run(&self, request: &AnalysisRequest, emitter: &ProgressEmitter) -> Result<AnalysisResponse> {
        let valid = request.validate(&self.config)?;
        if valid.mode.needs_remote() && self.remote.is_none() {
            return Err(Error::InvalidRequest(format!(
                "Mode '{}' needs a remote API client; set GITHUB_TOKEN or configure [github]",
                valid.mode
            )));
        }

        info!("Starting {} analysis", valid.mode);
        emitter.progress(
            0,
            format!("Starting {} analysis...", valid.mode),
            ProgressDetails::default(),
        );

        match valid.mode {
            AnalysisMode::Blame => {
                let stage = emitter.stage(0, 100);
                Ok(AnalysisResponse::Blame(self.run_blame(&valid, stage).await?))
            }
            AnalysisMode::Commits => {
                let stage = emitter.stage(0, 100);
                Ok(AnalysisResponse::Commits(self.run_commits(&valid, stage).await?))
            }
            AnalysisMode::RemoteMetadata => {
                let stage = emitter.stage(0, 100);
                let metadata = self.run_metadata(&valid, emitter, stage).await?;
                Ok(AnalysisResponse::RemoteMetadata(metadata))
            }
            AnalysisMode::Hybrid => {
                let [blame_stage, commit_stage, meta_stage]: [Stage; 3] = emitter
                    .stages(&[50, 30, 20])
                    .try_into()
                    .map_err(|_| Error::Internal("progress stages".to_string()))?;
                let (blame, stats, metadata) = tokio::try_join!(
                    self.run_blame(&valid, blame_stage),
                    self.run_commits(&valid, commit_stage),
                    self.run_metadata(&valid, emitter, meta_stage),
                )?;
                Ok(AnalysisResponse::Hybrid(merge_hybrid(blame, stats, metadata)))
            }
            AnalysisMode::Legacy => {
                let report = self.run_legacy(&valid, emitter).await?;
                Ok(AnalysisResponse::Legacy(report))
            }
        }
    }

    fn local_path(valid: &ValidRequest) -> Result<PathBuf> {
        valid
            .repo_path
            .clone()
            .ok_or_else(|| Error::InvalidRequest("Missing 'repoPath'".to_string()))
    }

    /// Client, request-scoped queue and slug for the remote sub-computations.
    fn remote_parts(
        &self,
        valid: &ValidRequest,
        emitter: &ProgressEmitter,
    ) -> Result<(Arc<dyn RemoteApi>, Arc<RequestQueue>, RepoSlug)> {
        let api = self
            .remote
            .clone()
            .ok_or_else(|| Error::InvalidRequest("No remote API client configured".to_string()))?;
        let slug = valid
            .slug
            .clone()
            .ok_or_else(|| Error::InvalidRequest("Missing 'owner'/'repo'".to_string()))?;
        let guard = Arc::new(RateLimitGuard::new(
            Arc::clone(&api),
            self.config.rate_limit_settings(self.policy),
        ));
        let queue = Arc::new(RequestQueue::new(
            self.config.queue.concurrency,
            guard,
            emitter.cancellation().clone(),
        ));
        Ok((api, queue, slug))
    }

    async fn run_blame(&self, valid: &ValidRequest, stage: Stage) -> Result<AttributionResult> {
        let engine = BlameEngine::new(&Self::local_path(valid)?, valid.blame.clone());
        let last = AtomicUsize::new(usize::MAX);
        let result = tokio::task::spawn_blocking(move || {
            engine.compute_attribution(|done, total| {
                let pct = if total == 0 { 100 } else { done * 100 / total };
                if last.swap(pct, Ordering::Relaxed) != pct || done == total {
                    stage.report(
                        pct as f64,
                        format!("Blaming files ({}/{})...", done, total),
                        ProgressDetails::files(done, total),
                    );
                }
            })
        })
        .await??;
        info!(
            "Blame: {} lines in {} files, {} authors",
            result.total_lines,
            result.files_processed,
            result.authors.len()
        );
        Ok(result)
    }

    async fn run_commits(&self, valid: &ValidRequest, stage: Stage) -> Result<CommitStatsResult> {
        let engine = CommitStatsEngine::new(&Self::local_path(valid)?, valid.commits.clone());
        let max_commits = valid.commits.max_commits;
        let result = tokio::task::spawn_blocking(move || {
            engine.compute_stats(|processed| {
                let pct = max_commits.map_or(0, |max| processed * 100 / max.max(1));
                stage.report(
                    pct as f64,
                    format!("Reading commit log ({} commits)...", processed),
                    ProgressDetails::commits(processed),
                );
            })
        })
        .await??;
        info!(
            "Commit log: {} commits from {} authors",
            result.total_commits,
            result.authors.len()
        );
        Ok(result)
    }

    async fn run_metadata(
        &self,
        valid: &ValidRequest,
        emitter: &ProgressEmitter,
        stage: Stage,
    ) -> Result<RemoteMetadata> {
        let (api, queue, slug) = self.remote_parts(valid, emitter)?;
        let collector = RemoteMetadataCollector::new(api, queue, self.config.metadata_settings());
        let finished = AtomicUsize::new(0);
        collector
            .collect(&slug, |listing| {
                let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                stage.report(
                    (done * 100 / 3) as f64,
                    format!("Listed {} for {}", listing, slug),
                    ProgressDetails::default(),
                );
            })
            .await
    }

    async fn run_legacy(&self, valid: &ValidRequest, emitter: &ProgressEmitter) -> Result<LegacyReport> {
        let (api, queue, slug) = self.remote_parts(valid, emitter)?;
        let (pages_stage, hydrate_stage) = (emitter.stage(0, 80), emitter.stage(80, 20));
        let fetcher = CommitFetcher::new(api, queue, valid.fetch_settings.clone());
        let max_pages = valid.fetch_settings.max_pages.max(1);

        let fetched = fetcher
            .fetch_commits(&slug, &valid.fetch, |event| match event {
                FetchProgress::Page {
                    current,
                    total,
                    commits,
                } => {
                    let of = total.unwrap_or(max_pages).max(current);
                    pages_stage.report(
                        current as f64 * 100.0 / of as f64,
                        format!("Fetching commits page {}...", current),
                        ProgressDetails::pages(current, total, commits),
                    );
                }
                FetchProgress::Hydrating { done, total } => {
                    hydrate_stage.report(
                        done as f64 * 100.0 / total.max(1) as f64,
                        format!("Fetching commit stats ({}/{})...", done, total),
                        ProgressDetails::commits(done),
                    );
                }
            })
            .await?;

        if let Some(note) = fetched.status.describe() {
            info!("{}: {}", slug, note);
        }
        Ok(aggregate_remote(slug.to_string(), fetched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::TestRepo;
    use crate::models::HistoryStatus;
    use crate::progress::ProgressEvent;
    use crate::remote::testing::{history, ScriptedRemote};
    use crate::remote::RemoteContributor;
    use tokio_util::sync::CancellationToken;

    const ADA: (&str, &str) = ("Ada", "ada@example.com");
    const BOB: (&str, &str) = ("Bob", "bob@example.com");

    fn local_repo() -> anyhow::Result<TestRepo> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_700_000_000, &[("a.txt", Some("1\n2\n3\n"))], "ada")?;
        repo.commit(BOB, 1_700_100_000, &[("b.txt", Some("x\n"))], "bob")?;
        Ok(repo)
    }

    fn hybrid_request(repo: &TestRepo) -> AnalysisRequest {
        AnalysisRequest {
            mode: Some(AnalysisMode::Hybrid),
            repo_path: Some(repo.path().to_path_buf()),
            owner: Some("acme".to_string()),
            repo: Some("widgets".to_string()),
            ..Default::default()
        }
    }

    async fn collect(mut sub: crate::progress::ProgressSubscriber) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Some(e) = sub.next().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_blame_mode_completes_with_result() -> anyhow::Result<()> {
        let repo = local_repo()?;
        let dispatcher = ModeDispatcher::new(AttributionConfig::default(), None);
        let (emitter, sub) = ProgressEmitter::channel(CancellationToken::new());
        let request = AnalysisRequest {
            mode: Some(AnalysisMode::Blame),
            repo_path: Some(repo.path().to_path_buf()),
            ..Default::default()
        };

        let response = dispatcher.dispatch(&request, &emitter).await?;
        drop(emitter);
        let AnalysisResponse::Blame(result) = response else {
            panic!("expected blame response");
        };
        assert_eq!(result.total_lines, 4);
        assert_eq!(dispatcher.state(), DispatchState::Succeeded);

        let events = collect(sub).await;
        let last = events.last().cloned();
        match last {
            Some(ProgressEvent::Complete { result, .. }) => {
                let result = result.unwrap_or_default();
                assert_eq!(result["mode"], "blame");
                assert_eq!(result["totalLines"], 4);
            }
            other => panic!("expected complete, got {:?}", other),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_hybrid_merges_all_sources() -> anyhow::Result<()> {
        let repo = local_repo()?;
        let mut remote = ScriptedRemote::new(vec![]);
        remote.contributors = vec![RemoteContributor {
            login: "ada".to_string(),
            contributions: 1,
        }];
        let dispatcher = ModeDispatcher::new(AttributionConfig::default(), Some(Arc::new(remote)));
        let emitter = ProgressEmitter::detached(CancellationToken::new());

        let response = dispatcher.dispatch(&hybrid_request(&repo), &emitter).await?;
        let AnalysisResponse::Hybrid(report) = response else {
            panic!("expected hybrid response");
        };
        assert_eq!(report.total_lines, 4);
        assert_eq!(report.total_commits, 2);
        assert_eq!(report.contributors.len(), 2);
        let ada = report
            .contributors
            .iter()
            .find(|c| c.identity.canonical_email == "ada@example.com")
            .cloned()
            .unwrap();
        assert_eq!(ada.commit_count, 1);
        assert_eq!(ada.line_ownership, Some(3));
        assert_eq!(report.remote.contributors.len(), 1);
        assert_eq!(emitter.last_percent(), 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_hybrid_fails_when_any_source_fails() -> anyhow::Result<()> {
        let repo = local_repo()?;
        let mut remote = ScriptedRemote::new(vec![]);
        remote.fail_listings = true;
        let dispatcher = ModeDispatcher::new(AttributionConfig::default(), Some(Arc::new(remote)));
        let (emitter, sub) = ProgressEmitter::channel(CancellationToken::new());

        let outcome = dispatcher.dispatch(&hybrid_request(&repo), &emitter).await;
        drop(emitter);
        assert!(matches!(outcome, Err(Error::UpstreamUnavailable(_))));
        assert_eq!(dispatcher.state(), DispatchState::Failed);

        let events = collect(sub).await;
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Error { code, .. }) if code == "upstream_unavailable"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_hybrid_fails_when_only_commit_log_fails() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_700_000_000, &[("a.txt", Some("1\n2\n3\n"))], "ada")?;
        repo.commit(("Cat", "cat@example.com"), 1_700_050_000, &[("gone.txt", Some("scratch\n"))], "add")?;
        repo.commit(("Cat", "cat@example.com"), 1_700_060_000, &[("gone.txt", None)], "remove")?;
        repo.commit(BOB, 1_700_100_000, &[("b.txt", Some("x\n"))], "bob")?;

        // Drop the blob only the deleted file pointed at: blame at HEAD never
        // reads it, the commit log needs it for line stats.
        let blob = git2::Oid::hash_object(git2::ObjectType::Blob, b"scratch\n")?.to_string();
        std::fs::remove_file(repo.path().join(".git/objects").join(&blob[..2]).join(&blob[2..]))?;

        let blame = BlameEngine::new(repo.path(), Default::default()).compute_attribution(|_, _| {})?;
        assert_eq!(blame.total_lines, 4);

        let dispatcher = ModeDispatcher::new(
            AttributionConfig::default(),
            Some(Arc::new(ScriptedRemote::new(vec![]))),
        );
        let (emitter, sub) = ProgressEmitter::channel(CancellationToken::new());
        let outcome = dispatcher.dispatch(&hybrid_request(&repo), &emitter).await;
        drop(emitter);
        assert!(matches!(outcome, Err(Error::Git(_))));
        assert_eq!(dispatcher.state(), DispatchState::Failed);

        let events = collect(sub).await;
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Error { code, .. }) if code == "git_error"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_hybrid_fails_on_unknown_branch() -> anyhow::Result<()> {
        let repo = local_repo()?;
        let dispatcher = ModeDispatcher::new(
            AttributionConfig::default(),
            Some(Arc::new(ScriptedRemote::new(vec![]))),
        );
        let emitter = ProgressEmitter::detached(CancellationToken::new());
        let mut request = hybrid_request(&repo);
        request.branch = Some("no-such-branch".to_string());

        let outcome = dispatcher.dispatch(&request, &emitter).await;
        assert!(matches!(outcome, Err(Error::InvalidRequest(_))));
        assert_eq!(dispatcher.state(), DispatchState::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatching_twice_is_invalid() -> anyhow::Result<()> {
        let repo = local_repo()?;
        let dispatcher = ModeDispatcher::new(AttributionConfig::default(), None);
        let request = AnalysisRequest {
            mode: Some(AnalysisMode::Commits),
            repo_path: Some(repo.path().to_path_buf()),
            ..Default::default()
        };
        let first = ProgressEmitter::detached(CancellationToken::new());
        dispatcher.dispatch(&request, &first).await?;

        let second = ProgressEmitter::detached(CancellationToken::new());
        let again = dispatcher.dispatch(&request, &second).await;
        assert!(matches!(again, Err(Error::InvalidRequest(_))));
        assert!(second.is_finished());
        assert_eq!(dispatcher.state(), DispatchState::Succeeded);
        Ok(())
    }

    #[tokio::test]
    async fn test_remote_modes_need_a_client() {
        let dispatcher = ModeDispatcher::new(AttributionConfig::default(), None);
        let request = AnalysisRequest {
            mode: Some(AnalysisMode::Legacy),
            owner: Some("acme".to_string()),
            repo: Some("widgets".to_string()),
            ..Default::default()
        };
        let emitter = ProgressEmitter::detached(CancellationToken::new());
        let outcome = dispatcher.dispatch(&request, &emitter).await;
        assert!(matches!(outcome, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_legacy_mode_streams_pages() -> anyhow::Result<()> {
        let remote = Arc::new(ScriptedRemote::new(history(250, 30)));
        let dispatcher = ModeDispatcher::new(AttributionConfig::default(), Some(remote.clone()))
            .with_wait_policy(WaitPolicy::Abort);
        let (emitter, sub) = ProgressEmitter::channel(CancellationToken::new());
        let request = AnalysisRequest {
            mode: Some(AnalysisMode::Legacy),
            owner: Some("acme".to_string()),
            repo: Some("widgets".to_string()),
            github_options: Some(GithubRequestOptions {
                max_hydration_calls: Some(20),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = dispatcher.dispatch(&request, &emitter).await?;
        drop(emitter);
        let AnalysisResponse::Legacy(report) = response else {
            panic!("expected legacy response");
        };
        assert_eq!(report.total_commits, 220);
        assert_eq!(report.pages_fetched, 3);
        assert_eq!(report.hydrated, 20);
        assert_eq!(report.status, HistoryStatus::Populated);
        assert_eq!(report.contributors.len(), 3);
        assert!(!report.warnings.is_empty());

        let events = collect(sub).await;
        assert!(events.iter().any(|e| matches!(
            e,
            ProgressEvent::Progress { message, .. } if message.starts_with("Fetching commits page")
        )));
        let percents: Vec<u8> = events.iter().filter_map(|e| e.percent()).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        Ok(())
    }

    #[tokio::test]
    async fn test_rate_limited_stream_ends_with_error_event() -> anyhow::Result<()> {
        let remote = Arc::new(ScriptedRemote::new(history(10, 0)).with_remaining(10));
        let dispatcher = ModeDispatcher::new(AttributionConfig::default(), Some(remote.clone()))
            .with_wait_policy(WaitPolicy::Abort);
        let (emitter, sub) = ProgressEmitter::channel(CancellationToken::new());
        let request = AnalysisRequest {
            mode: Some(AnalysisMode::Legacy),
            owner: Some("acme".to_string()),
            repo: Some("widgets".to_string()),
            ..Default::default()
        };

        let outcome = dispatcher.dispatch(&request, &emitter).await;
        drop(emitter);
        assert!(matches!(outcome, Err(Error::RateLimited { .. })));
        assert_eq!(remote.pages_served(), 0);
        let events = collect(sub).await;
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Error { code, reset_at: Some(_), .. }) if code == "rate_limited"
        ));
        Ok(())
    }
}
