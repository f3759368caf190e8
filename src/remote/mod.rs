//! Remote hosting API access
//!
//! The remote side is reached through the [`RemoteApi`] trait. Calls are
//! blocking (the GitHub client uses `ureq`) and are bridged onto the async
//! pipeline with `spawn_blocking`. Every call made on behalf of a request
//! goes through that request's [`RequestQueue`], which bounds concurrency
//! and consults the [`RateLimitGuard`] first.

pub mod fetcher;
pub mod github;
pub mod metadata;
pub mod queue;
pub mod rate_limit;

pub use fetcher::{CommitFetchResult, CommitFetcher, FetchOptions, FetchProgress, FetchSettings};
pub use github::GithubClient;
pub use metadata::{LoginActivity, MetadataSettings, RemoteMetadata, RemoteMetadataCollector};
pub use queue::RequestQueue;
pub use rate_limit::{RateLimitGuard, RateLimitSettings, RateLimitState, WaitPolicy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::models::CommitRecord;

/// Listing page size used for every paginated call.
pub const PAGE_SIZE: u32 = 100;

/// `owner/repo` on the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

impl RepoSlug {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Result<Self> {
        let (owner, repo) = (owner.into(), repo.into());
        let valid = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid(&owner) || !valid(&repo) {
            return Err(Error::InvalidRequest(format!(
                "'{}/{}' is not a valid owner/repo pair",
                owner, repo
            )));
        }
        Ok(Self { owner, repo })
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Filters for a commit listing.
#[derive(Debug, Clone, Default)]
pub struct CommitQuery {
    pub branch: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub per_page: u32,
}

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    /// Last page number, when the remote reports it
    pub last_page: Option<u32>,
}

impl<T> ListPage<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            last_page: None,
        }
    }
}

/// Additions and deletions of a single commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineDelta {
    pub additions: u64,
    pub deletions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestSummary {
    pub number: u64,
    pub title: String,
    pub author_login: Option<String>,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueSummary {
    pub number: u64,
    pub title: String,
    pub author_login: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteContributor {
    pub login: String,
    pub contributions: u64,
}

/// Blocking access to a hosting provider's REST API.
///
/// Implementations map HTTP failures onto [`Error`]: exhausted quota is
/// `RateLimited`, transport errors and 5xx are `UpstreamUnavailable`.
pub trait RemoteApi: Send + Sync + 'static {
    /// Current quota. Must not consume quota itself.
    fn rate_limit(&self) -> Result<RateLimitState>;

    /// One page of commits, newest first, without line stats.
    ///
    /// An empty repository yields an empty page rather than an error.
    fn list_commits(&self, slug: &RepoSlug, query: &CommitQuery, page: u32)
        -> Result<ListPage<CommitRecord>>;

    /// Line stats of a single commit.
    fn commit_detail(&self, slug: &RepoSlug, sha: &str) -> Result<LineDelta>;

    fn list_pull_requests(&self, slug: &RepoSlug, page: u32) -> Result<ListPage<PullRequestSummary>>;

    /// Issues only; pull requests reported by the issues endpoint are dropped.
    fn list_issues(&self, slug: &RepoSlug, page: u32) -> Result<ListPage<IssueSummary>>;

    fn list_contributors(&self, slug: &RepoSlug, page: u32) -> Result<ListPage<RemoteContributor>>;
}

/// Run a blocking remote call on tokio's blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
