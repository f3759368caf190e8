//! GitHub REST client (sync HTTP via ureq)

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use super::{
    CommitQuery, IssueSummary, LineDelta, ListPage, PullRequestSummary, RateLimitState, RemoteApi,
    RemoteContributor, RepoSlug, PAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::models::CommitRecord;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

type Response = ureq::http::Response<ureq::Body>;

pub struct GithubClient {
    agent: ureq::Agent,
    api_url: String,
    token: Option<String>,
}

fn make_agent(timeout: Duration) -> ureq::Agent {
    ureq::config::Config::builder()
        .http_status_as_error(false)
        .timeout_global(Some(timeout))
        .build()
        .new_agent()
}

impl GithubClient {
    pub fn new(api_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            agent: make_agent(timeout),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response> {
        let url = format!("{}{}", self.api_url, path);
        let mut req = self
            .agent
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", concat!("authorship/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            req = req.header("Authorization", &format!("Bearer {}", token));
        }
        for (key, value) in query {
            req = req.query(*key, value);
        }

        debug!("GET {}", url);
        req.call()
            .map_err(|e| Error::UpstreamUnavailable(format!("GET {} failed: {}", path, e)))
    }

    /// Map non-success statuses onto the error taxonomy.
    fn check_status(&self, path: &str, response: Response) -> Result<Response> {
        let status = response.status().as_u16();
        if status < 400 {
            return Ok(response);
        }

        let remaining = header(&response, "x-ratelimit-remaining").and_then(|v| v.parse::<u64>().ok());
        let reset_at = header(&response, "x-ratelimit-reset")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        if status == 429 || (status == 403 && remaining == Some(0)) {
            return Err(Error::RateLimited {
                remaining: 0,
                reset_at: reset_at.unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(1)),
            });
        }

        let body = response.into_body().read_to_string().unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or(body);
        match status {
            404 => Err(Error::InvalidRequest(format!(
                "{} not found on the remote: {}",
                path, message
            ))),
            401 => Err(Error::InvalidRequest(format!(
                "Remote rejected the token: {}",
                message
            ))),
            s if s >= 500 => Err(Error::UpstreamUnavailable(format!(
                "{} returned {}: {}",
                path, s, message
            ))),
            s => Err(Error::InvalidRequest(format!(
                "{} returned {}: {}",
                path, s, message
            ))),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<ListPage<T>> {
        let response = self.check_status(path, self.get(path, query)?)?;
        let last_page = header(&response, "link").and_then(|l| parse_last_page(&l));
        let items: Vec<T> = response
            .into_body()
            .read_json()
            .map_err(|e| Error::UpstreamUnavailable(format!("bad JSON from {}: {}", path, e)))?;
        Ok(ListPage { items, last_page })
    }

    fn paged(page: u32) -> Vec<(&'static str, String)> {
        vec![("per_page", PAGE_SIZE.to_string()), ("page", page.to_string())]
    }
}

impl RemoteApi for GithubClient {
    fn rate_limit(&self) -> Result<RateLimitState> {
        let response = self.check_status("/rate_limit", self.get("/rate_limit", &[])?)?;
        let body: RateLimitBody = response
            .into_body()
            .read_json()
            .map_err(|e| Error::UpstreamUnavailable(format!("bad rate limit body: {}", e)))?;
        Ok(RateLimitState {
            limit: body.resources.core.limit,
            remaining: body.resources.core.remaining,
            reset_at: Utc
                .timestamp_opt(body.resources.core.reset, 0)
                .single()
                .unwrap_or_else(Utc::now),
            should_wait: false,
        })
    }

    fn list_commits(
        &self,
        slug: &RepoSlug,
        query: &CommitQuery,
        page: u32,
    ) -> Result<ListPage<CommitRecord>> {
        let path = format!("/repos/{}/{}/commits", slug.owner, slug.repo);
        let mut params = vec![
            ("per_page", query.per_page.max(1).to_string()),
            ("page", page.to_string()),
        ];
        if let Some(branch) = &query.branch {
            params.push(("sha", branch.clone()));
        }
        if let Some(since) = query.since {
            params.push(("since", since.to_rfc3339()));
        }
        if let Some(until) = query.until {
            params.push(("until", until.to_rfc3339()));
        }

        let response = self.get(&path, &params)?;
        // "Git Repository is empty."
        if response.status().as_u16() == 409 {
            debug!("{} is empty", slug);
            return Ok(ListPage::empty());
        }
        let response = self.check_status(&path, response)?;
        let last_page = header(&response, "link").and_then(|l| parse_last_page(&l));
        let items: Vec<ApiCommit> = response
            .into_body()
            .read_json()
            .map_err(|e| Error::UpstreamUnavailable(format!("bad JSON from {}: {}", path, e)))?;

        Ok(ListPage {
            items: items.into_iter().map(ApiCommit::into_record).collect(),
            last_page,
        })
    }

    fn commit_detail(&self, slug: &RepoSlug, sha: &str) -> Result<LineDelta> {
        let path = format!("/repos/{}/{}/commits/{}", slug.owner, slug.repo, sha);
        let response = self.check_status(&path, self.get(&path, &[])?)?;
        let commit: ApiCommit = response
            .into_body()
            .read_json()
            .map_err(|e| Error::UpstreamUnavailable(format!("bad JSON from {}: {}", path, e)))?;
        let stats = commit.stats.unwrap_or_default();
        Ok(LineDelta {
            additions: stats.additions,
            deletions: stats.deletions,
        })
    }

    fn list_pull_requests(&self, slug: &RepoSlug, page: u32) -> Result<ListPage<PullRequestSummary>> {
        let path = format!("/repos/{}/{}/pulls", slug.owner, slug.repo);
        let mut params = Self::paged(page);
        params.push(("state", "all".to_string()));
        let page: ListPage<ApiIssue> = self.get_json(&path, &params)?;
        Ok(ListPage {
            items: page
                .items
                .into_iter()
                .map(|pr| PullRequestSummary {
                    number: pr.number,
                    title: pr.title,
                    author_login: pr.user.map(|u| u.login),
                    created_at: pr.created_at,
                    merged_at: pr.merged_at,
                })
                .collect(),
            last_page: page.last_page,
        })
    }

    fn list_issues(&self, slug: &RepoSlug, page: u32) -> Result<ListPage<IssueSummary>> {
        let path = format!("/repos/{}/{}/issues", slug.owner, slug.repo);
        let mut params = Self::paged(page);
        params.push(("state", "all".to_string()));
        let page: ListPage<ApiIssue> = self.get_json(&path, &params)?;
        Ok(ListPage {
            items: page
                .items
                .into_iter()
                .filter(|issue| issue.pull_request.is_none())
                .map(|issue| IssueSummary {
                    number: issue.number,
                    title: issue.title,
                    author_login: issue.user.map(|u| u.login),
                    created_at: issue.created_at,
                    closed_at: issue.closed_at,
                })
                .collect(),
            last_page: page.last_page,
        })
    }

    fn list_contributors(&self, slug: &RepoSlug, page: u32) -> Result<ListPage<RemoteContributor>> {
        let path = format!("/repos/{}/{}/contributors", slug.owner, slug.repo);
        let response = self.get(&path, &Self::paged(page))?;
        // Empty repositories answer 204 with no body
        if response.status().as_u16() == 204 {
            return Ok(ListPage::empty());
        }
        let response = self.check_status(&path, response)?;
        let last_page = header(&response, "link").and_then(|l| parse_last_page(&l));
        let items: Vec<ApiUser> = response
            .into_body()
            .read_json()
            .map_err(|e| Error::UpstreamUnavailable(format!("bad JSON from {}: {}", path, e)))?;
        Ok(ListPage {
            items: items
                .into_iter()
                .map(|u| RemoteContributor {
                    login: u.login,
                    contributions: u.contributions.unwrap_or(0),
                })
                .collect(),
            last_page,
        })
    }
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Extract the page number of `rel="last"` from a `Link` header.
pub fn parse_last_page(link: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r#"<([^>]*)>\s*;\s*rel="last""#).expect("valid link regex")
    });
    static PAGE: OnceLock<Regex> = OnceLock::new();
    let page = PAGE.get_or_init(|| Regex::new(r"[?&]page=(\d+)").expect("valid page regex"));

    let url = re.captures(link)?.get(1)?.as_str();
    page.captures(url)?.get(1)?.as_str().parse().ok()
}

/// `owner/repo` from a GitHub remote URL (https, ssh or scp-like).
pub fn slug_from_remote_url(url: &str) -> Option<RepoSlug> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"github\.com[:/]([^/]+)/([^/]+?)(?:\.git)?/?$").expect("valid remote regex")
    });
    let caps = re.captures(url.trim())?;
    RepoSlug::new(caps.get(1)?.as_str(), caps.get(2)?.as_str()).ok()
}

// GitHub API types

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    resources: RateLimitResources,
}

#[derive(Deserialize)]
struct RateLimitResources {
    core: RateLimitCore,
}

#[derive(Deserialize)]
struct RateLimitCore {
    limit: u64,
    remaining: u64,
    reset: i64,
}

#[derive(Deserialize)]
struct ApiCommit {
    sha: String,
    commit: ApiCommitBody,
    author: Option<ApiUser>,
    #[serde(default)]
    parents: Vec<serde_json::Value>,
    stats: Option<ApiStats>,
}

#[derive(Deserialize)]
struct ApiCommitBody {
    author: Option<ApiGitActor>,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ApiGitActor {
    name: Option<String>,
    email: Option<String>,
    date: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
struct ApiStats {
    additions: u64,
    deletions: u64,
}

#[derive(Deserialize)]
struct ApiUser {
    login: String,
    contributions: Option<u64>,
}

/// Shared shape of issues and pull requests.
#[derive(Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    user: Option<ApiUser>,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    merged_at: Option<DateTime<Utc>>,
    pull_request: Option<serde_json::Value>,
}

impl ApiCommit {
    fn into_record(self) -> CommitRecord {
        let actor = self.commit.author;
        let (name, email, date) = match actor {
            Some(a) => (a.name, a.email, a.date),
            None => (None, None, None),
        };
        let stats = self.stats;
        CommitRecord {
            sha: self.sha,
            author_name: name.unwrap_or_else(|| "Unknown".to_string()),
            author_email: email.unwrap_or_default().to_lowercase(),
            author_date: date.unwrap_or_default(),
            login: self.author.map(|u| u.login),
            message: self.commit.message.lines().next().unwrap_or("").to_string(),
            additions: stats.as_ref().map_or(0, |s| s.additions),
            deletions: stats.as_ref().map_or(0, |s| s.deletions),
            parent_count: self.parents.len() as u32,
            stats_known: stats.is_some(),
        }
    }
}
