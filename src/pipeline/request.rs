//! Analysis request contract and validation

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::config::AttributionConfig;
use crate::error::{Error, Result};
use crate::git::{AttributionOptions, CommitStatsOptions};
use crate::remote::{FetchOptions, FetchSettings, RepoSlug};

/// Which sources an analysis draws on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    /// Local line ownership
    Blame,
    /// Local commit log
    Commits,
    /// Remote pull requests, issues and contributors
    RemoteMetadata,
    /// All three, merged per contributor
    Hybrid,
    /// Remote commit listing with stat hydration
    Legacy,
}

impl AnalysisMode {
    pub const ALL: [AnalysisMode; 5] = [
        AnalysisMode::Blame,
        AnalysisMode::Commits,
        AnalysisMode::RemoteMetadata,
        AnalysisMode::Hybrid,
        AnalysisMode::Legacy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Blame => "blame",
            AnalysisMode::Commits => "commits",
            AnalysisMode::RemoteMetadata => "remote-metadata",
            AnalysisMode::Hybrid => "hybrid",
            AnalysisMode::Legacy => "legacy",
        }
    }

    pub fn needs_local(&self) -> bool {
        matches!(
            self,
            AnalysisMode::Blame | AnalysisMode::Commits | AnalysisMode::Hybrid
        )
    }

    pub fn needs_remote(&self) -> bool {
        matches!(
            self,
            AnalysisMode::RemoteMetadata | AnalysisMode::Hybrid | AnalysisMode::Legacy
        )
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AnalysisMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "Unknown mode '{}'. Expected one of: blame, commits, remote-metadata, hybrid, legacy",
                    s
                ))
            })
    }
}

/// Per-request blame overrides; unset fields fall back to configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlameRequestOptions {
    pub max_concurrency: Option<usize>,
    pub respect_ignore_revs_file: Option<bool>,
    pub ignore_revs_file: Option<PathBuf>,
    pub ignore_revs: Vec<String>,
    pub ignore_whitespace: Option<bool>,
    pub detect_moves: Option<bool>,
    pub detect_copies: Option<bool>,
    pub use_mailmap: Option<bool>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub include_file_breakdown: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommitRequestOptions {
    pub exclude_merges: Option<bool>,
    pub max_commits: Option<usize>,
    pub use_mailmap: Option<bool>,
    pub exclude_bots: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GithubRequestOptions {
    pub max_commits: Option<usize>,
    pub exclude_merges: Option<bool>,
    pub max_hydration_calls: Option<usize>,
    pub hydration_skip_above: Option<usize>,
}

/// Request body as received from a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisRequest {
    pub mode: Option<AnalysisMode>,
    pub repo_path: Option<PathBuf>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    /// RFC 3339 instant or `YYYY-MM-DD`
    pub since: Option<String>,
    /// RFC 3339 instant or `YYYY-MM-DD` (inclusive, end of day)
    pub until: Option<String>,
    pub blame_options: Option<BlameRequestOptions>,
    pub commit_options: Option<CommitRequestOptions>,
    pub github_options: Option<GithubRequestOptions>,
}

/// A request that passed validation, with every layer of options resolved.
#[derive(Debug, Clone)]
pub struct ValidRequest {
    pub mode: AnalysisMode,
    pub repo_path: Option<PathBuf>,
    pub slug: Option<RepoSlug>,
    pub blame: AttributionOptions,
    pub commits: CommitStatsOptions,
    pub fetch: FetchOptions,
    pub fetch_settings: FetchSettings,
}

impl AnalysisRequest {
    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|e| Error::InvalidRequest(format!("Malformed request body: {}", e)))
    }

    /// Check mode-specific required fields and resolve options over `config`.
    pub fn validate(&self, config: &AttributionConfig) -> Result<ValidRequest> {
        let mode = self
            .mode
            .ok_or_else(|| Error::InvalidRequest("Missing field 'mode'".to_string()))?;

        let repo_path = match (&self.repo_path, mode.needs_local()) {
            (Some(path), true) => {
                if !path.exists() {
                    return Err(Error::InvalidRequest(format!(
                        "Repository path {} does not exist",
                        path.display()
                    )));
                }
                Some(path.clone())
            }
            (None, true) => {
                return Err(Error::InvalidRequest(format!(
                    "Mode '{}' requires 'repoPath'",
                    mode
                )))
            }
            (path, false) => path.clone(),
        };

        let slug = match (self.owner.as_deref(), self.repo.as_deref()) {
            (Some(owner), Some(repo)) => Some(RepoSlug::new(owner, repo)?),
            _ if mode.needs_remote() => {
                return Err(Error::InvalidRequest(format!(
                    "Mode '{}' requires 'owner' and 'repo'",
                    mode
                )))
            }
            _ => None,
        };

        let since = self.since.as_deref().map(|s| parse_date(s, false)).transpose()?;
        let until = self.until.as_deref().map(|s| parse_date(s, true)).transpose()?;
        if let (Some(since), Some(until)) = (since, until) {
            if since > until {
                return Err(Error::InvalidRequest(format!(
                    "'since' ({}) is after 'until' ({})",
                    since.to_rfc3339(),
                    until.to_rfc3339()
                )));
            }
        }
        let branch = self.branch.clone().filter(|b| !b.trim().is_empty());

        let mut blame = config.attribution_options();
        blame.revision = branch.clone();
        if let Some(o) = &self.blame_options {
            if o.max_concurrency == Some(0) {
                return Err(Error::InvalidRequest(
                    "blameOptions.maxConcurrency must be at least 1".to_string(),
                ));
            }
            apply(&mut blame.max_concurrency, o.max_concurrency);
            apply(&mut blame.respect_ignore_revs_file, o.respect_ignore_revs_file);
            apply(&mut blame.ignore_whitespace, o.ignore_whitespace);
            apply(&mut blame.detect_moves, o.detect_moves);
            apply(&mut blame.detect_copies, o.detect_copies);
            apply(&mut blame.use_mailmap, o.use_mailmap);
            blame.ignore_revs_file = o.ignore_revs_file.clone();
            blame.ignore_revs = o.ignore_revs.clone();
            blame.include_patterns = o.include_patterns.clone();
            blame.exclude_patterns = o.exclude_patterns.clone();
            blame.include_file_breakdown = o.include_file_breakdown;
        }

        let mut commits = CommitStatsOptions {
            since,
            until,
            branch: branch.clone(),
            use_mailmap: config.blame.use_mailmap,
            ..Default::default()
        };
        if let Some(o) = &self.commit_options {
            if o.max_commits == Some(0) {
                return Err(Error::InvalidRequest(
                    "commitOptions.maxCommits must be at least 1".to_string(),
                ));
            }
            apply(&mut commits.exclude_merges, o.exclude_merges);
            apply(&mut commits.use_mailmap, o.use_mailmap);
            apply(&mut commits.exclude_bots, o.exclude_bots);
            commits.max_commits = o.max_commits;
        }

        let mut fetch = FetchOptions {
            branch,
            since,
            until,
            ..Default::default()
        };
        let mut fetch_settings = config.fetch_settings();
        if let Some(o) = &self.github_options {
            if o.max_commits == Some(0) {
                return Err(Error::InvalidRequest(
                    "githubOptions.maxCommits must be at least 1".to_string(),
                ));
            }
            fetch.max_commits = o.max_commits;
            apply(&mut fetch.exclude_merges, o.exclude_merges);
            apply(&mut fetch_settings.max_hydration_calls, o.max_hydration_calls);
            if o.hydration_skip_above.is_some() {
                fetch_settings.hydration_skip_above = o.hydration_skip_above;
            }
        }

        Ok(ValidRequest {
            mode,
            repo_path,
            slug,
            blame,
            commits,
            fetch,
            fetch_settings,
        })
    }
}

fn apply<T>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

/// Parse an RFC 3339 instant or a calendar date.
///
/// A bare date is the start of that day, or its last second when `end_of_day`.
pub fn parse_date(s: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        Error::InvalidRequest(format!(
            "'{}' is not a date (expected YYYY-MM-DD or RFC 3339)",
            s
        ))
    })?;
    let time = if end_of_day {
        NaiveTime::from_hms_opt(23, 59, 59)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .unwrap_or_default();
    Ok(date.and_time(time).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(mode: AnalysisMode) -> AnalysisRequest {
        AnalysisRequest {
            mode: Some(mode),
            ..Default::default()
        }
    }

    #[test]
    fn test_mode_names_round_trip() -> anyhow::Result<()> {
        for mode in AnalysisMode::ALL {
            assert_eq!(mode.as_str().parse::<AnalysisMode>()?, mode);
            assert_eq!(serde_json::to_string(&mode)?, format!("\"{}\"", mode));
        }
        assert!("everything".parse::<AnalysisMode>().is_err());
        Ok(())
    }

    #[test]
    fn test_missing_fields_are_invalid() {
        let config = AttributionConfig::default();
        let invalid = |r: AnalysisRequest| matches!(r.validate(&config), Err(Error::InvalidRequest(_)));

        assert!(invalid(AnalysisRequest::default()));
        assert!(invalid(request(AnalysisMode::Blame)));
        assert!(invalid(request(AnalysisMode::Commits)));
        assert!(invalid(request(AnalysisMode::RemoteMetadata)));
        assert!(invalid(request(AnalysisMode::Legacy)));

        let mut hybrid = request(AnalysisMode::Hybrid);
        hybrid.owner = Some("acme".to_string());
        hybrid.repo = Some("widgets".to_string());
        assert!(invalid(hybrid));
    }

    #[test]
    fn test_remote_modes_need_only_slug() -> anyhow::Result<()> {
        let mut r = request(AnalysisMode::Legacy);
        r.owner = Some("acme".to_string());
        r.repo = Some("widgets".to_string());
        r.github_options = Some(GithubRequestOptions {
            max_commits: Some(120),
            exclude_merges: Some(false),
            max_hydration_calls: Some(5),
            ..Default::default()
        });
        let valid = r.validate(&AttributionConfig::default())?;
        assert_eq!(valid.slug.map(|s| s.to_string()).as_deref(), Some("acme/widgets"));
        assert_eq!(valid.fetch.max_commits, Some(120));
        assert!(!valid.fetch.exclude_merges);
        assert_eq!(valid.fetch_settings.max_hydration_calls, 5);
        Ok(())
    }

    #[test]
    fn test_options_layer_over_config() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut config = AttributionConfig::default();
        config.blame.detect_copies = true;
        config.blame.max_concurrency = 3;

        let r = AnalysisRequest::from_json(&format!(
            r#"{{"mode":"blame","repoPath":{:?},"branch":"main",
                "blameOptions":{{"ignoreWhitespace":false,"excludePatterns":["vendor/**"]}}}}"#,
            dir.path().display().to_string()
        ))?;
        let valid = r.validate(&config)?;
        assert!(valid.blame.detect_copies);
        assert_eq!(valid.blame.max_concurrency, 3);
        assert!(!valid.blame.ignore_whitespace);
        assert_eq!(valid.blame.exclude_patterns, vec!["vendor/**".to_string()]);
        assert_eq!(valid.blame.revision.as_deref(), Some("main"));
        Ok(())
    }

    #[test]
    fn test_date_range() -> anyhow::Result<()> {
        let since = parse_date("2024-01-01", false)?;
        let until = parse_date("2024-01-31", true)?;
        assert_eq!(since.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(until.to_rfc3339(), "2024-01-31T23:59:59+00:00");
        assert_eq!(
            parse_date("2024-02-03T04:05:06+02:00", false)?.to_rfc3339(),
            "2024-02-03T02:05:06+00:00"
        );
        assert!(parse_date("last tuesday", false).is_err());

        let dir = tempdir()?;
        let mut r = request(AnalysisMode::Commits);
        r.repo_path = Some(dir.path().to_path_buf());
        r.since = Some("2024-02-01".to_string());
        r.until = Some("2024-01-01".to_string());
        assert!(matches!(
            r.validate(&AttributionConfig::default()),
            Err(Error::InvalidRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn test_malformed_body() {
        assert!(matches!(
            AnalysisRequest::from_json("{\"mode\": 3}"),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            AnalysisRequest::from_json("{\"mode\": \"sideways\"}"),
            Err(Error::InvalidRequest(_))
        ));
    }
}
