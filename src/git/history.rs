//! Commit-log statistics from a local repository
//!
//! Walks history from a revision, computes additions/deletions for each
//! commit against its first parent, and aggregates them per author along
//! with a chronological timeline of running totals.

use chrono::{DateTime, TimeZone, Utc};
use git2::{Repository, Sort};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::mailmap::IdentityResolver;
use crate::error::Result;
use crate::models::{
    CommitRecord, ContributorAggregate, ContributorTally, HistoryStatus, TimelineEntry,
};

/// Options for a commit-log walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommitStatsOptions {
    /// Drop commits with two or more parents
    pub exclude_merges: bool,
    /// Only commits authored at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only commits authored at or before this instant
    pub until: Option<DateTime<Utc>>,
    /// Branch or revision to walk from (default: HEAD)
    pub branch: Option<String>,
    /// Stop after this many kept commits
    pub max_commits: Option<usize>,
    pub use_mailmap: bool,
    /// Drop authors whose name ends with `[bot]`
    pub exclude_bots: bool,
}

impl Default for CommitStatsOptions {
    fn default() -> Self {
        Self {
            exclude_merges: true,
            since: None,
            until: None,
            branch: None,
            max_commits: None,
            use_mailmap: true,
            exclude_bots: false,
        }
    }
}

/// Per-author commit activity and the timeline it was built from.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStatsResult {
    pub authors: Vec<ContributorAggregate>,
    /// Oldest first
    pub timeline: Vec<TimelineEntry>,
    pub status: HistoryStatus,
    /// Commits counted into `authors`
    pub total_commits: u64,
    /// Tip the walk started from
    pub revision: Option<String>,
}

/// Local commit-log engine.
pub struct CommitStatsEngine {
    repo_path: PathBuf,
    options: CommitStatsOptions,
}

impl CommitStatsEngine {
    pub fn new(repo_path: &Path, options: CommitStatsOptions) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            options,
        }
    }

    /// Walk the log and aggregate.
    ///
    /// `on_progress` receives the number of commits processed so far.
    pub fn compute_stats<F>(&self, on_progress: F) -> Result<CommitStatsResult>
    where
        F: Fn(usize),
    {
        let repo = super::open_repo(&self.repo_path)?;
        let Some(tip) = super::resolve_tip(&repo, self.options.branch.as_deref())? else {
            info!("Repository has no commits");
            return Ok(CommitStatsResult {
                status: HistoryStatus::EmptyRepository,
                ..Default::default()
            });
        };
        let tip_id = tip.id();
        let resolver =
            IdentityResolver::for_repo(&repo, Some(&tip_id.to_string()), self.options.use_mailmap);

        let mut revwalk = repo.revwalk()?;
        revwalk.set_sorting(Sort::TIME)?;
        revwalk.push(tip_id)?;

        let mut seen = 0usize;
        let mut merges_dropped = 0usize;
        let mut records = Vec::new();

        for oid_result in revwalk {
            if self
                .options
                .max_commits
                .is_some_and(|max| records.len() >= max)
            {
                break;
            }

            let commit = repo.find_commit(oid_result?)?;
            let authored = git_time(&commit.author().when());
            if self.options.since.is_some_and(|since| authored < since)
                || self.options.until.is_some_and(|until| authored > until)
            {
                continue;
            }
            seen += 1;

            if self.options.exclude_merges && commit.parent_count() >= 2 {
                merges_dropped += 1;
                continue;
            }
            if self.options.exclude_bots && is_bot(commit.author().name().unwrap_or("")) {
                continue;
            }

            records.push(commit_record(&repo, &commit)?);
            if records.len() % 100 == 0 {
                on_progress(records.len());
            }
        }
        on_progress(records.len());

        let status = HistoryStatus::classify(seen, records.len(), merges_dropped);
        debug!(
            "Walked {} commits: {} kept, {} merges dropped",
            seen,
            records.len(),
            merges_dropped
        );

        // Revwalk is newest first; the timeline runs oldest first
        records.reverse();

        let mut tally = ContributorTally::new();
        let mut timeline = Vec::with_capacity(records.len());
        let (mut commits, mut additions, mut deletions) = (0u64, 0u64, 0u64);
        for record in &records {
            let identity = resolver.resolve(&record.author_name, &record.author_email);
            tally.record(&identity, record);

            commits += 1;
            additions += record.additions;
            deletions += record.deletions;
            timeline.push(TimelineEntry {
                sha: record.sha.clone(),
                date: record.author_date,
                author_name: identity.canonical_name.clone(),
                author_email: identity.canonical_email.clone(),
                additions: record.additions,
                deletions: record.deletions,
                cumulative_commits: commits,
                cumulative_additions: additions,
                cumulative_deletions: deletions,
            });
        }

        let authors = tally.finish();
        info!(
            "Commit stats complete: {} commits by {} authors",
            commits,
            authors.len()
        );

        Ok(CommitStatsResult {
            authors,
            timeline,
            status,
            total_commits: commits,
            revision: Some(tip_id.to_string()),
        })
    }
}

/// Build a [`CommitRecord`] with stats against the first parent.
///
/// Root commits are diffed against the empty tree.
pub(crate) fn commit_record(repo: &Repository, commit: &git2::Commit<'_>) -> Result<CommitRecord> {
    let author = commit.author();
    let tree = commit.tree()?;
    let parent_tree = commit.parent(0).ok().map(|p| p.tree()).transpose()?;
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
    let stats = diff.stats()?;

    Ok(CommitRecord {
        sha: commit.id().to_string(),
        author_name: author.name().unwrap_or("Unknown").to_string(),
        author_email: author.email().unwrap_or("").to_lowercase(),
        author_date: git_time(&author.when()),
        login: None,
        message: commit.summary().unwrap_or("").to_string(),
        additions: stats.insertions() as u64,
        deletions: stats.deletions() as u64,
        parent_count: commit.parent_count() as u32,
        stats_known: true,
    })
}

/// Automation accounts, e.g. `dependabot[bot]`.
pub fn is_bot(name: &str) -> bool {
    name.trim_end().ends_with("[bot]")
}

fn git_time(time: &git2::Time) -> DateTime<Utc> {
    Utc.timestamp_opt(time.seconds(), 0)
        .single()
        .unwrap_or_default()
}
