//! Core data models for attribution results
//!
//! These types flow between the engines and out to downstream report
//! layers. All of them are recomputed for every request.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A single commit as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    /// Full 40-hex commit id
    pub sha: String,
    pub author_name: String,
    /// Lowercased author email
    pub author_email: String,
    pub author_date: DateTime<Utc>,
    /// Remote account login, when the hosting API reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// First line of the commit message
    pub message: String,
    pub additions: u64,
    pub deletions: u64,
    pub parent_count: u32,
    /// False when additions/deletions were never hydrated
    pub stats_known: bool,
}

impl CommitRecord {
    /// Merge commits (two or more parents) represent integration, not authored work.
    pub fn is_merge(&self) -> bool {
        self.parent_count >= 2
    }
}

/// Canonical identity of a contributor after mailmap resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorIdentity {
    pub canonical_name: String,
    pub canonical_email: String,
    /// Raw emails observed for this identity, lowercased
    #[serde(default)]
    pub alias_emails: BTreeSet<String>,
}

impl AuthorIdentity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            canonical_name: name.into(),
            canonical_email: email.into().to_lowercase(),
            alias_emails: BTreeSet::new(),
        }
    }

    /// Key used to merge contributors across engines.
    pub fn key(&self) -> String {
        if self.canonical_email.is_empty() {
            self.canonical_name.to_lowercase()
        } else {
            self.canonical_email.clone()
        }
    }

    /// Record a raw email seen for this identity.
    pub fn add_alias(&mut self, email: &str) {
        let email = email.to_lowercase();
        if !email.is_empty() && email != self.canonical_email {
            self.alias_emails.insert(email);
        }
    }

    /// Fold the aliases of another occurrence of the same identity into this one.
    pub fn absorb(&mut self, other: &AuthorIdentity) {
        for alias in &other.alias_emails {
            self.add_alias(alias);
        }
        self.add_alias(&other.canonical_email);
    }
}

/// Blame totals for a single file at a single revision.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBlameResult {
    pub path: String,
    pub total_lines: u64,
    /// Identity key -> lines
    pub per_author_lines: BTreeMap<String, u64>,
}

impl FileBlameResult {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Attribute `lines` lines to the author with the given identity key.
    pub fn attribute(&mut self, author_key: &str, lines: u64) {
        if lines == 0 {
            return;
        }
        *self.per_author_lines.entry(author_key.to_string()).or_insert(0) += lines;
        self.total_lines += lines;
    }

    /// Every line is owned by exactly one author.
    pub fn is_consistent(&self) -> bool {
        self.per_author_lines.values().sum::<u64>() == self.total_lines
    }
}

/// Whether a commit-based result actually contains authored commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum HistoryStatus {
    #[default]
    Populated,
    /// No commits reachable from the branch
    EmptyRepository,
    /// Commits exist but every one of them was excluded as a merge
    OnlyMergeCommits,
    /// Commits exist but the bot filter (possibly with the merge filter) dropped all of them
    AllFiltered,
}

impl HistoryStatus {
    /// Classify a history from the number of commits seen and the number kept.
    pub fn classify(seen: usize, kept: usize, merges_dropped: usize) -> Self {
        if seen == 0 {
            HistoryStatus::EmptyRepository
        } else if kept == 0 && merges_dropped == seen {
            HistoryStatus::OnlyMergeCommits
        } else if kept == 0 {
            HistoryStatus::AllFiltered
        } else {
            HistoryStatus::Populated
        }
    }

    pub fn describe(&self) -> Option<&'static str> {
        match self {
            HistoryStatus::Populated => None,
            HistoryStatus::EmptyRepository => Some("No commits are reachable from this branch."),
            HistoryStatus::OnlyMergeCommits => {
                Some("Every commit on this branch is a merge commit; nothing to attribute.")
            }
            HistoryStatus::AllFiltered => {
                Some("Every commit on this branch was excluded by the bot or merge filters.")
            }
        }
    }
}

/// One commit on the chronological timeline, with running totals.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub sha: String,
    pub date: DateTime<Utc>,
    pub author_name: String,
    pub author_email: String,
    pub additions: u64,
    pub deletions: u64,
    pub cumulative_commits: u64,
    pub cumulative_additions: u64,
    pub cumulative_deletions: u64,
}

/// Per-contributor merge of commit activity and line ownership.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributorAggregate {
    pub identity: AuthorIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    pub commit_count: u64,
    pub additions: u64,
    pub deletions: u64,
    pub net_lines: i64,
    /// Lines currently owned according to blame (None when blame did not run)
    pub line_ownership: Option<u64>,
    pub ownership_percent: Option<f64>,
    pub first_commit_date: Option<DateTime<Utc>>,
    pub last_commit_date: Option<DateTime<Utc>>,
    /// Distinct calendar days with at least one commit
    pub active_days: u32,
    /// Calendar days from first to last commit, inclusive
    pub span_days: u32,
}

impl ContributorAggregate {
    pub fn new(identity: AuthorIdentity) -> Self {
        Self {
            identity,
            login: None,
            commit_count: 0,
            additions: 0,
            deletions: 0,
            net_lines: 0,
            line_ownership: None,
            ownership_percent: None,
            first_commit_date: None,
            last_commit_date: None,
            active_days: 0,
            span_days: 0,
        }
    }

    /// Set blame ownership for this contributor.
    pub fn set_ownership(&mut self, lines: u64, total_lines: u64) {
        self.line_ownership = Some(lines);
        self.ownership_percent = Some(if total_lines == 0 {
            0.0
        } else {
            (lines as f64 / total_lines as f64) * 100.0
        });
    }
}

/// Accumulates commit records into per-identity aggregates.
#[derive(Debug, Default)]
pub struct ContributorTally {
    entries: HashMap<String, (ContributorAggregate, BTreeSet<NaiveDate>)>,
}

impl ContributorTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one commit authored by `identity`.
    pub fn record(&mut self, identity: &AuthorIdentity, commit: &CommitRecord) {
        let (agg, days) = self
            .entries
            .entry(identity.key())
            .or_insert_with(|| (ContributorAggregate::new(identity.clone()), BTreeSet::new()));
        agg.identity.absorb(identity);
        agg.identity.add_alias(&commit.author_email);
        if agg.login.is_none() {
            agg.login = commit.login.clone();
        }

        agg.commit_count += 1;
        agg.additions += commit.additions;
        agg.deletions += commit.deletions;
        agg.net_lines = agg.additions as i64 - agg.deletions as i64;

        let date = commit.author_date;
        if agg.first_commit_date.map_or(true, |d| date < d) {
            agg.first_commit_date = Some(date);
        }
        if agg.last_commit_date.map_or(true, |d| date > d) {
            agg.last_commit_date = Some(date);
        }
        days.insert(date.date_naive());
    }

    /// Finish aggregation, ordered by commit count then name.
    pub fn finish(self) -> Vec<ContributorAggregate> {
        let mut out: Vec<ContributorAggregate> = self
            .entries
            .into_values()
            .map(|(mut agg, days)| {
                agg.active_days = days.len() as u32;
                agg.span_days = match (agg.first_commit_date, agg.last_commit_date) {
                    (Some(first), Some(last)) => {
                        (last.date_naive() - first.date_naive()).num_days() as u32 + 1
                    }
                    _ => 0,
                };
                agg
            })
            .collect();
        sort_contributors(&mut out);
        out
    }
}

/// Sort by commits, then owned lines, then name for stable output.
pub fn sort_contributors(contributors: &mut [ContributorAggregate]) {
    contributors.sort_by(|a, b| {
        b.commit_count
            .cmp(&a.commit_count)
            .then(b.line_ownership.unwrap_or(0).cmp(&a.line_ownership.unwrap_or(0)))
            .then(a.identity.canonical_name.cmp(&b.identity.canonical_name))
    });
}
