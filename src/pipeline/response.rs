//! Mode-specific response shapes and the merges that build them

use serde::Serialize;
use std::collections::HashMap;

use crate::error::Warning;
use crate::git::{AttributionResult, CommitStatsResult};
use crate::models::{
    sort_contributors, AuthorIdentity, ContributorAggregate, ContributorTally, HistoryStatus,
    TimelineEntry,
};
use crate::remote::{CommitFetchResult, RemoteMetadata};

/// Blame and commit activity side by side, plus remote activity by login.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridReport {
    /// Keyed by author identity; every entry carries both ownership and activity
    pub contributors: Vec<ContributorAggregate>,
    pub total_lines: u64,
    pub files_processed: usize,
    pub total_commits: u64,
    pub status: HistoryStatus,
    pub timeline: Vec<TimelineEntry>,
    pub remote: RemoteMetadata,
    pub warnings: Vec<Warning>,
}

/// Contributor aggregates built from the remote commit listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyReport {
    pub repository: String,
    pub contributors: Vec<ContributorAggregate>,
    pub total_commits: u64,
    pub status: HistoryStatus,
    pub pages_fetched: u32,
    pub merges_dropped: usize,
    pub hydrated: usize,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum AnalysisResponse {
    Blame(AttributionResult),
    Commits(CommitStatsResult),
    RemoteMetadata(RemoteMetadata),
    Hybrid(HybridReport),
    Legacy(LegacyReport),
}

impl AnalysisResponse {
    /// One-line description for the terminal `complete` event.
    pub fn summary(&self) -> String {
        match self {
            AnalysisResponse::Blame(r) => format!(
                "Analysis complete. Attributed {} lines across {} files to {} authors.",
                r.total_lines,
                r.files_processed,
                r.authors.len()
            ),
            AnalysisResponse::Commits(r) => format!(
                "Analysis complete. Processed {} commits from {} authors.",
                r.total_commits,
                r.authors.len()
            ),
            AnalysisResponse::RemoteMetadata(r) => format!(
                "Analysis complete. Listed {} pull requests and {} issues for {} accounts.",
                r.total_pull_requests,
                r.total_issues,
                r.contributors.len()
            ),
            AnalysisResponse::Hybrid(r) => format!(
                "Analysis complete. Merged {} lines and {} commits for {} contributors.",
                r.total_lines,
                r.total_commits,
                r.contributors.len()
            ),
            AnalysisResponse::Legacy(r) => {
                format!("Analysis complete. Processed {} commits.", r.total_commits)
            }
        }
    }

    pub fn warnings(&self) -> &[Warning] {
        match self {
            AnalysisResponse::Blame(r) => &r.warnings,
            AnalysisResponse::Commits(_) => &[],
            AnalysisResponse::RemoteMetadata(r) => &r.warnings,
            AnalysisResponse::Hybrid(r) => &r.warnings,
            AnalysisResponse::Legacy(r) => &r.warnings,
        }
    }

    pub fn status(&self) -> HistoryStatus {
        match self {
            AnalysisResponse::Blame(r) => r.status,
            AnalysisResponse::Commits(r) => r.status,
            AnalysisResponse::RemoteMetadata(_) => HistoryStatus::Populated,
            AnalysisResponse::Hybrid(r) => r.status,
            AnalysisResponse::Legacy(r) => r.status,
        }
    }
}

/// Union blame ownership and commit activity by identity key.
///
/// Commit-only authors own zero lines; blame-only authors have zero commits.
pub fn merge_hybrid(
    blame: AttributionResult,
    stats: CommitStatsResult,
    remote: RemoteMetadata,
) -> HybridReport {
    let total_lines = blame.total_lines;
    let mut by_key: HashMap<String, ContributorAggregate> = stats
        .authors
        .into_iter()
        .map(|a| (a.identity.key(), a))
        .collect();

    for owner in &blame.authors {
        let entry = by_key
            .entry(owner.identity.key())
            .or_insert_with(|| ContributorAggregate::new(owner.identity.clone()));
        entry.identity.absorb(&owner.identity);
        entry.set_ownership(owner.lines, total_lines);
    }
    for agg in by_key.values_mut() {
        if agg.line_ownership.is_none() {
            agg.set_ownership(0, total_lines);
        }
    }

    let mut contributors: Vec<ContributorAggregate> = by_key.into_values().collect();
    sort_contributors(&mut contributors);

    let mut warnings = blame.warnings;
    warnings.extend(remote.warnings.iter().cloned());

    HybridReport {
        contributors,
        total_lines,
        files_processed: blame.files_processed,
        total_commits: stats.total_commits,
        status: stats.status,
        timeline: stats.timeline,
        remote,
        warnings,
    }
}

/// Aggregate remote commits per author.
///
/// Remote records carry no mailmap; identities are keyed by email.
pub fn aggregate_remote(repository: String, fetched: CommitFetchResult) -> LegacyReport {
    let mut tally = ContributorTally::new();
    for commit in &fetched.commits {
        let identity = AuthorIdentity::new(commit.author_name.clone(), commit.author_email.clone());
        tally.record(&identity, commit);
    }

    LegacyReport {
        repository,
        contributors: tally.finish(),
        total_commits: fetched.commits.len() as u64,
        status: fetched.status,
        pages_fetched: fetched.pages_fetched,
        merges_dropped: fetched.merges_dropped,
        hydrated: fetched.hydrated,
        warnings: fetched.warnings,
    }
}
