//! Paginated commit listing with stat hydration
//!
//! Listing endpoints return commits without line stats. After pagination
//! the fetcher hydrates missing stats with one detail call per commit, in
//! small concurrent batches and under a hard call cap. Records beyond the
//! cap keep zeroed stats and the result carries a `PartialHydration`
//! warning instead of failing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::queue::RequestQueue;
use super::{blocking, CommitQuery, ListPage, RemoteApi, RepoSlug, PAGE_SIZE};
use crate::error::{Result, Warning};
use crate::models::{CommitRecord, HistoryStatus};

/// Per-request filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchOptions {
    pub branch: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Upper bound on returned commits, applied after merge filtering
    pub max_commits: Option<usize>,
    pub exclude_merges: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            branch: None,
            since: None,
            until: None,
            max_commits: None,
            exclude_merges: true,
        }
    }
}

/// Paging and hydration limits, normally taken from configuration.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub page_size: u32,
    /// Hard pagination ceiling
    pub max_pages: u32,
    pub hydration_batch_size: usize,
    pub max_hydration_calls: usize,
    /// Skip hydration entirely when this many records or more need it
    pub hydration_skip_above: Option<usize>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            max_pages: 100,
            hydration_batch_size: 10,
            max_hydration_calls: 1_000,
            hydration_skip_above: None,
        }
    }
}

/// Progress notifications from a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchProgress {
    Page {
        current: u32,
        total: Option<u32>,
        commits: usize,
    },
    Hydrating {
        done: usize,
        total: usize,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFetchResult {
    /// Remote API order: page index, then order within the page
    pub commits: Vec<CommitRecord>,
    pub status: HistoryStatus,
    pub pages_fetched: u32,
    pub merges_dropped: usize,
    pub hydrated: usize,
    pub warnings: Vec<Warning>,
}

pub struct CommitFetcher {
    api: Arc<dyn RemoteApi>,
    queue: Arc<RequestQueue>,
    settings: FetchSettings,
}

/// Running state of one pagination.
struct Pages {
    raw: BTreeMap<u32, Vec<CommitRecord>>,
    kept: usize,
    exclude_merges: bool,
}

impl Pages {
    fn insert(&mut self, page: u32, items: Vec<CommitRecord>) {
        self.kept += items
            .iter()
            .filter(|c| !(self.exclude_merges && c.is_merge()))
            .count();
        self.raw.insert(page, items);
    }
}

impl CommitFetcher {
    pub fn new(api: Arc<dyn RemoteApi>, queue: Arc<RequestQueue>, settings: FetchSettings) -> Self {
        Self {
            api,
            queue,
            settings,
        }
    }

    /// Fetch the commit history of `slug` and hydrate line stats.
    pub async fn fetch_commits<P>(
        &self,
        slug: &RepoSlug,
        options: &FetchOptions,
        on_progress: P,
    ) -> Result<CommitFetchResult>
    where
        P: Fn(FetchProgress) + Send + Sync,
    {
        let query = CommitQuery {
            branch: options.branch.clone(),
            since: options.since,
            until: options.until,
            per_page: self.settings.page_size.max(1),
        };
        let page_size = query.per_page as usize;
        let max_pages = self.settings.max_pages.max(1);
        let wanted_pages = options
            .max_commits
            .map(|max| (max.div_ceil(page_size).max(1)) as u32)
            .unwrap_or(max_pages)
            .min(max_pages);
        let enough = |kept: usize| options.max_commits.is_some_and(|max| kept >= max);

        let mut pages = Pages {
            raw: BTreeMap::new(),
            kept: 0,
            exclude_merges: options.exclude_merges,
        };
        let mut warnings = Vec::new();

        self.queue.guard().invalidate().await;
        let first = self.fetch_page(slug, &query, 1).await?;
        let last_page = first.last_page;
        let mut full = first.items.len() >= page_size;
        pages.insert(1, first.items);
        on_progress(FetchProgress::Page {
            current: 1,
            total: last_page,
            commits: pages.kept,
        });

        // Known page count: the rest goes out concurrently
        let mut next = 2;
        if let Some(last) = last_page.filter(|_| full) {
            let upto = last.min(wanted_pages);
            if upto >= next {
                self.queue.guard().invalidate().await;
                let fetched = self.fetch_concurrently(slug, &query, next..=upto).await?;
                for (page, listing) in fetched {
                    full = listing.items.len() >= page_size;
                    pages.insert(page, listing.items);
                    on_progress(FetchProgress::Page {
                        current: page,
                        total: Some(last),
                        commits: pages.kept,
                    });
                }
                next = upto + 1;
            }
            full = full && next <= last;
        }

        // Unknown page count, or merges left us short of max_commits
        while full && !enough(pages.kept) && next <= max_pages {
            self.queue.guard().invalidate().await;
            let listing = self.fetch_page(slug, &query, next).await?;
            full = listing.items.len() >= page_size;
            pages.insert(next, listing.items);
            on_progress(FetchProgress::Page {
                current: next,
                total: last_page,
                commits: pages.kept,
            });
            next += 1;
        }

        let pages_fetched = next - 1;
        if full && !enough(pages.kept) && pages_fetched >= max_pages {
            warn!("{}: stopped paginating at the {} page ceiling", slug, max_pages);
            warnings.push(Warning::PageCeilingReached {
                pages: pages_fetched,
            });
        }

        let seen: usize = pages.raw.values().map(Vec::len).sum();
        let mut merges_dropped = 0;
        let mut commits = Vec::with_capacity(pages.kept);
        for record in pages.raw.into_values().flatten() {
            if options.exclude_merges && record.is_merge() {
                merges_dropped += 1;
                continue;
            }
            commits.push(record);
        }
        if let Some(max) = options.max_commits {
            commits.truncate(max);
        }
        let status = HistoryStatus::classify(seen, commits.len(), merges_dropped);
        info!(
            "{}: {} commits over {} pages ({} merges dropped)",
            slug,
            commits.len(),
            pages_fetched,
            merges_dropped
        );

        let hydrated = self
            .hydrate(slug, &mut commits, &mut warnings, &on_progress)
            .await?;

        Ok(CommitFetchResult {
            commits,
            status,
            pages_fetched,
            merges_dropped,
            hydrated,
            warnings,
        })
    }

    async fn fetch_page(
        &self,
        slug: &RepoSlug,
        query: &CommitQuery,
        page: u32,
    ) -> Result<ListPage<CommitRecord>> {
        let api = Arc::clone(&self.api);
        let (slug, query) = (slug.clone(), query.clone());
        self.queue
            .add(|| blocking(move || api.list_commits(&slug, &query, page)))
            .await
    }

    /// Fetch a page range through the queue, reassembled by page index.
    async fn fetch_concurrently(
        &self,
        slug: &RepoSlug,
        query: &CommitQuery,
        range: std::ops::RangeInclusive<u32>,
    ) -> Result<BTreeMap<u32, ListPage<CommitRecord>>> {
        debug!(
            "{}: fetching pages {:?}, {} at a time",
            slug,
            range,
            self.queue.concurrency()
        );
        let mut tasks = JoinSet::new();
        for page in range {
            let api = Arc::clone(&self.api);
            let queue = Arc::clone(&self.queue);
            let (slug, query) = (slug.clone(), query.clone());
            tasks.spawn(async move {
                let listing = queue
                    .add(|| blocking(move || api.list_commits(&slug, &query, page)))
                    .await;
                (page, listing)
            });
        }

        let mut out = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (page, listing) = joined?;
            match listing {
                Ok(listing) => {
                    out.insert(page, listing);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// Fill in line stats for records that lack them. Returns how many were hydrated.
    async fn hydrate<P>(
        &self,
        slug: &RepoSlug,
        commits: &mut [CommitRecord],
        warnings: &mut Vec<Warning>,
        on_progress: &P,
    ) -> Result<usize>
    where
        P: Fn(FetchProgress) + Send + Sync,
    {
        let missing: Vec<usize> = commits
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.stats_known)
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        if let Some(threshold) = self.settings.hydration_skip_above {
            if missing.len() >= threshold {
                info!(
                    "{}: {} commits need stats (threshold {}), skipping hydration",
                    slug,
                    missing.len(),
                    threshold
                );
                warnings.push(Warning::PartialHydration {
                    hydrated: 0,
                    skipped: missing.len(),
                });
                return Ok(0);
            }
        }

        let budget = missing.len().min(self.settings.max_hydration_calls);
        let batch_size = self.settings.hydration_batch_size.max(1);
        let mut hydrated = 0;

        for batch in missing[..budget].chunks(batch_size) {
            self.queue.guard().invalidate().await;

            let mut tasks = JoinSet::new();
            for &index in batch {
                let api = Arc::clone(&self.api);
                let queue = Arc::clone(&self.queue);
                let slug = slug.clone();
                let sha = commits[index].sha.clone();
                tasks.spawn(async move {
                    let delta = queue
                        .add(|| blocking(move || api.commit_detail(&slug, &sha)))
                        .await;
                    (index, delta)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (index, delta) = joined?;
                let delta = match delta {
                    Ok(delta) => delta,
                    Err(e) => {
                        tasks.abort_all();
                        return Err(e);
                    }
                };
                let record = &mut commits[index];
                record.additions = delta.additions;
                record.deletions = delta.deletions;
                record.stats_known = true;
                hydrated += 1;
            }

            on_progress(FetchProgress::Hydrating {
                done: hydrated,
                total: budget,
            });
        }

        let skipped = missing.len() - hydrated;
        if skipped > 0 {
            warn!(
                "{}: hydration capped at {} calls, {} commits keep zeroed stats",
                slug, self.settings.max_hydration_calls, skipped
            );
            warnings.push(Warning::PartialHydration { hydrated, skipped });
        }
        Ok(hydrated)
    }
}
