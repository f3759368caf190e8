//! Pull request, issue and contributor listings
//!
//! Collects remote-only activity keyed by account login. The three
//! listings are paged independently and run concurrently through the
//! request's queue.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::queue::RequestQueue;
use super::{blocking, ListPage, RemoteApi, RepoSlug, PAGE_SIZE};
use crate::error::{Result, Warning};

#[derive(Debug, Clone)]
pub struct MetadataSettings {
    /// Page ceiling per listing
    pub max_pages: u32,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self { max_pages: 10 }
    }
}

/// Remote activity of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginActivity {
    pub login: String,
    /// Commit count reported by the contributors endpoint
    pub contributions: u64,
    pub pull_requests_opened: u64,
    pub pull_requests_merged: u64,
    pub issues_opened: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMetadata {
    pub repository: String,
    /// Sorted by contributions, then pull requests, then login
    pub contributors: Vec<LoginActivity>,
    pub total_pull_requests: u64,
    pub total_issues: u64,
    pub warnings: Vec<Warning>,
}

pub struct RemoteMetadataCollector {
    api: Arc<dyn RemoteApi>,
    queue: Arc<RequestQueue>,
    settings: MetadataSettings,
}

impl RemoteMetadataCollector {
    pub fn new(api: Arc<dyn RemoteApi>, queue: Arc<RequestQueue>, settings: MetadataSettings) -> Self {
        Self {
            api,
            queue,
            settings,
        }
    }

    /// List everything for `slug`. `on_listing` is called as each listing finishes.
    pub async fn collect<P>(&self, slug: &RepoSlug, on_listing: P) -> Result<RemoteMetadata>
    where
        P: Fn(&'static str) + Send + Sync,
    {
        self.queue.guard().invalidate().await;

        let (pulls, issues, contributors) = tokio::try_join!(
            async {
                let r = self
                    .list_all("pull requests", slug, |api, slug, page| {
                        api.list_pull_requests(slug, page)
                    })
                    .await;
                on_listing("pull requests");
                r
            },
            async {
                let r = self
                    .list_all("issues", slug, |api, slug, page| api.list_issues(slug, page))
                    .await;
                on_listing("issues");
                r
            },
            async {
                let r = self
                    .list_all("contributors", slug, |api, slug, page| {
                        api.list_contributors(slug, page)
                    })
                    .await;
                on_listing("contributors");
                r
            },
        )?;

        let mut warnings = Vec::new();
        warnings.extend(pulls.1);
        warnings.extend(issues.1);
        warnings.extend(contributors.1);

        let mut by_login: BTreeMap<String, LoginActivity> = BTreeMap::new();
        for c in &contributors.0 {
            activity(&mut by_login, &c.login).contributions += c.contributions;
        }
        for pr in &pulls.0 {
            if let Some(login) = &pr.author_login {
                let entry = activity(&mut by_login, login);
                entry.pull_requests_opened += 1;
                if pr.merged_at.is_some() {
                    entry.pull_requests_merged += 1;
                }
            }
        }
        for issue in &issues.0 {
            if let Some(login) = &issue.author_login {
                activity(&mut by_login, login).issues_opened += 1;
            }
        }

        let mut contributors_out: Vec<LoginActivity> = by_login.into_values().collect();
        contributors_out.sort_by(|a, b| {
            b.contributions
                .cmp(&a.contributions)
                .then(b.pull_requests_opened.cmp(&a.pull_requests_opened))
                .then(a.login.cmp(&b.login))
        });

        info!(
            "{}: {} pull requests, {} issues, {} accounts",
            slug,
            pulls.0.len(),
            issues.0.len(),
            contributors_out.len()
        );

        Ok(RemoteMetadata {
            repository: slug.to_string(),
            contributors: contributors_out,
            total_pull_requests: pulls.0.len() as u64,
            total_issues: issues.0.len() as u64,
            warnings,
        })
    }

    /// Page through one listing until a short page or the ceiling.
    async fn list_all<T, F>(
        &self,
        resource: &'static str,
        slug: &RepoSlug,
        call: F,
    ) -> Result<(Vec<T>, Option<Warning>)>
    where
        T: Send + 'static,
        F: Fn(&dyn RemoteApi, &RepoSlug, u32) -> Result<ListPage<T>> + Copy + Send + 'static,
    {
        let max_pages = self.settings.max_pages.max(1);
        let mut items = Vec::new();

        for page in 1..=max_pages {
            let api = Arc::clone(&self.api);
            let slug_owned = slug.clone();
            let listing = self
                .queue
                .add(|| blocking(move || call(api.as_ref(), &slug_owned, page)))
                .await?;
            let full = listing.items.len() >= PAGE_SIZE as usize;
            items.extend(listing.items);

            if !full {
                return Ok((items, None));
            }
        }

        warn!(
            "{}: {} listing truncated after {} pages",
            slug, resource, max_pages
        );
        Ok((
            items,
            Some(Warning::MetadataTruncated {
                resource: resource.to_string(),
                pages: max_pages,
            }),
        ))
    }
}

fn activity<'a>(by_login: &'a mut BTreeMap<String, LoginActivity>, login: &str) -> &'a mut LoginActivity {
    by_login
        .entry(login.to_string())
        .or_insert_with(|| LoginActivity {
            login: login.to_string(),
            ..Default::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::rate_limit::{RateLimitGuard, RateLimitSettings};
    use crate::remote::testing::ScriptedRemote;
    use crate::remote::{IssueSummary, PullRequestSummary, RemoteContributor};
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    fn collector(remote: Arc<ScriptedRemote>, max_pages: u32) -> RemoteMetadataCollector {
        let guard = Arc::new(RateLimitGuard::new(remote.clone(), RateLimitSettings::default()));
        let queue = Arc::new(RequestQueue::new(8, guard, CancellationToken::new()));
        RemoteMetadataCollector::new(remote, queue, MetadataSettings { max_pages })
    }

    fn pr(number: u64, login: &str, merged: bool) -> PullRequestSummary {
        PullRequestSummary {
            number,
            title: format!("PR {}", number),
            author_login: Some(login.to_string()),
            created_at: Utc::now(),
            merged_at: merged.then(Utc::now),
        }
    }

    #[tokio::test]
    async fn test_activity_is_keyed_by_login() -> anyhow::Result<()> {
        let mut remote = ScriptedRemote::new(vec![]);
        remote.contributors = vec![
            RemoteContributor {
                login: "ada".to_string(),
                contributions: 40,
            },
            RemoteContributor {
                login: "bob".to_string(),
                contributions: 12,
            },
        ];
        remote.pull_requests = vec![pr(1, "ada", true), pr(2, "bob", false), pr(3, "bob", true)];
        remote.issues = vec![IssueSummary {
            number: 9,
            title: "crash".to_string(),
            author_login: Some("carol".to_string()),
            created_at: Utc::now(),
            closed_at: None,
        }];

        let seen = std::sync::Mutex::new(Vec::new());
        let meta = collector(Arc::new(remote), 10)
            .collect(&RepoSlug::new("acme", "widgets")?, |l| {
                seen.lock().unwrap().push(l)
            })
            .await?;

        assert_eq!(meta.total_pull_requests, 3);
        assert_eq!(meta.total_issues, 1);
        assert_eq!(meta.contributors.len(), 3);
        assert_eq!(meta.contributors[0].login, "ada");
        let bob = &meta.contributors[1];
        assert_eq!(bob.pull_requests_opened, 2);
        assert_eq!(bob.pull_requests_merged, 1);
        assert_eq!(meta.contributors[2].issues_opened, 1);
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert!(meta.warnings.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_ceiling_is_reported() -> anyhow::Result<()> {
        let mut remote = ScriptedRemote::new(vec![]);
        remote.pull_requests = (0..250).map(|n| pr(n, "ada", false)).collect();
        let meta = collector(Arc::new(remote), 2)
            .collect(&RepoSlug::new("acme", "widgets")?, |_| {})
            .await?;
        assert_eq!(meta.total_pull_requests, 200);
        assert_eq!(
            meta.warnings,
            vec![Warning::MetadataTruncated {
                resource: "pull requests".to_string(),
                pages: 2
            }]
        );
        Ok(())
    }
}
