//! Local repository engines
//!
//! Everything here reads a local git repository through libgit2 (the
//! `git2` crate) and never touches the network.
//!
//! - [`BlameEngine`] computes line-level ownership per author
//! - [`CommitStatsEngine`] walks the log for commit activity and a timeline
//! - [`Mailmap`] / [`IdentityResolver`] collapse author aliases
//! - [`IgnoreRevs`] lists revisions excluded from blame
//!
//! # Example
//!
//! ```no_run
//! use authorship::git::{AttributionOptions, BlameEngine};
//! use std::path::Path;
//!
//! let engine = BlameEngine::new(Path::new("/path/to/repo"), AttributionOptions::default());
//! let result = engine.compute_attribution(|_, _| {}).unwrap();
//! println!("{} lines across {} files", result.total_lines, result.files_processed);
//! ```

pub mod blame;
pub mod history;
pub mod ignore_revs;
pub mod mailmap;

pub use blame::{AttributionOptions, AttributionResult, AuthorLines, BlameEngine};
pub use history::{CommitStatsEngine, CommitStatsOptions, CommitStatsResult};
pub use ignore_revs::IgnoreRevs;
pub use mailmap::{IdentityResolver, Mailmap};

use git2::{Commit, Repository};

use crate::error::{Error, Result};

/// Open the repository containing `path`.
pub(crate) fn open_repo(path: &std::path::Path) -> Result<Repository> {
    Repository::discover(path).map_err(|e| {
        Error::InvalidRequest(format!(
            "{} is not inside a git repository: {}",
            path.display(),
            e.message()
        ))
    })
}

/// Resolve the tip commit for `revision` (HEAD when `None`).
///
/// Returns `Ok(None)` for an unborn HEAD, i.e. a repository without commits.
pub(crate) fn resolve_tip<'r>(
    repo: &'r Repository,
    revision: Option<&str>,
) -> Result<Option<Commit<'r>>> {
    match revision {
        None => match repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(None),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        },
        Some(rev) => {
            let object = repo.revparse_single(rev).map_err(|e| {
                Error::InvalidRequest(format!("Unknown revision '{}': {}", rev, e.message()))
            })?;
            Ok(Some(object.peel_to_commit()?))
        }
    }
}
