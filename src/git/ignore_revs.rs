//! Revisions excluded from blame attribution
//!
//! Large mechanical commits (reformatting, license headers, mass renames)
//! are listed in an ignore-revs file so they do not claim authorship of
//! lines whose logic they never touched. The file format is the one git
//! uses for `blame.ignoreRevsFile`: one revision per line, `#` comments.

use git2::{Oid, Repository};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

/// Default file name looked up at the repository root.
pub const DEFAULT_IGNORE_REVS_FILE: &str = ".git-blame-ignore-revs";

/// Set of commit ids whose blame is passed through to their parent.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRevs {
    oids: HashSet<Oid>,
}

impl IgnoreRevs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the ignore set for a blame run.
    ///
    /// # Arguments
    /// * `explicit` - Revisions passed on the request
    /// * `file_override` - Ignore-revs file path (relative paths resolve against the workdir)
    /// * `respect_file` - Whether to read the configured or default ignore-revs file at all
    pub fn load(
        repo: &Repository,
        explicit: &[String],
        file_override: Option<&Path>,
        respect_file: bool,
    ) -> Result<Self> {
        let mut revs = IgnoreRevs::new();

        for rev in explicit {
            revs.add_revision(repo, rev)?;
        }

        if respect_file {
            if let Some(path) = ignore_revs_path(repo, file_override) {
                match std::fs::read_to_string(&path) {
                    Ok(content) => {
                        let added = revs.add_from_str(repo, &content);
                        debug!("Loaded {} ignored revisions from {}", added, path.display());
                    }
                    Err(e) if file_override.is_some() => {
                        warn!("Failed to read ignore-revs file {}: {}", path.display(), e);
                    }
                    Err(_) => {}
                }
            }
        }

        Ok(revs)
    }

    /// Add revisions from ignore-revs file content; returns how many resolved.
    ///
    /// Unresolvable revisions are logged and skipped, as git does.
    pub fn add_from_str(&mut self, repo: &Repository, content: &str) -> usize {
        let mut added = 0;
        for line in content.lines() {
            let rev = line.split('#').next().unwrap_or("").trim();
            if rev.is_empty() {
                continue;
            }
            match self.add_revision(repo, rev) {
                Ok(()) => added += 1,
                Err(e) => warn!("Ignoring unknown revision {:?} in ignore-revs: {}", rev, e),
            }
        }
        added
    }

    /// Resolve a (possibly abbreviated) revision and add its commit id.
    pub fn add_revision(&mut self, repo: &Repository, rev: &str) -> Result<()> {
        let commit = repo.revparse_single(rev)?.peel_to_commit()?;
        self.oids.insert(commit.id());
        Ok(())
    }

    pub fn insert(&mut self, oid: Oid) {
        self.oids.insert(oid);
    }

    pub fn contains(&self, oid: &Oid) -> bool {
        self.oids.contains(oid)
    }

    pub fn len(&self) -> usize {
        self.oids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }
}

/// Resolve which ignore-revs file applies: explicit override, then
/// `blame.ignoreRevsFile` from the repository config, then the default name.
fn ignore_revs_path(repo: &Repository, file_override: Option<&Path>) -> Option<PathBuf> {
    let workdir = repo.workdir()?;
    let configured = file_override.map(Path::to_path_buf).or_else(|| {
        repo.config()
            .ok()
            .and_then(|c| c.get_path("blame.ignoreRevsFile").ok())
    });
    let path = configured.unwrap_or_else(|| PathBuf::from(DEFAULT_IGNORE_REVS_FILE));
    Some(if path.is_absolute() {
        path
    } else {
        workdir.join(path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn repo_with_commits(n: usize) -> anyhow::Result<(tempfile::TempDir, Repository, Vec<Oid>)> {
        let dir = tempdir()?;
        let repo = Repository::init(dir.path())?;
        let mut oids = Vec::new();
        {
            let sig = git2::Signature::now("Test User", "test@example.com")?;
            let mut parent: Option<Oid> = None;
            for i in 0..n {
                std::fs::write(dir.path().join("file.txt"), format!("v{}\n", i))?;
                let mut index = repo.index()?;
                index.add_path(Path::new("file.txt"))?;
                index.write()?;
                let tree = repo.find_tree(index.write_tree()?)?;
                let parents: Vec<git2::Commit> = parent
                    .map(|p| repo.find_commit(p))
                    .transpose()?
                    .into_iter()
                    .collect();
                let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
                let oid = repo.commit(Some("HEAD"), &sig, &sig, "edit", &tree, &parent_refs)?;
                oids.push(oid);
                parent = Some(oid);
            }
        }
        Ok((dir, repo, oids))
    }

    #[test]
    fn test_parse_file_with_comments_and_abbreviations() -> anyhow::Result<()> {
        let (_dir, repo, oids) = repo_with_commits(3)?;
        let content = format!(
            "# reformat\n{}\n\n{}  # short sha\nnot-a-revision\n",
            oids[0],
            &oids[1].to_string()[..10]
        );
        let mut revs = IgnoreRevs::new();
        let added = revs.add_from_str(&repo, &content);
        assert_eq!(added, 2);
        assert!(revs.contains(&oids[0]));
        assert!(revs.contains(&oids[1]));
        assert!(!revs.contains(&oids[2]));
        Ok(())
    }

    #[test]
    fn test_load_reads_default_file_only_when_respected() -> anyhow::Result<()> {
        let (dir, repo, oids) = repo_with_commits(2)?;
        std::fs::write(
            dir.path().join(DEFAULT_IGNORE_REVS_FILE),
            format!("{}\n", oids[1]),
        )?;

        let respected = IgnoreRevs::load(&repo, &[], None, true)?;
        assert!(respected.contains(&oids[1]));

        let ignored = IgnoreRevs::load(&repo, &[], None, false)?;
        assert!(ignored.is_empty());

        let explicit = IgnoreRevs::load(&repo, &[oids[0].to_string()], None, false)?;
        assert_eq!(explicit.len(), 1);
        Ok(())
    }

    #[test]
    fn test_explicit_unknown_revision_is_an_error() -> anyhow::Result<()> {
        let (_dir, repo, _oids) = repo_with_commits(1)?;
        let result = IgnoreRevs::load(&repo, &["deadbeefdeadbeef".to_string()], None, false);
        assert!(result.is_err());
        Ok(())
    }
}
