//! Line-level ownership via git blame
//!
//! For every tracked text file at a revision, determines which commit last
//! touched each line and credits that commit's (mailmap-resolved) author.
//! Whitespace-only edits and revisions listed in the ignore-revs file do not
//! transfer ownership; moved or copied lines keep their original author.
//!
//! Ignore-revs is applied after move/copy tracking: a moved line is first
//! followed to the commit that originally introduced it, and only that
//! commit is checked against the ignore set.

use dashmap::DashMap;
use git2::{BlameHunk, Oid, Patch, Repository};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::ignore_revs::IgnoreRevs;
use super::mailmap::IdentityResolver;
use crate::error::{Error, Result, Warning};
use crate::models::{AuthorIdentity, FileBlameResult, HistoryStatus};

/// How many moves or ignored revisions a single line may be followed through.
const MAX_TRACE_DEPTH: usize = 16;

/// Alphanumeric characters a run of moved lines needs before it counts as a move.
const MIN_MOVE_SCORE: usize = 3;

/// Copies match any line of a modified file, so they need a longer run.
const MIN_COPY_SCORE: usize = 20;

/// Git file mode for symbolic links.
const FILEMODE_LINK: i32 = 0o120000;

/// Options for a blame attribution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttributionOptions {
    /// Files blamed in parallel
    pub max_concurrency: usize,
    /// Read the ignore-revs file (`blame.ignoreRevsFile` or `.git-blame-ignore-revs`)
    pub respect_ignore_revs_file: bool,
    /// Override the ignore-revs file location
    pub ignore_revs_file: Option<PathBuf>,
    /// Additional revisions to ignore
    pub ignore_revs: Vec<String>,
    /// Whitespace-only changes do not transfer ownership
    pub ignore_whitespace: bool,
    /// Follow lines moved within or between files
    pub detect_moves: bool,
    /// Follow lines copied from files modified in the same commit
    pub detect_copies: bool,
    /// Collapse author aliases through `.mailmap`
    pub use_mailmap: bool,
    /// Revision to attribute (default: HEAD)
    pub revision: Option<String>,
    /// Only blame paths matching these globs
    pub include_patterns: Vec<String>,
    /// Never blame paths matching these globs
    pub exclude_patterns: Vec<String>,
    /// Return the per-file breakdown alongside the totals
    pub include_file_breakdown: bool,
}

impl Default for AttributionOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            respect_ignore_revs_file: true,
            ignore_revs_file: None,
            ignore_revs: Vec::new(),
            ignore_whitespace: true,
            detect_moves: true,
            detect_copies: false,
            use_mailmap: true,
            revision: None,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            include_file_breakdown: false,
        }
    }
}

/// Lines owned by one author across the whole snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorLines {
    pub identity: AuthorIdentity,
    pub lines: u64,
    pub percent: f64,
}

/// Result of a blame attribution run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionResult {
    /// Sorted by lines owned, descending
    pub authors: Vec<AuthorLines>,
    pub total_lines: u64,
    pub files_processed: usize,
    /// Binary files and symlinks left out of the totals
    pub files_excluded: usize,
    /// Commit the snapshot was taken at
    pub revision: Option<String>,
    pub status: HistoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileBlameResult>>,
    pub warnings: Vec<Warning>,
}

/// Where a single line came from.
#[derive(Debug, Clone)]
struct LineOwner {
    commit: Oid,
    /// Path of the line in `commit`
    path: PathBuf,
    /// 1-based line number of the line in `commit`
    line: usize,
    name: String,
    email: String,
}

enum FileOutcome {
    Blamed(FileBlameResult, HashMap<String, AuthorIdentity>),
    Excluded,
}

/// Blame-based ownership engine for one repository snapshot.
pub struct BlameEngine {
    repo_path: PathBuf,
    options: AttributionOptions,
}

impl BlameEngine {
    pub fn new(repo_path: &Path, options: AttributionOptions) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            options,
        }
    }

    /// Compute per-author line ownership.
    ///
    /// `on_progress(done, total)` is called as files complete, from worker threads.
    pub fn compute_attribution<F>(&self, on_progress: F) -> Result<AttributionResult>
    where
        F: Fn(usize, usize) + Sync,
    {
        let repo = super::open_repo(&self.repo_path)?;
        let revision = self.options.revision.as_deref();
        let Some(tip) = super::resolve_tip(&repo, revision)? else {
            info!("Repository has no commits; nothing to blame");
            return Ok(AttributionResult {
                status: HistoryStatus::EmptyRepository,
                ..Default::default()
            });
        };
        let tip_id = tip.id();

        let ignore = IgnoreRevs::load(
            &repo,
            &self.options.ignore_revs,
            self.options.ignore_revs_file.as_deref(),
            self.options.respect_ignore_revs_file,
        )?;
        let resolver = IdentityResolver::for_repo(
            &repo,
            Some(&tip_id.to_string()),
            self.options.use_mailmap,
        );
        let files = self.list_files(&repo, &tip)?;
        let total = files.len();
        info!(
            "Blaming {} files at {} ({} ignored revisions)",
            total,
            &tip_id.to_string()[..12],
            ignore.len()
        );

        let git_dir = repo.path().to_path_buf();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.max_concurrency.max(1))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build blame pool: {}", e)))?;

        let authors: DashMap<String, (AuthorIdentity, u64)> = DashMap::new();
        let warnings = Mutex::new(Vec::new());
        let breakdown = Mutex::new(Vec::new());
        let done = AtomicUsize::new(0);
        let excluded = AtomicUsize::new(0);

        pool.install(|| {
            files.par_iter().for_each_init(
                || Repository::open(&git_dir),
                |worker_repo, path| {
                    let outcome = match worker_repo {
                        Ok(worker_repo) => {
                            self.blame_one(worker_repo, tip_id, path, &ignore, &resolver)
                        }
                        Err(e) => Err(Error::Git(git2::Error::from_str(e.message()))),
                    };

                    match outcome {
                        Ok(FileOutcome::Blamed(file, identities)) => {
                            debug_assert!(file.is_consistent());
                            for (key, lines) in &file.per_author_lines {
                                let mut entry = authors.entry(key.clone()).or_insert_with(|| {
                                    (identities[key].clone(), 0)
                                });
                                entry.0.absorb(&identities[key]);
                                entry.1 += lines;
                            }
                            if self.options.include_file_breakdown {
                                if let Ok(mut b) = breakdown.lock() {
                                    b.push(file);
                                }
                            }
                        }
                        Ok(FileOutcome::Excluded) => {
                            excluded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!("Skipping {}: {}", path, e);
                            if let Ok(mut w) = warnings.lock() {
                                w.push(Warning::CorruptFileSkipped {
                                    path: path.clone(),
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }

                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    on_progress(finished, total);
                },
            );
        });

        let mut warnings = warnings
            .into_inner()
            .map_err(|_| Error::Internal("blame warning list poisoned".to_string()))?;
        warnings.sort_by(|a, b| a.to_string().cmp(&b.to_string()));

        let mut authors: Vec<(AuthorIdentity, u64)> = authors.into_iter().map(|(_, v)| v).collect();
        let total_lines: u64 = authors.iter().map(|(_, lines)| lines).sum();
        authors.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(a.0.canonical_name.cmp(&b.0.canonical_name))
        });
        let authors = authors
            .into_iter()
            .map(|(identity, lines)| AuthorLines {
                identity,
                lines,
                percent: if total_lines == 0 {
                    0.0
                } else {
                    (lines as f64 / total_lines as f64) * 100.0
                },
            })
            .collect();

        let files = if self.options.include_file_breakdown {
            let mut files = breakdown
                .into_inner()
                .map_err(|_| Error::Internal("blame breakdown poisoned".to_string()))?;
            files.sort_by(|a, b| a.path.cmp(&b.path));
            Some(files)
        } else {
            None
        };

        let excluded = excluded.load(Ordering::Relaxed);
        let files_processed = total - excluded - warnings.len();
        info!(
            "Blame complete: {} lines, {} files, {} excluded, {} skipped",
            total_lines,
            files_processed,
            excluded,
            warnings.len()
        );

        Ok(AttributionResult {
            authors,
            total_lines,
            files_processed,
            files_excluded: excluded,
            revision: Some(tip_id.to_string()),
            status: HistoryStatus::Populated,
            files,
            warnings,
        })
    }

    /// Tracked blob paths at the tip, filtered by include/exclude patterns.
    fn list_files(&self, repo: &Repository, tip: &git2::Commit<'_>) -> Result<Vec<String>> {
        let overrides = self.build_overrides()?;
        let tree = tip.tree()?;

        let mut files = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob) && entry.filemode() != FILEMODE_LINK {
                let path = format!("{}{}", dir, entry.name().unwrap_or(""));
                let keep = match &overrides {
                    Some(ov) => !ov.matched(Path::new(&path), false).is_ignore(),
                    None => true,
                };
                if keep {
                    files.push(path);
                }
            }
            git2::TreeWalkResult::Ok
        })?;

        debug!("{} files selected for blame in {:?}", files.len(), repo.path());
        Ok(files)
    }

    fn build_overrides(&self) -> Result<Option<ignore::overrides::Override>> {
        let opts = &self.options;
        if opts.include_patterns.is_empty() && opts.exclude_patterns.is_empty() {
            return Ok(None);
        }
        let mut builder = ignore::overrides::OverrideBuilder::new("");
        let invalid = |e: ignore::Error| Error::InvalidRequest(format!("bad path pattern: {}", e));
        for glob in &opts.include_patterns {
            builder.add(glob).map_err(invalid)?;
        }
        for glob in &opts.exclude_patterns {
            builder.add(&format!("!{}", glob)).map_err(invalid)?;
        }
        Ok(Some(builder.build().map_err(invalid)?))
    }

    fn git_blame_options(&self, newest: Oid) -> git2::BlameOptions {
        let mut opts = git2::BlameOptions::new();
        opts.newest_commit(newest)
            .ignore_whitespace(self.options.ignore_whitespace);
        opts
    }

    fn tracks_lines(&self) -> bool {
        self.options.detect_moves || self.options.detect_copies
    }

    /// Blame one file and attribute each of its lines.
    fn blame_one(
        &self,
        repo: &Repository,
        tip: Oid,
        path: &str,
        ignore: &IgnoreRevs,
        resolver: &IdentityResolver,
    ) -> Result<FileOutcome> {
        let tree = repo.find_commit(tip)?.tree()?;
        let entry = tree.get_path(Path::new(path))?;
        let blob = repo.find_blob(entry.id())?;
        if blob.is_binary() {
            return Ok(FileOutcome::Excluded);
        }

        let mut file = FileBlameResult::new(path);
        let mut identities: HashMap<String, AuthorIdentity> = HashMap::new();
        let mut credit = |name: &str, email: &str, lines: u64| {
            let identity = resolver.resolve(name, email);
            let key = identity.key();
            file.attribute(&key, lines);
            identities
                .entry(key)
                .and_modify(|known| known.absorb(&identity))
                .or_insert(identity);
        };

        let blame = repo.blame_file(Path::new(path), Some(&mut self.git_blame_options(tip)))?;
        let mut tracer = LineTracer::new(repo, self, ignore);

        for hunk in blame.iter() {
            let lines = hunk.lines_in_hunk();
            if lines == 0 {
                continue;
            }
            let owner = hunk_owner(repo, &hunk, Path::new(path), 0);

            if !ignore.contains(&owner.commit) && !tracer.has_origins(&owner, lines)? {
                credit(&owner.name, &owner.email, lines as u64);
                continue;
            }

            // Each line of the hunk may land on a different earlier author
            for offset in 0..lines {
                let line_owner = tracer.resolve(hunk_owner(repo, &hunk, Path::new(path), offset))?;
                credit(&line_owner.name, &line_owner.email, 1);
            }
        }

        Ok(FileOutcome::Blamed(file, identities))
    }
}

/// Owner of the line at `offset` within a blame hunk.
fn hunk_owner(repo: &Repository, hunk: &BlameHunk<'_>, fallback_path: &Path, offset: usize) -> LineOwner {
    let commit = hunk.final_commit_id();
    let sig = hunk.final_signature();
    let (mut name, mut email) = (
        sig.name().unwrap_or("").to_string(),
        sig.email().unwrap_or("").to_string(),
    );
    if name.is_empty() && email.is_empty() {
        if let Ok(c) = repo.find_commit(commit) {
            let author = c.author();
            name = author.name().unwrap_or("Unknown").to_string();
            email = author.email().unwrap_or("").to_string();
        }
    }

    LineOwner {
        commit,
        path: hunk
            .path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| fallback_path.to_path_buf()),
        line: hunk.orig_start_line() + offset,
        name,
        email,
    }
}

/// Follows a blamed line back past moves, copies and ignored revisions.
///
/// Move/copy tracking runs first: a line whose commit merely moved it is
/// re-blamed where it came from. The ignore set is only consulted for a
/// commit that really introduced the line.
struct LineTracer<'a> {
    repo: &'a Repository,
    engine: &'a BlameEngine,
    ignore: &'a IgnoreRevs,
    /// (commit, path) -> owner of each line, index = line - 1
    blames: HashMap<(Oid, PathBuf), Vec<LineOwner>>,
    changes: HashMap<Oid, CommitChanges>,
    /// (commit, path) -> line in commit -> (path, line) in its first parent
    origins: HashMap<(Oid, PathBuf), HashMap<usize, (PathBuf, usize)>>,
}

impl<'a> LineTracer<'a> {
    fn new(repo: &'a Repository, engine: &'a BlameEngine, ignore: &'a IgnoreRevs) -> Self {
        Self {
            repo,
            engine,
            ignore,
            blames: HashMap::new(),
            changes: HashMap::new(),
            origins: HashMap::new(),
        }
    }

    /// Whether any of the `lines` lines starting at `owner` was moved or copied.
    fn has_origins(&mut self, owner: &LineOwner, lines: usize) -> Result<bool> {
        if !self.engine.tracks_lines() {
            return Ok(false);
        }
        let origins = self.origins(owner.commit, &owner.path)?;
        Ok((owner.line..owner.line + lines).any(|line| origins.contains_key(&line)))
    }

    fn resolve(&mut self, mut owner: LineOwner) -> Result<LineOwner> {
        for _ in 0..MAX_TRACE_DEPTH {
            if self.engine.tracks_lines() {
                let origin = self.origins(owner.commit, &owner.path)?.get(&owner.line).cloned();
                if let Some((path, line)) = origin {
                    let parent = self.repo.find_commit(owner.commit)?.parent_id(0)?;
                    if let Some(previous) = self.owner_at(parent, &path, line)? {
                        owner = previous;
                        continue;
                    }
                }
            }

            if !self.ignore.contains(&owner.commit) {
                return Ok(owner);
            }
            let commit = self.repo.find_commit(owner.commit)?;
            // Root commits cannot be skipped
            let Ok(parent) = commit.parent(0) else {
                return Ok(owner);
            };
            let Some(mapped) = map_line_to_parent(
                self.repo,
                &commit,
                &parent,
                &owner.path,
                owner.line,
                self.engine.options.ignore_whitespace,
            )?
            else {
                return Ok(owner);
            };
            match self.owner_at(parent.id(), &owner.path, mapped)? {
                Some(previous) => owner = previous,
                None => return Ok(owner),
            }
        }
        debug!("Line trace depth limit reached at {}", owner.commit);
        Ok(owner)
    }

    fn owner_at(&mut self, commit: Oid, path: &Path, line: usize) -> Result<Option<LineOwner>> {
        let key = (commit, path.to_path_buf());
        if !self.blames.contains_key(&key) {
            let mut opts = self.engine.git_blame_options(commit);
            let blame = self.repo.blame_file(path, Some(&mut opts))?;
            let mut owners = Vec::new();
            for hunk in blame.iter() {
                for offset in 0..hunk.lines_in_hunk() {
                    owners.push(hunk_owner(self.repo, &hunk, path, offset));
                }
            }
            self.blames.insert(key.clone(), owners);
        }
        Ok(self
            .blames
            .get(&key)
            .and_then(|owners| line.checked_sub(1).and_then(|i| owners.get(i)))
            .cloned())
    }

    /// Lines `commit` added to `path` that it moved or copied from its parent.
    fn origins(&mut self, commit: Oid, path: &Path) -> Result<&HashMap<usize, (PathBuf, usize)>> {
        let key = (commit, path.to_path_buf());
        if !self.origins.contains_key(&key) {
            if !self.changes.contains_key(&commit) {
                let options = &self.engine.options;
                let changes = CommitChanges::load(
                    self.repo,
                    commit,
                    options.ignore_whitespace,
                    options.detect_copies,
                )?;
                self.changes.insert(commit, changes);
            }
            let found = match self.changes.get(&commit) {
                Some(changes) => changes.origins(path, &self.engine.options),
                None => HashMap::new(),
            };
            self.origins.insert(key.clone(), found);
        }
        Ok(&self.origins[&key])
    }
}

/// A line of a parent blob that a commit's added lines may have come from.
#[derive(Debug, Clone)]
struct SourceLine {
    path: PathBuf,
    line: usize,
    text: String,
}

/// Line-level changes a commit made against its first parent.
#[derive(Debug, Default)]
struct CommitChanges {
    /// Added lines per path, as (line in commit, text)
    added: HashMap<PathBuf, Vec<(usize, String)>>,
    /// Lines the commit removed, from any file
    deleted: Vec<SourceLine>,
    /// Every line of the parent's version of files the commit modified
    copy_sources: Vec<SourceLine>,
}

impl CommitChanges {
    fn load(repo: &Repository, id: Oid, ignore_whitespace: bool, with_copies: bool) -> Result<Self> {
        let commit = repo.find_commit(id)?;
        let Ok(parent) = commit.parent(0) else {
            return Ok(Self::default());
        };
        let mut opts = git2::DiffOptions::new();
        opts.context_lines(0).ignore_whitespace(ignore_whitespace);
        let diff = repo.diff_tree_to_tree(Some(&parent.tree()?), Some(&commit.tree()?), Some(&mut opts))?;

        let mut changes = Self::default();
        for idx in 0..diff.deltas().count() {
            let Some(patch) = Patch::from_diff(&diff, idx)? else {
                continue;
            };
            let delta = patch.delta();
            let old_path = delta.old_file().path().map(Path::to_path_buf);
            let new_path = delta.new_file().path().map(Path::to_path_buf);

            for h in 0..patch.num_hunks() {
                let (_, count) = patch.hunk(h)?;
                for l in 0..count {
                    let line = patch.line_in_hunk(h, l)?;
                    let text = normalize_line(&String::from_utf8_lossy(line.content()), ignore_whitespace);
                    match (line.origin(), &new_path, &old_path) {
                        ('+', Some(path), _) => {
                            if let Some(n) = line.new_lineno() {
                                changes
                                    .added
                                    .entry(path.clone())
                                    .or_default()
                                    .push((n as usize, text));
                            }
                        }
                        ('-', _, Some(path)) => {
                            if let Some(n) = line.old_lineno() {
                                changes.deleted.push(SourceLine {
                                    path: path.clone(),
                                    line: n as usize,
                                    text,
                                });
                            }
                        }
                        _ => {}
                    }
                }
            }

            if with_copies && delta.status() == git2::Delta::Modified {
                if let Some(path) = &old_path {
                    let blob = repo.find_blob(delta.old_file().id())?;
                    if !blob.is_binary() {
                        let content = String::from_utf8_lossy(blob.content());
                        for (i, text) in content.lines().enumerate() {
                            changes.copy_sources.push(SourceLine {
                                path: path.clone(),
                                line: i + 1,
                                text: normalize_line(text, ignore_whitespace),
                            });
                        }
                    }
                }
            }
        }
        Ok(changes)
    }

    /// Map added lines of `path` to the parent lines they were moved or copied from.
    fn origins(&self, path: &Path, options: &AttributionOptions) -> HashMap<usize, (PathBuf, usize)> {
        let Some(added) = self.added.get(path) else {
            return HashMap::new();
        };
        let mut found = HashMap::new();
        if options.detect_moves {
            found = match_runs(added, &self.deleted, MIN_MOVE_SCORE);
        }
        if options.detect_copies {
            let rest: Vec<(usize, String)> = added
                .iter()
                .filter(|(line, _)| !found.contains_key(line))
                .cloned()
                .collect();
            found.extend(match_runs(&rest, &self.copy_sources, MIN_COPY_SCORE));
        }
        found
    }
}

fn normalize_line(text: &str, ignore_whitespace: bool) -> String {
    if ignore_whitespace {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        text.trim_end_matches(['\n', '\r']).to_string()
    }
}

/// Match runs of consecutive added lines against runs of consecutive source lines.
///
/// The longest identical run wins for each starting line. A run is accepted
/// once its alphanumeric characters reach `min_score`, so stray braces and
/// blank lines never match on their own.
fn match_runs(
    added: &[(usize, String)],
    sources: &[SourceLine],
    min_score: usize,
) -> HashMap<usize, (PathBuf, usize)> {
    let mut index: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, source) in sources.iter().enumerate() {
        if !source.text.is_empty() {
            index.entry(source.text.as_str()).or_default().push(i);
        }
    }

    let mut found = HashMap::new();
    let mut i = 0;
    while i < added.len() {
        let Some(candidates) = index.get(added[i].1.as_str()) else {
            i += 1;
            continue;
        };
        let mut best = (0, 0);
        for &start in candidates {
            let mut len = 1;
            while i + len < added.len()
                && start + len < sources.len()
                && added[i + len].0 == added[i + len - 1].0 + 1
                && sources[start + len].path == sources[start].path
                && sources[start + len].line == sources[start + len - 1].line + 1
                && added[i + len].1 == sources[start + len].text
            {
                len += 1;
            }
            if len > best.0 {
                best = (len, start);
            }
        }

        let (len, start) = best;
        let score: usize = added[i..i + len]
            .iter()
            .map(|(_, text)| text.chars().filter(|c| c.is_alphanumeric()).count())
            .sum();
        if score < min_score {
            i += 1;
            continue;
        }
        for k in 0..len {
            let source = &sources[start + k];
            found.insert(added[i + k].0, (source.path.clone(), source.line));
        }
        i += len;
    }
    found
}

/// Map a 1-based line of `path` in `commit` to the matching line in `parent`.
///
/// A line inside a changed hunk maps to the same offset on the old side when
/// the old side is long enough; lines outside hunks shift by the hunks before
/// them. Returns `None` when the line has no counterpart.
fn map_line_to_parent(
    repo: &Repository,
    commit: &git2::Commit<'_>,
    parent: &git2::Commit<'_>,
    path: &Path,
    line: usize,
    ignore_whitespace: bool,
) -> Result<Option<usize>> {
    let Some(new_blob) = blob_at(repo, commit, path)? else {
        return Ok(None);
    };
    let Some(old_blob) = blob_at(repo, parent, path)? else {
        return Ok(None);
    };

    let mut opts = git2::DiffOptions::new();
    opts.context_lines(0).ignore_whitespace(ignore_whitespace);
    let patch = Patch::from_blobs(&old_blob, Some(path), &new_blob, Some(path), Some(&mut opts))?;

    let hunks = (0..patch.num_hunks())
        .map(|i| {
            patch.hunk(i).map(|(h, _)| {
                (
                    h.old_start() as i64,
                    h.old_lines() as i64,
                    h.new_start() as i64,
                    h.new_lines() as i64,
                )
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(map_line_through_hunks(&hunks, line))
}

/// Core of [`map_line_to_parent`], over `(old_start, old_lines, new_start, new_lines)` hunks.
fn map_line_through_hunks(hunks: &[(i64, i64, i64, i64)], line: usize) -> Option<usize> {
    let line = line as i64;
    let mut shift = 0i64;
    for &(old_start, old_lines, new_start, new_lines) in hunks {
        let before = if new_lines == 0 {
            line <= new_start
        } else {
            line < new_start
        };
        if before {
            break;
        }
        if new_lines > 0 && line < new_start + new_lines {
            let k = line - new_start;
            return (k < old_lines).then(|| (old_start + k) as usize);
        }
        shift += old_lines - new_lines;
    }
    let mapped = line + shift;
    (mapped >= 1).then_some(mapped as usize)
}

fn blob_at<'r>(
    repo: &'r Repository,
    commit: &git2::Commit<'_>,
    path: &Path,
) -> Result<Option<git2::Blob<'r>>> {
    let tree = commit.tree()?;
    match tree.get_path(path) {
        Ok(entry) => Ok(Some(repo.find_blob(entry.id())?)),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::TestRepo;

    const ADA: (&str, &str) = ("Ada", "ada@example.com");
    const BOB: (&str, &str) = ("Bob", "bob@example.com");
    const CAT: (&str, &str) = ("Cat", "cat@example.com");

    fn engine(repo: &TestRepo, options: AttributionOptions) -> BlameEngine {
        BlameEngine::new(repo.path(), options)
    }

    fn lines_for(result: &AttributionResult, email: &str) -> u64 {
        result
            .authors
            .iter()
            .find(|a| a.identity.canonical_email == email)
            .map(|a| a.lines)
            .unwrap_or(0)
    }

    #[test]
    fn test_two_authors_sum_to_total() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.txt", Some("one\ntwo\nthree\n"))], "add a")?;
        repo.commit(BOB, 2_000, &[("b.txt", Some("x\ny\n"))], "add b")?;
        repo.commit(BOB, 3_000, &[("a.txt", Some("one\nTWO\nthree\n"))], "edit a")?;

        let result = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        assert_eq!(result.total_lines, 5);
        assert_eq!(result.files_processed, 2);
        assert_eq!(lines_for(&result, "ada@example.com"), 2);
        assert_eq!(lines_for(&result, "bob@example.com"), 3);
        let sum: u64 = result.authors.iter().map(|a| a.lines).sum();
        assert_eq!(sum, result.total_lines);
        Ok(())
    }

    #[test]
    fn test_file_breakdown_is_consistent() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.txt", Some("1\n2\n3\n4\n"))], "add")?;
        repo.commit(BOB, 2_000, &[("a.txt", Some("1\n2\nthree\n4\n5\n"))], "edit")?;

        let options = AttributionOptions {
            include_file_breakdown: true,
            ..Default::default()
        };
        let result = engine(&repo, options).compute_attribution(|_, _| {})?;
        let files = result.files.expect("breakdown requested");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].total_lines, 5);
        assert!(files[0].is_consistent());
        assert_eq!(files[0].per_author_lines["bob@example.com"], 2);
        Ok(())
    }

    #[test]
    fn test_binary_files_are_excluded_from_totals() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.txt", Some("text\n"))], "text")?;
        std::fs::write(repo.path().join("blob.bin"), [0u8, 159, 146, 150, 0, 1, 2])?;
        let mut index = repo.repo.index()?;
        index.add_path(Path::new("blob.bin"))?;
        index.write()?;
        repo.commit(BOB, 2_000, &[], "binary")?;

        let result = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        assert_eq!(result.total_lines, 1);
        assert_eq!(result.files_excluded, 1);
        assert_eq!(lines_for(&result, "bob@example.com"), 0);
        Ok(())
    }

    #[test]
    fn test_whitespace_only_edit_keeps_owner() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.py", Some("def f():\n    return 1\n"))], "add")?;
        repo.commit(BOB, 2_000, &[("a.py", Some("def f():\n\treturn 1\n"))], "tabs")?;

        let tolerant = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        assert_eq!(lines_for(&tolerant, "ada@example.com"), 2);

        let strict = AttributionOptions {
            ignore_whitespace: false,
            ..Default::default()
        };
        let strict = engine(&repo, strict).compute_attribution(|_, _| {})?;
        assert_eq!(lines_for(&strict, "bob@example.com"), 1);
        Ok(())
    }

    #[test]
    fn test_ignored_revision_passes_lines_to_parent() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.txt", Some("alpha\nbeta\ngamma\n"))], "add")?;
        let reformat = repo.commit(
            BOB,
            2_000,
            &[("a.txt", Some("ALPHA\nBETA\ngamma\n"))],
            "reformat",
        )?;
        repo.commit(CAT, 3_000, &[("a.txt", Some("ALPHA\nBETA\ngamma\ndelta\n"))], "append")?;

        let plain = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        assert_eq!(lines_for(&plain, "bob@example.com"), 2);

        let options = AttributionOptions {
            ignore_revs: vec![reformat.to_string()],
            ..Default::default()
        };
        let result = engine(&repo, options).compute_attribution(|_, _| {})?;
        assert_eq!(lines_for(&result, "bob@example.com"), 0);
        assert_eq!(lines_for(&result, "ada@example.com"), 3);
        assert_eq!(lines_for(&result, "cat@example.com"), 1);
        assert_eq!(result.total_lines, 4);
        Ok(())
    }

    #[test]
    fn test_ignored_revision_adding_lines_keeps_them() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.txt", Some("one\n"))], "add")?;
        let grow = repo.commit(BOB, 2_000, &[("a.txt", Some("one\ntwo\nthree\n"))], "grow")?;

        let options = AttributionOptions {
            ignore_revs: vec![grow.to_string()],
            ..Default::default()
        };
        let result = engine(&repo, options).compute_attribution(|_, _| {})?;
        // Pure additions have no earlier counterpart and stay with the ignored commit
        assert_eq!(lines_for(&result, "ada@example.com"), 1);
        assert_eq!(lines_for(&result, "bob@example.com"), 2);
        assert_eq!(result.total_lines, 3);
        Ok(())
    }

    #[test]
    fn test_mailmap_collapses_aliases() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.txt", Some("1\n2\n"))], "add")?;
        repo.commit(
            ("ada", "ada@old-laptop.local"),
            2_000,
            &[
                ("b.txt", Some("3\n")),
                (".mailmap", Some("Ada <ada@example.com> <ada@old-laptop.local>\n")),
            ],
            "laptop",
        )?;

        let mapped = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        // .mailmap itself is one line owned by the laptop identity, now mapped too
        assert_eq!(lines_for(&mapped, "ada@example.com"), 4);
        assert_eq!(mapped.authors.len(), 1);
        assert!(mapped.authors[0]
            .identity
            .alias_emails
            .contains("ada@old-laptop.local"));

        let unmapped = AttributionOptions {
            use_mailmap: false,
            ..Default::default()
        };
        let unmapped = engine(&repo, unmapped).compute_attribution(|_, _| {})?;
        assert_eq!(unmapped.authors.len(), 2);
        Ok(())
    }

    #[test]
    fn test_exclude_patterns_filter_files() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(
            ADA,
            1_000,
            &[
                ("src/lib.rs", Some("fn a() {}\n")),
                ("vendor/dep.rs", Some("fn b() {}\nfn c() {}\n")),
            ],
            "add",
        )?;

        let options = AttributionOptions {
            exclude_patterns: vec!["vendor/**".to_string()],
            ..Default::default()
        };
        let result = engine(&repo, options).compute_attribution(|_, _| {})?;
        assert_eq!(result.files_processed, 1);
        assert_eq!(result.total_lines, 1);
        Ok(())
    }

    #[test]
    fn test_empty_repository_is_signaled() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        let result = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        assert_eq!(result.status, HistoryStatus::EmptyRepository);
        assert_eq!(result.total_lines, 0);
        Ok(())
    }

    #[test]
    fn test_progress_reports_every_file() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(
            ADA,
            1_000,
            &[("a", Some("1\n")), ("b", Some("2\n")), ("c", Some("3\n"))],
            "add",
        )?;
        let seen = AtomicUsize::new(0);
        let options = AttributionOptions {
            max_concurrency: 2,
            ..Default::default()
        };
        engine(&repo, options).compute_attribution(|_, total| {
            assert_eq!(total, 3);
            seen.fetch_add(1, Ordering::Relaxed);
        })?;
        assert_eq!(seen.load(Ordering::Relaxed), 3);
        Ok(())
    }

    #[test]
    fn test_map_line_through_hunks() {
        // one line replaced at line 2
        let replaced = [(2, 1, 2, 1)];
        assert_eq!(map_line_through_hunks(&replaced, 1), Some(1));
        assert_eq!(map_line_through_hunks(&replaced, 2), Some(2));
        assert_eq!(map_line_through_hunks(&replaced, 3), Some(3));

        // two lines inserted after old line 1
        let inserted = [(1, 0, 2, 2)];
        assert_eq!(map_line_through_hunks(&inserted, 2), None);
        assert_eq!(map_line_through_hunks(&inserted, 4), Some(2));

        // old lines 2-3 deleted
        let deleted = [(2, 2, 1, 0)];
        assert_eq!(map_line_through_hunks(&deleted, 1), Some(1));
        assert_eq!(map_line_through_hunks(&deleted, 2), Some(4));
    }

    const HELPERS: &str = "fn keep() -> u32 {\n    1\n}\nfn moved(input: &str) -> usize {\n    let trimmed = input.trim();\n    trimmed.len()\n}\n";

    /// First `n` lines of `text`, newline-terminated.
    fn head(text: &str, n: usize) -> String {
        text.lines().take(n).map(|l| format!("{l}\n")).collect()
    }

    /// Lines after the first `n`, newline-terminated.
    fn tail(text: &str, n: usize) -> String {
        text.lines().skip(n).map(|l| format!("{l}\n")).collect()
    }

    #[test]
    fn test_lines_moved_to_another_file_keep_their_author() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.rs", Some(HELPERS))], "add helpers")?;
        let moved = format!("// helpers\n{}", tail(HELPERS, 3));
        repo.commit(
            BOB,
            2_000,
            &[("a.rs", Some(head(HELPERS, 3).as_str())), ("b.rs", Some(moved.as_str()))],
            "split helpers",
        )?;

        let result = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        assert_eq!(result.total_lines, 8);
        assert_eq!(lines_for(&result, "ada@example.com"), 7);
        assert_eq!(lines_for(&result, "bob@example.com"), 1);

        let options = AttributionOptions {
            detect_moves: false,
            ..Default::default()
        };
        let result = engine(&repo, options).compute_attribution(|_, _| {})?;
        assert_eq!(lines_for(&result, "ada@example.com"), 3);
        assert_eq!(lines_for(&result, "bob@example.com"), 5);
        Ok(())
    }

    #[test]
    fn test_reordered_functions_keep_their_author() -> anyhow::Result<()> {
        let first = "fn first() -> u32 {\n    let one = 1;\n    one\n}\n";
        let second = "fn second() -> u32 {\n    let two = 2;\n    two\n}\n";
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.rs", Some(format!("{first}{second}").as_str()))], "add")?;
        repo.commit(BOB, 2_000, &[("a.rs", Some(format!("{second}{first}").as_str()))], "swap")?;

        let result = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        assert_eq!(result.total_lines, 8);
        assert_eq!(lines_for(&result, "ada@example.com"), 8);
        assert_eq!(lines_for(&result, "bob@example.com"), 0);

        let options = AttributionOptions {
            detect_moves: false,
            ..Default::default()
        };
        let result = engine(&repo, options).compute_attribution(|_, _| {})?;
        assert_eq!(lines_for(&result, "bob@example.com"), 4);
        Ok(())
    }

    #[test]
    fn test_copied_lines_follow_copy_detection() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.rs", Some(HELPERS))], "add helpers")?;
        let touched = format!("{HELPERS}// touched\n");
        repo.commit(
            BOB,
            2_000,
            &[("a.rs", Some(touched.as_str())), ("c.rs", Some(tail(HELPERS, 3).as_str()))],
            "copy helper",
        )?;

        let result = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        assert_eq!(result.total_lines, 12);
        assert_eq!(lines_for(&result, "bob@example.com"), 5);

        let options = AttributionOptions {
            detect_copies: true,
            ..Default::default()
        };
        let result = engine(&repo, options).compute_attribution(|_, _| {})?;
        assert_eq!(lines_for(&result, "ada@example.com"), 11);
        assert_eq!(lines_for(&result, "bob@example.com"), 1);
        Ok(())
    }

    #[test]
    fn test_moved_lines_skip_ignored_origin() -> anyhow::Result<()> {
        let repo = TestRepo::new()?;
        repo.commit(ADA, 1_000, &[("a.rs", Some(HELPERS))], "add helpers")?;
        let tidied = HELPERS
            .replace("input.trim()", "input.trim_end()")
            .replace("trimmed.len()", "trimmed.chars().count()");
        let tidy = repo.commit(CAT, 2_000, &[("a.rs", Some(tidied.as_str()))], "tidy")?;
        let moved = format!("// helpers\n{}", tail(&tidied, 3));
        repo.commit(
            BOB,
            3_000,
            &[("a.rs", Some(head(&tidied, 3).as_str())), ("b.rs", Some(moved.as_str()))],
            "split helpers",
        )?;

        let result = engine(&repo, AttributionOptions::default()).compute_attribution(|_, _| {})?;
        assert_eq!(lines_for(&result, "cat@example.com"), 2);
        assert_eq!(lines_for(&result, "ada@example.com"), 5);
        assert_eq!(lines_for(&result, "bob@example.com"), 1);

        // The move commit is never the one skipped; the tidy commit under it is
        let options = AttributionOptions {
            ignore_revs: vec![tidy.to_string()],
            ..Default::default()
        };
        let result = engine(&repo, options).compute_attribution(|_, _| {})?;
        assert_eq!(lines_for(&result, "cat@example.com"), 0);
        assert_eq!(lines_for(&result, "ada@example.com"), 7);
        assert_eq!(lines_for(&result, "bob@example.com"), 1);
        assert_eq!(result.total_lines, 8);
        Ok(())
    }

    #[test]
    fn test_match_runs_needs_enough_content() {
        let sources: Vec<SourceLine> = ["}", "", "let total = sum(values);", "}"]
            .iter()
            .enumerate()
            .map(|(i, text)| SourceLine {
                path: PathBuf::from("old.rs"),
                line: i + 1,
                text: text.to_string(),
            })
            .collect();

        // a lone brace never counts as moved
        let brace = vec![(1, "}".to_string())];
        assert!(match_runs(&brace, &sources, MIN_MOVE_SCORE).is_empty());

        let added = vec![
            (4, "let total = sum(values);".to_string()),
            (5, "}".to_string()),
        ];
        let found = match_runs(&added, &sources, MIN_MOVE_SCORE);
        assert_eq!(found[&4], (PathBuf::from("old.rs"), 3));
        assert_eq!(found[&5], (PathBuf::from("old.rs"), 4));
        assert!(match_runs(&added, &sources, MIN_COPY_SCORE).is_empty());
    }
}
