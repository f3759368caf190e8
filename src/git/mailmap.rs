//! `.mailmap` parsing and identity resolution
//!
//! Collapses the raw (name, email) pairs recorded on commits into one
//! canonical [`AuthorIdentity`] per person. Supported line forms:
//!
//! ```text
//! Proper Name <commit@email>
//! <proper@email> <commit@email>
//! Proper Name <proper@email> <commit@email>
//! Proper Name <proper@email> Commit Name <commit@email>
//! ```
//!
//! Email matching is case-insensitive. Entries that also name the commit
//! author only apply when both name and email match.

use git2::Repository;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::models::AuthorIdentity;

/// Upper bound on chained rewrites (a -> b -> c) followed during resolution.
const MAX_RESOLVE_STEPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
struct MailmapEntry {
    proper_name: Option<String>,
    proper_email: Option<String>,
}

/// Parsed mailmap snapshot.
#[derive(Debug, Clone, Default)]
pub struct Mailmap {
    /// commit email -> entry
    by_email: HashMap<String, MailmapEntry>,
    /// (commit email, lowercased commit name) -> entry
    by_email_and_name: HashMap<(String, String), MailmapEntry>,
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([^<]*?)\s*<([^>]*)>\s*(?:([^<]*?)\s*<([^>]*)>)?\s*$")
            .expect("valid mailmap regex")
    })
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl Mailmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse mailmap text. Malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let mut map = Mailmap::new();
        for (line_no, raw) in content.lines().enumerate() {
            let line = match raw.find('#') {
                Some(idx) => &raw[..idx],
                None => raw,
            };
            if line.trim().is_empty() {
                continue;
            }
            let Some(caps) = line_regex().captures(line) else {
                debug!("Ignoring malformed mailmap line {}: {:?}", line_no + 1, raw);
                continue;
            };

            let first_name = caps.get(1).and_then(|m| non_empty(m.as_str()));
            let first_email = caps.get(2).map(|m| m.as_str().trim().to_lowercase());
            let second_name = caps.get(3).and_then(|m| non_empty(m.as_str()));
            let second_email = caps.get(4).map(|m| m.as_str().trim().to_lowercase());

            match (first_email, second_email) {
                // Proper Name <commit@email>
                (Some(commit_email), None) => {
                    if first_name.is_some() {
                        map.insert(commit_email, None, first_name, None);
                    }
                }
                // [Proper Name] <proper@email> [Commit Name] <commit@email>
                (Some(proper_email), Some(commit_email)) => {
                    map.insert(
                        commit_email,
                        second_name,
                        first_name,
                        non_empty(&proper_email),
                    );
                }
                _ => {}
            }
        }
        map
    }

    fn insert(
        &mut self,
        commit_email: String,
        commit_name: Option<String>,
        proper_name: Option<String>,
        proper_email: Option<String>,
    ) {
        let entry = MailmapEntry {
            proper_name,
            proper_email,
        };
        match commit_name {
            Some(name) => {
                self.by_email_and_name
                    .insert((commit_email, name.to_lowercase()), entry);
            }
            None => {
                // Later lines refine earlier ones for the same email
                let slot = self.by_email.entry(commit_email).or_insert(MailmapEntry {
                    proper_name: None,
                    proper_email: None,
                });
                if entry.proper_name.is_some() {
                    slot.proper_name = entry.proper_name;
                }
                if entry.proper_email.is_some() {
                    slot.proper_email = entry.proper_email;
                }
            }
        }
    }

    /// Load the mailmap for a repository.
    ///
    /// Looks for `.mailmap` in the working tree, then in the tree of
    /// `revision` (or HEAD), then at the path configured by `mailmap.file`.
    pub fn load(repo: &Repository, revision: Option<&str>) -> Self {
        let mut content = String::new();

        if let Some(workdir) = repo.workdir() {
            if let Ok(text) = std::fs::read_to_string(workdir.join(".mailmap")) {
                content.push_str(&text);
            }
        }

        if content.is_empty() {
            if let Some(text) = read_mailmap_blob(repo, revision.unwrap_or("HEAD")) {
                content.push_str(&text);
            }
        }

        if let Ok(config) = repo.config() {
            if let Ok(path) = config.get_path("mailmap.file") {
                match std::fs::read_to_string(&path) {
                    Ok(text) => {
                        content.push('\n');
                        content.push_str(&text);
                    }
                    Err(e) => warn!("Failed to read mailmap.file {}: {}", path.display(), e),
                }
            }
        }

        let map = Self::parse(&content);
        debug!("Loaded mailmap with {} entries", map.len());
        map
    }

    pub fn len(&self) -> usize {
        self.by_email.len() + self.by_email_and_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, name: &str, email: &str) -> Option<&MailmapEntry> {
        self.by_email_and_name
            .get(&(email.to_string(), name.to_lowercase()))
            .or_else(|| self.by_email.get(email))
    }

    fn step(&self, name: &str, email: &str) -> (String, String) {
        match self.lookup(name, email) {
            Some(entry) => (
                entry.proper_name.clone().unwrap_or_else(|| name.to_string()),
                entry
                    .proper_email
                    .clone()
                    .unwrap_or_else(|| email.to_string()),
            ),
            None => (name.to_string(), email.to_string()),
        }
    }

    /// Resolve a raw commit identity to its canonical identity.
    ///
    /// Chains are followed to a fixed point, so resolving an already
    /// canonical identity returns it unchanged.
    pub fn resolve(&self, name: &str, email: &str) -> AuthorIdentity {
        let raw_email = email.trim().to_lowercase();
        let mut current = (name.trim().to_string(), raw_email.clone());

        for _ in 0..MAX_RESOLVE_STEPS {
            let next = self.step(&current.0, &current.1);
            if next == current {
                break;
            }
            current = next;
        }

        let mut identity = AuthorIdentity::new(current.0, current.1);
        identity.add_alias(&raw_email);
        identity
    }
}

fn read_mailmap_blob(repo: &Repository, revision: &str) -> Option<String> {
    let tree = repo.revparse_single(revision).ok()?.peel_to_tree().ok()?;
    let entry = tree.get_path(Path::new(".mailmap")).ok()?;
    let blob = repo.find_blob(entry.id()).ok()?;
    std::str::from_utf8(blob.content()).ok().map(str::to_string)
}

/// Resolves identities with or without a mailmap, depending on options.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    mailmap: Option<Mailmap>,
}

impl IdentityResolver {
    pub fn new(mailmap: Option<Mailmap>) -> Self {
        Self { mailmap }
    }

    /// Build a resolver for a repository, loading its mailmap when enabled.
    pub fn for_repo(repo: &Repository, revision: Option<&str>, use_mailmap: bool) -> Self {
        Self::new(use_mailmap.then(|| Mailmap::load(repo, revision)))
    }

    pub fn resolve(&self, name: &str, email: &str) -> AuthorIdentity {
        match &self.mailmap {
            Some(map) => map.resolve(name, email),
            None => AuthorIdentity::new(name.trim(), email.trim()),
        }
    }
}
