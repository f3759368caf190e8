//! Configuration for authorship
//!
//! Settings are layered, later layers winning:
//! 1. Built-in defaults
//! 2. User config (`~/.config/authorship/config.toml`)
//! 3. Project config (`authorship.toml` at the repository root)
//! 4. Environment (`GITHUB_TOKEN` / `AUTHORSHIP_GITHUB_TOKEN`, `AUTHORSHIP_API_URL`)
//! 5. Per-request options and CLI flags (applied by the caller)
//!
//! ```toml
//! # authorship.toml
//! [github]
//! api_url = "https://ghe.example.com/api/v3"
//!
//! [fetch]
//! max_hydration_calls = 500
//!
//! [blame]
//! detect_copies = true
//! ```

mod project_config;
mod user_config;

pub use project_config::{load_project_config, PROJECT_CONFIG_FILE};
pub use user_config::{init_user_config, user_config_path};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::git::AttributionOptions;
use crate::remote::github::DEFAULT_API_URL;
use crate::remote::queue::DEFAULT_CONCURRENCY;
use crate::remote::{
    FetchSettings, GithubClient, MetadataSettings, RateLimitSettings, WaitPolicy,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub api_url: String,
    pub timeout_secs: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: DEFAULT_API_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Remote calls in flight per request
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub safety_margin: u64,
    pub max_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            safety_margin: 50,
            max_wait_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub page_size: u32,
    pub max_pages: u32,
    pub hydration_batch_size: usize,
    pub max_hydration_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hydration_skip_above: Option<usize>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let defaults = FetchSettings::default();
        Self {
            page_size: defaults.page_size,
            max_pages: defaults.max_pages,
            hydration_batch_size: defaults.hydration_batch_size,
            max_hydration_calls: defaults.max_hydration_calls,
            hydration_skip_above: defaults.hydration_skip_above,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub max_pages: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            max_pages: MetadataSettings::default().max_pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlameConfig {
    pub max_concurrency: usize,
    pub ignore_whitespace: bool,
    pub detect_moves: bool,
    pub detect_copies: bool,
    pub use_mailmap: bool,
    pub respect_ignore_revs_file: bool,
}

impl Default for BlameConfig {
    fn default() -> Self {
        let defaults = AttributionOptions::default();
        Self {
            max_concurrency: defaults.max_concurrency,
            ignore_whitespace: defaults.ignore_whitespace,
            detect_moves: defaults.detect_moves,
            detect_copies: defaults.detect_copies,
            use_mailmap: defaults.use_mailmap,
            respect_ignore_revs_file: defaults.respect_ignore_revs_file,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Interval between SSE keep-alive comments
    pub keepalive_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { keepalive_secs: 15 }
    }
}

/// Fully resolved settings for one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    pub github: GithubConfig,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub fetch: FetchConfig,
    pub metadata: MetadataConfig,
    pub blame: BlameConfig,
    pub stream: StreamConfig,
}

impl AttributionConfig {
    /// Load every layer up to the environment.
    ///
    /// Unreadable or invalid files are logged and skipped.
    pub fn load(repo_path: Option<&Path>) -> Self {
        let user = user_config_path()
            .filter(|p| p.exists())
            .and_then(|p| read_toml(&p));
        let project = repo_path.and_then(load_project_config);

        let mut config = match Self::from_layers(user, project) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring configuration files: {}", e);
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Merge file layers over the defaults, later layers winning per key.
    pub fn from_layers(user: Option<toml::Value>, project: Option<toml::Value>) -> Result<Self> {
        let mut merged = toml::Value::try_from(Self::default())
            .map_err(|e| Error::Config(e.to_string()))?;
        for layer in [user, project].into_iter().flatten() {
            merge_values(&mut merged, layer);
        }
        let config = merged
            .try_into::<Self>()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("AUTHORSHIP_GITHUB_TOKEN").or_else(|| lookup("GITHUB_TOKEN")) {
            if !token.trim().is_empty() {
                debug!("Using GitHub token from environment");
                self.github.token = Some(token);
            }
        }
        if let Some(url) = lookup("AUTHORSHIP_API_URL") {
            self.github.api_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.concurrency == 0 {
            return Err(Error::Config("queue.concurrency must be at least 1".into()));
        }
        if self.fetch.page_size == 0 || self.fetch.page_size > 100 {
            return Err(Error::Config("fetch.page_size must be between 1 and 100".into()));
        }
        if self.fetch.max_pages == 0 {
            return Err(Error::Config("fetch.max_pages must be at least 1".into()));
        }
        if self.blame.max_concurrency == 0 {
            return Err(Error::Config("blame.max_concurrency must be at least 1".into()));
        }
        if !self.github.api_url.starts_with("http://") && !self.github.api_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "github.api_url must be an http(s) URL, got '{}'",
                self.github.api_url
            )));
        }
        Ok(())
    }

    pub fn rate_limit_settings(&self, policy: WaitPolicy) -> RateLimitSettings {
        RateLimitSettings {
            safety_margin: self.rate_limit.safety_margin,
            max_wait: Duration::from_secs(self.rate_limit.max_wait_secs),
            policy,
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            page_size: self.fetch.page_size,
            max_pages: self.fetch.max_pages,
            hydration_batch_size: self.fetch.hydration_batch_size,
            max_hydration_calls: self.fetch.max_hydration_calls,
            hydration_skip_above: self.fetch.hydration_skip_above,
        }
    }

    pub fn metadata_settings(&self) -> MetadataSettings {
        MetadataSettings {
            max_pages: self.metadata.max_pages,
        }
    }

    /// Blame options seeded from the `[blame]` section.
    pub fn attribution_options(&self) -> AttributionOptions {
        AttributionOptions {
            max_concurrency: self.blame.max_concurrency,
            ignore_whitespace: self.blame.ignore_whitespace,
            detect_moves: self.blame.detect_moves,
            detect_copies: self.blame.detect_copies,
            use_mailmap: self.blame.use_mailmap,
            respect_ignore_revs_file: self.blame.respect_ignore_revs_file,
            ..Default::default()
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.stream.keepalive_secs.max(1))
    }

    pub fn github_client(&self) -> GithubClient {
        GithubClient::new(
            self.github.api_url.clone(),
            self.github.token.clone(),
            Duration::from_secs(self.github.timeout_secs.max(1)),
        )
    }

    /// Copy safe to print: the token is masked.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if let Some(token) = &out.github.token {
            let chars: Vec<char> = token.chars().collect();
            let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
            out.github.token = Some(format!("****{}", tail));
        }
        out
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

fn read_toml(path: &Path) -> Option<toml::Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    match toml::from_str::<toml::Value>(&content) {
        Ok(value) => {
            debug!("Loaded config from {}", path.display());
            Some(value)
        }
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            None
        }
    }
}

/// Deep-merge `overlay` into `base`; tables merge per key, everything else replaces.
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
