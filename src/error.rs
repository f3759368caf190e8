//! Error and warning types for the attribution pipeline
//!
//! Fatal conditions are [`Error`] variants and abort the request.
//! Degraded-but-usable conditions are [`Warning`] values attached to an
//! otherwise successful result.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while running an attribution request
#[derive(Error, Debug)]
pub enum Error {
    /// Quota exhausted (or projected to exhaust) on the remote API
    #[error("Remote API rate limit reached ({remaining} requests left). Retry after {reset_at}.")]
    RateLimited {
        remaining: u64,
        reset_at: DateTime<Utc>,
    },

    /// Network failure or 5xx from the remote API
    #[error("Remote API unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Request is missing fields required by its mode, or is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The consumer went away; no further work is submitted
    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code, used in streamed `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::RateLimited { .. } => "rate_limited",
            Error::UpstreamUnavailable(_) => "upstream_unavailable",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Git(_) => "git_error",
            Error::Io(_) => "io_error",
            Error::Json(_) => "invalid_json",
            Error::Config(_) => "config_error",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Reset time for retryable rate-limit errors.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Error::RateLimited { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("worker task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal conditions recorded on a successful result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Warning {
    /// Stat hydration was capped; `skipped` records keep zeroed stats
    #[serde(rename_all = "camelCase")]
    PartialHydration { hydrated: usize, skipped: usize },

    /// A single file could not be blamed and was left out of the totals
    #[serde(rename_all = "camelCase")]
    CorruptFileSkipped { path: String, reason: String },

    /// Commit pagination stopped at the hard page ceiling
    #[serde(rename_all = "camelCase")]
    PageCeilingReached { pages: u32 },

    /// A metadata listing stopped at its page ceiling
    #[serde(rename_all = "camelCase")]
    MetadataTruncated { resource: String, pages: u32 },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::PartialHydration { hydrated, skipped } => write!(
                f,
                "Commit stats incomplete: {} hydrated, {} left with zeroed additions/deletions",
                hydrated, skipped
            ),
            Warning::CorruptFileSkipped { path, reason } => {
                write!(f, "Skipped {}: {}", path, reason)
            }
            Warning::PageCeilingReached { pages } => write!(
                f,
                "History truncated after {} pages; older commits were not fetched",
                pages
            ),
            Warning::MetadataTruncated { resource, pages } => {
                write!(f, "Listing of {} truncated after {} pages", resource, pages)
            }
        }
    }
}
