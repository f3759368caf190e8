//! Authorship - per-contributor attribution for git repositories
//!
//! Produces commit counts, line churn, active-day spans and true line-level
//! ownership per contributor, from a local repository, the GitHub API, or
//! both.
//!
//! The entry point is [`pipeline::ModeDispatcher`], which runs one
//! [`pipeline::AnalysisRequest`] and reports through a
//! [`progress::ProgressEmitter`].

pub mod cli;
pub mod config;
pub mod error;
pub mod git;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod remote;

pub use error::{Error, Result, Warning};
