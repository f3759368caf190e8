//! Analyze command - run one attribution request from the command line

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AttributionConfig;
use crate::models::ContributorAggregate;
use crate::pipeline::{
    AnalysisMode, AnalysisRequest, AnalysisResponse, BlameRequestOptions, CommitRequestOptions,
    GithubRequestOptions, ModeDispatcher,
};
use crate::progress::{ProgressEmitter, ProgressEvent, SseWriter};
use crate::remote::github::slug_from_remote_url;
use crate::remote::{RemoteApi, WaitPolicy};

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Path to the local repository
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Analysis mode
    #[arg(long, short = 'm', default_value = "blame", value_parser = ["blame", "commits", "remote-metadata", "hybrid", "legacy"])]
    pub mode: String,

    /// Repository owner on GitHub (default: from the origin remote)
    #[arg(long)]
    pub owner: Option<String>,

    /// Repository name on GitHub (default: from the origin remote)
    #[arg(long)]
    pub repo: Option<String>,

    /// Branch or revision (default: HEAD / the remote default branch)
    #[arg(long, short = 'b')]
    pub branch: Option<String>,

    /// Only commits on or after this date (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub since: Option<String>,

    /// Only commits on or before this date (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub until: Option<String>,

    /// Output format: text, json
    #[arg(long, short = 'f', default_value = "text", value_parser = ["text", "json"])]
    pub format: String,

    /// Output file path (default: stdout)
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Write the progress event stream to stdout instead of a report
    #[arg(long)]
    pub stream: bool,

    /// Read the full JSON request from a file (other request flags are ignored)
    #[arg(long)]
    pub request: Option<PathBuf>,

    /// Revision to leave out of blame (repeatable)
    #[arg(long = "ignore-rev")]
    pub ignore_revs: Vec<String>,

    /// Only blame paths matching this glob (repeatable)
    #[arg(long)]
    pub include: Vec<String>,

    /// Never blame paths matching this glob (repeatable)
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Include the per-file ownership breakdown
    #[arg(long)]
    pub files: bool,

    /// Follow lines copied from other files
    #[arg(long)]
    pub detect_copies: bool,

    /// Count merge commits
    #[arg(long)]
    pub include_merges: bool,

    /// Stop after this many commits
    #[arg(long)]
    pub max_commits: Option<usize>,

    /// Do not apply .mailmap
    #[arg(long)]
    pub no_mailmap: bool,

    /// Contributors shown in text output (0 = all)
    #[arg(long, default_value = "20")]
    pub top: usize,
}

/// Run the analyze command
pub fn run(args: AnalyzeArgs, workers: Option<usize>) -> Result<()> {
    let request = build_request(&args)?;
    let config_root = request.repo_path.clone().unwrap_or_else(|| args.path.clone());
    let mut config = AttributionConfig::load(Some(&config_root));
    super::apply_workers(&mut config, workers);
    let keepalive = config.keepalive();

    let remote = remote_client(&config, &request);
    let policy = if args.stream {
        WaitPolicy::Abort
    } else {
        WaitPolicy::Wait
    };
    let dispatcher = ModeDispatcher::new(config, remote).with_wait_policy(policy);

    let rt = Runtime::new().context("Failed to create tokio runtime")?;
    if args.stream {
        return rt.block_on(stream(dispatcher, request, keepalive));
    }

    let response = rt.block_on(run_with_bar(dispatcher, request))?;
    let rendered = match args.format.as_str() {
        "json" => serde_json::to_string_pretty(&response)?,
        _ => format_text(&response, args.top),
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            eprintln!("{} Report written to {}", style("✓").green(), path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn build_request(args: &AnalyzeArgs) -> Result<AnalysisRequest> {
    if let Some(file) = &args.request {
        let body = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read request file {}", file.display()))?;
        return Ok(AnalysisRequest::from_json(&body)?);
    }

    let mode: AnalysisMode = args.mode.parse()?;
    let (mut owner, mut repo) = (args.owner.clone(), args.repo.clone());
    if mode.needs_remote() && (owner.is_none() || repo.is_none()) {
        if let Some(slug) = origin_slug(&args.path) {
            debug!("Using {} from the origin remote", slug);
            owner = owner.or(Some(slug.owner));
            repo = repo.or(Some(slug.repo));
        }
    }

    let repo_path = if mode.needs_local() {
        Some(
            args.path
                .canonicalize()
                .with_context(|| format!("Path does not exist: {}", args.path.display()))?,
        )
    } else {
        None
    };

    Ok(AnalysisRequest {
        mode: Some(mode),
        repo_path,
        owner,
        repo,
        branch: args.branch.clone(),
        since: args.since.clone(),
        until: args.until.clone(),
        blame_options: Some(BlameRequestOptions {
            ignore_revs: args.ignore_revs.clone(),
            include_patterns: args.include.clone(),
            exclude_patterns: args.exclude.clone(),
            include_file_breakdown: args.files,
            detect_copies: args.detect_copies.then_some(true),
            use_mailmap: args.no_mailmap.then_some(false),
            ..Default::default()
        }),
        commit_options: Some(CommitRequestOptions {
            exclude_merges: Some(!args.include_merges),
            max_commits: args.max_commits,
            use_mailmap: args.no_mailmap.then_some(false),
            ..Default::default()
        }),
        github_options: Some(GithubRequestOptions {
            exclude_merges: Some(!args.include_merges),
            max_commits: args.max_commits,
            ..Default::default()
        }),
    })
}

/// GitHub slug of the `origin` remote, if it points at GitHub.
fn origin_slug(path: &Path) -> Option<crate::remote::RepoSlug> {
    let repo = git2::Repository::discover(path).ok()?;
    let remote = repo.find_remote("origin").ok()?;
    slug_from_remote_url(remote.url()?)
}

fn remote_client(config: &AttributionConfig, request: &AnalysisRequest) -> Option<Arc<dyn RemoteApi>> {
    if !request.mode.is_some_and(|m| m.needs_remote()) {
        return None;
    }
    let client = config.github_client();
    if !client.has_token() {
        warn!("No GitHub token configured; unauthenticated requests are limited to 60 per hour");
    }
    Some(Arc::new(client))
}

/// Create bar progress style
fn create_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .unwrap()
        .progress_chars("█▓▒░  ")
}

async fn run_with_bar(dispatcher: ModeDispatcher, request: AnalysisRequest) -> Result<AnalysisResponse> {
    let (emitter, mut subscriber) = ProgressEmitter::channel(CancellationToken::new());
    let bar = ProgressBar::new(100);
    bar.set_style(create_bar_style());

    let bar_task = tokio::spawn(async move {
        while let Some(event) = subscriber.next().await {
            if let ProgressEvent::Progress { percent, message, .. } = event {
                bar.set_position(percent as u64);
                bar.set_message(message);
            }
        }
        bar.finish_and_clear();
    });

    let outcome = dispatcher.dispatch(&request, &emitter).await;
    drop(emitter);
    bar_task.await?;
    Ok(outcome?)
}

async fn stream(
    dispatcher: ModeDispatcher,
    request: AnalysisRequest,
    keepalive: std::time::Duration,
) -> Result<()> {
    let (emitter, subscriber) = ProgressEmitter::channel(CancellationToken::new());
    let task = tokio::spawn(async move { dispatcher.dispatch(&request, &emitter).await });

    let mut writer = SseWriter::new(tokio::io::stdout(), keepalive);
    let pumped = writer.pump(subscriber).await;
    let outcome = task.await?;
    pumped.context("Failed to write event stream")?;
    outcome?;
    Ok(())
}

fn identity_label(c: &ContributorAggregate) -> String {
    let name = &c.identity.canonical_name;
    match (&c.login, c.identity.canonical_email.is_empty()) {
        (Some(login), _) => format!("{} (@{})", name, login),
        (None, false) => format!("{} <{}>", name, c.identity.canonical_email),
        (None, true) => name.clone(),
    }
}

fn limit<T>(items: &[T], top: usize) -> &[T] {
    if top == 0 || top >= items.len() {
        items
    } else {
        &items[..top]
    }
}

/// Human-readable report for a response.
pub fn format_text(response: &AnalysisResponse, top: usize) -> String {
    let mut out = String::new();
    match response {
        AnalysisResponse::Blame(r) => {
            let _ = writeln!(
                out,
                "{} {} lines in {} files",
                style("Line ownership:").bold(),
                r.total_lines,
                r.files_processed
            );
            for a in limit(&r.authors, top) {
                let _ = writeln!(
                    out,
                    "  {:<40} {:>8} lines  {:>5.1}%",
                    format!("{} <{}>", a.identity.canonical_name, a.identity.canonical_email),
                    a.lines,
                    a.percent
                );
            }
        }
        AnalysisResponse::Commits(r) => {
            let _ = writeln!(
                out,
                "{} {} commits",
                style("Commit activity:").bold(),
                r.total_commits
            );
            for c in limit(&r.authors, top) {
                let _ = writeln!(
                    out,
                    "  {:<40} {:>6} commits  {}  {}  {} active days",
                    identity_label(c),
                    c.commit_count,
                    style(format!("+{}", c.additions)).green(),
                    style(format!("-{}", c.deletions)).red(),
                    c.active_days
                );
            }
        }
        AnalysisResponse::RemoteMetadata(r) => {
            let _ = writeln!(
                out,
                "{} {}: {} pull requests, {} issues",
                style("Remote activity:").bold(),
                r.repository,
                r.total_pull_requests,
                r.total_issues
            );
            for a in limit(&r.contributors, top) {
                let _ = writeln!(
                    out,
                    "  @{:<30} {:>6} commits  {:>4} PRs ({} merged)  {:>4} issues",
                    a.login,
                    a.contributions,
                    a.pull_requests_opened,
                    a.pull_requests_merged,
                    a.issues_opened
                );
            }
        }
        AnalysisResponse::Hybrid(r) => {
            let _ = writeln!(
                out,
                "{} {} lines, {} commits, {} contributors",
                style("Contributors:").bold(),
                r.total_lines,
                r.total_commits,
                r.contributors.len()
            );
            for c in limit(&r.contributors, top) {
                let _ = writeln!(
                    out,
                    "  {:<40} {:>8} lines  {:>5.1}%  {:>6} commits  {}  {}",
                    identity_label(c),
                    c.line_ownership.unwrap_or(0),
                    c.ownership_percent.unwrap_or(0.0),
                    c.commit_count,
                    style(format!("+{}", c.additions)).green(),
                    style(format!("-{}", c.deletions)).red()
                );
            }
            let _ = writeln!(
                out,
                "  {} {} pull requests, {} issues",
                style(&r.remote.repository).cyan(),
                r.remote.total_pull_requests,
                r.remote.total_issues
            );
        }
        AnalysisResponse::Legacy(r) => {
            let _ = writeln!(
                out,
                "{} {}: {} commits over {} pages",
                style("Commit activity:").bold(),
                r.repository,
                r.total_commits,
                r.pages_fetched
            );
            for c in limit(&r.contributors, top) {
                let _ = writeln!(
                    out,
                    "  {:<40} {:>6} commits  {}  {}",
                    identity_label(c),
                    c.commit_count,
                    style(format!("+{}", c.additions)).green(),
                    style(format!("-{}", c.deletions)).red()
                );
            }
        }
    }

    if let Some(note) = response.status().describe() {
        let _ = writeln!(out, "\n{}", style(note).yellow());
    }
    for warning in response.warnings() {
        let _ = writeln!(out, "{} {}", style("warning:").yellow().bold(), warning);
    }
    out.trim_end().to_string()
}
