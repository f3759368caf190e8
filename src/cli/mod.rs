//! CLI command definitions and handlers

mod analyze;
mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;

use crate::config::{init_user_config, user_config_path, AttributionConfig, PROJECT_CONFIG_FILE};

pub use analyze::{format_text, AnalyzeArgs};
pub use serve::serve;

/// Parse and validate workers count (1-64)
fn parse_workers(s: &str) -> Result<usize, String> {
    let n: usize = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", s))?;
    if n == 0 {
        Err("workers must be at least 1".to_string())
    } else if n > 64 {
        Err("workers cannot exceed 64".to_string())
    } else {
        Ok(n)
    }
}

/// Authorship - who wrote this code, and how much of it
#[derive(Parser, Debug)]
#[command(name = "authorship")]
#[command(
    version,
    about = "Per-contributor attribution for git repositories: line ownership, commit activity and remote metadata",
    after_help = "\
Examples:
  authorship analyze .                                  Line ownership of the current repository
  authorship analyze . --mode commits --since 2024-01-01
  authorship analyze . --mode hybrid --owner acme --repo widgets
  authorship analyze --mode legacy --owner acme --repo widgets --stream
  authorship serve                                      One JSON request per stdin line, SSE out
  authorship config show                                Show resolved configuration"
)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn", value_parser = ["error", "warn", "info", "debug", "trace"])]
    pub log_level: String,

    /// Number of parallel workers (1-64) for blame and remote calls
    #[arg(long, global = true, value_parser = parse_workers)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one attribution analysis
    #[command(after_help = "\
Modes:
  blame            line ownership at a revision (local)
  commits          commit counts, line churn and timeline (local)
  remote-metadata  pull requests, issues and contributors (remote)
  hybrid           all of the above, merged per contributor
  legacy           remote commit listing with per-commit stats")]
    Analyze(AnalyzeArgs),

    /// Answer JSON requests read from stdin with event streams on stdout
    Serve,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Initialize the user config file with example settings
    Init,
    /// Show config paths and resolved values
    Show {
        /// Repository whose authorship.toml should be included
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

/// Run the CLI with parsed arguments
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Analyze(args) => analyze::run(args, cli.workers),

        Commands::Serve => {
            let mut config = AttributionConfig::load(None);
            apply_workers(&mut config, cli.workers);
            serve::run(config, cli.workers)
        }

        Commands::Config { action } => run_config_action(action),

        Commands::Version => {
            println!("authorship {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// `--workers` overrides both blame and remote concurrency.
pub(crate) fn apply_workers(config: &mut AttributionConfig, workers: Option<usize>) {
    if let Some(n) = workers {
        config.blame.max_concurrency = n;
        config.queue.concurrency = n;
    }
}

fn run_config_action(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init => {
            let path = init_user_config()?;
            println!("{} Config initialized at: {}", style("✓").green(), path.display());
            println!("\nSet a GitHub token for remote modes:");
            println!("  export GITHUB_TOKEN=\"ghp_...\"");
            Ok(())
        }
        ConfigAction::Show { path } => show_config(&path),
    }
}

fn show_config(path: &std::path::Path) -> Result<()> {
    let config = AttributionConfig::load(Some(path));
    println!("Config paths:");
    if let Some(user_path) = user_config_path() {
        let status = if user_path.exists() {
            style("✓").green().to_string()
        } else {
            style("(not found)").dim().to_string()
        };
        println!("  User:    {} {}", user_path.display(), status);
    }
    let project = path.join(PROJECT_CONFIG_FILE);
    let status = if project.exists() {
        style("✓").green().to_string()
    } else {
        style("(not found)").dim().to_string()
    };
    println!("  Project: {} {}", project.display(), status);
    println!();
    print!("{}", config.redacted().to_toml()?);
    Ok(())
}
