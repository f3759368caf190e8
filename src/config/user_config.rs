//! User-level configuration file
//!
//! Lives at `~/.config/authorship/config.toml` (or the platform's
//! equivalent config directory).

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Path of the user config file, if the platform has a config directory.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("authorship").join("config.toml"))
}

const EXAMPLE: &str = r#"# authorship user configuration
# Every key is optional; project-level authorship.toml overrides this file.

[github]
# Prefer the GITHUB_TOKEN / AUTHORSHIP_GITHUB_TOKEN environment variables
# token = "ghp_..."
# api_url = "https://api.github.com"
# timeout_secs = 30

[queue]
# concurrency = 8

[rate_limit]
# safety_margin = 50
# max_wait_secs = 60

[fetch]
# max_pages = 100
# max_hydration_calls = 1000
# hydration_skip_above = 5000

[blame]
# max_concurrency = 8
# ignore_whitespace = true
# detect_moves = true
# detect_copies = false
# use_mailmap = true
# respect_ignore_revs_file = true

[stream]
# keepalive_secs = 15
"#;

/// Create the user config directory and an example file if none exists.
pub fn init_user_config() -> Result<PathBuf> {
    let config_path = user_config_path()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    write_example(&config_path)?;
    Ok(config_path)
}

fn write_example(config_path: &std::path::Path) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !config_path.exists() {
        std::fs::write(config_path, EXAMPLE)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttributionConfig;
    use tempfile::tempdir;

    #[test]
    fn test_user_config_path_shape() {
        if let Some(p) = user_config_path() {
            assert!(p.ends_with("authorship/config.toml"));
        }
    }

    #[test]
    fn test_example_parses_to_defaults() -> anyhow::Result<()> {
        let value: toml::Value = toml::from_str(EXAMPLE)?;
        let config = AttributionConfig::from_layers(Some(value), None)?;
        assert_eq!(config, AttributionConfig::default());
        Ok(())
    }

    #[test]
    fn test_write_example_keeps_existing_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("config.toml");
        write_example(&path)?;
        assert!(std::fs::read_to_string(&path)?.contains("[github]"));

        std::fs::write(&path, "[queue]\nconcurrency = 2\n")?;
        write_example(&path)?;
        assert!(std::fs::read_to_string(&path)?.contains("concurrency = 2"));
        Ok(())
    }
}
