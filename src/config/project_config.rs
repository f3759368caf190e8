//! Project-level configuration support
//!
//! Loads `authorship.toml` from the repository root. The file uses the same
//! sections as the user config and overrides it key by key.

use std::path::Path;
use tracing::debug;

use super::read_toml;

pub const PROJECT_CONFIG_FILE: &str = "authorship.toml";

/// Raw project config layer, if the repository carries one.
///
/// `repo_path` may be any directory inside the working tree; the file is
/// looked up at the top of the working tree.
pub fn load_project_config(repo_path: &Path) -> Option<toml::Value> {
    let root = git2::Repository::discover(repo_path)
        .ok()
        .and_then(|repo| repo.workdir().map(Path::to_path_buf))
        .unwrap_or_else(|| repo_path.to_path_buf());

    let toml_path = root.join(PROJECT_CONFIG_FILE);
    if !toml_path.exists() {
        debug!("No {} in {}", PROJECT_CONFIG_FILE, root.display());
        return None;
    }
    read_toml(&toml_path)
}
