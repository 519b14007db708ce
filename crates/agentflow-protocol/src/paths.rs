use std::path::{Path, PathBuf};

/// Directory (relative to the project root) holding per-project console state.
pub const STATE_DIR_NAME: &str = ".ohmyagentflow";

/// Returns the default run archive directory for a project.
pub fn default_archive_dir(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR_NAME).join("runs")
}

/// Returns the config/data directory path for agentflow.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("agentflow")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("agentflow")
    } else {
        PathBuf::from("/tmp/agentflow")
    }
}

/// Returns the config file path for the console.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_dir_lives_under_project_state() {
        let dir = default_archive_dir(Path::new("/work/project"));
        assert_eq!(dir, PathBuf::from("/work/project/.ohmyagentflow/runs"));
    }

    #[test]
    fn config_path_ends_with_toml() {
        assert!(config_path().ends_with("agentflow/config.toml"));
    }
}
