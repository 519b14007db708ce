use anyhow::{Context, Result};
use libagentflow::{BusConfig, MarkerConfig, SupervisorConfig};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8765;

/// Settings read from `config.toml`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub project_root: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub archive: Option<bool>,
    pub max_events_per_run: Option<usize>,
    pub subscriber_buffer: Option<usize>,
    pub max_process_text_bytes: Option<usize>,
    pub max_archive_bytes: Option<u64>,
    pub archive_retention_count: Option<usize>,
    pub archive_retention_bytes: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub interpreter: Option<String>,
    pub script: Option<String>,
    pub markers: Option<MarkerConfig>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Load `explicit` if given, otherwise the user config file when present.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default = agentflow_protocol::paths::config_path();
        if default.is_file() {
            return Self::load(&default);
        }
        Ok(Self::default())
    }
}

/// Command-line values; each one beats the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub port: Option<u16>,
    pub project_root: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub no_archive: bool,
    pub max_events_per_run: Option<usize>,
    pub max_process_text_bytes: Option<usize>,
    pub stop_grace_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub port: u16,
    pub bus: BusConfig,
    pub supervisor: SupervisorConfig,
}

impl ConsoleConfig {
    /// Merge CLI overrides over the file config over built-in defaults.
    ///
    /// A relative project root is resolved against `cwd`.
    pub fn resolve(cli: Overrides, file: FileConfig, cwd: &Path) -> Result<Self> {
        let root = cli
            .project_root
            .or(file.project_root)
            .unwrap_or_else(|| cwd.to_path_buf());
        let root = if root.is_absolute() {
            root
        } else {
            cwd.join(root)
        };
        let root = fs::canonicalize(&root)
            .with_context(|| format!("project root {} is not accessible", root.display()))?;

        let archive_enabled = !cli.no_archive && file.archive.unwrap_or(true);
        let archive_dir = archive_enabled.then(|| {
            cli.archive_dir
                .or(file.archive_dir)
                .unwrap_or_else(|| agentflow_protocol::paths::default_archive_dir(&root))
        });

        let defaults = BusConfig::default();
        let bus = BusConfig {
            max_events_per_run: cli
                .max_events_per_run
                .or(file.max_events_per_run)
                .unwrap_or(defaults.max_events_per_run),
            subscriber_buffer: file.subscriber_buffer.unwrap_or(defaults.subscriber_buffer),
            max_process_text_bytes: cli
                .max_process_text_bytes
                .or(file.max_process_text_bytes)
                .unwrap_or(defaults.max_process_text_bytes),
            archive_dir,
            max_archive_bytes: file.max_archive_bytes.unwrap_or(defaults.max_archive_bytes),
            archive_retention_count: file
                .archive_retention_count
                .unwrap_or(defaults.archive_retention_count),
            archive_retention_bytes: file
                .archive_retention_bytes
                .unwrap_or(defaults.archive_retention_bytes),
        }
        .normalized();

        let mut supervisor = SupervisorConfig::new(root);
        if let Some(ms) = cli.stop_grace_ms.or(file.stop_grace_ms) {
            supervisor.stop_grace = Duration::from_millis(ms);
        }
        if let Some(interpreter) = file.interpreter {
            supervisor.interpreter = interpreter;
        }
        if let Some(script) = file.script {
            supervisor.script = script;
        }
        if let Some(markers) = file.markers {
            supervisor.markers = markers;
        }

        Ok(Self {
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            bus,
            supervisor,
        })
    }
}
