use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_EVENTS_PER_RUN: usize = 5_000;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 128;
pub const DEFAULT_MAX_PROCESS_TEXT_BYTES: usize = 8 * 1024;
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_ARCHIVE_RETENTION_COUNT: usize = 50;
pub const DEFAULT_ARCHIVE_RETENTION_BYTES: u64 = 1024 * 1024 * 1024;

pub const DEFAULT_ITERATION_PATTERN: &str = r"Ralph Iteration (\d+) of (\d+)";
pub const DEFAULT_COMPLETE_MARKER: &str = "<promise>COMPLETE</promise>";

/// Limits and archive location for an [`crate::EventBus`].
///
/// Zero values are replaced by the defaults in [`BusConfig::normalized`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub max_events_per_run: usize,
    pub subscriber_buffer: usize,
    pub max_process_text_bytes: usize,
    /// Archiving is disabled when unset.
    pub archive_dir: Option<PathBuf>,
    pub max_archive_bytes: u64,
    pub archive_retention_count: usize,
    pub archive_retention_bytes: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: DEFAULT_MAX_EVENTS_PER_RUN,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            max_process_text_bytes: DEFAULT_MAX_PROCESS_TEXT_BYTES,
            archive_dir: None,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            archive_retention_count: DEFAULT_ARCHIVE_RETENTION_COUNT,
            archive_retention_bytes: DEFAULT_ARCHIVE_RETENTION_BYTES,
        }
    }
}

impl BusConfig {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_events_per_run == 0 {
            self.max_events_per_run = defaults.max_events_per_run;
        }
        if self.subscriber_buffer == 0 {
            self.subscriber_buffer = defaults.subscriber_buffer;
        }
        if self.max_process_text_bytes == 0 {
            self.max_process_text_bytes = defaults.max_process_text_bytes;
        }
        if self.max_archive_bytes == 0 {
            self.max_archive_bytes = defaults.max_archive_bytes;
        }
        if self.archive_retention_count == 0 {
            self.archive_retention_count = defaults.archive_retention_count;
        }
        if self.archive_retention_bytes == 0 {
            self.archive_retention_bytes = defaults.archive_retention_bytes;
        }
        self
    }
}

/// Textual markers recognised in supervised process output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Regex whose first capture group is the iteration number and whose
    /// optional second group is the iteration bound.
    pub iteration_pattern: String,
    /// Literal substring signalling that the agent considers the work done.
    pub complete_marker: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            iteration_pattern: DEFAULT_ITERATION_PATTERN.to_string(),
            complete_marker: DEFAULT_COMPLETE_MARKER.to_string(),
        }
    }
}

/// Settings for a [`crate::RunSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub project_root: PathBuf,
    /// Interpreter looked up on `PATH` to run the loop script.
    pub interpreter: String,
    /// Loop script, a bare file name under the project root.
    pub script: String,
    /// Artifacts that must exist as regular files under the project root.
    pub required_files: Vec<String>,
    pub max_iterations: RangeInclusive<i64>,
    pub stop_grace: Duration,
    pub stop_poll_interval: Duration,
    pub output_drain_timeout: Duration,
    pub max_line_bytes: usize,
    pub markers: MarkerConfig,
}

impl SupervisorConfig {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            interpreter: "bash".to_string(),
            script: "ralph-codex.sh".to_string(),
            required_files: vec!["prd.json".to_string()],
            max_iterations: 1..=200,
            stop_grace: Duration::from_secs(5),
            stop_poll_interval: Duration::from_millis(50),
            output_drain_timeout: Duration::from_secs(2),
            max_line_bytes: 1024 * 1024,
            markers: MarkerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limits_fall_back_to_defaults() {
        let cfg = BusConfig {
            max_events_per_run: 0,
            subscriber_buffer: 0,
            max_process_text_bytes: 0,
            archive_dir: None,
            max_archive_bytes: 0,
            archive_retention_count: 0,
            archive_retention_bytes: 0,
        }
        .normalized();
        assert_eq!(cfg.max_events_per_run, DEFAULT_MAX_EVENTS_PER_RUN);
        assert_eq!(cfg.subscriber_buffer, DEFAULT_SUBSCRIBER_BUFFER);
        assert_eq!(cfg.max_process_text_bytes, DEFAULT_MAX_PROCESS_TEXT_BYTES);
        assert_eq!(cfg.max_archive_bytes, DEFAULT_MAX_ARCHIVE_BYTES);
        assert_eq!(cfg.archive_retention_count, DEFAULT_ARCHIVE_RETENTION_COUNT);
    }

    #[test]
    fn marker_config_accepts_partial_override() {
        let cfg: MarkerConfig = serde_json::from_str(r#"{"complete_marker":"DONE"}"#).unwrap();
        assert_eq!(cfg.complete_marker, "DONE");
        assert_eq!(cfg.iteration_pattern, DEFAULT_ITERATION_PATTERN);
    }
}
