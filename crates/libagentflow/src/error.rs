use agentflow_protocol::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FireError {
    #[error("tool must be one of: {}", .allowed.join(", "))]
    InvalidTool { allowed: Vec<&'static str> },

    #[error("maxIterations must be between {min} and {max}")]
    InvalidIterations { min: i64, max: i64 },

    #[error("{0} is required but was not found")]
    MissingArtifact(String),

    #[error("{0} must be a regular file (symlinks are not allowed)")]
    SymlinkArtifact(String),

    #[error("{0} must be a regular file")]
    NotRegularFile(String),

    #[error("failed to stat {name}: {source}")]
    ArtifactStat {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsafe server path configuration: {0}")]
    UnsafePath(String),

    #[error("a run is already active")]
    AlreadyActive,

    #[error("{0} was not found on PATH")]
    InterpreterNotFound(String),

    #[error("failed to start process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("invalid marker pattern: {0}")]
    InvalidMarkerPattern(#[from] regex::Error),
}

impl FireError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FireError::InvalidTool { .. }
            | FireError::InvalidIterations { .. }
            | FireError::MissingArtifact(_)
            | FireError::SymlinkArtifact(_)
            | FireError::NotRegularFile(_) => ErrorCode::ValidationError,
            FireError::AlreadyActive => ErrorCode::ResourceConflict,
            FireError::InterpreterNotFound(_) | FireError::Spawn(_) => ErrorCode::FireStartFailed,
            FireError::ArtifactStat { .. }
            | FireError::UnsafePath(_)
            | FireError::InvalidMarkerPattern(_) => ErrorCode::InternalError,
        }
    }

    /// Convert to the API error body, keeping OS detail out of the message.
    pub fn to_api_error(&self) -> ApiError {
        let code = self.code();
        match self {
            FireError::InvalidTool { .. } => ApiError::new(code, format!("{self}."))
                .with_hint("Use tool=codex for Codex CLI or tool=claude for Claude CLI."),
            FireError::InvalidIterations { .. } => ApiError::new(code, format!("{self}."))
                .with_hint("Pick a value like 10 (or 1 for a quick smoke run)."),
            FireError::MissingArtifact(name) => {
                let err = ApiError::new(code, format!("{self}."));
                if name.ends_with(".json") {
                    err.with_hint("Generate or Convert a PRD first so prd.json exists, then retry Fire.")
                } else {
                    err.with_hint(format!(
                        "Ensure {name} exists under the project root and is not a symlink."
                    ))
                }
            }
            FireError::SymlinkArtifact(_) => ApiError::new(code, format!("{self}."))
                .with_hint("Replace the symlink with a real file under the project root and retry."),
            FireError::NotRegularFile(_) => ApiError::new(code, format!("{self}.")),
            FireError::ArtifactStat { name, .. } => {
                ApiError::new(code, format!("Failed to stat {name}."))
            }
            FireError::UnsafePath(_) => ApiError::new(code, "unsafe server path configuration."),
            FireError::AlreadyActive => ApiError::new(code, "A Fire run is already active.")
                .with_hint("Wait for it to finish or stop it first."),
            FireError::InterpreterNotFound(interpreter) => {
                ApiError::new(code, "Failed to start Fire process.").with_hint(format!(
                    "{interpreter} was not found on PATH. Install it (or run on a Unix-like environment) and retry."
                ))
            }
            FireError::Spawn(_) => ApiError::new(code, "Failed to start Fire process.")
                .with_hint("Ensure the interpreter is installed and the loop script is present under the project root."),
            FireError::InvalidMarkerPattern(_) => {
                ApiError::new(code, "Output marker configuration is invalid.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_resource_conflict() {
        let api = FireError::AlreadyActive.to_api_error();
        assert_eq!(api.code, ErrorCode::ResourceConflict);
        assert_eq!(api.code.http_status(), 409);
    }

    #[test]
    fn missing_prd_hint_mentions_convert() {
        let api = FireError::MissingArtifact("prd.json".to_string()).to_api_error();
        assert_eq!(api.code, ErrorCode::ValidationError);
        assert!(api.hint.unwrap().to_lowercase().contains("convert"));
    }

    #[test]
    fn spawn_errors_do_not_leak_os_detail() {
        let err = FireError::Spawn(std::io::Error::other("secret /path/detail"));
        let api = err.to_api_error();
        assert_eq!(api.code, ErrorCode::FireStartFailed);
        assert!(!api.message.contains("secret"));
    }

    #[test]
    fn not_found_hint_names_interpreter() {
        let api = FireError::InterpreterNotFound("bash".to_string()).to_api_error();
        assert!(api.hint.unwrap().starts_with("bash was not found on PATH"));
    }
}
