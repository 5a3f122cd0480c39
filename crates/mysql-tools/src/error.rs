//! Error types for the migration tooling.

use std::time::Duration;
use thiserror::Error;

/// Exit code for configuration and usage errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for failed platform commands.
pub const EXIT_COMMAND_ERROR: u8 = 2;
/// Exit code for failures reported by the remote platform.
pub const EXIT_REMOTE_ERROR: u8 = 3;
/// Exit code for polling deadlines.
pub const EXIT_TIMEOUT: u8 = 4;
/// Exit code for a failed authorization check.
pub const EXIT_UNAUTHORIZED: u8 = 5;
/// Exit code for tunnel and transport failures.
pub const EXIT_TUNNEL_ERROR: u8 = 6;
/// Exit code for local IO failures.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code after SIGINT/SIGTERM.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for platform and migration operations.
#[derive(Error, Debug)]
pub enum ToolsError {
    /// Configuration error (invalid YAML, bad values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid command-line usage
    #[error("{0}")]
    Usage(String),

    /// A platform command could not be executed or exited non-zero
    #[error("{action}: {message}")]
    Command { action: String, message: String },

    /// Output was received but not in the expected shape
    #[error("{context}: {message}")]
    Parse { context: String, message: String },

    /// The platform accepted the request but reported an error in the body
    #[error("{action}: {code}: {title} - {detail}")]
    Remote {
        action: String,
        code: i64,
        title: String,
        detail: String,
    },

    /// A remote task reached a non-successful terminal state
    #[error("task completed with status {state:?}")]
    TaskFailed { state: String },

    /// A polling loop exceeded its deadline
    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout { operation: String, after: Duration },

    /// Port allocation failed
    #[error("failed to get free port: {message}")]
    Port { message: String },

    /// Worker application assets could not be extracted
    #[error("Error extracting migrate assets: {message}")]
    Assets { message: String },

    /// Forwarding or secure transport failure
    #[error("Tunnel error: {message}")]
    Tunnel { message: String },

    /// The invoking user lacks the required platform role
    #[error("You must have the 'Space Developer' privilege to use the 'mysql-tools {command}' command")]
    Unauthorized { command: String },

    /// IO error (file operations, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Workflow was cancelled (SIGINT, etc.)
    #[error("Operation cancelled")]
    Cancelled,
}

impl ToolsError {
    /// Create a Command error for the action being attempted.
    pub fn command(action: impl Into<String>, message: impl ToString) -> Self {
        ToolsError::Command {
            action: action.into(),
            message: message.to_string(),
        }
    }

    /// Create a Parse error with context about what was being read.
    pub fn parse(context: impl Into<String>, message: impl ToString) -> Self {
        ToolsError::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a Tunnel error
    pub fn tunnel(message: impl ToString) -> Self {
        ToolsError::Tunnel {
            message: message.to_string(),
        }
    }

    /// Create a Timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        ToolsError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> u8 {
        match self {
            ToolsError::Config(_)
            | ToolsError::Usage(_)
            | ToolsError::Yaml(_)
            | ToolsError::Json(_) => EXIT_CONFIG_ERROR,
            ToolsError::Command { .. } | ToolsError::Parse { .. } => EXIT_COMMAND_ERROR,
            ToolsError::Remote { .. } | ToolsError::TaskFailed { .. } => EXIT_REMOTE_ERROR,
            ToolsError::Timeout { .. } => EXIT_TIMEOUT,
            ToolsError::Unauthorized { .. } => EXIT_UNAUTHORIZED,
            ToolsError::Tunnel { .. } | ToolsError::Port { .. } => EXIT_TUNNEL_ERROR,
            ToolsError::Io(_) | ToolsError::Assets { .. } => EXIT_IO_ERROR,
            ToolsError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for tooling operations.
pub type Result<T> = std::result::Result<T, ToolsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_keeps_action() {
        let err = ToolsError::command(
            "failed to bind-service \"db\" to application \"app\"",
            "exit status 1",
        );
        assert_eq!(
            err.to_string(),
            "failed to bind-service \"db\" to application \"app\": exit status 1"
        );
        assert_eq!(err.exit_code(), EXIT_COMMAND_ERROR);
    }

    #[test]
    fn test_exit_codes_by_category() {
        assert_eq!(ToolsError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(
            ToolsError::timeout("tunnel", Duration::from_secs(1)).exit_code(),
            EXIT_TIMEOUT
        );
        assert_eq!(
            ToolsError::TaskFailed {
                state: "FAILED".into()
            }
            .exit_code(),
            EXIT_REMOTE_ERROR
        );
        assert_eq!(
            ToolsError::Unauthorized { command: "migrate".into() }.exit_code(),
            EXIT_UNAUTHORIZED
        );
        assert_eq!(ToolsError::Cancelled.exit_code(), EXIT_CANCELLED);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = ToolsError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: missing"));
    }
}
