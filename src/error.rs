//! Error types for DataBridge

use thiserror::Error;

/// DataBridge error types
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Required input parameter absent and no default declared
    #[error("Command '{command}' is missing required parameter '{parameter}'")]
    MissingParameter { command: String, parameter: String },

    /// Condition expression could not be evaluated
    #[error("Cannot evaluate condition '{expression}': {reason}")]
    ConditionEvaluation { expression: String, reason: String },

    /// Failure reported by an adapter collaborator, surfaced as-is
    #[error("Adapter failure: {0}")]
    Adapter(#[source] anyhow::Error),

    /// A fire arrived while the previous run of the same schedule was still executing
    #[error("Schedule '{schedule}' is still running, fire skipped")]
    OverlapSkipped { schedule: String },

    /// Unhandled error inside a fired execution
    #[error("Scheduled run '{schedule}' (root '{root}') failed: {message}")]
    SchedulerJob {
        schedule: String,
        root: String,
        message: String,
    },

    /// The timer engine could not arm a trigger
    #[error("Failed to arm schedule '{schedule}': {message}")]
    SchedulerArm { schedule: String, message: String },

    /// Schedule description is not usable
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No schedule registered under the identifier
    #[error("Unknown schedule '{0}'")]
    UnknownSchedule(String),

    /// Programming error: operation not valid in the current state
    #[error("Invalid state: {0}")]
    State(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl BridgeError {
    pub fn missing(command: &str, parameter: &str) -> Self {
        BridgeError::MissingParameter {
            command: command.to_string(),
            parameter: parameter.to_string(),
        }
    }
}

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_parameter_message() {
        let err = BridgeError::missing("loop_files", "Directory");
        assert_eq!(
            err.to_string(),
            "Command 'loop_files' is missing required parameter 'Directory'"
        );
    }

    #[test]
    fn test_adapter_error_keeps_source_text() {
        let err = BridgeError::Adapter(anyhow::anyhow!("connection refused"));
        assert_eq!(err.to_string(), "Adapter failure: connection refused");
    }
}
