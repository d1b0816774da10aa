//! Closed error taxonomy shared by every component (spec §7).

use serde::{Deserialize, Serialize};
use serde_json::Map;

/// Closed set of error codes carried in `StepResult.error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    MissingCode,
    SandboxUnavailable,
    SandboxSyncError,
    SandboxAsyncTimeout,
    TransformError,
    ConditionError,
    HttpError,
    NetworkError,
    UnknownStepType,
    StepExecutionError,
    InvalidConditionRule,
    LogUpdateError,
    NotFound,
    NoAccessToken,
    NoRefreshToken,
    Cancelled,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingCode => "MISSING_CODE",
            ErrorCode::SandboxUnavailable => "SANDBOX_UNAVAILABLE",
            ErrorCode::SandboxSyncError => "SANDBOX_SYNC_ERROR",
            ErrorCode::SandboxAsyncTimeout => "SANDBOX_ASYNC_TIMEOUT",
            ErrorCode::TransformError => "TRANSFORM_ERROR",
            ErrorCode::ConditionError => "CONDITION_ERROR",
            ErrorCode::HttpError => "HTTP_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::UnknownStepType => "UNKNOWN_STEP_TYPE",
            ErrorCode::StepExecutionError => "STEP_EXECUTION_ERROR",
            ErrorCode::InvalidConditionRule => "INVALID_CONDITION_RULE",
            ErrorCode::LogUpdateError => "LOG_UPDATE_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::NoAccessToken => "NO_ACCESS_TOKEN",
            ErrorCode::NoRefreshToken => "NO_REFRESH_TOKEN",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized `{message, code, stack?}` error record attached to a failed
/// `StepInvocation` or `StepResult`. Unknown/non-Error-shaped values are
/// normalized into this via [`ErrorRecord::unknown`], preserving whatever
/// extra keys they carried (spec §4.3, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, serde_json::Value>,
}

impl ErrorRecord {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.as_str().to_string(),
            stack: None,
            extra: Map::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Normalizes an arbitrary JSON error value into `{message, code, stack?}`,
    /// mapping unrecognized shapes to `UNKNOWN_ERROR` while preserving any
    /// extra keys present on the original value (spec §4.3 `markStepFailed`).
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(mut obj) => {
                let message = obj
                    .remove("message")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "Unknown error".to_string());
                let code = obj
                    .remove("code")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| ErrorCode::UnknownError.as_str().to_string());
                let stack = obj
                    .remove("stack")
                    .and_then(|v| v.as_str().map(str::to_string));
                Self {
                    message,
                    code,
                    stack,
                    extra: obj,
                }
            }
            serde_json::Value::String(message) => {
                Self::new(ErrorCode::UnknownError, message)
            }
            other => Self {
                message: "Unknown error".to_string(),
                code: ErrorCode::UnknownError.as_str().to_string(),
                stack: None,
                extra: {
                    let mut m = Map::new();
                    m.insert("value".to_string(), other);
                    m
                },
            },
        }
    }
}

impl From<&EngineError> for ErrorRecord {
    fn from(err: &EngineError) -> Self {
        ErrorRecord::new(err.code(), err.to_string())
    }
}

/// Structured engine error. Propagated with `?` inside components; converted
/// to an [`ErrorRecord`] at the Orchestrator boundary rather than unwound
/// past it (spec §7: "handler-level errors ... do not unwind past the
/// Orchestrator").
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("code is required")]
    MissingCode,
    #[error("sandbox backend is not configured")]
    SandboxUnavailable,
    #[error("sandbox execution failed: {0}")]
    SandboxSyncError(String),
    #[error("sandbox async execution timed out after {attempts} polls")]
    SandboxAsyncTimeout { attempts: u32 },
    #[error("transform failed: {0}")]
    TransformError(String),
    #[error("condition evaluation failed: {0}")]
    ConditionError(String),
    #[error("{0}")]
    HttpError(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("unknown step type: {0}")]
    UnknownStepType(String),
    #[error("step execution error: {0}")]
    StepExecutionError(String),
    #[error("invalid condition rule: {0}")]
    InvalidConditionRule(String),
    #[error("failed to persist execution log update: {0}")]
    LogUpdateError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no access token available")]
    NoAccessToken,
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::MissingCode => ErrorCode::MissingCode,
            EngineError::SandboxUnavailable => ErrorCode::SandboxUnavailable,
            EngineError::SandboxSyncError(_) => ErrorCode::SandboxSyncError,
            EngineError::SandboxAsyncTimeout { .. } => ErrorCode::SandboxAsyncTimeout,
            EngineError::TransformError(_) => ErrorCode::TransformError,
            EngineError::ConditionError(_) => ErrorCode::ConditionError,
            EngineError::HttpError(_) => ErrorCode::HttpError,
            EngineError::NetworkError(_) => ErrorCode::NetworkError,
            EngineError::UnknownStepType(_) => ErrorCode::UnknownStepType,
            EngineError::StepExecutionError(_) => ErrorCode::StepExecutionError,
            EngineError::InvalidConditionRule(_) => ErrorCode::InvalidConditionRule,
            EngineError::LogUpdateError(_) => ErrorCode::LogUpdateError,
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::NoAccessToken => ErrorCode::NoAccessToken,
            EngineError::NoRefreshToken => ErrorCode::NoRefreshToken,
            EngineError::Unknown(_) => ErrorCode::UnknownError,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
