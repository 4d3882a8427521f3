//! Single typed error for the whole runtime.
//!
//! Every fallible operation returns [`WeftError`], which carries a closed
//! [`ErrorCode`] discriminant, a message, an optional wrapped cause, and a
//! free-form context map. Retryability is a property of the code, not the
//! call site: the workflow engine's retry budget only activates on codes
//! whose [`ErrorCode::is_retryable`] is true.

use std::collections::BTreeMap;
use std::fmt;

/// Closed set of error codes, grouped by origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Configuration
    ConfigInvalid,
    ConfigNotFound,
    ConfigParseFailed,
    // Provider
    ProviderNotFound,
    ProviderInvalid,
    ProviderTimeout,
    ProviderApiError,
    // Tool
    ToolNotFound,
    ToolExecutionError,
    ToolInvalidArgs,
    // Request
    RequestInvalid,
    RequestTooLarge,
    // Server (MCP subprocess)
    ServerNotFound,
    ServerStartFailed,
    ServerStopped,
    // Generic
    Unknown,
    Internal,
}

impl ErrorCode {
    /// Whether the workflow engine's retry budget applies to this code.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::ProviderTimeout | ErrorCode::ProviderApiError | ErrorCode::ToolExecutionError
        )
    }

    /// Deterministic HTTP status for the proxy surface.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::ConfigInvalid
            | ErrorCode::ConfigParseFailed
            | ErrorCode::RequestInvalid
            | ErrorCode::ToolInvalidArgs => 400,
            ErrorCode::ConfigNotFound
            | ErrorCode::ProviderNotFound
            | ErrorCode::ToolNotFound
            | ErrorCode::ServerNotFound => 404,
            ErrorCode::ProviderTimeout => 408,
            ErrorCode::RequestTooLarge => 413,
            ErrorCode::ProviderApiError => 502,
            ErrorCode::ProviderInvalid
            | ErrorCode::ToolExecutionError
            | ErrorCode::ServerStartFailed
            | ErrorCode::ServerStopped
            | ErrorCode::Unknown
            | ErrorCode::Internal => 500,
        }
    }

    /// Process exit code for the CLI: 2 config, 3 network/provider, 1 otherwise.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::ConfigInvalid | ErrorCode::ConfigNotFound | ErrorCode::ConfigParseFailed => {
                2
            }
            ErrorCode::ProviderTimeout | ErrorCode::ProviderApiError => 3,
            _ => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::ConfigNotFound => "CONFIG_NOT_FOUND",
            ErrorCode::ConfigParseFailed => "CONFIG_PARSE_FAILED",
            ErrorCode::ProviderNotFound => "PROVIDER_NOT_FOUND",
            ErrorCode::ProviderInvalid => "PROVIDER_INVALID",
            ErrorCode::ProviderTimeout => "PROVIDER_TIMEOUT",
            ErrorCode::ProviderApiError => "PROVIDER_API_ERROR",
            ErrorCode::ToolNotFound => "TOOL_NOT_FOUND",
            ErrorCode::ToolExecutionError => "TOOL_EXECUTION_ERROR",
            ErrorCode::ToolInvalidArgs => "TOOL_INVALID_ARGS",
            ErrorCode::RequestInvalid => "REQUEST_INVALID",
            ErrorCode::RequestTooLarge => "REQUEST_TOO_LARGE",
            ErrorCode::ServerNotFound => "SERVER_NOT_FOUND",
            ErrorCode::ServerStartFailed => "SERVER_START_FAILED",
            ErrorCode::ServerStopped => "SERVER_STOPPED",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The runtime's error type.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct WeftError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Free-form context, e.g. `{"provider": "openai", "model": "gpt-4o"}`.
    pub context: BTreeMap<String, String>,
}

impl WeftError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            context: BTreeMap::new(),
        }
    }

    /// Wraps a lower-level cause. Used at each layer boundary an I/O error
    /// crosses; errors are never re-raised bare.
    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl From<config::ConfigError> for WeftError {
    fn from(err: config::ConfigError) -> Self {
        let code = match &err {
            config::ConfigError::NotFound(_) => ErrorCode::ConfigNotFound,
            config::ConfigError::Parse(_) => ErrorCode::ConfigParseFailed,
            config::ConfigError::Read(_) => ErrorCode::ConfigNotFound,
            config::ConfigError::Invalid(_) => ErrorCode::ConfigInvalid,
        };
        WeftError::new(code, err.to_string()).with_cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert!(ErrorCode::ProviderTimeout.is_retryable());
        assert!(ErrorCode::ProviderApiError.is_retryable());
        assert!(ErrorCode::ToolExecutionError.is_retryable());
        assert!(!ErrorCode::ConfigInvalid.is_retryable());
        assert!(!ErrorCode::ToolNotFound.is_retryable());
        assert!(!ErrorCode::ServerStopped.is_retryable());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorCode::RequestInvalid.http_status(), 400);
        assert_eq!(ErrorCode::ToolNotFound.http_status(), 404);
        assert_eq!(ErrorCode::ProviderTimeout.http_status(), 408);
        assert_eq!(ErrorCode::RequestTooLarge.http_status(), 413);
        assert_eq!(ErrorCode::ProviderApiError.http_status(), 502);
        assert_eq!(ErrorCode::Internal.http_status(), 500);
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(ErrorCode::ConfigInvalid.exit_code(), 2);
        assert_eq!(ErrorCode::ProviderTimeout.exit_code(), 3);
        assert_eq!(ErrorCode::ToolExecutionError.exit_code(), 1);
    }

    #[test]
    fn context_is_attached() {
        let err = WeftError::new(ErrorCode::ProviderApiError, "rate limited")
            .with_context("provider", "openai")
            .with_context("model", "gpt-4o");
        assert_eq!(err.context["provider"], "openai");
        assert_eq!(err.to_string(), "PROVIDER_API_ERROR: rate limited");
    }
}
