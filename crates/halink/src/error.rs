//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use halink_config::ConfigError;
use halink_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to Home Assistant: {reason}")]
    #[diagnostic(
        code(halink::connection_failed),
        help(
            "Check that Home Assistant is running and reachable.\n\
             The URL should point at the instance, e.g. http://homeassistant.local:8123"
        )
    )]
    ConnectionFailed { reason: String },

    #[error("Connection to Home Assistant lost: {reason}")]
    #[diagnostic(code(halink::connection_lost))]
    ConnectionLost { reason: String },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(halink::auth_failed),
        help(
            "Create a long-lived access token under your Home Assistant user profile,\n\
             then run: halink config set-token <TOKEN>"
        )
    )]
    AuthFailed { message: String },

    #[error("No access token configured for profile '{profile}'")]
    #[diagnostic(
        code(halink::no_credentials),
        help("Pass --token, set HALINK_TOKEN, or run: halink config set-token <TOKEN>")
    )]
    NoCredentials { profile: String },

    // ── Upstream ─────────────────────────────────────────────────────
    #[error("Home Assistant error ({code}): {message}")]
    #[diagnostic(code(halink::upstream))]
    Upstream { code: String, message: String },

    #[error("Subscription to '{category}' failed: {message}")]
    #[diagnostic(code(halink::subscription))]
    Subscription { category: String, message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(halink::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(halink::profile_not_found),
        help("Create one with: halink config init --profile {name} --url <URL>")
    )]
    ProfileNotFound { name: String },

    #[error("No Home Assistant URL configured")]
    #[diagnostic(
        code(halink::no_config),
        help(
            "Pass --url, set HALINK_URL, or create a profile with: halink config init\n\
             Expected config at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(halink::config))]
    Config(ConfigError),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Request timed out after {millis}ms")]
    #[diagnostic(
        code(halink::timeout),
        help("Increase the deadline with --timeout.")
    )]
    Timeout { millis: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(halink::json))]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    #[diagnostic(code(halink::internal))]
    Internal(String),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::ConnectionLost { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::ProfileNotFound { .. } | Self::NoConfig { .. } => {
                exit_code::USAGE
            }
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { reason } => Self::ConnectionFailed { reason },
            CoreError::NotConnected => Self::ConnectionFailed {
                reason: "not connected".into(),
            },
            CoreError::ConnectionClosed => Self::ConnectionLost {
                reason: "session closed".into(),
            },
            CoreError::ConnectionLost { reason } => Self::ConnectionLost { reason },
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::Timeout { timeout_ms } => Self::Timeout { millis: timeout_ms },
            CoreError::Upstream { code, message } => Self::Upstream { code, message },
            CoreError::Subscription { category, message } => {
                Self::Subscription { category, message }
            }
            CoreError::InvalidRequest { message } => Self::Validation {
                field: "request".into(),
                reason: message,
            },
            CoreError::InvalidFilter { expression, reason } => Self::Validation {
                field: format!("filter '{expression}'"),
                reason,
            },
            CoreError::Config { message } => Self::Validation {
                field: "configuration".into(),
                reason: message,
            },
            CoreError::Internal(message) => Self::Internal(message),
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::UnknownProfile { name } => Self::ProfileNotFound { name },
            ConfigError::NoCredentials { profile } => Self::NoCredentials { profile },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}
