//! Error types for Helmsman

use hyper::StatusCode;
use serde::Serialize;

/// Main error type for coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum HelmsmanError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient credits: {0}")]
    InsufficientCredits(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("No capacity: {0}")]
    NoCapacity(String),

    #[error("Command timed out: {0}")]
    Timeout(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Command failed on node: {0}")]
    CommandFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HelmsmanError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientCredits(_) => StatusCode::PAYMENT_REQUIRED,
            Self::BudgetExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NoCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ChannelClosed(_) => StatusCode::BAD_GATEWAY,
            Self::CommandFailed(_) => StatusCode::BAD_GATEWAY,
            Self::WebSocket(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for structured error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InsufficientCredits(_) => "insufficient_credits",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::NoCapacity(_) => "no_capacity",
            Self::Timeout(_) => "timeout",
            Self::ChannelClosed(_) => "channel_closed",
            Self::CommandFailed(_) => "command_failed",
            Self::WebSocket(_) => "websocket",
            Self::Storage(_) => "storage",
            Self::Database(_) => "database",
            Self::Internal(_) => "internal",
            Self::Config(_) => "config",
        }
    }

    /// Structured body for user-visible failures
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            details: None,
        }
    }
}

/// Structured error object surfaced to callers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// Implement From conversions for common error types

impl From<std::io::Error> for HelmsmanError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for HelmsmanError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for HelmsmanError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HelmsmanError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

impl From<rusqlite::Error> for HelmsmanError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<reqwest::Error> for HelmsmanError {
    fn from(err: reqwest::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, HelmsmanError>;
