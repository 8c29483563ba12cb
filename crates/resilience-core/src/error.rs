use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad failure category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport failure: the remote could not be reached at all.
    Network,
    /// The remote answered with an error status.
    RemoteApi,
    /// Invalid, conflicting or duplicate input.
    Validation,
    /// Missing or expired session.
    Auth,
    /// Authenticated caller is not allowed to do this.
    Permission,
    /// Too many requests.
    RateLimit,
    /// The environment reports no connectivity.
    Offline,
    /// A call exceeded its deadline.
    Timeout,
    /// Anything that matched no other rule.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::RemoteApi => "remote_api",
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::RateLimit => "rate_limit",
            Self::Offline => "offline",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Severity ranking, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A failure as observed at a boundary, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawError {
    /// Connect/fetch level failure.
    Transport { message: String },
    /// The remote answered with a status code.
    Status {
        status: u16,
        code: Option<String>,
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// Caller-tagged validation failure; `message` is shown to the user verbatim.
    Validation { message: String },
    /// A per-call deadline elapsed.
    Timeout { after_ms: u64 },
    /// No session is present for an operation that needs one.
    Unauthenticated,
    /// A local write gate refused the submission.
    Throttled { retry_after_ms: u64 },
    /// Anything else.
    Other { message: String },
}

impl RawError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            code: None,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Attach a backend error code. Only meaningful for `Status`.
    pub fn with_code(mut self, new_code: impl Into<String>) -> Self {
        if let Self::Status { code, .. } = &mut self {
            *code = Some(new_code.into());
        }
        self
    }

    /// Whether this failure came out of network activity. Local outcomes
    /// (validation, missing session, throttling) are never reported as offline.
    fn touches_network(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Status { .. } | Self::Timeout { .. } | Self::Other { .. }
        )
    }

    fn internal_message(&self) -> String {
        match self {
            Self::Transport { message } => format!("transport failure: {message}"),
            Self::Status {
                status, message, ..
            } => format!("remote status {status}: {message}"),
            Self::Validation { message } => format!("validation failed: {message}"),
            Self::Timeout { after_ms } => format!("deadline elapsed after {after_ms} ms"),
            Self::Unauthenticated => "no active session".to_owned(),
            Self::Throttled { retry_after_ms } => {
                format!("write throttled; retry in {retry_after_ms} ms")
            }
            Self::Other { message } => message.clone(),
        }
    }
}

/// Result of running the classification rules over a [`RawError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub user_message: String,
}

impl Classification {
    fn new(kind: ErrorKind, severity: Severity, user_message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            user_message: user_message.into(),
        }
    }
}

pub const OFFLINE_MESSAGE: &str = "You appear to be offline. Check your connection and try again.";
pub const NETWORK_MESSAGE: &str =
    "Unable to reach the server. Check your connection and try again.";
pub const TIMEOUT_MESSAGE: &str = "The request timed out. Please try again.";
pub const THROTTLED_MESSAGE: &str = "Too many requests. Please wait a moment and try again.";
pub const UNAUTHENTICATED_MESSAGE: &str = "Please sign in to continue.";
pub const UNKNOWN_MESSAGE: &str = "Something went wrong. Please try again.";

/// Map HTTP status codes to an error kind and severity.
pub fn classify_http_status(status: u16) -> (ErrorKind, Severity) {
    match status {
        400 => (ErrorKind::Validation, Severity::Medium),
        401 => (ErrorKind::Auth, Severity::High),
        403 => (ErrorKind::Permission, Severity::High),
        404 => (ErrorKind::RemoteApi, Severity::Medium),
        408 => (ErrorKind::Timeout, Severity::Medium),
        409 => (ErrorKind::Validation, Severity::Medium),
        429 => (ErrorKind::RateLimit, Severity::Medium),
        400..=499 => (ErrorKind::RemoteApi, Severity::Medium),
        500..=599 => (ErrorKind::RemoteApi, Severity::High),
        _ => (ErrorKind::Unknown, Severity::Medium),
    }
}

fn status_user_message(status: u16) -> &'static str {
    match status {
        400 => "The request was invalid. Please check your input.",
        401 => "Your session has expired. Please sign in again.",
        403 => "You don't have permission to do that.",
        404 => "The requested record was not found.",
        408 => TIMEOUT_MESSAGE,
        409 => "Conflicting or duplicate data. Please review and try again.",
        429 => THROTTLED_MESSAGE,
        400..=499 => "The server rejected the request.",
        500..=599 => "The server is having trouble. Please try again shortly.",
        _ => UNKNOWN_MESSAGE,
    }
}

/// Apply the classification rules in order; the first match wins.
pub fn classify_raw(raw: &RawError, online: bool) -> Classification {
    if !online && raw.touches_network() {
        return Classification::new(ErrorKind::Offline, Severity::High, OFFLINE_MESSAGE);
    }

    match raw {
        RawError::Transport { .. } => {
            Classification::new(ErrorKind::Network, Severity::High, NETWORK_MESSAGE)
        }
        RawError::Status { status, .. } => {
            let (kind, severity) = classify_http_status(*status);
            Classification::new(kind, severity, status_user_message(*status))
        }
        RawError::Validation { message } => {
            Classification::new(ErrorKind::Validation, Severity::Medium, message.clone())
        }
        RawError::Timeout { .. } => {
            Classification::new(ErrorKind::Timeout, Severity::Medium, TIMEOUT_MESSAGE)
        }
        RawError::Unauthenticated => {
            Classification::new(ErrorKind::Auth, Severity::High, UNAUTHENTICATED_MESSAGE)
        }
        RawError::Throttled { .. } => {
            Classification::new(ErrorKind::RateLimit, Severity::Low, THROTTLED_MESSAGE)
        }
        RawError::Other { .. } => {
            Classification::new(ErrorKind::Unknown, Severity::Medium, UNKNOWN_MESSAGE)
        }
    }
}

const CANCELLED_CODE: &str = "cancelled";

/// Normalized failure record produced uniformly for every failure origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}:{context}: {internal_message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Diagnostic text; never shown to users.
    pub internal_message: String,
    /// Short actionable text safe to show to users.
    pub user_message: String,
    /// Backend-specific error code, when the remote supplied one.
    pub origin_code: Option<String>,
    /// Remote status code, when the failure came from a status response.
    pub status: Option<u16>,
    /// Retry hint from the remote or a local throttle.
    pub retry_after_ms: Option<u64>,
    /// Identifies the calling operation, e.g. `clients.add`.
    pub context: String,
    pub timestamp_ms: u64,
    pub user_id: Option<String>,
}

impl ClassifiedError {
    /// Build a classified error from a raw failure and its classification.
    pub fn from_raw(
        raw: &RawError,
        classification: Classification,
        context: impl Into<String>,
        timestamp_ms: u64,
        user_id: Option<&str>,
    ) -> Self {
        let (origin_code, status, retry_after_ms) = match raw {
            RawError::Status {
                status,
                code,
                retry_after_ms,
                ..
            } => (code.clone(), Some(*status), *retry_after_ms),
            RawError::Throttled { retry_after_ms } => (None, None, Some(*retry_after_ms)),
            _ => (None, None, None),
        };

        Self {
            kind: classification.kind,
            severity: classification.severity,
            internal_message: raw.internal_message(),
            user_message: classification.user_message,
            origin_code,
            status,
            retry_after_ms,
            context: context.into(),
            timestamp_ms,
            user_id: user_id.map(str::to_owned),
        }
    }

    /// Error returned when the governing operation was abandoned.
    pub fn cancelled(context: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            severity: Severity::Low,
            internal_message: "operation abandoned by caller".to_owned(),
            user_message: "The operation was cancelled.".to_owned(),
            origin_code: Some(CANCELLED_CODE.to_owned()),
            status: None,
            retry_after_ms: None,
            context: context.into(),
            timestamp_ms,
            user_id: None,
        }
    }

    /// Derive a copy with a different kind, severity and user message.
    pub fn refined(
        &self,
        kind: ErrorKind,
        severity: Severity,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            user_message: user_message.into(),
            ..self.clone()
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Network | ErrorKind::Timeout => true,
            ErrorKind::RateLimit => self.status == Some(429),
            ErrorKind::RemoteApi => self.status.is_some_and(|status| status >= 500),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.origin_code.as_deref() == Some(CANCELLED_CODE)
    }

    /// The remote refused a write because it conflicts with current state.
    pub fn is_conflict_status(&self) -> bool {
        self.status == Some(409)
    }
}
