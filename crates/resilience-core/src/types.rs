use serde::{Deserialize, Serialize};

use crate::error::{ClassifiedError, ErrorKind, Severity};

/// Backend reachability state tracked by the connection monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No probe has run yet, or the monitor was reset.
    #[default]
    Disconnected,
    /// A probe is in flight.
    Connecting,
    /// The last probe or write succeeded.
    Connected,
    /// The last probe or write failed.
    Error,
}

/// Immutable snapshot of connection health.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub last_success_at_ms: Option<u64>,
    pub last_attempt_at_ms: Option<u64>,
    /// Minimum wait after the last attempt before another probe is allowed.
    pub backoff_window_ms: u64,
}

/// Which backend currently serves entity operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum StorageMode {
    #[default]
    Remote,
    LocalDurable,
}

/// Why the storage mode changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModeChangeReason {
    /// Consecutive remote failures crossed the switch threshold.
    FailureThreshold,
    /// The user picked a mode explicitly.
    UserChoice,
    /// A manual retry reached the remote again.
    RemoteRecovered,
}

/// Visual tone of a user notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NoticeTone {
    Success,
    Info,
    Warning,
    Error,
}

/// Payload rendered by the UI toast channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
    pub tone: NoticeTone,
    /// Set for error notices.
    pub kind: Option<ErrorKind>,
    pub severity: Option<Severity>,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tone: NoticeTone::Success,
            kind: None,
            severity: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tone: NoticeTone::Warning,
            kind: None,
            severity: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tone: NoticeTone::Info,
            kind: None,
            severity: None,
        }
    }

    /// Error notice carrying the user-facing message, kind and severity.
    pub fn from_error(error: &ClassifiedError) -> Self {
        Self {
            message: error.user_message.clone(),
            tone: NoticeTone::Error,
            kind: Some(error.kind),
            severity: Some(error.severity),
        }
    }
}

/// Events fanned out to UI subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResilienceEvent {
    /// Toast-style notification.
    Notice(Notice),
    /// Remote writes are failing; the UI may offer local fallback.
    FallbackOffered { consecutive_failures: u32 },
    /// The active storage backend changed.
    StorageModeChanged {
        mode: StorageMode,
        reason: ModeChangeReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClassifiedError, RawError, classify_raw};

    #[test]
    fn error_notice_carries_kind_and_severity() {
        let raw = RawError::status(403, "rls violation");
        let err = ClassifiedError::from_raw(&raw, classify_raw(&raw, true), "clients.add", 0, None);
        let notice = Notice::from_error(&err);
        assert_eq!(notice.tone, NoticeTone::Error);
        assert_eq!(notice.kind, Some(ErrorKind::Permission));
        assert_eq!(notice.severity, Some(Severity::High));
        assert_eq!(notice.message, err.user_message);
    }

    #[test]
    fn defaults_are_disconnected_and_remote() {
        assert_eq!(ConnectionHealth::default().state, ConnectionState::Disconnected);
        assert_eq!(StorageMode::default(), StorageMode::Remote);
    }
}
