//! Opaque CRUD contract shared by the remote service and the local durable store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::RawError;

/// Code attached to status 409 when a conditional update matched zero rows.
pub const PRECONDITION_FAILED_CODE: &str = "precondition_failed";

/// One row as returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub owner_id: String,
    pub created_at_ms: u64,
    /// Server-assigned modification time; doubles as the concurrency token.
    pub updated_at_ms: u64,
    /// Domain fields as a JSON object.
    pub fields: Value,
}

/// Failure reported by an [`EntityBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("status {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// Conditional update found a different `updated_at_ms` than expected.
    #[error("record '{id}' changed since {expected_updated_at_ms}")]
    PreconditionFailed {
        id: String,
        expected_updated_at_ms: u64,
    },
}

impl RemoteError {
    pub fn status(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            code: code.map(str::to_owned),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn not_found(id: &str) -> Self {
        Self::status(404, None, format!("record '{id}' not found"))
    }
}

impl From<RemoteError> for RawError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transport(message) => RawError::Transport { message },
            RemoteError::Status {
                status,
                code,
                message,
                retry_after_ms,
            } => RawError::Status {
                status,
                code,
                message,
                retry_after_ms,
            },
            precondition @ RemoteError::PreconditionFailed { .. } => RawError::Status {
                status: 409,
                code: Some(PRECONDITION_FAILED_CODE.to_owned()),
                message: precondition.to_string(),
                retry_after_ms: None,
            },
        }
    }
}

/// CRUD backend scoped by owner.
#[async_trait]
pub trait EntityBackend: Send + Sync {
    /// Short label used in logs.
    fn label(&self) -> &'static str;

    /// Insert a record and return it with server-assigned id and timestamps.
    async fn insert(
        &self,
        collection: &str,
        owner_id: &str,
        fields: Value,
    ) -> Result<StoredRecord, RemoteError>;

    /// Merge `patch` into the record only if its `updated_at_ms` still equals
    /// `expected_updated_at_ms`; otherwise fail with `PreconditionFailed`.
    async fn update_if_unmodified(
        &self,
        collection: &str,
        owner_id: &str,
        id: &str,
        expected_updated_at_ms: u64,
        patch: Value,
    ) -> Result<StoredRecord, RemoteError>;

    /// Delete a record owned by `owner_id`.
    async fn delete(&self, collection: &str, owner_id: &str, id: &str) -> Result<(), RemoteError>;

    /// All records owned by `owner_id`, newest created first.
    async fn list(&self, collection: &str, owner_id: &str)
    -> Result<Vec<StoredRecord>, RemoteError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_failure_becomes_409() {
        let raw: RawError = RemoteError::PreconditionFailed {
            id: "INV-1".into(),
            expected_updated_at_ms: 10,
        }
        .into();

        match raw {
            RawError::Status { status, code, .. } => {
                assert_eq!(status, 409);
                assert_eq!(code.as_deref(), Some(PRECONDITION_FAILED_CODE));
            }
            other => panic!("unexpected raw error: {other:?}"),
        }
    }

    #[test]
    fn transport_stays_transport() {
        let raw: RawError = RemoteError::Transport("reset by peer".into()).into();
        assert_eq!(raw, RawError::transport("reset by peer"));
    }
}
