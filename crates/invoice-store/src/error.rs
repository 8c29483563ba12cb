use local_store::LOCAL_STORAGE_CODE;
use resilience_core::{ClassifiedError, ErrorKind, Severity};
use thiserror::Error;

/// Shown when a conditional update finds the record changed since it was loaded.
pub const CONFLICT_MESSAGE: &str =
    "This record was changed elsewhere. Refresh and try again.";
pub const REQUIRED_FIELDS_MESSAGE: &str = "Please check required fields and try again.";
pub const PERMISSION_MESSAGE: &str =
    "You don't have permission to do that. Try logging out and back in.";
pub const LOCAL_STORAGE_MESSAGE: &str =
    "Could not save on this device. Check available storage and try again.";
/// The backend accepted the write but returned a record that could not be read.
pub const UNREADABLE_SAVED_MESSAGE: &str =
    "Your change was saved, but the response could not be read. Refresh to see it.";

const UNIQUE_VIOLATION_CODE: &str = "23505";
const NOT_NULL_VIOLATION_CODE: &str = "23502";
const CHECK_VIOLATION_CODE: &str = "23514";

/// Failure of an entity store operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Refused locally before any backend call (validation, session, throttle).
    #[error("rejected: {0}")]
    Rejected(ClassifiedError),
    /// Optimistic concurrency mismatch. Never retried.
    #[error("conflict: {0}")]
    Conflict(ClassifiedError),
    /// The backend call failed after retries.
    #[error("failed: {0}")]
    Failed(ClassifiedError),
}

impl StoreError {
    pub fn classified(&self) -> &ClassifiedError {
        match self {
            Self::Rejected(err) | Self::Conflict(err) | Self::Failed(err) => err,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.classified().kind
    }

    pub fn user_message(&self) -> &str {
        &self.classified().user_message
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOp {
    Create,
    Update,
    Other,
}

/// Apply store-specific messages on top of the generic classification.
pub(crate) fn refine_backend_error(
    error: ClassifiedError,
    op: WriteOp,
    duplicate_message: &str,
) -> StoreError {
    let code = error.origin_code.as_deref();

    if op == WriteOp::Update && error.is_conflict_status() {
        let message = if code == Some(UNIQUE_VIOLATION_CODE) {
            duplicate_message
        } else {
            CONFLICT_MESSAGE
        };
        return StoreError::Conflict(error.refined(ErrorKind::Validation, Severity::Medium, message));
    }

    let refined = match code {
        Some(UNIQUE_VIOLATION_CODE) => {
            error.refined(ErrorKind::Validation, Severity::Medium, duplicate_message)
        }
        Some(NOT_NULL_VIOLATION_CODE | CHECK_VIOLATION_CODE) => {
            error.refined(ErrorKind::Validation, Severity::Medium, REQUIRED_FIELDS_MESSAGE)
        }
        Some(LOCAL_STORAGE_CODE) => {
            error.refined(ErrorKind::Unknown, Severity::High, LOCAL_STORAGE_MESSAGE)
        }
        _ if error.kind == ErrorKind::Permission => {
            error.refined(ErrorKind::Permission, error.severity, PERMISSION_MESSAGE)
        }
        _ => error,
    };
    StoreError::Failed(refined)
}

#[cfg(test)]
mod tests {
    use resilience_core::{PRECONDITION_FAILED_CODE, RawError, classify_raw};

    use super::*;

    fn classified(raw: RawError) -> ClassifiedError {
        ClassifiedError::from_raw(&raw, classify_raw(&raw, true), "clients.test", 0, None)
    }

    #[test]
    fn precondition_failure_on_update_is_conflict() {
        let err = classified(RawError::status(409, "0 rows").with_code(PRECONDITION_FAILED_CODE));
        let refined = refine_backend_error(err, WriteOp::Update, "dup");
        assert!(refined.is_conflict());
        assert_eq!(refined.kind(), ErrorKind::Validation);
        assert_eq!(refined.user_message(), CONFLICT_MESSAGE);
    }

    #[test]
    fn duplicate_key_on_create_is_already_exists() {
        let err = classified(RawError::status(409, "duplicate key").with_code("23505"));
        let refined = refine_backend_error(err, WriteOp::Create, "A record with this email already exists.");
        assert!(matches!(refined, StoreError::Failed(_)));
        assert_eq!(refined.kind(), ErrorKind::Validation);
        assert_eq!(refined.user_message(), "A record with this email already exists.");
    }

    #[test]
    fn duplicate_key_on_update_is_conflict_with_duplicate_message() {
        let err = classified(RawError::status(409, "duplicate key").with_code("23505"));
        let refined = refine_backend_error(err, WriteOp::Update, "already exists");
        assert!(refined.is_conflict());
        assert_eq!(refined.user_message(), "already exists");
    }

    #[test]
    fn constraint_failures_ask_to_check_fields() {
        for code in ["23502", "23514"] {
            let err = classified(RawError::status(400, "violates constraint").with_code(code));
            let refined = refine_backend_error(err, WriteOp::Create, "dup");
            assert_eq!(refined.user_message(), REQUIRED_FIELDS_MESSAGE);
        }
    }

    #[test]
    fn permission_failures_suggest_signing_in_again() {
        let err = classified(RawError::status(403, "rls"));
        let refined = refine_backend_error(err, WriteOp::Other, "dup");
        assert_eq!(refined.kind(), ErrorKind::Permission);
        assert_eq!(refined.classified().severity, Severity::High);
        assert_eq!(refined.user_message(), PERMISSION_MESSAGE);
    }

    #[test]
    fn local_storage_failures_name_the_device() {
        let err = classified(
            RawError::status(500, "failed writing clients.json").with_code(LOCAL_STORAGE_CODE),
        );
        let refined = refine_backend_error(err, WriteOp::Create, "dup");
        assert!(matches!(refined, StoreError::Failed(_)));
        assert_eq!(refined.kind(), ErrorKind::Unknown);
        assert_eq!(refined.user_message(), LOCAL_STORAGE_MESSAGE);
    }

    #[test]
    fn other_failures_pass_through() {
        let err = classified(RawError::transport("reset"));
        let refined = refine_backend_error(err.clone(), WriteOp::Create, "dup");
        assert_eq!(refined, StoreError::Failed(err));
    }
}
