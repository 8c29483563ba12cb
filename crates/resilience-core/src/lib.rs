//! Client-side data resilience primitives.
//!
//! This crate defines the error taxonomy and classifier, the retry executor,
//! the write debouncer, the connection health monitor, and the notification
//! and collaborator abstractions shared by entity store adapters.

/// Opaque owner-scoped CRUD contract.
pub mod backend;
/// Broadcast notification channel.
pub mod channel;
/// Error classifier with diagnostic ring and sink forwarding.
pub mod classifier;
/// Wall-clock abstraction.
pub mod clock;
/// Per-channel write rate limiting.
pub mod debounce;
/// Bounded ring of recent classified errors.
pub mod diagnostics;
/// Error taxonomy and classification rules.
pub mod error;
/// Connection health state machine.
pub mod health;
/// Synchronous observer registration.
pub mod observer;
/// Bounded retry with exponential backoff.
pub mod retry;
/// Session and connectivity collaborators.
pub mod session;
/// Event and snapshot types consumed by the UI.
pub mod types;

pub use backend::{EntityBackend, PRECONDITION_FAILED_CODE, RemoteError, StoredRecord};
pub use channel::{EventStream, Notifier};
pub use classifier::{DEFAULT_DIAGNOSTICS_CAPACITY, ErrorClassifier, ErrorSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use debounce::{DEFAULT_DEBOUNCE_WINDOW_MS, WriteDebouncer};
pub use diagnostics::DiagnosticLog;
pub use error::{
    Classification, ClassifiedError, ErrorKind, RawError, Severity, classify_http_status,
    classify_raw,
};
pub use health::{ConnectionMonitor, HealthPolicy, HealthProbe, ProbeOutcome};
pub use observer::{ObserverId, ObserverList};
pub use retry::{RetryExecutor, RetryPolicy, RetryScope};
pub use session::{NetworkStatus, SessionProvider, StaticSession};
pub use types::{
    ConnectionHealth, ConnectionState, ModeChangeReason, Notice, NoticeTone, ResilienceEvent,
    StorageMode,
};
pub use tokio_util::sync::CancellationToken;
