use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    channel::Notifier,
    clock::Clock,
    diagnostics::DiagnosticLog,
    error::{ClassifiedError, RawError, Severity, classify_raw},
    session::NetworkStatus,
    types::Notice,
};

pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 50;

/// External destination for high-severity errors (crash reporter, log shipper).
pub trait ErrorSink: Send + Sync {
    fn forward(&self, error: &ClassifiedError);
}

/// Turns raw failures into [`ClassifiedError`]s, keeps a diagnostic ring and
/// notifies the UI.
pub struct ErrorClassifier {
    network: NetworkStatus,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    diagnostics: Mutex<DiagnosticLog>,
    sink: RwLock<Option<Arc<dyn ErrorSink>>>,
}

impl ErrorClassifier {
    pub fn new(
        network: NetworkStatus,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        diagnostics_capacity: usize,
    ) -> Self {
        Self {
            network,
            clock,
            notifier,
            diagnostics: Mutex::new(DiagnosticLog::new(diagnostics_capacity)),
            sink: RwLock::new(None),
        }
    }

    pub fn set_sink(&self, sink: Arc<dyn ErrorSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Classify, record, and notify the user.
    pub fn classify(&self, raw: &RawError, context: &str, user_id: Option<&str>) -> ClassifiedError {
        let classified = self.classify_silent(raw, context, user_id);
        self.report(&classified);
        classified
    }

    /// Classify and record without a user notification.
    pub fn classify_silent(
        &self,
        raw: &RawError,
        context: &str,
        user_id: Option<&str>,
    ) -> ClassifiedError {
        self.record(raw, self.network.is_online(), context, user_id)
    }

    /// Like [`classify_silent`](Self::classify_silent) for failures of an
    /// on-device store: connectivity plays no part, so the offline override
    /// is skipped.
    pub fn classify_on_device(
        &self,
        raw: &RawError,
        context: &str,
        user_id: Option<&str>,
    ) -> ClassifiedError {
        self.record(raw, true, context, user_id)
    }

    /// Notify the user about an already-classified error and forward it to
    /// the sink when severe enough.
    pub fn report(&self, error: &ClassifiedError) {
        self.notifier.notice(Notice::from_error(error));

        if error.severity >= Severity::High {
            let sink = self.sink.read().clone();
            if let Some(sink) = sink {
                sink.forward(error);
            }
        }
    }

    /// Recent classified errors, oldest first.
    pub fn recent(&self) -> Vec<ClassifiedError> {
        self.diagnostics.lock().snapshot()
    }

    pub fn clear_diagnostics(&self) {
        self.diagnostics.lock().clear();
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn record(
        &self,
        raw: &RawError,
        online: bool,
        context: &str,
        user_id: Option<&str>,
    ) -> ClassifiedError {
        let classified = ClassifiedError::from_raw(
            raw,
            classify_raw(raw, online),
            context,
            self.clock.now_ms(),
            user_id,
        );

        log_classified(&classified);
        self.diagnostics.lock().push(classified.clone());
        classified
    }
}

impl std::fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("online", &self.network.is_online())
            .field("diagnostics", &self.diagnostics.lock().len())
            .finish()
    }
}

fn log_classified(error: &ClassifiedError) {
    let context = error.context.as_str();
    let kind = error.kind;
    let message = error.internal_message.as_str();
    match error.severity {
        Severity::Low => debug!(%context, %kind, %message, "classified error"),
        Severity::Medium => info!(%context, %kind, %message, "classified error"),
        Severity::High => warn!(%context, %kind, %message, "classified error"),
        Severity::Critical => error!(%context, %kind, %message, "classified error"),
    }
}
