//! Connection health state machine.
//!
//! ```text
//! Disconnected/Error/Connected --test_connection--> Connecting
//! Connecting --probe ok--> Connected   (failures = 0, last_success recorded)
//! Connecting --probe err--> Error      (failures += 1)
//! any --reset--> Disconnected          (failures = 0)
//! ```
//!
//! Once `consecutive_failures >= max_retries`, probes are suppressed until
//! `min(base_backoff * 2^(failures - max_retries), max_backoff)` has elapsed
//! since the last attempt. Concurrent probe requests share one in-flight probe.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    classifier::ErrorClassifier,
    clock::Clock,
    error::{ClassifiedError, RawError},
    observer::{ObserverId, ObserverList},
    types::{ConnectionHealth, ConnectionState},
};

const PROBE_CONTEXT: &str = "connection.probe";

/// Reachability check run by the monitor.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), RawError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub probe_timeout_ms: u64,
}

impl HealthPolicy {
    /// Backoff window after `failures` consecutive failures.
    pub fn backoff_window_ms(&self, failures: u32) -> u64 {
        if failures < self.max_retries {
            return 0;
        }
        let shift = (failures - self.max_retries).min(20);
        self.base_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms)
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            probe_timeout_ms: 8_000,
        }
    }
}

/// Result of [`ConnectionMonitor::test_connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Connected,
    Failed(ClassifiedError),
    /// Backoff is in effect; no probe was issued.
    Suppressed { retry_at_ms: u64 },
}

#[derive(Debug, Default)]
struct MonitorState {
    state: ConnectionState,
    consecutive_failures: u32,
    last_success_at_ms: Option<u64>,
    last_attempt_at_ms: Option<u64>,
    waiters: Option<Vec<oneshot::Sender<ProbeOutcome>>>,
}

impl MonitorState {
    fn snapshot(&self, policy: &HealthPolicy) -> ConnectionHealth {
        ConnectionHealth {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_success_at_ms: self.last_success_at_ms,
            last_attempt_at_ms: self.last_attempt_at_ms,
            backoff_window_ms: policy.backoff_window_ms(self.consecutive_failures),
        }
    }

    fn next_retry_at(&self, policy: &HealthPolicy, now: u64) -> Option<u64> {
        if self.consecutive_failures < policy.max_retries {
            return None;
        }
        let last = self.last_attempt_at_ms?;
        let resume_at = last.saturating_add(policy.backoff_window_ms(self.consecutive_failures));
        (now < resume_at).then_some(resume_at)
    }

    fn record_success(&mut self, now: u64) {
        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
        self.last_success_at_ms = Some(now);
    }

    fn record_failure(&mut self, now: u64) {
        self.state = ConnectionState::Error;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_attempt_at_ms = Some(now);
    }
}

struct MonitorInner {
    policy: HealthPolicy,
    probe: Arc<dyn HealthProbe>,
    classifier: Arc<ErrorClassifier>,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
    observers: ObserverList<ConnectionHealth>,
}

/// Tracks backend reachability. Cloning shares the same state.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectionMonitor {
    pub fn new(
        policy: HealthPolicy,
        probe: Arc<dyn HealthProbe>,
        classifier: Arc<ErrorClassifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                policy,
                probe,
                classifier,
                clock,
                state: Mutex::new(MonitorState::default()),
                observers: ObserverList::new(),
            }),
        }
    }

    pub fn policy(&self) -> HealthPolicy {
        self.inner.policy
    }

    pub fn snapshot(&self) -> ConnectionHealth {
        self.inner.state.lock().snapshot(&self.inner.policy)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state
    }

    /// Whether a probe may be issued now.
    pub fn should_attempt_connection(&self) -> bool {
        let now = self.inner.clock.now_ms();
        self.inner
            .state
            .lock()
            .next_retry_at(&self.inner.policy, now)
            .is_none()
    }

    /// Instant at which probes resume, while backoff is in effect.
    pub fn next_retry_time(&self) -> Option<u64> {
        let now = self.inner.clock.now_ms();
        self.inner.state.lock().next_retry_at(&self.inner.policy, now)
    }

    /// Probe the backend. Concurrent callers share the in-flight probe and all
    /// receive its outcome. The probe runs on its own task and completes even
    /// if every caller goes away.
    pub async fn test_connection(&self) -> ProbeOutcome {
        let now = self.inner.clock.now_ms();
        let (rx, started) = {
            let mut state = self.inner.state.lock();
            let (tx, rx) = oneshot::channel();

            if let Some(waiters) = state.waiters.as_mut() {
                waiters.push(tx);
                (rx, None)
            } else {
                if let Some(retry_at_ms) = state.next_retry_at(&self.inner.policy, now) {
                    debug!(retry_at_ms, "probe suppressed by backoff");
                    return ProbeOutcome::Suppressed { retry_at_ms };
                }
                state.waiters = Some(vec![tx]);
                state.state = ConnectionState::Connecting;
                state.last_attempt_at_ms = Some(now);
                (rx, Some(state.snapshot(&self.inner.policy)))
            }
        };

        if let Some(snapshot) = started {
            self.inner.observers.notify(&snapshot);
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let result = run_probe(&inner).await;
                inner.finish_probe(result);
            });
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Failed(self.inner.classifier.classify_silent(
                &RawError::other("probe task ended without a result"),
                PROBE_CONTEXT,
                None,
            )),
        }
    }

    /// Record a successful remote write.
    pub fn record_success(&self) {
        let now = self.inner.clock.now_ms();
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.record_success(now);
            state.snapshot(&self.inner.policy)
        };
        self.inner.observers.notify(&snapshot);
    }

    /// Record a failed remote operation.
    pub fn record_failure(&self, error: &ClassifiedError) {
        let now = self.inner.clock.now_ms();
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.record_failure(now);
            state.snapshot(&self.inner.policy)
        };
        debug!(
            context = %error.context,
            failures = snapshot.consecutive_failures,
            "remote failure recorded"
        );
        self.inner.observers.notify(&snapshot);
    }

    /// Force `Disconnected` and clear the failure counter (manual retry).
    pub fn reset(&self) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.state = ConnectionState::Disconnected;
            state.consecutive_failures = 0;
            state.last_attempt_at_ms = None;
            state.snapshot(&self.inner.policy)
        };
        info!("connection monitor reset");
        self.inner.observers.notify(&snapshot);
    }

    pub fn subscribe(
        &self,
        observer: impl Fn(&ConnectionHealth) + Send + Sync + 'static,
    ) -> ObserverId {
        self.inner.observers.subscribe(observer)
    }

    /// Remove an observer; repeated or unknown ids are ignored.
    pub fn unsubscribe(&self, id: ObserverId) {
        self.inner.observers.unsubscribe(id);
    }
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("health", &self.snapshot())
            .finish()
    }
}

async fn run_probe(inner: &MonitorInner) -> Result<(), ClassifiedError> {
    let timeout = Duration::from_millis(inner.policy.probe_timeout_ms);
    let outcome = match tokio::time::timeout(timeout, inner.probe.probe()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RawError::Timeout {
            after_ms: inner.policy.probe_timeout_ms,
        }),
    };
    outcome.map_err(|raw| inner.classifier.classify_silent(&raw, PROBE_CONTEXT, None))
}

impl MonitorInner {
    fn finish_probe(&self, result: Result<(), ClassifiedError>) {
        let now = self.clock.now_ms();
        let (snapshot, waiters) = {
            let mut state = self.state.lock();
            match &result {
                Ok(()) => state.record_success(now),
                Err(_) => state.record_failure(now),
            }
            (state.snapshot(&self.policy), state.waiters.take().unwrap_or_default())
        };

        let outcome = match result {
            Ok(()) => {
                info!("connection probe succeeded");
                ProbeOutcome::Connected
            }
            Err(error) => {
                warn!(
                    failures = snapshot.consecutive_failures,
                    kind = %error.kind,
                    "connection probe failed"
                );
                ProbeOutcome::Failed(error)
            }
        };

        self.observers.notify(&snapshot);
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{
        channel::Notifier, clock::ManualClock, error::ErrorKind, session::NetworkStatus,
    };

    struct ScriptedProbe {
        calls: AtomicU32,
        fail: std::sync::atomic::AtomicBool,
        latency: Duration,
    }

    impl ScriptedProbe {
        fn new(fail: bool, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: std::sync::atomic::AtomicBool::new(fail),
                latency,
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> Result<(), RawError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if self.fail.load(Ordering::SeqCst) {
                Err(RawError::transport("connection refused"))
            } else {
                Ok(())
            }
        }
    }

    fn monitor(probe: Arc<ScriptedProbe>) -> (ConnectionMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let classifier = Arc::new(ErrorClassifier::new(
            NetworkStatus::new(true),
            clock.clone(),
            Notifier::new(8),
            16,
        ));
        (
            ConnectionMonitor::new(HealthPolicy::default(), probe, classifier, clock.clone()),
            clock,
        )
    }

    fn failure() -> ClassifiedError {
        let raw = RawError::transport("reset");
        ClassifiedError::from_raw(&raw, crate::error::classify_raw(&raw, true), "clients.add", 0, None)
    }

    #[test]
    fn backoff_window_follows_formula() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.backoff_window_ms(2), 0);
        assert_eq!(policy.backoff_window_ms(3), 1_000);
        assert_eq!(policy.backoff_window_ms(4), 2_000);
        assert_eq!(policy.backoff_window_ms(5), 4_000);
        assert_eq!(policy.backoff_window_ms(7), 16_000);
        assert_eq!(policy.backoff_window_ms(8), 30_000);
        assert_eq!(policy.backoff_window_ms(10), 30_000);
        assert_eq!(policy.backoff_window_ms(u32::MAX), 30_000);
    }

    #[tokio::test]
    async fn successful_probe_connects_and_resets_failures() {
        let probe = ScriptedProbe::new(false, Duration::ZERO);
        let (monitor, _) = monitor(probe.clone());
        monitor.record_failure(&failure());
        assert_eq!(monitor.snapshot().consecutive_failures, 1);

        assert_eq!(monitor.test_connection().await, ProbeOutcome::Connected);
        let health = monitor.snapshot();
        assert_eq!(health.state, ConnectionState::Connected);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.last_success_at_ms, Some(1_000_000));
    }

    #[tokio::test]
    async fn failed_probe_moves_to_error() {
        let probe = ScriptedProbe::new(true, Duration::ZERO);
        let (monitor, _) = monitor(probe);

        match monitor.test_connection().await {
            ProbeOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::Network),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(monitor.state(), ConnectionState::Error);
        assert_eq!(monitor.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn consecutive_failures_gate_attempts_until_window_elapses() {
        let probe = ScriptedProbe::new(true, Duration::ZERO);
        let (monitor, clock) = monitor(probe);

        for n in 1..=5 {
            monitor.record_failure(&failure());
            assert_eq!(monitor.snapshot().consecutive_failures, n);
        }

        // 5 failures with max_retries 3: window = 1000 * 2^2.
        assert!(!monitor.should_attempt_connection());
        assert_eq!(monitor.next_retry_time(), Some(1_004_000));
        assert_eq!(monitor.snapshot().backoff_window_ms, 4_000);

        clock.advance(3_999);
        assert!(!monitor.should_attempt_connection());
        clock.advance(1);
        assert!(monitor.should_attempt_connection());
        assert_eq!(monitor.next_retry_time(), None);
    }

    #[tokio::test]
    async fn suppressed_probe_does_not_touch_backend() {
        let probe = ScriptedProbe::new(true, Duration::ZERO);
        let (monitor, _) = monitor(probe.clone());
        for _ in 0..3 {
            monitor.record_failure(&failure());
        }

        assert_eq!(
            monitor.test_connection().await,
            ProbeOutcome::Suppressed {
                retry_at_ms: 1_001_000
            }
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_probes_are_coalesced() {
        let probe = ScriptedProbe::new(false, Duration::from_millis(200));
        let (monitor, _) = monitor(probe.clone());

        let (a, b, c) = tokio::join!(
            monitor.test_connection(),
            monitor.test_connection(),
            monitor.test_connection()
        );

        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, ProbeOutcome::Connected);
        assert_eq!(b, ProbeOutcome::Connected);
        assert_eq!(c, ProbeOutcome::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out() {
        let probe = ScriptedProbe::new(false, Duration::from_secs(60));
        let (monitor, _) = monitor(probe);

        match monitor.test_connection().await {
            ProbeOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::Timeout),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(monitor.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_probe_still_records_result() {
        let probe = ScriptedProbe::new(false, Duration::from_millis(100));
        let (monitor, _) = monitor(probe);

        let pending = monitor.clone();
        let handle = tokio::spawn(async move { pending.test_connection().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(monitor.state(), ConnectionState::Connected);
    }

    #[test]
    fn reset_clears_failures_and_notifies_observers() {
        let probe = ScriptedProbe::new(true, Duration::ZERO);
        let (monitor, _) = monitor(probe);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = monitor.subscribe(move |health| sink.lock().push(health.state));

        for _ in 0..4 {
            monitor.record_failure(&failure());
        }
        monitor.reset();

        assert!(monitor.should_attempt_connection());
        assert_eq!(monitor.snapshot().consecutive_failures, 0);
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
        assert_eq!(seen.lock().last(), Some(&ConnectionState::Disconnected));

        monitor.unsubscribe(id);
        monitor.unsubscribe(id);
        monitor.record_success();
        assert_eq!(seen.lock().len(), 5);
    }

    #[tokio::test]
    async fn observers_see_connecting_then_connected() {
        let probe = ScriptedProbe::new(false, Duration::ZERO);
        let (monitor, _) = monitor(probe);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.subscribe(move |health| sink.lock().push(health.state));

        monitor.test_connection().await;
        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }
}
