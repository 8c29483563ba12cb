//! Switches entity storage between the remote service and the local durable
//! store based on consecutive write failures or explicit user choice.

use parking_lot::Mutex;
use resilience_core::{
    ClassifiedError, ConnectionMonitor, ErrorKind, ModeChangeReason, Notice, Notifier,
    ProbeOutcome, ResilienceEvent, StorageMode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const SWITCHED_TO_LOCAL_MESSAGE: &str =
    "Connection problems persist. Switched to local storage on this device.";
pub const USING_LOCAL_MESSAGE: &str = "Using local storage on this device.";
pub const RECONNECTED_MESSAGE: &str = "Reconnected to the server.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Consecutive failures before local fallback is offered.
    pub offer_after: u32,
    /// Consecutive failures before switching automatically.
    pub switch_after: u32,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            offer_after: 2,
            switch_after: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FallbackSnapshot {
    pub mode: StorageMode,
    pub consecutive_failures: u32,
    pub fallback_offered: bool,
}

/// Whether a failure says something about backend reachability. Rejections
/// the remote answered deliberately (validation, conflict, permission) do not.
pub fn degrades_connection(error: &ClassifiedError) -> bool {
    !error.is_cancelled() && (error.kind == ErrorKind::Offline || error.is_retryable())
}

#[derive(Debug)]
pub struct FallbackCoordinator {
    policy: FallbackPolicy,
    monitor: ConnectionMonitor,
    notifier: Notifier,
    state: Mutex<FallbackSnapshot>,
}

impl FallbackCoordinator {
    pub fn new(policy: FallbackPolicy, monitor: ConnectionMonitor, notifier: Notifier) -> Self {
        Self {
            policy,
            monitor,
            notifier,
            state: Mutex::new(FallbackSnapshot::default()),
        }
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    pub fn mode(&self) -> StorageMode {
        self.state.lock().mode
    }

    pub fn snapshot(&self) -> FallbackSnapshot {
        *self.state.lock()
    }

    /// A remote mutating operation succeeded.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.mode == StorageMode::Remote {
            state.consecutive_failures = 0;
            state.fallback_offered = false;
        }
    }

    /// A remote mutating operation failed. Only connectivity failures count.
    pub fn record_failure(&self, error: &ClassifiedError) {
        if !degrades_connection(error) {
            return;
        }
        self.register_failure(false);
    }

    /// Probe the remote once, bypassing health backoff. Success returns to
    /// remote mode; failure counts toward the thresholds and re-offers fallback.
    pub async fn retry_remote(&self) -> ProbeOutcome {
        self.monitor.reset();
        let outcome = self.monitor.test_connection().await;

        match &outcome {
            ProbeOutcome::Connected => {
                let previous = {
                    let mut state = self.state.lock();
                    let previous = state.mode;
                    *state = FallbackSnapshot::default();
                    previous
                };
                info!(?previous, "remote storage reachable again");
                if previous != StorageMode::Remote {
                    self.notifier.emit(ResilienceEvent::StorageModeChanged {
                        mode: StorageMode::Remote,
                        reason: ModeChangeReason::RemoteRecovered,
                    });
                }
                self.notifier.notice(Notice::success(RECONNECTED_MESSAGE));
            }
            ProbeOutcome::Failed(error) => {
                warn!(kind = %error.kind, "manual remote retry failed");
                self.register_failure(true);
            }
            ProbeOutcome::Suppressed { .. } => {}
        }
        outcome
    }

    /// Switch to local storage immediately, without any network call.
    pub fn switch_to_local(&self) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.mode != StorageMode::LocalDurable;
            state.mode = StorageMode::LocalDurable;
            state.fallback_offered = false;
            changed
        };
        if changed {
            info!("switched to local storage by user choice");
            self.notifier.emit(ResilienceEvent::StorageModeChanged {
                mode: StorageMode::LocalDurable,
                reason: ModeChangeReason::UserChoice,
            });
            self.notifier.notice(Notice::info(USING_LOCAL_MESSAGE));
        }
    }

    fn register_failure(&self, reoffer: bool) {
        let (failures, offer, switch) = {
            let mut state = self.state.lock();
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let failures = state.consecutive_failures;

            let switch = state.mode == StorageMode::Remote && failures >= self.policy.switch_after;
            let offer = !switch
                && state.mode == StorageMode::Remote
                && failures >= self.policy.offer_after
                && (reoffer || !state.fallback_offered);

            if switch {
                state.mode = StorageMode::LocalDurable;
                state.fallback_offered = false;
            } else if offer {
                state.fallback_offered = true;
            }
            (failures, offer, switch)
        };

        if switch {
            warn!(failures, "switching to local storage after repeated failures");
            self.notifier.emit(ResilienceEvent::StorageModeChanged {
                mode: StorageMode::LocalDurable,
                reason: ModeChangeReason::FailureThreshold,
            });
            self.notifier.notice(Notice::warning(SWITCHED_TO_LOCAL_MESSAGE));
        } else if offer {
            info!(failures, "offering local storage fallback");
            self.notifier.emit(ResilienceEvent::FallbackOffered {
                consecutive_failures: failures,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use async_trait::async_trait;
    use resilience_core::{
        ErrorClassifier, EventStream, HealthPolicy, HealthProbe, ManualClock, NetworkStatus,
        RawError, classify_raw,
    };

    use super::*;

    struct ToggleProbe {
        up: AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for ToggleProbe {
        async fn probe(&self) -> Result<(), RawError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(RawError::transport("connection refused"))
            }
        }
    }

    fn coordinator(up: bool) -> (FallbackCoordinator, Arc<ToggleProbe>, EventStream) {
        let clock = Arc::new(ManualClock::new(0));
        let notifier = Notifier::new(32);
        let classifier = Arc::new(ErrorClassifier::new(
            NetworkStatus::new(true),
            clock.clone(),
            notifier.clone(),
            8,
        ));
        let probe = Arc::new(ToggleProbe {
            up: AtomicBool::new(up),
        });
        let monitor = ConnectionMonitor::new(HealthPolicy::default(), probe.clone(), classifier, clock);
        let events = notifier.subscribe();
        (
            FallbackCoordinator::new(FallbackPolicy::default(), monitor, notifier),
            probe,
            events,
        )
    }

    fn network_failure() -> ClassifiedError {
        let raw = RawError::transport("reset");
        ClassifiedError::from_raw(&raw, classify_raw(&raw, true), "clients.add", 0, None)
    }

    fn drain(events: &mut EventStream) -> Vec<ResilienceEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    #[test]
    fn offers_after_two_and_switches_after_three() {
        let (coordinator, _, mut events) = coordinator(false);

        coordinator.record_failure(&network_failure());
        assert!(drain(&mut events).is_empty());

        coordinator.record_failure(&network_failure());
        assert_eq!(
            drain(&mut events),
            vec![ResilienceEvent::FallbackOffered {
                consecutive_failures: 2
            }]
        );
        assert!(coordinator.snapshot().fallback_offered);

        coordinator.record_failure(&network_failure());
        let emitted = drain(&mut events);
        assert_eq!(
            emitted[0],
            ResilienceEvent::StorageModeChanged {
                mode: StorageMode::LocalDurable,
                reason: ModeChangeReason::FailureThreshold,
            }
        );
        assert_eq!(emitted.len(), 2);
        assert_eq!(coordinator.mode(), StorageMode::LocalDurable);

        coordinator.record_failure(&network_failure());
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn deliberate_rejections_do_not_count() {
        let (coordinator, _, _) = coordinator(false);
        let raw = RawError::status(409, "conflict");
        let conflict = ClassifiedError::from_raw(&raw, classify_raw(&raw, true), "x", 0, None);
        for _ in 0..5 {
            coordinator.record_failure(&conflict);
        }
        assert_eq!(coordinator.snapshot(), FallbackSnapshot::default());
        assert!(!degrades_connection(&ClassifiedError::cancelled("x", 0)));
    }

    #[test]
    fn success_clears_the_counter() {
        let (coordinator, _, _) = coordinator(false);
        coordinator.record_failure(&network_failure());
        coordinator.record_failure(&network_failure());
        coordinator.record_success();
        assert_eq!(coordinator.snapshot(), FallbackSnapshot::default());
    }

    #[test]
    fn switch_to_local_is_immediate_and_idempotent() {
        let (coordinator, _, mut events) = coordinator(true);
        coordinator.switch_to_local();
        coordinator.switch_to_local();
        let emitted = drain(&mut events);
        assert_eq!(
            emitted[0],
            ResilienceEvent::StorageModeChanged {
                mode: StorageMode::LocalDurable,
                reason: ModeChangeReason::UserChoice,
            }
        );
        assert_eq!(emitted.len(), 2);
        assert_eq!(coordinator.mode(), StorageMode::LocalDurable);
    }

    #[tokio::test]
    async fn retry_remote_recovers_from_local_mode() {
        let (coordinator, _, mut events) = coordinator(true);
        coordinator.switch_to_local();
        drain(&mut events);

        assert_eq!(coordinator.retry_remote().await, ProbeOutcome::Connected);
        assert_eq!(coordinator.snapshot(), FallbackSnapshot::default());
        let emitted = drain(&mut events);
        assert_eq!(
            emitted[0],
            ResilienceEvent::StorageModeChanged {
                mode: StorageMode::Remote,
                reason: ModeChangeReason::RemoteRecovered,
            }
        );
    }

    #[tokio::test]
    async fn failed_retry_counts_and_reoffers() {
        let (coordinator, _, mut events) = coordinator(false);
        coordinator.record_failure(&network_failure());
        coordinator.record_failure(&network_failure());
        drain(&mut events);

        let outcome = coordinator.retry_remote().await;
        assert!(matches!(outcome, ProbeOutcome::Failed(_)));
        // Third failure crosses the switch threshold.
        assert_eq!(coordinator.mode(), StorageMode::LocalDurable);

        let (coordinator, _, mut events) = self::coordinator(false);
        coordinator.record_failure(&network_failure());
        drain(&mut events);
        coordinator.retry_remote().await;
        coordinator.retry_remote().await;
        let offers = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, ResilienceEvent::FallbackOffered { .. }))
            .count();
        assert_eq!(offers, 1);
        assert_eq!(coordinator.mode(), StorageMode::LocalDurable);
    }
}
