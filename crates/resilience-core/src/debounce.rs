use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::clock::Clock;

pub const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 5_000;

#[derive(Debug, Default, Clone, Copy)]
struct ChannelSlot {
    last_saved_ms: Option<u64>,
    pending_since_ms: Option<u64>,
}

/// Advisory per-channel write rate limiter.
///
/// A channel is a logical write operation such as `add:clients`. It does not
/// serialize writers: it only refuses repeated submissions on one channel
/// within the window.
#[derive(Debug)]
pub struct WriteDebouncer {
    window_ms: u64,
    clock: Arc<dyn Clock>,
    channels: Mutex<HashMap<String, ChannelSlot>>,
}

impl WriteDebouncer {
    pub fn new(window_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_ms,
            clock,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Whether a write may proceed on `channel`. A `true` result reserves the
    /// channel until [`mark_saved`](Self::mark_saved) or
    /// [`release`](Self::release), so a concurrent caller gets `false`.
    ///
    /// Channels idle for a full window are forgotten here.
    pub fn can_save(&self, channel: &str) -> bool {
        let now = self.clock.now_ms();
        let mut channels = self.channels.lock();
        channels.retain(|_, slot| self.is_active(slot, now));
        let slot = channels.entry(channel.to_owned()).or_default();

        if self.is_active(slot, now) {
            return false;
        }

        slot.pending_since_ms = Some(now);
        true
    }

    /// Record a successful write on `channel`.
    pub fn mark_saved(&self, channel: &str) {
        let now = self.clock.now_ms();
        let mut channels = self.channels.lock();
        let slot = channels.entry(channel.to_owned()).or_default();
        slot.last_saved_ms = Some(now);
        slot.pending_since_ms = None;
    }

    /// Drop a reservation after a failed write so the user may resubmit.
    pub fn release(&self, channel: &str) {
        let now = self.clock.now_ms();
        let mut channels = self.channels.lock();
        if let Some(slot) = channels.get_mut(channel) {
            slot.pending_since_ms = None;
            if !self.is_active(slot, now) {
                channels.remove(channel);
            }
        }
    }

    /// Channels currently holding a reservation or a recent save.
    pub fn tracked_channels(&self) -> usize {
        self.channels.lock().len()
    }

    /// Milliseconds until `channel` accepts another write (0 when open).
    pub fn remaining_ms(&self, channel: &str) -> u64 {
        let now = self.clock.now_ms();
        let channels = self.channels.lock();
        let Some(slot) = channels.get(channel) else {
            return 0;
        };

        [slot.last_saved_ms, slot.pending_since_ms]
            .into_iter()
            .flatten()
            .map(|at| (at + self.window_ms).saturating_sub(now))
            .max()
            .unwrap_or(0)
    }

    fn is_active(&self, slot: &ChannelSlot, now: u64) -> bool {
        self.within_window(slot.last_saved_ms, now) || self.within_window(slot.pending_since_ms, now)
    }

    fn within_window(&self, at: Option<u64>, now: u64) -> bool {
        at.is_some_and(|at| now.saturating_sub(at) < self.window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn debouncer() -> (WriteDebouncer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(100_000));
        (
            WriteDebouncer::new(DEFAULT_DEBOUNCE_WINDOW_MS, clock.clone()),
            clock,
        )
    }

    #[test]
    fn concurrent_callers_on_one_channel_second_is_refused() {
        let (debouncer, _) = debouncer();
        assert!(debouncer.can_save("addClient"));
        assert!(!debouncer.can_save("addClient"));
    }

    #[test]
    fn window_applies_from_last_successful_mark() {
        let (debouncer, clock) = debouncer();
        assert!(debouncer.can_save("addClient"));
        debouncer.mark_saved("addClient");

        clock.advance(4_999);
        assert!(!debouncer.can_save("addClient"));
        assert_eq!(debouncer.remaining_ms("addClient"), 1);

        clock.advance(1);
        assert!(debouncer.can_save("addClient"));
    }

    #[test]
    fn channels_are_independent() {
        let (debouncer, _) = debouncer();
        assert!(debouncer.can_save("addClient"));
        debouncer.mark_saved("addClient");
        assert!(debouncer.can_save("addInvoice"));
    }

    #[test]
    fn release_reopens_channel_after_failed_write() {
        let (debouncer, _) = debouncer();
        assert!(debouncer.can_save("updateClient:c1"));
        debouncer.release("updateClient:c1");
        assert!(debouncer.can_save("updateClient:c1"));
    }

    #[test]
    fn stale_reservation_expires_after_window() {
        let (debouncer, clock) = debouncer();
        assert!(debouncer.can_save("deleteClient:c1"));
        clock.advance(DEFAULT_DEBOUNCE_WINDOW_MS);
        assert!(debouncer.can_save("deleteClient:c1"));
    }

    #[test]
    fn idle_per_record_channels_are_forgotten() {
        let (debouncer, clock) = debouncer();
        for id in ["c1", "c2", "c3"] {
            let channel = format!("update:clients:{id}");
            assert!(debouncer.can_save(&channel));
            debouncer.mark_saved(&channel);
        }
        assert!(debouncer.can_save("delete:clients:c4"));
        debouncer.release("delete:clients:c4");
        assert_eq!(debouncer.tracked_channels(), 3);

        clock.advance(DEFAULT_DEBOUNCE_WINDOW_MS);
        assert!(debouncer.can_save("add:clients"));
        assert_eq!(debouncer.tracked_channels(), 1);
        assert_eq!(debouncer.remaining_ms("update:clients:c1"), 0);
    }

    #[test]
    fn unknown_channel_has_no_wait() {
        let (debouncer, _) = debouncer();
        assert_eq!(debouncer.remaining_ms("never-used"), 0);
        debouncer.release("never-used");
    }
}
