//! Scripted remote backend shared by adapter tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use local_store::MemoryBackend;
use parking_lot::Mutex;
use resilience_core::{EntityBackend, ManualClock, RemoteError, StaticSession, StoredRecord};
use serde_json::Value;

use crate::{config::StoreConfig, context::ResilienceContext};

/// In-memory remote that counts calls and can fail the next N operations.
#[derive(Debug)]
pub(crate) struct ScriptedBackend {
    pub(crate) inner: MemoryBackend,
    calls: AtomicU32,
    pings: AtomicU32,
    failures: Mutex<VecDeque<RemoteError>>,
    latency: Mutex<Option<Duration>>,
    garble_next: AtomicBool,
}

impl ScriptedBackend {
    pub(crate) fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBackend::new("remote", clock).with_unique("clients", "email"),
            calls: AtomicU32::new(0),
            pings: AtomicU32::new(0),
            failures: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            garble_next: AtomicBool::new(false),
        })
    }

    /// CRUD calls received, pings excluded.
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next(&self, error: RemoteError, times: usize) {
        let mut failures = self.failures.lock();
        failures.extend(std::iter::repeat_n(error, times));
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Apply the next write but answer with fields no entity decodes from.
    pub(crate) fn garble_next_response(&self) {
        self.garble_next.store(true, Ordering::SeqCst);
    }

    fn respond(&self, mut record: StoredRecord) -> StoredRecord {
        if self.garble_next.swap(false, Ordering::SeqCst) {
            record.fields = serde_json::json!({ "unexpected": true });
        }
        record
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.failures.lock().pop_front();
        match next {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EntityBackend for ScriptedBackend {
    fn label(&self) -> &'static str {
        "remote"
    }

    async fn insert(
        &self,
        collection: &str,
        owner_id: &str,
        fields: Value,
    ) -> Result<StoredRecord, RemoteError> {
        self.enter().await?;
        let record = self.inner.insert(collection, owner_id, fields).await?;
        Ok(self.respond(record))
    }

    async fn update_if_unmodified(
        &self,
        collection: &str,
        owner_id: &str,
        id: &str,
        expected_updated_at_ms: u64,
        patch: Value,
    ) -> Result<StoredRecord, RemoteError> {
        self.enter().await?;
        let record = self
            .inner
            .update_if_unmodified(collection, owner_id, id, expected_updated_at_ms, patch)
            .await?;
        Ok(self.respond(record))
    }

    async fn delete(&self, collection: &str, owner_id: &str, id: &str) -> Result<(), RemoteError> {
        self.enter().await?;
        self.inner.delete(collection, owner_id, id).await
    }

    async fn list(
        &self,
        collection: &str,
        owner_id: &str,
    ) -> Result<Vec<StoredRecord>, RemoteError> {
        self.enter().await?;
        self.inner.list(collection, owner_id).await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.inner.ping().await
    }
}

pub(crate) struct Harness {
    pub(crate) ctx: ResilienceContext,
    pub(crate) remote: Arc<ScriptedBackend>,
    pub(crate) session: Arc<StaticSession>,
    pub(crate) clock: Arc<ManualClock>,
}

pub(crate) fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let remote = ScriptedBackend::new(clock.clone());
    let session = Arc::new(StaticSession::signed_in("user-1"));
    let ctx = ResilienceContext::builder(remote.clone(), session.clone())
        .config(StoreConfig::default())
        .clock(clock.clone())
        .build();
    Harness {
        ctx,
        remote,
        session,
        clock,
    }
}
