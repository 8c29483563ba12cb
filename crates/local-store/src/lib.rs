//! Record tables implementing the owner-scoped CRUD contract.
//!
//! [`MemoryBackend`] keeps everything in process memory; [`DurableBackend`]
//! persists one JSON document per collection and serves the local durable
//! storage mode.

mod durable;
mod table;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::RwLock;
use resilience_core::{Clock, EntityBackend, RemoteError, StoredRecord};
use serde_json::Value;
use thiserror::Error;

pub use durable::DurableBackend;
pub use table::{RecordTable, UniqueConstraint};

/// Code reported for unique constraint violations.
pub const UNIQUE_VIOLATION_CODE: &str = "23505";
/// Code reported when a local durable store cannot read or write its files.
pub const LOCAL_STORAGE_CODE: &str = "local_storage";

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("failed {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed encoding collection '{collection}': {source}")]
    Encode {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<LocalStoreError> for RemoteError {
    fn from(err: LocalStoreError) -> Self {
        RemoteError::status(500, Some(LOCAL_STORAGE_CODE), err.to_string())
    }
}

/// In-process backend. Also usable as a stand-in remote: reachability can be
/// toggled to simulate an outage.
#[derive(Clone)]
pub struct MemoryBackend {
    label: &'static str,
    tables: Arc<RwLock<HashMap<String, RecordTable>>>,
    constraints: Arc<Vec<UniqueConstraint>>,
    clock: Arc<dyn Clock>,
    reachable: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new(label: &'static str, clock: Arc<dyn Clock>) -> Self {
        Self {
            label,
            tables: Arc::new(RwLock::new(HashMap::new())),
            constraints: Arc::new(Vec::new()),
            clock,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Reject inserts/updates that would duplicate `field` within one owner's
    /// records of `collection`.
    pub fn with_unique(mut self, collection: &str, field: &str) -> Self {
        let mut constraints = (*self.constraints).clone();
        constraints.push(UniqueConstraint::new(collection, field));
        self.constraints = Arc::new(constraints);
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Place a record verbatim, bypassing id and timestamp assignment.
    pub fn seed(&self, collection: &str, record: StoredRecord) {
        self.tables
            .write()
            .entry(collection.to_owned())
            .or_default()
            .put(record);
    }

    /// Current stored copy of a record regardless of owner.
    pub fn peek(&self, collection: &str, id: &str) -> Option<StoredRecord> {
        self.tables
            .read()
            .get(collection)
            .and_then(|table| table.get(id).cloned())
    }

    fn ensure_reachable(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Transport(format!("{} backend unreachable", self.label)))
        }
    }

    fn constraints_for(&self, collection: &str) -> Vec<UniqueConstraint> {
        self.constraints
            .iter()
            .filter(|c| c.collection == collection)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("label", &self.label)
            .field("reachable", &self.reachable.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl EntityBackend for MemoryBackend {
    fn label(&self) -> &'static str {
        self.label
    }

    async fn insert(
        &self,
        collection: &str,
        owner_id: &str,
        fields: Value,
    ) -> Result<StoredRecord, RemoteError> {
        self.ensure_reachable()?;
        let constraints = self.constraints_for(collection);
        let now = self.clock.now_ms();
        self.tables
            .write()
            .entry(collection.to_owned())
            .or_default()
            .insert(owner_id, fields, now, &constraints)
    }

    async fn update_if_unmodified(
        &self,
        collection: &str,
        owner_id: &str,
        id: &str,
        expected_updated_at_ms: u64,
        patch: Value,
    ) -> Result<StoredRecord, RemoteError> {
        self.ensure_reachable()?;
        let constraints = self.constraints_for(collection);
        let now = self.clock.now_ms();
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(collection)
            .ok_or_else(|| RemoteError::not_found(id))?;
        table.update_if_unmodified(owner_id, id, expected_updated_at_ms, patch, now, &constraints)
    }

    async fn delete(&self, collection: &str, owner_id: &str, id: &str) -> Result<(), RemoteError> {
        self.ensure_reachable()?;
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(collection)
            .ok_or_else(|| RemoteError::not_found(id))?;
        table.delete(owner_id, id)
    }

    async fn list(
        &self,
        collection: &str,
        owner_id: &str,
    ) -> Result<Vec<StoredRecord>, RemoteError> {
        self.ensure_reachable()?;
        Ok(self
            .tables
            .read()
            .get(collection)
            .map(|table| table.list(owner_id))
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.ensure_reachable()
    }
}

#[cfg(test)]
mod tests {
    use resilience_core::ManualClock;
    use serde_json::json;

    use super::*;

    fn backend() -> (MemoryBackend, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (
            MemoryBackend::new("remote", clock.clone()).with_unique("clients", "email"),
            clock,
        )
    }

    #[tokio::test]
    async fn insert_then_list_round_trip() {
        let (backend, clock) = backend();
        let first = backend
            .insert("clients", "u1", json!({"name": "Acme", "email": "a@acme.test"}))
            .await
            .expect("insert should work");
        clock.advance(5);
        let second = backend
            .insert("clients", "u1", json!({"name": "Beta", "email": "b@beta.test"}))
            .await
            .expect("insert should work");

        let listed = backend.list("clients", "u1").await.expect("list should work");
        assert_eq!(listed, vec![second, first.clone()]);
        assert_eq!(first.fields["name"], "Acme");
        assert_eq!(first.created_at_ms, 1_000);
        assert_eq!(first.updated_at_ms, 1_000);
    }

    #[tokio::test]
    async fn list_is_scoped_to_owner() {
        let (backend, _) = backend();
        backend
            .insert("clients", "u1", json!({"email": "x@y.test"}))
            .await
            .expect("insert should work");

        let other = backend.list("clients", "u2").await.expect("list should work");
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn duplicate_unique_field_is_rejected() {
        let (backend, _) = backend();
        backend
            .insert("clients", "u1", json!({"email": "dup@acme.test"}))
            .await
            .expect("first insert");

        let err = backend
            .insert("clients", "u1", json!({"email": "dup@acme.test"}))
            .await
            .expect_err("duplicate must fail");
        match err {
            RemoteError::Status { status, code, .. } => {
                assert_eq!(status, 409);
                assert_eq!(code.as_deref(), Some(UNIQUE_VIOLATION_CODE));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        backend
            .insert("clients", "u2", json!({"email": "dup@acme.test"}))
            .await
            .expect("other owner may reuse the email");
    }

    #[tokio::test]
    async fn unreachable_backend_fails_with_transport_error() {
        let (backend, _) = backend();
        backend.set_reachable(false);
        assert!(matches!(
            backend.ping().await,
            Err(RemoteError::Transport(_))
        ));
        backend.set_reachable(true);
        backend.ping().await.expect("reachable again");
    }

    #[tokio::test]
    async fn update_on_missing_collection_is_not_found() {
        let (backend, _) = backend();
        let err = backend
            .update_if_unmodified("invoices", "u1", "INV-1", 1, json!({}))
            .await
            .expect_err("nothing to update");
        assert!(matches!(err, RemoteError::Status { status: 404, .. }));
    }
}
