use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::RwLock;
use resilience_core::{
    ClassifiedError, ErrorKind, Notice, RawError, RemoteError, RetryScope, Severity, StorageMode,
    StoredRecord,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    context::ResilienceContext,
    entity::{Entity, EntityKind},
    error::{StoreError, UNREADABLE_SAVED_MESSAGE, WriteOp, refine_backend_error},
};

#[derive(Debug)]
pub(crate) struct EntityCache<T> {
    /// Mode the entries were loaded under.
    mode: Option<StorageMode>,
    entities: Vec<Entity<T>>,
}

impl<T> Default for EntityCache<T> {
    fn default() -> Self {
        Self {
            mode: None,
            entities: Vec::new(),
        }
    }
}

/// Entity cache shared by all stores of one kind within a context.
pub(crate) type SharedCache<T> = RwLock<EntityCache<T>>;

/// CRUD adapter for one entity collection.
///
/// Every operation runs validation, the session check and the write debouncer
/// before touching a backend. Remote calls go through the retry executor;
/// their outcomes feed the connection monitor and the fallback coordinator.
/// In local durable mode a single attempt is made against the local store.
/// The cache only changes after a backend confirmed the write, and is shared
/// with every other store of the same kind created from the context.
pub struct EntityStore<T: EntityKind> {
    ctx: ResilienceContext,
    cache: Arc<SharedCache<T>>,
    cancel: CancellationToken,
}

impl<T: EntityKind> EntityStore<T> {
    pub fn new(ctx: ResilienceContext) -> Self {
        Self {
            cache: ctx.cache_for::<T>(),
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &ResilienceContext {
        &self.ctx
    }

    /// Storage mode the cached entries belong to, if anything was loaded.
    pub fn mode(&self) -> Option<StorageMode> {
        self.cache.read().mode
    }

    /// Cached entities, newest created first.
    pub fn snapshot(&self) -> Vec<Entity<T>> {
        self.cache.read().entities.clone()
    }

    pub fn get(&self, id: &str) -> Option<Entity<T>> {
        self.cache
            .read()
            .entities
            .iter()
            .find(|entity| entity.id == id)
            .cloned()
    }

    /// Stop scheduling retries for operations in flight. Attempts already
    /// sent complete and their results are discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn add(&self, data: T) -> Result<Entity<T>, StoreError> {
        let context = operation_context::<T>("add");
        if let Err(message) = data.validate() {
            return Err(self.reject(RawError::validation(message), &context, None));
        }
        let user_id = self.require_session(&context)?;
        let channel = format!("add:{}", T::COLLECTION);
        self.acquire(&channel, &context, &user_id)?;

        let mode = self.sync_mode();
        let fields = match self.encode(&data, &context, &user_id) {
            Ok(fields) => fields,
            Err(err) => {
                self.ctx.debouncer().release(&channel);
                return Err(err);
            }
        };

        let backend = self.ctx.backend_for(mode);
        let backend = &*backend;
        let user = user_id.as_str();
        let fields = &fields;
        let outcome = self
            .execute(mode, &context, user, self.ctx.config().write_timeout(), move || {
                backend.insert(T::COLLECTION, user, fields.clone())
            })
            .await;

        let outcome = outcome.and_then(|record| self.decode_saved(record, &context, &user_id));
        let entity = self.settle(outcome, mode, &channel, WriteOp::Create, &context, &user_id)?;

        {
            let mut cache = self.cache.write();
            if cache.mode == Some(mode) {
                cache.entities.insert(0, entity.clone());
            }
        }
        info!(collection = T::COLLECTION, id = %entity.id, ?mode, "entity added");
        self.ctx
            .inner
            .notifier
            .notice(Notice::success(format!("{} added", T::LABEL)));
        Ok(entity)
    }

    /// Apply `patch` to entity `id` only if the store still holds the version
    /// this cache last saw.
    pub async fn update(&self, id: &str, patch: T::Patch) -> Result<Entity<T>, StoreError> {
        let context = operation_context::<T>("update");
        if let Err(message) = T::validate_patch(&patch) {
            return Err(self.reject(RawError::validation(message), &context, None));
        }
        let user_id = self.require_session(&context)?;

        let mode = self.sync_mode();
        let Some(expected_updated_at_ms) = self.get(id).map(|entity| entity.updated_at_ms) else {
            return Err(self.reject(
                RawError::validation(format!(
                    "This {} is not loaded. Refresh and try again.",
                    T::LABEL.to_lowercase()
                )),
                &context,
                Some(&user_id),
            ));
        };

        let channel = format!("update:{}:{id}", T::COLLECTION);
        self.acquire(&channel, &context, &user_id)?;
        let patch = match self.encode(&patch, &context, &user_id) {
            Ok(patch) => patch,
            Err(err) => {
                self.ctx.debouncer().release(&channel);
                return Err(err);
            }
        };

        let backend = self.ctx.backend_for(mode);
        let backend = &*backend;
        let user = user_id.as_str();
        let patch = &patch;
        let outcome = self
            .execute(mode, &context, user, self.ctx.config().write_timeout(), move || {
                backend.update_if_unmodified(
                    T::COLLECTION,
                    user,
                    id,
                    expected_updated_at_ms,
                    patch.clone(),
                )
            })
            .await;

        let outcome = outcome.and_then(|record| self.decode_saved(record, &context, &user_id));
        let entity = self.settle(outcome, mode, &channel, WriteOp::Update, &context, &user_id)?;

        {
            let mut cache = self.cache.write();
            if cache.mode == Some(mode)
                && let Some(slot) = cache.entities.iter_mut().find(|e| e.id == entity.id)
            {
                *slot = entity.clone();
            }
        }
        info!(collection = T::COLLECTION, id, ?mode, "entity updated");
        self.ctx
            .inner
            .notifier
            .notice(Notice::success(format!("{} updated", T::LABEL)));
        Ok(entity)
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let context = operation_context::<T>("delete");
        let user_id = self.require_session(&context)?;
        let channel = format!("delete:{}:{id}", T::COLLECTION);
        self.acquire(&channel, &context, &user_id)?;

        let mode = self.sync_mode();
        let backend = self.ctx.backend_for(mode);
        let backend = &*backend;
        let user = user_id.as_str();
        let outcome = self
            .execute(mode, &context, user, self.ctx.config().write_timeout(), move || {
                backend.delete(T::COLLECTION, user, id)
            })
            .await;

        self.settle(outcome, mode, &channel, WriteOp::Other, &context, &user_id)?;

        {
            let mut cache = self.cache.write();
            if cache.mode == Some(mode) {
                cache.entities.retain(|entity| entity.id != id);
            }
        }
        info!(collection = T::COLLECTION, id, ?mode, "entity deleted");
        self.ctx
            .inner
            .notifier
            .notice(Notice::success(format!("{} deleted", T::LABEL)));
        Ok(())
    }

    /// Fetch the caller's records and replace the cache wholesale.
    pub async fn list(&self) -> Result<Vec<Entity<T>>, StoreError> {
        let context = operation_context::<T>("list");
        let user_id = self.require_session(&context)?;

        let mode = self.sync_mode();
        let backend = self.ctx.backend_for(mode);
        let backend = &*backend;
        let user = user_id.as_str();
        let outcome = self
            .execute(mode, &context, user, self.ctx.config().read_timeout(), move || {
                backend.list(T::COLLECTION, user)
            })
            .await;

        let records = match outcome {
            Ok(records) => records,
            Err(error) => {
                if mode == StorageMode::Remote && crate::fallback::degrades_connection(&error) {
                    self.ctx.monitor().record_failure(&error);
                }
                return Err(self.fail(error, WriteOp::Other));
            }
        };

        let mut entities = records
            .into_iter()
            .map(|record| self.decode(record, &context, &user_id))
            .collect::<Result<Vec<_>, _>>()?;
        entities.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));

        {
            let mut cache = self.cache.write();
            if cache.mode == Some(mode) {
                cache.entities = entities.clone();
            }
        }
        debug!(collection = T::COLLECTION, count = entities.len(), ?mode, "cache refreshed");
        Ok(entities)
    }

    async fn execute<R, F, Fut>(
        &self,
        mode: StorageMode,
        context: &str,
        user_id: &str,
        timeout: Duration,
        mut call: F,
    ) -> Result<R, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, RemoteError>>,
    {
        match mode {
            StorageMode::Remote => {
                let scope = RetryScope::new(context, timeout)
                    .with_user(Some(user_id))
                    .with_cancel(self.cancel.child_token());
                self.ctx
                    .inner
                    .retry
                    .run(scope, || {
                        let attempt = call();
                        async move { attempt.await.map_err(RawError::from) }
                    })
                    .await
            }
            StorageMode::LocalDurable => {
                let raw = match tokio::time::timeout(timeout, call()).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(err)) => RawError::from(err),
                    Err(_) => RawError::Timeout {
                        after_ms: timeout.as_millis() as u64,
                    },
                };
                Err(self
                    .ctx
                    .classifier()
                    .classify_on_device(&raw, context, Some(user_id)))
            }
        }
    }

    /// Commit or release the debounce reservation and account the outcome.
    fn settle<R>(
        &self,
        outcome: Result<R, ClassifiedError>,
        mode: StorageMode,
        channel: &str,
        op: WriteOp,
        context: &str,
        user_id: &str,
    ) -> Result<R, StoreError> {
        match outcome {
            Ok(value) => {
                self.ctx.debouncer().mark_saved(channel);
                if mode == StorageMode::Remote {
                    self.ctx.monitor().record_success();
                    self.ctx.fallback().record_success();
                }
                Ok(value)
            }
            Err(error) => {
                self.ctx.debouncer().release(channel);
                if mode == StorageMode::Remote && crate::fallback::degrades_connection(&error) {
                    self.ctx.monitor().record_failure(&error);
                    self.ctx.fallback().record_failure(&error);
                }
                debug!(context, user_id, kind = %error.kind, "write failed");
                Err(self.fail(error, op))
            }
        }
    }

    fn fail(&self, error: ClassifiedError, op: WriteOp) -> StoreError {
        if error.is_cancelled() {
            return StoreError::Failed(error);
        }
        let refined = refine_backend_error(error, op, T::DUPLICATE_MESSAGE);
        self.ctx.classifier().report(refined.classified());
        refined
    }

    fn reject(&self, raw: RawError, context: &str, user_id: Option<&str>) -> StoreError {
        StoreError::Rejected(self.ctx.classifier().classify(&raw, context, user_id))
    }

    fn require_session(&self, context: &str) -> Result<String, StoreError> {
        self.ctx
            .inner
            .session
            .current_user_id()
            .ok_or_else(|| self.reject(RawError::Unauthenticated, context, None))
    }

    fn acquire(&self, channel: &str, context: &str, user_id: &str) -> Result<(), StoreError> {
        let debouncer = self.ctx.debouncer();
        if debouncer.can_save(channel) {
            return Ok(());
        }
        let retry_after_ms = debouncer.remaining_ms(channel);
        debug!(channel, retry_after_ms, "write throttled");
        Err(self.reject(
            RawError::Throttled { retry_after_ms },
            context,
            Some(user_id),
        ))
    }

    /// Current storage mode; drops cached entries loaded under another one.
    fn sync_mode(&self) -> StorageMode {
        let mode = self.ctx.mode();
        let mut cache = self.cache.write();
        if cache.mode != Some(mode) {
            if let Some(previous) = cache.mode {
                debug!(
                    collection = T::COLLECTION,
                    ?previous,
                    ?mode,
                    "discarding cache loaded under other storage mode"
                );
            }
            cache.entities.clear();
            cache.mode = Some(mode);
        }
        mode
    }

    fn encode<P: Serialize>(
        &self,
        value: &P,
        context: &str,
        user_id: &str,
    ) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(value).map_err(|err| {
            StoreError::Failed(self.ctx.classifier().classify(
                &RawError::other(format!("failed encoding {}: {err}", T::COLLECTION)),
                context,
                Some(user_id),
            ))
        })
    }

    fn decode(
        &self,
        record: StoredRecord,
        context: &str,
        user_id: &str,
    ) -> Result<Entity<T>, StoreError> {
        let id = record.id.clone();
        Entity::from_record(record).map_err(|err| {
            StoreError::Failed(self.ctx.classifier().classify(
                &RawError::other(format!("failed decoding {} '{id}': {err}", T::COLLECTION)),
                context,
                Some(user_id),
            ))
        })
    }

    /// Decode the record a backend returned for a write it accepted.
    fn decode_saved(
        &self,
        record: StoredRecord,
        context: &str,
        user_id: &str,
    ) -> Result<Entity<T>, ClassifiedError> {
        let id = record.id.clone();
        Entity::from_record(record).map_err(|err| {
            self.ctx
                .classifier()
                .classify_silent(
                    &RawError::other(format!("failed decoding saved {} '{id}': {err}", T::COLLECTION)),
                    context,
                    Some(user_id),
                )
                .refined(ErrorKind::Unknown, Severity::High, UNREADABLE_SAVED_MESSAGE)
        })
    }
}

impl<T: EntityKind> Drop for EntityStore<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T: EntityKind> std::fmt::Debug for EntityStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.read();
        f.debug_struct("EntityStore")
            .field("collection", &T::COLLECTION)
            .field("mode", &cache.mode)
            .field("cached", &cache.entities.len())
            .finish()
    }
}

fn operation_context<T: EntityKind>(operation: &str) -> String {
    format!("{}.{operation}", T::COLLECTION)
}
