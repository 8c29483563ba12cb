//! Explicit wiring of the shared resilience components.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use local_store::DurableBackend;
use parking_lot::Mutex;
use resilience_core::{
    Clock, ConnectionMonitor, EntityBackend, ErrorClassifier, EventStream, HealthProbe,
    NetworkStatus, Notifier, RawError, RetryExecutor, SessionProvider, StorageMode, SystemClock,
    WriteDebouncer,
};

use crate::{
    config::StoreConfig,
    entity::{Client, EntityKind, Invoice},
    fallback::FallbackCoordinator,
    store::{EntityStore, SharedCache},
};

/// Probes a backend with its cheap reachability check.
pub struct BackendProbe {
    backend: Arc<dyn EntityBackend>,
}

impl BackendProbe {
    pub fn new(backend: Arc<dyn EntityBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl HealthProbe for BackendProbe {
    async fn probe(&self) -> Result<(), RawError> {
        self.backend.ping().await.map_err(RawError::from)
    }
}

type ErasedCache = Arc<dyn Any + Send + Sync>;

pub(crate) struct ContextInner {
    pub(crate) config: StoreConfig,
    pub(crate) session: Arc<dyn SessionProvider>,
    pub(crate) notifier: Notifier,
    pub(crate) classifier: Arc<ErrorClassifier>,
    pub(crate) retry: RetryExecutor,
    pub(crate) debouncer: WriteDebouncer,
    pub(crate) monitor: ConnectionMonitor,
    pub(crate) fallback: FallbackCoordinator,
    pub(crate) remote: Arc<dyn EntityBackend>,
    pub(crate) local: Arc<dyn EntityBackend>,
    /// One entity cache per kind, shared by every store of that kind.
    caches: Mutex<HashMap<TypeId, ErasedCache>>,
}

/// Shared state of one signed-in application instance: one classifier, one
/// connection monitor, one storage mode. Cloning shares it.
#[derive(Clone)]
pub struct ResilienceContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl ResilienceContext {
    pub fn builder(
        remote: Arc<dyn EntityBackend>,
        session: Arc<dyn SessionProvider>,
    ) -> ResilienceContextBuilder {
        ResilienceContextBuilder {
            remote,
            session,
            config: StoreConfig::default(),
            clock: None,
            network: None,
            notifier: None,
            local: None,
        }
    }

    /// Adapter for one entity collection. Stores created from one context
    /// share its health, storage mode and entity cache.
    pub fn store<T: EntityKind>(&self) -> EntityStore<T> {
        EntityStore::new(self.clone())
    }

    pub fn clients(&self) -> EntityStore<Client> {
        self.store()
    }

    pub fn invoices(&self) -> EntityStore<Invoice> {
        self.store()
    }

    pub fn subscribe(&self) -> EventStream {
        self.inner.notifier.subscribe()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.inner.classifier
    }

    pub fn network(&self) -> &NetworkStatus {
        self.inner.classifier.network()
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.inner.monitor
    }

    pub fn fallback(&self) -> &FallbackCoordinator {
        &self.inner.fallback
    }

    pub fn debouncer(&self) -> &WriteDebouncer {
        &self.inner.debouncer
    }

    pub fn mode(&self) -> StorageMode {
        self.inner.fallback.mode()
    }

    pub(crate) fn cache_for<T: EntityKind>(&self) -> Arc<SharedCache<T>> {
        let mut caches = self.inner.caches.lock();
        let slot = caches
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(SharedCache::<T>::default()) as ErasedCache);
        match slot.clone().downcast::<SharedCache<T>>() {
            Ok(cache) => cache,
            Err(_) => {
                let cache = Arc::new(SharedCache::<T>::default());
                *slot = cache.clone() as ErasedCache;
                cache
            }
        }
    }

    pub(crate) fn backend_for(&self, mode: StorageMode) -> Arc<dyn EntityBackend> {
        match mode {
            StorageMode::Remote => self.inner.remote.clone(),
            StorageMode::LocalDurable => self.inner.local.clone(),
        }
    }
}

impl std::fmt::Debug for ResilienceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceContext")
            .field("remote", &self.inner.remote.label())
            .field("local", &self.inner.local.label())
            .field("fallback", &self.inner.fallback.snapshot())
            .field("health", &self.inner.monitor.snapshot())
            .finish()
    }
}

pub struct ResilienceContextBuilder {
    remote: Arc<dyn EntityBackend>,
    session: Arc<dyn SessionProvider>,
    config: StoreConfig,
    clock: Option<Arc<dyn Clock>>,
    network: Option<NetworkStatus>,
    notifier: Option<Notifier>,
    local: Option<Arc<dyn EntityBackend>>,
}

impl ResilienceContextBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn network(mut self, network: NetworkStatus) -> Self {
        self.network = Some(network);
        self
    }

    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Override the local durable backend. By default a [`DurableBackend`]
    /// under `config.local_dir` (memory-only when unset) is used.
    pub fn local(mut self, local: Arc<dyn EntityBackend>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn build(self) -> ResilienceContext {
        let config = self.config;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let network = self.network.unwrap_or_default();
        let notifier = self.notifier.unwrap_or_default();

        let local = self
            .local
            .unwrap_or_else(|| default_local_backend(&config, clock.clone()));
        let classifier = Arc::new(ErrorClassifier::new(
            network,
            clock.clone(),
            notifier.clone(),
            config.diagnostics_capacity,
        ));
        let monitor = ConnectionMonitor::new(
            config.health,
            Arc::new(BackendProbe::new(self.remote.clone())),
            classifier.clone(),
            clock.clone(),
        );
        let debouncer = WriteDebouncer::new(config.debounce_window_ms, clock);
        let fallback = FallbackCoordinator::new(config.fallback, monitor.clone(), notifier.clone());

        ResilienceContext {
            inner: Arc::new(ContextInner {
                retry: RetryExecutor::new(config.retry, classifier.clone()),
                debouncer,
                config,
                session: self.session,
                notifier,
                classifier,
                monitor,
                fallback,
                remote: self.remote,
                local,
                caches: Mutex::new(HashMap::new()),
            }),
        }
    }
}

fn default_local_backend(config: &StoreConfig, clock: Arc<dyn Clock>) -> Arc<dyn EntityBackend> {
    let backend = match &config.local_dir {
        Some(dir) => DurableBackend::open(dir, clock),
        None => DurableBackend::in_memory(clock),
    };
    Arc::new(
        backend
            .with_unique(Client::COLLECTION, "email")
            .with_unique(Invoice::COLLECTION, "invoice_number"),
    )
}
