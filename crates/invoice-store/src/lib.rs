//! Client and invoice storage on top of the resilience primitives.
//!
//! [`ResilienceContext`] wires one classifier, retry executor, debouncer,
//! connection monitor and fallback coordinator around a remote backend and a
//! local durable backend. [`EntityStore`] is the per-collection adapter the UI
//! calls.

/// Runtime configuration.
pub mod config;
/// Component wiring.
pub mod context;
/// Client and invoice records.
pub mod entity;
/// Store error type and backend error refinement.
pub mod error;
/// Remote/local storage mode switching.
pub mod fallback;
/// Per-collection CRUD adapter.
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, StoreConfig};
pub use context::{BackendProbe, ResilienceContext, ResilienceContextBuilder};
pub use entity::{
    Client, ClientPatch, Entity, EntityKind, Invoice, InvoicePatch, InvoiceStatus, LineItem,
};
pub use error::{
    CONFLICT_MESSAGE, LOCAL_STORAGE_MESSAGE, PERMISSION_MESSAGE, REQUIRED_FIELDS_MESSAGE,
    StoreError, UNREADABLE_SAVED_MESSAGE,
};
pub use fallback::{FallbackCoordinator, FallbackPolicy, FallbackSnapshot, degrades_connection};
pub use store::EntityStore;
