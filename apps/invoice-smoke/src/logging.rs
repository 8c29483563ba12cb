//! Tracing bootstrap for the smoke harness.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,invoice_store=debug,resilience_core=debug";

/// Initialize the global tracing subscriber.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `INVOICE_SMOKE_LOG`
/// 3) `INVOICE_SYNC_LOG`
/// 4) built-in default
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for key in ["INVOICE_SMOKE_LOG", "INVOICE_SYNC_LOG"] {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
