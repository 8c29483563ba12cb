//! Drives the resilience layer end to end against an in-process remote.
//!
//! Configuration comes from the `INVOICE_SYNC_*` environment variables; set
//! `INVOICE_SYNC_LOCAL_DIR` to keep the local fallback store on disk.

mod logging;

use std::{sync::Arc, time::Duration};

use invoice_store::{Client, ClientPatch, ResilienceContext, StoreConfig, StoreError};
use local_store::MemoryBackend;
use resilience_core::{EntityBackend, ResilienceEvent, StaticSession, SystemClock};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match StoreConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    logging::init();

    if let Err(err) = run(config).await {
        error!(kind = %err.kind(), "smoke run failed: {err}");
        eprintln!("smoke run failed: {}", err.user_message());
        std::process::exit(1);
    }
}

async fn run(config: StoreConfig) -> Result<(), StoreError> {
    let remote = MemoryBackend::new("remote", Arc::new(SystemClock)).with_unique("clients", "email");
    let session = Arc::new(StaticSession::signed_in("smoke-user"));
    let ctx = ResilienceContext::builder(Arc::new(remote.clone()), session)
        .config(config)
        .build();
    info!(?ctx, "resilience context ready");

    let mut events = ctx.subscribe();
    let clients = ctx.clients();

    let added = clients
        .add(Client::new("Acme Traders", "accounts@acme.test", "12 Harbour Rd"))
        .await?;
    println!("added client {} ({})", added.id, added.data.name);

    let listed = ctx.clients().list().await?;
    println!("listed {} client(s)", listed.len());

    let updated = clients
        .update(
            &added.id,
            ClientPatch {
                company: Some("Acme Traders Ltd".to_owned()),
                ..ClientPatch::default()
            },
        )
        .await?;
    println!("updated client at {}", updated.updated_at_ms);

    // Another device edits the record behind the cache.
    if let Err(err) = remote
        .update_if_unmodified(
            "clients",
            "smoke-user",
            &updated.id,
            updated.updated_at_ms,
            serde_json::json!({ "billing_address": "14 Harbour Rd" }),
        )
        .await
    {
        error!("direct remote edit failed: {err}");
    }

    // Writes on one record are debounced; wait the window out.
    tokio::time::sleep(Duration::from_millis(ctx.debouncer().window_ms())).await;
    match clients
        .update(
            &added.id,
            ClientPatch {
                phone: Some("555-0100".to_owned()),
                ..ClientPatch::default()
            },
        )
        .await
    {
        Err(err) if err.is_conflict() => println!("stale update refused: {}", err.user_message()),
        Err(err) => println!("stale update failed: {}", err.user_message()),
        Ok(_) => println!("stale update unexpectedly applied"),
    }

    ctx.fallback().switch_to_local();
    let local = clients.list().await?;
    println!(
        "storage mode {:?}; {} client(s) stored locally",
        ctx.mode(),
        local.len()
    );

    while let Ok(event) = events.try_recv() {
        match event {
            ResilienceEvent::Notice(notice) => println!("notice [{:?}] {}", notice.tone, notice.message),
            other => println!("event {other:?}"),
        }
    }
    Ok(())
}
