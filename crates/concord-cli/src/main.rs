//! # concord
//!
//! Replays a recorded account dump through the synchronization service and
//! prints the resulting chat list.
//!
//! ```text
//! concord <dump.json>
//! ```
//!
//! The dump path may also come from `CONCORD_REPLAY_PATH`. Service settings
//! are read from the environment (see [`SyncConfig`]).

mod replay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use concord_core::{ChatEvent, EventKind, Realm, SyncConfig, SyncService};
use concord_store::Database;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::replay::ReplayRealm;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("warn,concord=info,concord_core=debug,concord_store=info")
        }))
        .init();

    info!("Starting concord v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = SyncConfig::from_env();
    info!(?config, "Loaded configuration");

    let dump_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONCORD_REPLAY_PATH").ok())
        .map(PathBuf::from)
        .context("usage: concord <dump.json> (or set CONCORD_REPLAY_PATH)")?;

    // -----------------------------------------------------------------------
    // 3. Open the store and load the realm
    // -----------------------------------------------------------------------
    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    if let Some(path) = database.path() {
        info!(path = %path.display(), "Opened database");
    }

    let realm = Arc::new(ReplayRealm::load(&dump_path)?);

    // -----------------------------------------------------------------------
    // 4. Replay. The service blocks on SQLite and realm calls, so it runs
    //    off the async workers.
    // -----------------------------------------------------------------------
    tokio::task::spawn_blocking(move || replay(database, realm, &config))
        .await
        .context("replay task panicked")??;

    info!("Replay finished");
    Ok(())
}

fn replay(database: Database, realm: Arc<ReplayRealm>, config: &SyncConfig) -> anyhow::Result<()> {
    let service = SyncService::new(Box::new(database), config)?;
    service.register_realm(realm.clone());

    service.subscribe(&EventKind::ALL, log_event);

    let me = realm.user().entity.clone();
    let roster = service.merge_chats(&me, realm.chats())?;
    info!(
        added = roster.added.len(),
        updated = roster.updated.len(),
        removed = roster.removed.len(),
        "Merged chat roster"
    );

    let fetched = service.sync_all_messages(&me)?;
    info!(messages = fetched.len(), "Synced messages");

    let chats = service.sort_by_last_message(service.load_user_chats(&me)?)?;
    for chat in &chats {
        let last = service.get_last_message(&chat.entity)?;
        let unread = service.get_unread_count(&chat.entity)?;
        let title = chat
            .title
            .clone()
            .or_else(|| service.get_second_user(chat).map(|u| u.local_id().to_string()))
            .unwrap_or_else(|| chat.entity.local_id().to_string());

        match last {
            Some(message) => info!(
                chat = %title,
                unread,
                last_at = %message.send_time,
                last = %message.body,
                "Chat"
            ),
            None => info!(chat = %title, unread, "Chat (empty)"),
        }
    }

    service.flush_events();
    Ok(())
}

fn log_event(event: &ChatEvent) {
    debug!(kind = ?event.kind(), subject = %event.subject(), "Event");
}
