//! # concord-core
//!
//! Synchronization of chats and messages between pluggable backends
//! ("realms") and the local store.
//!
//! - [`realm`] -- the capability interface each backend implements, and the
//!   registry resolving a realm tag to its implementation
//! - [`events`] -- typed chat events and the bus delivering them to listeners
//! - [`cache`] -- chats, participants and last messages kept coherent by
//!   events
//! - [`service`] -- [`SyncService`], the orchestrator callers talk to

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod realm;
pub mod service;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use events::{ChatEvent, EventBus, EventKind, ListenerId};
pub use realm::{Realm, RealmError, RealmRegistry};
pub use service::SyncService;
