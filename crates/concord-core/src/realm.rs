//! The capability interface implemented once per backend.
//!
//! A [`Realm`] is one configured account on one backend (an XMPP server, a
//! social network API, a recorded dump). Calls are blocking: they may perform
//! network I/O on the calling thread.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use concord_shared::{Chat, ChatMessage, Entity, User};
use thiserror::Error;

use crate::error::{SyncError, SyncResult};

/// Failure reported by a realm implementation. Wrapped into
/// [`SyncError::BackendConnection`] together with the realm id before it
/// reaches callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealmError {
    /// The backend could not be reached or the transport failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The backend answered but refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// A pluggable backend account.
///
/// Ids passed in and out are the backend's own ids
/// ([`Entity::backend_id`]); mapping them to canonical entities is the
/// service's job.
pub trait Realm: Send + Sync {
    /// The realm tag carried by every entity of this realm.
    fn id(&self) -> &str;

    /// The account's own user.
    fn user(&self) -> &User;

    /// Every message visible to the account.
    fn fetch_all_messages(&self, account: &str) -> Result<Vec<ChatMessage>, RealmError>;

    /// Messages of a chat sent after `since`, or all of them if the chat was
    /// never synced.
    fn fetch_newer_messages(
        &self,
        chat: &str,
        account: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, RealmError>;

    /// A page of messages older than the `offset` newest ones.
    fn fetch_older_messages(
        &self,
        chat: &str,
        account: &str,
        offset: usize,
    ) -> Result<Vec<ChatMessage>, RealmError>;

    /// Create the private chat between two users of the account. The
    /// returned chat may carry the backend's own id instead of `derived`.
    fn create_private_chat(
        &self,
        derived: &Entity,
        user_a: &str,
        user_b: &str,
    ) -> Result<Chat, RealmError>;
}

/// Realms known to the process, keyed by realm id.
#[derive(Default)]
pub struct RealmRegistry {
    realms: RwLock<HashMap<String, Arc<dyn Realm>>>,
}

impl RealmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a realm, replacing any previous one with the same id.
    pub fn register(&self, realm: Arc<dyn Realm>) {
        let id = realm.id().to_string();
        let previous = self
            .realms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), realm);

        if previous.is_some() {
            tracing::warn!(realm = %id, "replaced registered realm");
        } else {
            tracing::info!(realm = %id, "registered realm");
        }
    }

    pub fn unregister(&self, realm_id: &str) -> Option<Arc<dyn Realm>> {
        let removed = self
            .realms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(realm_id);
        if removed.is_some() {
            tracing::info!(realm = %realm_id, "unregistered realm");
        }
        removed
    }

    pub fn get(&self, realm_id: &str) -> SyncResult<Arc<dyn Realm>> {
        self.realms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(realm_id)
            .cloned()
            .ok_or_else(|| SyncError::UnsupportedBackend {
                realm_id: realm_id.to_string(),
            })
    }

    /// The realm owning `entity`.
    pub fn for_entity(&self, entity: &Entity) -> SyncResult<Arc<dyn Realm>> {
        self.get(entity.realm_id())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .realms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
