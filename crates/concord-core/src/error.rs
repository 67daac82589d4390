use concord_shared::{Entity, EntityError};
use concord_store::StoreError;
use thiserror::Error;

use crate::realm::RealmError;

/// Errors surfaced by [`crate::SyncService`] operations.
///
/// Nothing here is retried internally: every failure reaches the immediate
/// caller, and a failed operation has committed nothing and fired no events.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No realm is registered for the entity's realm tag.
    #[error("Unsupported backend: no realm registered for {realm_id}")]
    UnsupportedBackend { realm_id: String },

    /// The realm failed to talk to its backend.
    #[error("Backend connection error in realm {realm_id}: {source}")]
    BackendConnection {
        realm_id: String,
        #[source]
        source: RealmError,
    },

    /// Both participants of a private chat resolve to the same user.
    #[error("Identity conflict: {local_id} on both sides of a private chat in realm {realm_id}")]
    IdentityConflict { realm_id: String, local_id: String },

    #[error("Malformed entity id: {0}")]
    MalformedEntity(String),

    #[error("Chat not found: {0}")]
    ChatNotFound(Entity),

    /// Persistence failure. The surrounding transaction was rolled back.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The event dispatch thread could not be started.
    #[error("Event dispatcher error: {0}")]
    EventDispatch(#[source] std::io::Error),

    /// A thread panicked while holding a service lock.
    #[error("Lock poisoned")]
    LockPoisoned,
}

impl From<EntityError> for SyncError {
    fn from(e: EntityError) -> Self {
        match e {
            EntityError::IdentityConflict { realm_id, local_id } => {
                SyncError::IdentityConflict { realm_id, local_id }
            }
            EntityError::Malformed(id) => SyncError::MalformedEntity(id),
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
