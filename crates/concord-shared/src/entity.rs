//! Backend-agnostic identity for users, chats and messages.
//!
//! An [`Entity`] is the `(realm, account, local id)` triple. It is an
//! immutable value used as a map key across the whole workspace: the
//! builder-style methods consume `self` and return a new value instead of
//! editing in place.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{ENTITY_ID_SEPARATOR, PRIVATE_CHAT_DELIMITER};
use crate::error::EntityError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    realm_id: String,
    account_id: String,
    /// Canonical id inside the account, assigned or derived locally.
    local_id: String,
    /// Id the backend itself uses for this object, when it differs from
    /// `local_id`. Never part of equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backend_id: Option<String>,
}

impl Entity {
    pub fn new(
        realm_id: impl Into<String>,
        account_id: impl Into<String>,
        local_id: impl Into<String>,
    ) -> Self {
        Self {
            realm_id: realm_id.into(),
            account_id: account_id.into(),
            local_id: local_id.into(),
            backend_id: None,
        }
    }

    /// Copy of this entity that records the backend's own id for it.
    pub fn with_backend_id(mut self, backend_id: impl Into<String>) -> Self {
        let backend_id = backend_id.into();
        self.backend_id = if backend_id == self.local_id {
            None
        } else {
            Some(backend_id)
        };
        self
    }

    /// Another entity in the same realm and account.
    pub fn sibling(&self, local_id: impl Into<String>) -> Self {
        Self::new(self.realm_id.clone(), self.account_id.clone(), local_id)
    }

    pub fn realm_id(&self) -> &str {
        &self.realm_id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The id to hand back to the backend: its own id if one was recorded,
    /// otherwise the local id.
    pub fn backend_id(&self) -> &str {
        self.backend_id.as_deref().unwrap_or(&self.local_id)
    }

    pub fn is_backend_id_set(&self) -> bool {
        self.backend_id.is_some()
    }

    pub fn belongs_to_realm(&self, realm_id: &str) -> bool {
        self.realm_id == realm_id
    }

    /// Globally unique string form, `realm/account/local`.
    pub fn entity_id(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.realm_id,
            self.account_id,
            self.local_id,
            sep = ENTITY_ID_SEPARATOR
        )
    }

    // ------------------------------------------------------------------
    // Private chats
    // ------------------------------------------------------------------

    /// Derive the canonical id of the private chat between `me` and `other`
    /// as seen from `me`'s account.
    ///
    /// The result depends on argument order: the caller is always `me`.
    /// Deriving a chat with oneself is a caller bug; it is logged and
    /// rejected with [`EntityError::IdentityConflict`].
    pub fn private_chat_id(me: &Entity, other: &Entity) -> Result<Entity, EntityError> {
        if me.local_id == other.local_id {
            tracing::error!(
                realm = %me.realm_id,
                user = %me.local_id,
                "Same user on both sides of a private chat"
            );
            return Err(EntityError::IdentityConflict {
                realm_id: me.realm_id.clone(),
                local_id: me.local_id.clone(),
            });
        }

        Ok(me.sibling(format!(
            "{}{}{}",
            me.local_id, PRIVATE_CHAT_DELIMITER, other.local_id
        )))
    }

    /// Split a private chat id back into `(me, other)` local ids.
    pub fn private_participants(&self) -> Option<(&str, &str)> {
        let (me, other) = self.local_id.split_once(PRIVATE_CHAT_DELIMITER)?;
        if me.is_empty() || other.is_empty() {
            return None;
        }
        Some((me, other))
    }

    /// True if both ids name the same two-party conversation, regardless of
    /// which participant derived them.
    pub fn is_same_conversation(&self, other: &Entity) -> bool {
        if self.realm_id != other.realm_id {
            return false;
        }
        match (self.private_participants(), other.private_participants()) {
            (Some((a1, b1)), Some((a2, b2))) => (a1 == a2 && b1 == b2) || (a1 == b2 && b1 == a2),
            _ => self == other,
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.realm_id == other.realm_id
            && self.account_id == other.account_id
            && self.local_id == other.local_id
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.realm_id.hash(state);
        self.account_id.hash(state);
        self.local_id.hash(state);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.entity_id())
    }
}

impl FromStr for Entity {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ENTITY_ID_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(realm), Some(account), Some(local))
                if !realm.is_empty() && !account.is_empty() && !local.is_empty() =>
            {
                Ok(Entity::new(realm, account, local))
            }
            _ => Err(EntityError::Malformed(s.to_string())),
        }
    }
}
