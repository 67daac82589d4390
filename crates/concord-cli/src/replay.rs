//! A realm backed by a recorded JSON dump of one account.
//!
//! The dump carries the account user, the chats the backend reported and
//! every message visible to the account:
//!
//! ```json
//! { "account": { ... }, "chats": [ ... ], "messages": [ ... ] }
//! ```
//!
//! Private chats created during a replay get a fresh backend id, the way a
//! live server would assign one.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use concord_core::{Realm, RealmError};
use concord_shared::{ApiChat, Chat, ChatMessage, Entity, User};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

/// Messages per page returned by [`Realm::fetch_older_messages`].
const OLDER_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
struct ReplayDump {
    account: User,
    #[serde(default)]
    chats: Vec<ApiChat>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

pub struct ReplayRealm {
    id: String,
    account: User,
    chats: Vec<ApiChat>,
    messages: Vec<ChatMessage>,
}

impl ReplayRealm {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading replay dump {}", path.display()))?;
        let realm = Self::from_json(&raw)
            .with_context(|| format!("parsing replay dump {}", path.display()))?;

        info!(
            realm = %realm.id,
            chats = realm.chats.len(),
            messages = realm.messages.len(),
            "Loaded replay dump"
        );
        Ok(realm)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let dump: ReplayDump = serde_json::from_str(raw)?;
        Ok(Self {
            id: dump.account.entity.realm_id().to_string(),
            account: dump.account,
            chats: dump.chats,
            messages: dump.messages,
        })
    }

    /// The chat roster as the backend reported it.
    pub fn chats(&self) -> Vec<ApiChat> {
        self.chats.clone()
    }

    fn messages_of<'a>(&'a self, chat: &'a str) -> impl Iterator<Item = &'a ChatMessage> + 'a {
        self.messages
            .iter()
            .filter(move |m| m.chat.backend_id() == chat)
    }
}

impl Realm for ReplayRealm {
    fn id(&self) -> &str {
        &self.id
    }

    fn user(&self) -> &User {
        &self.account
    }

    fn fetch_all_messages(&self, _account: &str) -> Result<Vec<ChatMessage>, RealmError> {
        Ok(self.messages.clone())
    }

    fn fetch_newer_messages(
        &self,
        chat: &str,
        _account: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, RealmError> {
        let newer: Vec<ChatMessage> = self
            .messages_of(chat)
            .filter(|m| since.map_or(true, |since| m.send_time > since))
            .cloned()
            .collect();
        debug!(chat, ?since, count = newer.len(), "Replayed newer messages");
        Ok(newer)
    }

    fn fetch_older_messages(
        &self,
        chat: &str,
        _account: &str,
        offset: usize,
    ) -> Result<Vec<ChatMessage>, RealmError> {
        let mut history: Vec<&ChatMessage> = self.messages_of(chat).collect();
        history.sort_by(|a, b| ChatMessage::chronological(b, a));

        Ok(history
            .into_iter()
            .skip(offset)
            .take(OLDER_PAGE_SIZE)
            .cloned()
            .collect())
    }

    fn create_private_chat(
        &self,
        derived: &Entity,
        user_a: &str,
        user_b: &str,
    ) -> Result<Chat, RealmError> {
        if user_a == user_b {
            return Err(RealmError::Rejected(format!(
                "cannot open a chat between {user_a} and itself"
            )));
        }

        let room = derived.sibling(format!("dm-{}", Uuid::new_v4()));
        info!(chat = %derived, room = %room.local_id(), "Opened private chat");
        Ok(Chat::new_private(room))
    }
}
