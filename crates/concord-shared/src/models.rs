//! Domain models persisted locally and exchanged with realms.
//!
//! Every struct derives `Serialize` and `Deserialize` so realms can load
//! them from recorded dumps and consumers can hand them to a UI layer.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::merge::Mergeable;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user known to one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub entity: Entity,
    /// Optional human-readable display name.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl User {
    /// A user we only know the id of.
    pub fn new_empty(entity: Entity) -> Self {
        Self {
            entity,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A conversation, either private (two participants) or a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub entity: Entity,
    pub private: bool,
    /// Display title for group chats.
    #[serde(default)]
    pub title: Option<String>,
    /// When newer messages were last fetched from the realm.
    #[serde(default)]
    pub last_messages_sync: Option<DateTime<Utc>>,
}

impl Chat {
    pub fn new_private(entity: Entity) -> Self {
        Self {
            entity,
            private: true,
            title: None,
            last_messages_sync: None,
        }
    }

    pub fn new_group(entity: Entity, title: impl Into<String>) -> Self {
        Self {
            entity,
            private: false,
            title: Some(title.into()),
            last_messages_sync: None,
        }
    }

    /// Copy of this chat under a different identity.
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entity = entity;
        self
    }

    /// Copy of this chat with the sync marker moved to `at`.
    pub fn with_messages_synced_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_messages_sync = Some(at);
        self
    }

    /// The participant on the other side of a private chat.
    pub fn second_user(&self) -> Option<Entity> {
        if !self.private {
            return None;
        }
        let (_, other) = self.entity.private_participants()?;
        Some(self.entity.sibling(other))
    }
}

impl Mergeable for Chat {
    type Key = Entity;

    fn merge_key(&self) -> Entity {
        self.entity.clone()
    }

    // The sync marker is local bookkeeping and never comes from a realm.
    fn same_content(&self, other: &Self) -> bool {
        self.private == other.private && self.title == other.title
    }
}

// ---------------------------------------------------------------------------
// ApiChat
// ---------------------------------------------------------------------------

/// A chat as reported by a realm, together with its participants and any
/// messages delivered alongside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiChat {
    pub chat: Chat,
    #[serde(default)]
    pub participants: Vec<User>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ApiChat {
    pub fn new_empty(chat: Chat, participants: Vec<User>) -> Self {
        Self {
            chat,
            participants,
            messages: Vec::new(),
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.chat.entity
    }

    /// Copy of this chat under a different identity; bundled messages are
    /// re-pointed at the new chat.
    pub fn with_entity(self, entity: Entity) -> Self {
        let messages = self
            .messages
            .into_iter()
            .map(|m| m.with_chat(entity.clone()))
            .collect();
        Self {
            chat: self.chat.with_entity(entity),
            participants: self.participants,
            messages,
        }
    }

    pub fn participants_except(&self, user: &Entity) -> Vec<&User> {
        self.participants
            .iter()
            .filter(|p| &p.entity != user)
            .collect()
    }
}

impl Mergeable for ApiChat {
    type Key = Entity;

    fn merge_key(&self) -> Entity {
        self.chat.entity.clone()
    }

    fn same_content(&self, other: &Self) -> bool {
        let ours: HashSet<&Entity> = self.participants.iter().map(|p| &p.entity).collect();
        let theirs: HashSet<&Entity> = other.participants.iter().map(|p| &p.entity).collect();
        self.chat.same_content(&other.chat) && ours == theirs
    }
}

// ---------------------------------------------------------------------------
// ChatMessage
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub entity: Entity,
    /// The chat this message belongs to.
    pub chat: Entity,
    pub author: Entity,
    /// Set for private messages.
    #[serde(default)]
    pub recipient: Option<Entity>,
    pub body: String,
    /// When the message was sent (as reported by the realm).
    pub send_time: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub private: bool,
}

impl ChatMessage {
    /// Copy of this message marked as read.
    pub fn as_read(mut self) -> Self {
        self.read = true;
        self
    }

    /// Copy of this message attached to another chat.
    pub fn with_chat(mut self, chat: Entity) -> Self {
        self.chat = chat;
        self
    }

    /// The participant of a private message that is not `me`.
    pub fn second_user(&self, me: &Entity) -> Option<&Entity> {
        if &self.author == me {
            self.recipient.as_ref()
        } else if self.recipient.as_ref() == Some(me) {
            Some(&self.author)
        } else {
            None
        }
    }

    /// Later in [`ChatMessage::chronological`] order. Equal send times are
    /// decided by id, as the store does when picking the last message.
    pub fn is_newer_than(&self, other: &ChatMessage) -> bool {
        Self::chronological(self, other) == Ordering::Greater
    }

    /// Total order used everywhere messages are sorted: send time, then id.
    pub fn chronological(a: &ChatMessage, b: &ChatMessage) -> Ordering {
        a.send_time
            .cmp(&b.send_time)
            .then_with(|| a.entity.local_id().cmp(b.entity.local_id()))
    }
}

impl Mergeable for ChatMessage {
    type Key = Entity;

    fn merge_key(&self) -> Entity {
        self.entity.clone()
    }

    // The read flag is local state; a realm re-delivering a window must not
    // count as a change.
    fn same_content(&self, other: &Self) -> bool {
        self.chat == other.chat
            && self.author == other.author
            && self.recipient == other.recipient
            && self.body == other.body
            && self.send_time == other.send_time
            && self.private == other.private
    }
}

/// The newest message of a batch, or `None` for an empty batch.
pub fn newest_message<'a, I>(messages: I) -> Option<&'a ChatMessage>
where
    I: IntoIterator<Item = &'a ChatMessage>,
{
    messages
        .into_iter()
        .max_by(|a, b| ChatMessage::chronological(a, b))
}

/// Compare two optional last messages so that the latest one sorts first and
/// a missing message sorts last.
pub fn compare_latest_first(a: Option<&ChatMessage>, b: Option<&ChatMessage>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => ChatMessage::chronological(b, a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
