//! The persistence interface consumed by the synchronization layer.
//!
//! [`ChatStore`] is object safe so the service can hold a
//! `Box<dyn ChatStore>`; [`Database`] is the SQLite implementation.
//! Implementations are not expected to be internally synchronized: callers
//! serialize access behind one lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use concord_shared::{ApiChat, Chat, ChatMessage, Entity, MergeResult, User};

use crate::database::Database;
use crate::error::Result;

/// A slice of message history to merge into one chat.
#[derive(Debug, Clone, Copy)]
pub struct MessageWindow<'a> {
    pub messages: &'a [ChatMessage],
    /// Delete stored messages of the chat that are absent from `messages`.
    /// Windows fetched from a realm never set this.
    pub delete_missing: bool,
    /// Move the chat's sync marker in the same atomic write.
    pub advance_marker_to: Option<DateTime<Utc>>,
}

impl<'a> MessageWindow<'a> {
    pub fn new(messages: &'a [ChatMessage]) -> Self {
        Self {
            messages,
            delete_missing: false,
            advance_marker_to: None,
        }
    }

    pub fn advancing_marker_to(mut self, at: DateTime<Utc>) -> Self {
        self.advance_marker_to = Some(at);
        self
    }
}

pub trait ChatStore: Send {
    /// Chats linked to `user`.
    fn read_all_chats(&self, user: &Entity) -> Result<Vec<Chat>>;

    fn merge_user_chats(
        &mut self,
        user: &Entity,
        chats: &[ApiChat],
        delete_missing: bool,
    ) -> Result<MergeResult<ApiChat, Entity>>;

    fn load_chat_by_id(&self, chat: &Entity) -> Result<Option<Chat>>;

    /// Overwrite a stored chat. Returns `true` if anything changed.
    fn update_chat(&mut self, chat: &Chat) -> Result<bool>;

    fn load_participants(&self, chat: &Entity) -> Result<Vec<User>>;

    /// Merge a window of messages. Fails with [`crate::StoreError::NotFound`] if the
    /// chat is unknown; nothing is written in that case.
    fn merge_messages(
        &mut self,
        chat: &Entity,
        window: MessageWindow<'_>,
    ) -> Result<MergeResult<ChatMessage, Entity>>;

    /// Messages of a chat, oldest first.
    fn load_messages(&self, chat: &Entity) -> Result<Vec<ChatMessage>>;

    fn count_messages(&self, chat: &Entity) -> Result<usize>;

    fn load_last_message(&self, chat: &Entity) -> Result<Option<ChatMessage>>;

    /// Returns `true` only if the stored flag changed.
    fn change_read_status(&mut self, message: &Entity, read: bool) -> Result<bool>;

    fn unread_count(&self, chat: &Entity) -> Result<usize>;

    fn unread_chats(&self) -> Result<HashMap<Entity, usize>>;

    fn load_user(&self, user: &Entity) -> Result<Option<User>>;

    /// Returns `true` if the stored user changed.
    fn save_user(&mut self, user: &User) -> Result<bool>;

    /// Delete every user, chat and message of a realm. Returns the number of
    /// deleted chats.
    fn delete_all_in_realm(&mut self, realm_id: &str) -> Result<usize>;
}

impl ChatStore for Database {
    fn read_all_chats(&self, user: &Entity) -> Result<Vec<Chat>> {
        self.list_user_chats(user)
    }

    fn merge_user_chats(
        &mut self,
        user: &Entity,
        chats: &[ApiChat],
        delete_missing: bool,
    ) -> Result<MergeResult<ApiChat, Entity>> {
        self.merge_chats_for_user(user, chats, delete_missing)
    }

    fn load_chat_by_id(&self, chat: &Entity) -> Result<Option<Chat>> {
        self.get_chat(chat)
    }

    fn update_chat(&mut self, chat: &Chat) -> Result<bool> {
        self.update_chat_row(chat)
    }

    fn load_participants(&self, chat: &Entity) -> Result<Vec<User>> {
        self.get_participants(chat)
    }

    fn merge_messages(
        &mut self,
        chat: &Entity,
        window: MessageWindow<'_>,
    ) -> Result<MergeResult<ChatMessage, Entity>> {
        self.merge_chat_messages(
            chat,
            window.messages,
            window.delete_missing,
            window.advance_marker_to.as_ref(),
        )
    }

    fn load_messages(&self, chat: &Entity) -> Result<Vec<ChatMessage>> {
        self.get_messages_for_chat(chat)
    }

    fn count_messages(&self, chat: &Entity) -> Result<usize> {
        self.count_messages_for_chat(chat)
    }

    fn load_last_message(&self, chat: &Entity) -> Result<Option<ChatMessage>> {
        self.get_last_message(chat)
    }

    fn change_read_status(&mut self, message: &Entity, read: bool) -> Result<bool> {
        self.set_message_read(message, read)
    }

    fn unread_count(&self, chat: &Entity) -> Result<usize> {
        self.count_unread_for_chat(chat)
    }

    fn unread_chats(&self) -> Result<HashMap<Entity, usize>> {
        self.unread_counts()
    }

    fn load_user(&self, user: &Entity) -> Result<Option<User>> {
        self.get_user(user)
    }

    fn save_user(&mut self, user: &User) -> Result<bool> {
        Database::save_user(self, user)
    }

    fn delete_all_in_realm(&mut self, realm_id: &str) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;

        tx.execute("DELETE FROM messages WHERE realm_id = ?1", [realm_id])?;
        tx.execute(
            "DELETE FROM user_chats
             WHERE chat_id IN (SELECT id FROM chats WHERE realm_id = ?1)",
            [realm_id],
        )?;
        let chats = tx.execute("DELETE FROM chats WHERE realm_id = ?1", [realm_id])?;
        tx.execute("DELETE FROM users WHERE realm_id = ?1", [realm_id])?;

        tx.commit()?;

        tracing::info!(realm = %realm_id, chats, "deleted realm data");
        Ok(chats)
    }
}
