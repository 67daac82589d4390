use std::collections::HashMap;

use chrono::{DateTime, Utc};
use concord_shared::{merge, ChatMessage, Entity, MergeResult};
use rusqlite::{params, Connection, OptionalExtension};

use crate::chats;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::rows::{backend_id_value, entity_columns, entity_id_column, format_ts, parse_ts};

const MESSAGE_COLUMNS: &str = "realm_id, account_id, local_id, backend_id, chat_id, author_id, \
                               recipient_id, body, send_time, read, private";

impl Database {
    /// Merge a window of messages into `chat` and, if `synced_at` is set,
    /// move the chat's sync marker, all in one transaction.
    pub fn merge_chat_messages(
        &mut self,
        chat: &Entity,
        messages: &[ChatMessage],
        delete_missing: bool,
        synced_at: Option<&DateTime<Utc>>,
    ) -> Result<MergeResult<ChatMessage, Entity>> {
        let tx = self.conn_mut().transaction()?;

        if chats::load_chat(&tx, chat)?.is_none() {
            return Err(StoreError::NotFound);
        }

        let result = merge_into(&tx, chat, messages, delete_missing)?;

        if let Some(at) = synced_at {
            chats::set_sync_marker(&tx, chat, at)?;
        }

        tx.commit()?;
        Ok(result)
    }

    /// All messages of a chat, oldest first.
    pub fn get_messages_for_chat(&self, chat: &Entity) -> Result<Vec<ChatMessage>> {
        load_for_chat(self.conn(), chat)
    }

    pub fn count_messages_for_chat(&self, chat: &Entity) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
            params![chat.entity_id()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn get_last_message(&self, chat: &Entity) -> Result<Option<ChatMessage>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_id = ?1
                     ORDER BY send_time DESC, local_id DESC
                     LIMIT 1"
                ),
                params![chat.entity_id()],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Set the read flag of a message. Returns `true` only if the flag
    /// actually flipped.
    pub fn set_message_read(&self, message: &Entity, read: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET read = ?2 WHERE id = ?1 AND read != ?2",
            params![message.entity_id(), read],
        )?;
        Ok(affected > 0)
    }

    pub fn count_unread_for_chat(&self, chat: &Entity) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1 AND read = 0",
            params![chat.entity_id()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Unread counts of every chat that has at least one unread message.
    pub fn unread_counts(&self) -> Result<HashMap<Entity, usize>> {
        let mut stmt = self.conn().prepare(
            "SELECT chat_id, COUNT(*) FROM messages
             WHERE read = 0
             GROUP BY chat_id",
        )?;

        let rows = stmt.query_map([], |row| {
            let chat = entity_id_column(row, 0)?;
            let count: i64 = row.get(1)?;
            Ok((chat, count as usize))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (chat, count) = row?;
            counts.insert(chat, count);
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

/// Merge `incoming` against every stored message of `chat`.
///
/// A message stays read locally even if the realm re-delivers it unread;
/// the returned updated objects reflect the stored read flag.
pub(crate) fn merge_into(
    conn: &Connection,
    chat: &Entity,
    incoming: &[ChatMessage],
    delete_missing: bool,
) -> Result<MergeResult<ChatMessage, Entity>> {
    let existing: HashMap<Entity, ChatMessage> = load_for_chat(conn, chat)?
        .into_iter()
        .map(|m| (m.entity.clone(), m))
        .collect();

    let mut result = merge(&existing, incoming.iter().cloned(), delete_missing);

    for message in &mut result.updated {
        if existing.get(&message.entity).map_or(false, |m| m.read) {
            message.read = true;
        }
    }

    for message in result.added.iter().chain(result.updated.iter()) {
        upsert_message(conn, chat, message)?;
    }

    for removed in &result.removed {
        conn.execute(
            "DELETE FROM messages WHERE id = ?1",
            params![removed.entity_id()],
        )?;
    }

    tracing::debug!(
        chat = %chat,
        added = result.added.len(),
        updated = result.updated.len(),
        removed = result.removed.len(),
        "merged chat messages"
    );

    Ok(result)
}

fn upsert_message(conn: &Connection, chat: &Entity, message: &ChatMessage) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, realm_id, account_id, local_id, backend_id, chat_id,
                               author_id, recipient_id, body, send_time, read, private)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
             backend_id = excluded.backend_id,
             chat_id = excluded.chat_id,
             author_id = excluded.author_id,
             recipient_id = excluded.recipient_id,
             body = excluded.body,
             send_time = excluded.send_time,
             read = MAX(messages.read, excluded.read),
             private = excluded.private",
        params![
            message.entity.entity_id(),
            message.entity.realm_id(),
            message.entity.account_id(),
            message.entity.local_id(),
            backend_id_value(&message.entity),
            chat.entity_id(),
            message.author.entity_id(),
            message.recipient.as_ref().map(|r| r.entity_id()),
            message.body,
            format_ts(&message.send_time),
            message.read,
            message.private,
        ],
    )?;
    Ok(())
}

pub(crate) fn load_for_chat(conn: &Connection, chat: &Entity) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE chat_id = ?1
         ORDER BY send_time ASC, local_id ASC"
    ))?;

    let rows = stmt.query_map(params![chat.entity_id()], row_to_message)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let entity = entity_columns(row, 0)?;
    let chat = entity_id_column(row, 4)?;
    let author = entity_id_column(row, 5)?;
    let recipient = match row.get::<_, Option<String>>(6)? {
        Some(_) => Some(entity_id_column(row, 6)?),
        None => None,
    };
    let body: String = row.get(7)?;
    let ts_str: String = row.get(8)?;
    let read: bool = row.get(9)?;
    let private: bool = row.get(10)?;

    Ok(ChatMessage {
        entity,
        chat,
        author,
        recipient,
        body,
        send_time: parse_ts(8, &ts_str)?,
        read,
        private,
    })
}
