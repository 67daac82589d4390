//! CRUD and merge operations for [`Chat`] records, their participants and
//! the chats-of-a-user relation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use concord_shared::{merge, ApiChat, Chat, Entity, MergeResult, User};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages;
use crate::rows::{backend_id_value, entity_columns, format_ts, parse_ts};
use crate::users::{self, row_to_user};

const CHAT_COLUMNS: &str =
    "c.realm_id, c.account_id, c.local_id, c.backend_id, c.private, c.title, c.last_messages_sync";

impl Database {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single chat.
    pub fn get_chat(&self, chat: &Entity) -> Result<Option<Chat>> {
        load_chat(self.conn(), chat)
    }

    /// List the chats linked to `user`, ordered by local id.
    pub fn list_user_chats(&self, user: &Entity) -> Result<Vec<Chat>> {
        list_user_chats(self.conn(), user)
    }

    /// Participants of a chat in the order the realm reported them.
    pub fn get_participants(&self, chat: &Entity) -> Result<Vec<User>> {
        load_participants(self.conn(), chat)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Overwrite a stored chat, sync marker included. Returns `true` if the
    /// row changed.
    pub fn update_chat_row(&self, chat: &Chat) -> Result<bool> {
        let stored = load_chat(self.conn(), &chat.entity)?.ok_or(StoreError::NotFound)?;
        if stored == *chat && stored.entity.backend_id() == chat.entity.backend_id() {
            return Ok(false);
        }

        self.conn().execute(
            "UPDATE chats
             SET backend_id = ?2, private = ?3, title = ?4, last_messages_sync = ?5
             WHERE id = ?1",
            params![
                chat.entity.entity_id(),
                backend_id_value(&chat.entity),
                chat.private,
                chat.title,
                chat.last_messages_sync.as_ref().map(format_ts),
            ],
        )?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    /// Reconcile the chats a realm reports for `user` against the stored
    /// ones, in a single transaction.
    ///
    /// Added chats are inserted and linked to the user, updated chats get
    /// their properties and participant list replaced (the sync marker is
    /// kept), and with `delete_missing` every stored chat of the user that
    /// the realm no longer reports is deleted together with its messages.
    pub fn merge_chats_for_user(
        &mut self,
        user: &Entity,
        chats: &[ApiChat],
        delete_missing: bool,
    ) -> Result<MergeResult<ApiChat, Entity>> {
        let tx = self.conn_mut().transaction()?;

        let existing = load_user_api_chats(&tx, user)?;
        let result = merge(&existing, chats.iter().cloned(), delete_missing);

        for api_chat in &result.added {
            upsert_chat(&tx, &api_chat.chat)?;
            link_user_chat(&tx, user, &api_chat.chat.entity)?;
            replace_participants(&tx, &api_chat.chat.entity, &api_chat.participants)?;
            merge_bundled_messages(&tx, api_chat)?;
        }

        for api_chat in &result.updated {
            upsert_chat(&tx, &api_chat.chat)?;
            replace_participants(&tx, &api_chat.chat.entity, &api_chat.participants)?;
            merge_bundled_messages(&tx, api_chat)?;
        }

        for api_chat in &result.unchanged {
            merge_bundled_messages(&tx, api_chat)?;
        }

        for chat in &result.removed {
            tx.execute("DELETE FROM chats WHERE id = ?1", params![chat.entity_id()])?;
        }

        tx.commit()?;

        tracing::debug!(
            user = %user,
            added = result.added.len(),
            updated = result.updated.len(),
            removed = result.removed.len(),
            "merged user chats"
        );

        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

pub(crate) fn load_chat(conn: &Connection, chat: &Entity) -> Result<Option<Chat>> {
    let chat = conn
        .query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats c WHERE c.id = ?1"),
            params![chat.entity_id()],
            row_to_chat,
        )
        .optional()?;
    Ok(chat)
}

pub(crate) fn list_user_chats(conn: &Connection, user: &Entity) -> Result<Vec<Chat>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHAT_COLUMNS}
         FROM chats c
         JOIN user_chats uc ON uc.chat_id = c.id
         WHERE uc.user_id = ?1
         ORDER BY c.local_id ASC"
    ))?;

    let rows = stmt.query_map(params![user.entity_id()], row_to_chat)?;

    let mut chats = Vec::new();
    for row in rows {
        chats.push(row?);
    }
    Ok(chats)
}

/// Insert a chat, or update its realm-provided properties if it exists. The
/// sync marker is only written on insert.
pub(crate) fn upsert_chat(conn: &Connection, chat: &Chat) -> Result<()> {
    conn.execute(
        "INSERT INTO chats (id, realm_id, account_id, local_id, backend_id, private, title, last_messages_sync)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             backend_id = excluded.backend_id,
             private = excluded.private,
             title = excluded.title",
        params![
            chat.entity.entity_id(),
            chat.entity.realm_id(),
            chat.entity.account_id(),
            chat.entity.local_id(),
            backend_id_value(&chat.entity),
            chat.private,
            chat.title,
            chat.last_messages_sync.as_ref().map(format_ts),
        ],
    )?;
    Ok(())
}

pub(crate) fn set_sync_marker(conn: &Connection, chat: &Entity, at: &DateTime<Utc>) -> Result<()> {
    let affected = conn.execute(
        "UPDATE chats SET last_messages_sync = ?2 WHERE id = ?1",
        params![chat.entity_id(), format_ts(at)],
    )?;
    if affected == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

fn link_user_chat(conn: &Connection, user: &Entity, chat: &Entity) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO user_chats (user_id, chat_id) VALUES (?1, ?2)",
        params![user.entity_id(), chat.entity_id()],
    )?;
    Ok(())
}

pub(crate) fn load_participants(conn: &Connection, chat: &Entity) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(
        "SELECT u.realm_id, u.account_id, u.local_id, u.backend_id, u.display_name
         FROM chat_participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.chat_id = ?1
         ORDER BY p.position ASC",
    )?;

    let rows = stmt.query_map(params![chat.entity_id()], row_to_user)?;

    let mut users = Vec::new();
    for row in rows {
        users.push(row?);
    }
    Ok(users)
}

fn replace_participants(conn: &Connection, chat: &Entity, participants: &[User]) -> Result<()> {
    conn.execute(
        "DELETE FROM chat_participants WHERE chat_id = ?1",
        params![chat.entity_id()],
    )?;

    for (position, user) in participants.iter().enumerate() {
        users::upsert_user(conn, user)?;
        conn.execute(
            "INSERT OR IGNORE INTO chat_participants (chat_id, user_id, position)
             VALUES (?1, ?2, ?3)",
            params![chat.entity_id(), user.entity.entity_id(), position as i64],
        )?;
    }
    Ok(())
}

fn merge_bundled_messages(conn: &Connection, api_chat: &ApiChat) -> Result<()> {
    if api_chat.messages.is_empty() {
        return Ok(());
    }
    messages::merge_into(conn, &api_chat.chat.entity, &api_chat.messages, false)?;
    Ok(())
}

/// Stored chats of a user with their participants, keyed for merging.
fn load_user_api_chats(conn: &Connection, user: &Entity) -> Result<HashMap<Entity, ApiChat>> {
    let mut result = HashMap::new();
    for chat in list_user_chats(conn, user)? {
        let participants = load_participants(conn, &chat.entity)?;
        result.insert(chat.entity.clone(), ApiChat::new_empty(chat, participants));
    }
    Ok(result)
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let entity = entity_columns(row, 0)?;
    let private: bool = row.get(4)?;
    let title: Option<String> = row.get(5)?;
    let synced: Option<String> = row.get(6)?;

    let last_messages_sync = synced.map(|s| parse_ts(6, &s)).transpose()?;

    Ok(Chat {
        entity,
        private,
        title,
        last_messages_sync,
    })
}
