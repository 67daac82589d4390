//! CRUD operations for [`User`] records.

use concord_shared::{Entity, User};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::rows::{backend_id_value, entity_columns};

const USER_COLUMNS: &str = "realm_id, account_id, local_id, backend_id, display_name";

impl Database {
    /// Insert or update a user. Returns `true` if the stored row changed.
    pub fn save_user(&self, user: &User) -> Result<bool> {
        upsert_user(self.conn(), user)
    }

    pub fn get_user(&self, entity: &Entity) -> Result<Option<User>> {
        load_user(self.conn(), entity)
    }
}

/// A missing display name never erases a known one: realms frequently report
/// participants by id only.
pub(crate) fn upsert_user(conn: &Connection, user: &User) -> Result<bool> {
    let existing = load_user(conn, &user.entity)?;

    let display_name = user
        .display_name
        .clone()
        .or_else(|| existing.as_ref().and_then(|u| u.display_name.clone()));

    if let Some(existing) = &existing {
        if existing.display_name == display_name
            && existing.entity.backend_id() == user.entity.backend_id()
        {
            return Ok(false);
        }
    }

    conn.execute(
        "INSERT INTO users (id, realm_id, account_id, local_id, backend_id, display_name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
             backend_id = excluded.backend_id,
             display_name = excluded.display_name",
        params![
            user.entity.entity_id(),
            user.entity.realm_id(),
            user.entity.account_id(),
            user.entity.local_id(),
            backend_id_value(&user.entity),
            display_name,
        ],
    )?;
    Ok(true)
}

pub(crate) fn load_user(conn: &Connection, entity: &Entity) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![entity.entity_id()],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        entity: entity_columns(row, 0)?,
        display_name: row.get(4)?,
    })
}
