//! v001 -- Initial schema creation.
//!
//! Creates `users`, `chats`, `user_chats`, `chat_participants` and
//! `messages`. Every entity row carries its realm, account and local id as
//! separate columns next to the serialized id used as primary key, so a
//! whole realm can be purged with one indexed delete per table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- realm/account/local
    realm_id     TEXT NOT NULL,
    account_id   TEXT NOT NULL,
    local_id     TEXT NOT NULL,
    backend_id   TEXT,
    display_name TEXT
);

CREATE INDEX IF NOT EXISTS idx_users_realm ON users(realm_id);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id                 TEXT PRIMARY KEY NOT NULL,
    realm_id           TEXT NOT NULL,
    account_id         TEXT NOT NULL,
    local_id           TEXT NOT NULL,
    backend_id         TEXT,                  -- id assigned by the realm, if different
    private            INTEGER NOT NULL,      -- boolean 0/1
    title              TEXT,
    last_messages_sync TEXT                   -- RFC-3339, nullable
);

CREATE INDEX IF NOT EXISTS idx_chats_realm ON chats(realm_id);

-- ----------------------------------------------------------------
-- Chats of a user
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_chats (
    user_id TEXT NOT NULL,
    chat_id TEXT NOT NULL,

    PRIMARY KEY (user_id, chat_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Participants of a chat
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_participants (
    chat_id  TEXT NOT NULL,
    user_id  TEXT NOT NULL,
    position INTEGER NOT NULL,

    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,
    realm_id     TEXT NOT NULL,
    account_id   TEXT NOT NULL,
    local_id     TEXT NOT NULL,
    backend_id   TEXT,
    chat_id      TEXT NOT NULL,              -- FK -> chats(id)
    author_id    TEXT NOT NULL,              -- serialized entity id
    recipient_id TEXT,
    body         TEXT NOT NULL,
    send_time    TEXT NOT NULL,              -- RFC-3339, fixed precision
    read         INTEGER NOT NULL DEFAULT 0,
    private      INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_time
    ON messages(chat_id, send_time DESC);
CREATE INDEX IF NOT EXISTS idx_messages_realm ON messages(realm_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
