//! # concord-store
//!
//! Local storage for Concord, backed by SQLite.
//!
//! The crate defines [`ChatStore`], the persistence interface the
//! synchronization layer talks to, and implements it for [`Database`], a
//! synchronous handle wrapping a `rusqlite::Connection`. Merges run inside a
//! single transaction so a failure never leaves a half-applied delta.

pub mod chats;
pub mod dao;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod users;

mod error;
mod rows;

pub use dao::{ChatStore, MessageWindow};
pub use database::Database;
pub use error::{Result, StoreError};
