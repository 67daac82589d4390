//! # concord-shared
//!
//! Backend-agnostic building blocks shared by every Concord crate: the
//! [`Entity`] identity model, the persisted domain models and the merge
//! primitive used to reconcile backend state against local state.

pub mod constants;
pub mod entity;
pub mod error;
pub mod merge;
pub mod models;

pub use entity::Entity;
pub use error::EntityError;
pub use merge::{merge, merge_with, MergeResult, Mergeable};
pub use models::*;
