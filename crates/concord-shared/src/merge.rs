//! Reconciliation of an authoritative collection against a persisted
//! baseline.
//!
//! [`merge`] never mutates its inputs. It classifies every incoming object as
//! added, updated or unchanged, and (only when asked to) every baseline key
//! missing from the incoming collection as removed. Persisting the delta is
//! the caller's job.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// An object that can be reconciled by key.
pub trait Mergeable {
    type Key: Eq + Hash + Clone;

    fn merge_key(&self) -> Self::Key;

    /// Whether two objects with the same key carry the same content. This is
    /// deliberately narrower than `PartialEq`: local-only state is ignored.
    fn same_content(&self, other: &Self) -> bool;
}

/// Classified delta produced by [`merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult<T, K> {
    pub added: Vec<T>,
    pub updated: Vec<T>,
    pub removed: Vec<K>,
    pub unchanged: Vec<T>,
}

impl<T, K> Default for MergeResult<T, K> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

impl<T, K> MergeResult<T, K> {
    /// True if nothing needs to be written.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn changed_count(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// The first added object, else the first updated one.
    pub fn first_saved(&self) -> Option<&T> {
        self.added.first().or_else(|| self.updated.first())
    }
}

/// Merge using each type's own [`Mergeable::same_content`].
pub fn merge<T>(
    existing: &HashMap<T::Key, T>,
    incoming: impl IntoIterator<Item = T>,
    delete_missing: bool,
) -> MergeResult<T, T::Key>
where
    T: Mergeable,
{
    merge_with(existing, incoming, delete_missing, T::same_content)
}

/// Merge with an injected content-equality function.
///
/// Incoming objects are compared against the baseline only, so duplicate
/// keys inside `incoming` are classified independently.
pub fn merge_with<T, F>(
    existing: &HashMap<T::Key, T>,
    incoming: impl IntoIterator<Item = T>,
    delete_missing: bool,
    same: F,
) -> MergeResult<T, T::Key>
where
    T: Mergeable,
    F: Fn(&T, &T) -> bool,
{
    let mut result = MergeResult::default();
    let mut seen: HashSet<T::Key> = HashSet::new();

    for item in incoming {
        let key = item.merge_key();
        match existing.get(&key) {
            None => result.added.push(item),
            Some(old) if same(old, &item) => result.unchanged.push(item),
            Some(_) => result.updated.push(item),
        }
        seen.insert(key);
    }

    if delete_missing {
        result.removed = existing
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
    }

    result
}
