//! Lazily populated views over the store, kept coherent by events.
//!
//! Each cache owns its lock and never holds it across a load: a miss releases
//! the lock, runs the loader (which may take the persistence lock and block on
//! I/O), then re-acquires it to insert. Every mutation records the generation
//! at which it touched its key, so a load that raced with an event for the
//! same key does not overwrite the newer value. Loads of other keys are not
//! affected.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use concord_shared::{newest_message, Chat, ChatMessage, Entity, User};

use crate::events::ChatEvent;

struct CacheState<V> {
    entries: HashMap<Entity, V>,
    generation: u64,
    /// Generation of the last mutation of each key.
    touched: HashMap<Entity, u64>,
    /// Generation of the last mutation spanning every key.
    bulk: u64,
}

impl<V> CacheState<V> {
    fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn touch(&mut self, key: &Entity) {
        let generation = self.bump();
        self.touched.insert(key.clone(), generation);
    }

    fn touched_since(&self, key: &Entity, generation: u64) -> bool {
        self.bulk > generation || self.touched.get(key).is_some_and(|g| *g > generation)
    }
}

/// A map from entity to `V` guarded by its own lock.
pub struct EntityCache<V> {
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> EntityCache<V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                generation: 0,
                touched: HashMap::new(),
                bulk: 0,
            }),
        }
    }

    // The state is a plain map: a panic elsewhere cannot leave it half
    // updated, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(&self, key: &Entity, f: impl FnOnce(&mut HashMap<Entity, V>) -> R) -> R {
        let mut state = self.lock();
        state.touch(key);
        f(&mut state.entries)
    }

    fn mutate_all<R>(&self, f: impl FnOnce(&mut CacheState<V>) -> R) -> R {
        let mut state = self.lock();
        let generation = state.bump();
        state.bulk = generation;
        f(&mut *state)
    }

    pub fn get(&self, key: &Entity) -> Option<V> {
        self.lock().entries.get(key).cloned()
    }

    /// Return the cached value or load it. A `None` from the loader is not
    /// cached, so the next read tries again.
    pub fn get_or_load<E>(
        &self,
        key: &Entity,
        load: impl FnOnce() -> Result<Option<V>, E>,
    ) -> Result<Option<V>, E> {
        let generation = {
            let state = self.lock();
            if let Some(value) = state.entries.get(key) {
                return Ok(Some(value.clone()));
            }
            state.generation
        };

        let loaded = load()?;

        let mut state = self.lock();
        if let Some(current) = state.entries.get(key) {
            return Ok(Some(current.clone()));
        }
        if let Some(value) = &loaded {
            if !state.touched_since(key, generation) {
                state.entries.insert(key.clone(), value.clone());
            }
        }
        Ok(loaded)
    }

    pub fn insert(&self, key: Entity, value: V) {
        let mut state = self.lock();
        state.touch(&key);
        state.entries.insert(key, value);
    }

    /// Edit a cached value in place. No-op on a miss.
    pub fn update(&self, key: &Entity, f: impl FnOnce(&mut V)) -> bool {
        self.mutate(key, |entries| match entries.get_mut(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        })
    }

    /// Atomically decide the new value from the current one. `decide`
    /// returns `None` to leave the entry as is.
    pub fn replace_with(&self, key: &Entity, decide: impl FnOnce(Option<&V>) -> Option<V>) -> Option<V> {
        self.mutate(key, |entries| {
            let next = decide(entries.get(key))?;
            entries.insert(key.clone(), next.clone());
            Some(next)
        })
    }

    pub fn update_all(&self, mut f: impl FnMut(&mut V)) {
        self.mutate_all(|state| state.entries.values_mut().for_each(|value| f(value)));
    }

    pub fn evict(&self, key: &Entity) -> Option<V> {
        self.mutate(key, |entries| entries.remove(key))
    }

    /// Drop every entry whose key belongs to `realm_id`.
    pub fn remove_realm(&self, realm_id: &str) -> usize {
        self.mutate_all(|state| {
            let before = state.entries.len();
            state.entries.retain(|key, _| !key.belongs_to_realm(realm_id));
            state.touched.retain(|key, _| !key.belongs_to_realm(realm_id));
            before - state.entries.len()
        })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for EntityCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Chat caches
// ---------------------------------------------------------------------------

/// The three caches of the chat layer and the event rules keeping them
/// consistent with committed writes.
#[derive(Default)]
pub struct ChatCaches {
    pub chats: EntityCache<Chat>,
    /// Cached only once non-empty.
    pub participants: EntityCache<Vec<User>>,
    pub last_messages: EntityCache<ChatMessage>,
}

impl ChatCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a committed event. Returns the events derived from it, to be
    /// published right after it.
    pub fn apply(&self, event: &ChatEvent) -> Vec<ChatEvent> {
        let mut derived = Vec::new();

        match event {
            ChatEvent::ParticipantAdded { chat, participant } => {
                self.participants.update(chat, |list| {
                    if !list.iter().any(|p| p.entity == participant.entity) {
                        list.push(participant.clone());
                    }
                });
            }
            ChatEvent::ParticipantRemoved { chat, participant } => {
                self.participants
                    .update(chat, |list| list.retain(|p| p.entity != participant.entity));
            }
            ChatEvent::ChatChanged(chat) => {
                self.chats.insert(chat.entity.clone(), chat.clone());
            }
            ChatEvent::ChatRemoved(chat) => self.evict_chat(chat),
            ChatEvent::MessageAdded { chat, message } => {
                derived.extend(self.offer_last_message(chat, message));
            }
            ChatEvent::MessageAddedBatch { chat, messages } => {
                if let Some(newest) = newest_message(messages) {
                    derived.extend(self.offer_last_message(chat, newest));
                }
            }
            ChatEvent::MessageChanged { chat, message } => {
                let refreshed = self.last_messages.replace_with(chat, |cached| {
                    let cached = cached?;
                    (cached.entity == message.entity && cached != message).then(|| message.clone())
                });
                if let Some(message) = refreshed {
                    derived.push(ChatEvent::LastMessageChanged {
                        chat: chat.clone(),
                        message,
                    });
                }
            }
            ChatEvent::UserChanged(user) => {
                self.participants.update_all(|list| {
                    for participant in list.iter_mut() {
                        if participant.entity == user.entity {
                            *participant = user.clone();
                        }
                    }
                });
            }
            ChatEvent::MessageRead { .. }
            | ChatEvent::LastMessageChanged { .. }
            | ChatEvent::UnreadCountChanged { .. } => {}
        }

        derived
    }

    /// Replace the cached last message if `candidate` is newer, or if nothing
    /// is cached.
    fn offer_last_message(&self, chat: &Entity, candidate: &ChatMessage) -> Option<ChatEvent> {
        let replaced = self.last_messages.replace_with(chat, |cached| match cached {
            Some(cached) if !candidate.is_newer_than(cached) => None,
            _ => Some(candidate.clone()),
        })?;

        Some(ChatEvent::LastMessageChanged {
            chat: chat.clone(),
            message: replaced,
        })
    }

    /// Forget a chat in all three caches; the next read goes to the store.
    pub fn evict_chat(&self, chat: &Entity) {
        self.chats.evict(chat);
        self.participants.evict(chat);
        self.last_messages.evict(chat);
    }

    /// Drop everything cached for a realm.
    pub fn remove_realm(&self, realm_id: &str) {
        let chats = self.chats.remove_realm(realm_id);
        let participants = self.participants.remove_realm(realm_id);
        let last_messages = self.last_messages.remove_realm(realm_id);
        tracing::debug!(
            realm = %realm_id,
            chats,
            participants,
            last_messages,
            "evicted realm from caches"
        );
    }
}
