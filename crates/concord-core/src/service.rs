//! The synchronization service: drives realms, merges their answers into the
//! store and keeps caches and listeners informed.
//!
//! Locking discipline:
//! - one persistence lock (the store mutex) serializes every
//!   read-merge-write sequence across the process;
//! - each cache has its own lock, never held while the persistence lock is
//!   taken;
//! - realm calls happen with neither held;
//! - a per-realm read/write guard lets [`SyncService::remove_realm_data`]
//!   wait for in-flight syncs of the same realm without blocking other
//!   realms.
//!
//! Events are emitted only after the write they describe committed, and
//! before the persistence lock is released, so caches and listeners see
//! writes in commit order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use chrono::{DateTime, SubsecRound, Utc};
use concord_shared::{
    compare_latest_first, ApiChat, Chat, ChatMessage, Entity, MergeResult, User,
};
use concord_store::{ChatStore, MessageWindow, StoreError};
use tracing::{debug, error, info, warn};

use crate::cache::ChatCaches;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{ChatEvent, EventBus, EventKind, ListenerId};
use crate::realm::{Realm, RealmError, RealmRegistry};

pub struct SyncService {
    store: Mutex<Box<dyn ChatStore>>,
    realms: RealmRegistry,
    caches: ChatCaches,
    bus: EventBus,
    realm_guards: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl SyncService {
    pub fn new(store: Box<dyn ChatStore>, config: &SyncConfig) -> SyncResult<Self> {
        let bus = EventBus::new(&config.event_thread_name, config.slow_listener_threshold)
            .map_err(SyncError::EventDispatch)?;

        Ok(Self {
            store: Mutex::new(store),
            realms: RealmRegistry::new(),
            caches: ChatCaches::new(),
            bus,
            realm_guards: Mutex::new(HashMap::new()),
        })
    }

    pub fn realms(&self) -> &RealmRegistry {
        &self.realms
    }

    pub fn register_realm(&self, realm: Arc<dyn Realm>) {
        self.realms.register(realm);
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&self, kinds: &[EventKind], listener: F) -> ListenerId
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kinds, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Wait until listeners have seen every event emitted so far.
    pub fn flush_events(&self) {
        self.bus.flush();
    }

    /// Bring the caches up to date, then queue the event followed by
    /// whatever the caches derived from it.
    fn emit(&self, events: Vec<ChatEvent>) {
        for event in events {
            let derived = self.caches.apply(&event);
            self.bus.publish(event);
            for event in derived {
                self.caches.apply(&event);
                self.bus.publish(event);
            }
        }
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    fn store(&self) -> SyncResult<MutexGuard<'_, Box<dyn ChatStore>>> {
        self.store.lock().map_err(|_| SyncError::LockPoisoned)
    }

    fn realm_guard(&self, realm_id: &str) -> Arc<RwLock<()>> {
        let mut guards = self
            .realm_guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(guards.entry(realm_id.to_string()).or_default())
    }

    fn realm(&self, entity: &Entity) -> SyncResult<Arc<dyn Realm>> {
        self.realms.for_entity(entity)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get_chat_by_id(&self, chat: &Entity) -> SyncResult<Option<Chat>> {
        self.caches.chats.get_or_load(chat, || -> SyncResult<Option<Chat>> {
            Ok(self.store()?.load_chat_by_id(chat)?)
        })
    }

    /// Participants in the order the realm reported them.
    pub fn get_participants(&self, chat: &Entity) -> SyncResult<Vec<User>> {
        let participants = self.caches.participants.get_or_load(chat, || -> SyncResult<_> {
            let participants = self.store()?.load_participants(chat)?;
            Ok((!participants.is_empty()).then_some(participants))
        })?;
        Ok(participants.unwrap_or_default())
    }

    pub fn get_participants_except(&self, chat: &Entity, user: &Entity) -> SyncResult<Vec<User>> {
        let mut participants = self.get_participants(chat)?;
        participants.retain(|p| &p.entity != user);
        Ok(participants)
    }

    /// The other participant of a private chat.
    pub fn get_second_user(&self, chat: &Chat) -> Option<Entity> {
        chat.second_user()
    }

    pub fn get_last_message(&self, chat: &Entity) -> SyncResult<Option<ChatMessage>> {
        self.caches.last_messages.get_or_load(chat, || -> SyncResult<Option<ChatMessage>> {
            Ok(self.store()?.load_last_message(chat)?)
        })
    }

    pub fn get_unread_count(&self, chat: &Entity) -> SyncResult<usize> {
        Ok(self.store()?.unread_count(chat)?)
    }

    /// Unread counts of every chat with unread messages.
    pub fn get_unread_chats(&self) -> SyncResult<HashMap<Entity, usize>> {
        Ok(self.store()?.unread_chats()?)
    }

    pub fn load_user_chats(&self, user: &Entity) -> SyncResult<Vec<Chat>> {
        Ok(self.store()?.read_all_chats(user)?)
    }

    /// Order chats by their last message, latest first. Chats without
    /// messages go last.
    pub fn sort_by_last_message(&self, chats: Vec<Chat>) -> SyncResult<Vec<Chat>> {
        let mut keyed = Vec::with_capacity(chats.len());
        for chat in chats {
            let last = self.get_last_message(&chat.entity)?;
            keyed.push((chat, last));
        }
        keyed.sort_by(|(_, a), (_, b)| compare_latest_first(a.as_ref(), b.as_ref()));
        Ok(keyed.into_iter().map(|(chat, _)| chat).collect())
    }

    // ------------------------------------------------------------------
    // Message sync
    // ------------------------------------------------------------------

    /// Fetch every message of `user`'s account and merge it into its chat.
    ///
    /// Private messages are grouped by the private chat derived from their
    /// two participants, which is created first if needed. Group messages go
    /// into the chat they reference if it is known locally.
    pub fn sync_all_messages(&self, user: &Entity) -> SyncResult<Vec<ChatMessage>> {
        let realm = self.realm(user)?;
        let guard = self.realm_guard(user.realm_id());
        let _in_flight = read_guard(&guard)?;

        let started_at = sync_timestamp();
        let messages = realm
            .fetch_all_messages(user.backend_id())
            .map_err(|e| backend_error(realm.as_ref(), e))?;

        let mut order: Vec<Entity> = Vec::new();
        let mut groups: HashMap<Entity, (Chat, Vec<ChatMessage>)> = HashMap::new();

        for message in &messages {
            let chat = if message.private {
                let Some(other) = message.second_user(user) else {
                    warn!(message = %message.entity, "private message without a second participant");
                    continue;
                };
                self.private_chat(realm.as_ref(), user, other)?
            } else {
                match self.get_chat_by_id(&message.chat)? {
                    Some(chat) => chat,
                    None => {
                        debug!(
                            message = %message.entity,
                            chat = %message.chat,
                            "skipping group message for unknown chat"
                        );
                        continue;
                    }
                }
            };

            let key = chat.entity.clone();
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    (chat, Vec::new())
                })
                .1
                .push(message.clone());
        }

        for key in order {
            if let Some((chat, batch)) = groups.remove(&key) {
                self.merge_messages(&chat, &batch, Some(started_at))?;
            }
        }

        info!(user = %user, fetched = messages.len(), "synced all messages");
        Ok(messages)
    }

    /// Fetch the messages of `chat` newer than its sync marker, merge them
    /// and advance the marker in the same write. The new marker is the time
    /// the fetch started, so nothing sent during the fetch is skipped next
    /// time.
    pub fn sync_newer_messages(&self, chat: &Entity) -> SyncResult<Vec<ChatMessage>> {
        let realm = self.realm(chat)?;
        let guard = self.realm_guard(chat.realm_id());
        let _in_flight = read_guard(&guard)?;

        let stored = self.require_chat(chat)?;
        let started_at = sync_timestamp();
        let messages = realm
            .fetch_newer_messages(
                stored.entity.backend_id(),
                realm.user().entity.backend_id(),
                stored.last_messages_sync,
            )
            .map_err(|e| backend_error(realm.as_ref(), e))?;

        self.merge_messages(&stored, &messages, Some(started_at))?;

        debug!(chat = %chat, fetched = messages.len(), "synced newer messages");
        Ok(messages)
    }

    pub fn sync_chat(&self, chat: &Entity) -> SyncResult<Vec<ChatMessage>> {
        self.sync_newer_messages(chat)
    }

    /// Fetch the page of messages preceding the ones already known. The
    /// number of known messages is the page offset; the marker stays put.
    pub fn sync_older_messages(&self, chat: &Entity, user: &Entity) -> SyncResult<Vec<ChatMessage>> {
        let realm = self.realm(user)?;
        let guard = self.realm_guard(chat.realm_id());
        let _in_flight = read_guard(&guard)?;

        let stored = self.require_chat(chat)?;
        let offset = self.store()?.count_messages(chat)?;
        let messages = realm
            .fetch_older_messages(stored.entity.backend_id(), user.backend_id(), offset)
            .map_err(|e| backend_error(realm.as_ref(), e))?;

        self.merge_messages(&stored, &messages, None)?;

        debug!(chat = %chat, offset, fetched = messages.len(), "synced older messages");
        Ok(messages)
    }

    /// Merge messages delivered outside a sync (e.g. pushed by the backend)
    /// into a known chat, optionally moving its sync marker to now.
    pub fn save_chat_messages(
        &self,
        chat: &Entity,
        messages: &[ChatMessage],
        update_sync_marker: bool,
    ) -> SyncResult<MergeResult<ChatMessage, Entity>> {
        let guard = self.realm_guard(chat.realm_id());
        let _in_flight = read_guard(&guard)?;

        let stored = self.require_chat(chat)?;
        let marker = update_sync_marker.then(sync_timestamp);
        self.merge_messages(&stored, messages, marker)
    }

    pub fn save_chat_message(
        &self,
        chat: &Entity,
        message: ChatMessage,
    ) -> SyncResult<MergeResult<ChatMessage, Entity>> {
        self.save_chat_messages(chat, &[message], false)
    }

    fn require_chat(&self, chat: &Entity) -> SyncResult<Chat> {
        self.get_chat_by_id(chat)?.ok_or_else(|| {
            error!(chat = %chat, "no chat found for message merge");
            SyncError::ChatNotFound(chat.clone())
        })
    }

    /// Merge one window into `chat` and emit, under the persistence lock.
    fn merge_messages(
        &self,
        chat: &Chat,
        messages: &[ChatMessage],
        advance_marker_to: Option<DateTime<Utc>>,
    ) -> SyncResult<MergeResult<ChatMessage, Entity>> {
        let rebound: Vec<ChatMessage> = messages
            .iter()
            .map(|m| m.clone().with_chat(chat.entity.clone()))
            .collect();

        let mut window = MessageWindow::new(&rebound);
        if let Some(at) = advance_marker_to {
            window = window.advancing_marker_to(at);
        }

        let mut store = self.store()?;

        // Cache the current last message first so that an older window merged
        // into an uncached chat is not mistaken for the newest one.
        self.caches
            .last_messages
            .get_or_load(&chat.entity, || store.load_last_message(&chat.entity))?;

        let result = store
            .merge_messages(&chat.entity, window)
            .map_err(|e| match e {
                StoreError::NotFound => SyncError::ChatNotFound(chat.entity.clone()),
                other => SyncError::Store(other),
            })?;

        let mut events = Vec::new();
        if advance_marker_to.is_some() {
            // `chat` may predate a write that landed during the fetch.
            match store.load_chat_by_id(&chat.entity) {
                Ok(Some(stored)) => events.push(ChatEvent::ChatChanged(stored)),
                Ok(None) => {
                    self.caches.chats.evict(&chat.entity);
                }
                Err(e) => {
                    warn!(chat = %chat.entity, error = %e, "reloading synced chat failed");
                    self.caches.chats.evict(&chat.entity);
                }
            }
        }
        events.extend(message_events(&chat.entity, &result));
        self.emit(events);

        Ok(result)
    }

    // ------------------------------------------------------------------
    // Private chats
    // ------------------------------------------------------------------

    /// The private chat between `me` and `other`, created through the realm
    /// if it does not exist yet.
    pub fn get_or_create_private_chat(&self, me: &Entity, other: &Entity) -> SyncResult<Chat> {
        let realm = self.realm(me)?;
        let guard = self.realm_guard(me.realm_id());
        let _in_flight = read_guard(&guard)?;

        self.private_chat(realm.as_ref(), me, other)
    }

    fn private_chat(&self, realm: &dyn Realm, me: &Entity, other: &Entity) -> SyncResult<Chat> {
        let derived = Entity::private_chat_id(me, other)?;
        if let Some(chat) = self.get_chat_by_id(&derived)? {
            return Ok(chat);
        }

        let created = realm
            .create_private_chat(&derived, me.backend_id(), other.backend_id())
            .map_err(|e| backend_error(realm, e))?;
        let chat = prepare_private_chat(created, &derived);

        let mut store = self.store()?;

        // Another thread may have created it while the realm was busy.
        if let Some(existing) = store.load_chat_by_id(&derived)? {
            self.caches.chats.insert(derived, existing.clone());
            return Ok(existing);
        }

        let mut participants = Vec::with_capacity(2);
        for user in [me, other] {
            let known = store.load_user(user)?;
            participants.push(known.unwrap_or_else(|| User::new_empty(user.clone())));
        }

        let api_chat = ApiChat::new_empty(chat, participants.clone());
        let result = store.merge_user_chats(me, &[api_chat.clone()], false)?;
        let saved = result
            .first_saved()
            .map(|saved| saved.chat.clone())
            .unwrap_or(api_chat.chat);
        let chat = store.load_chat_by_id(&derived)?.unwrap_or(saved);

        info!(chat = %chat.entity, backend_id = %chat.entity.backend_id(), "created private chat");

        let mut events = vec![ChatEvent::ChatChanged(chat.clone())];
        events.extend(participants.into_iter().map(|participant| {
            ChatEvent::ParticipantAdded {
                chat: chat.entity.clone(),
                participant,
            }
        }));
        self.emit(events);

        Ok(chat)
    }

    // ------------------------------------------------------------------
    // Chat roster
    // ------------------------------------------------------------------

    /// Reconcile the full chat list a realm reports for `user`. Stored chats
    /// of the user missing from `chats` are deleted.
    pub fn merge_chats(
        &self,
        user: &Entity,
        chats: Vec<ApiChat>,
    ) -> SyncResult<MergeResult<ApiChat, Entity>> {
        self.merge_user_chats(user, chats, true)
    }

    /// Merge a single chat without touching the others. Returns the chat
    /// under the id it is stored with.
    pub fn save_chat(&self, user: &Entity, chat: ApiChat) -> SyncResult<ApiChat> {
        let result = self.merge_user_chats(user, vec![chat.clone()], false)?;
        Ok(result
            .first_saved()
            .or_else(|| result.unchanged.first())
            .cloned()
            .unwrap_or(chat))
    }

    fn merge_user_chats(
        &self,
        user: &Entity,
        chats: Vec<ApiChat>,
        delete_missing: bool,
    ) -> SyncResult<MergeResult<ApiChat, Entity>> {
        let realm = self.realm(user)?;
        let guard = self.realm_guard(user.realm_id());
        let _in_flight = read_guard(&guard)?;

        // Bundled messages are merged per chat after the roster, so that each
        // batch yields its own message events.
        let mut bundled: Vec<(Entity, Vec<ChatMessage>)> = Vec::new();
        let mut prepared: Vec<ApiChat> = Vec::with_capacity(chats.len());
        let mut positions: HashMap<Entity, usize> = HashMap::new();
        for chat in chats {
            let mut chat = prepare_chat(realm.as_ref(), chat)?;
            let key = chat.entity().clone();
            let messages: Vec<ChatMessage> = std::mem::take(&mut chat.messages)
                .into_iter()
                .map(|m| m.with_chat(key.clone()))
                .collect();

            if !messages.is_empty() {
                match bundled.iter_mut().find(|(entity, _)| *entity == key) {
                    Some((_, batch)) => batch.extend(messages),
                    None => bundled.push((key.clone(), messages)),
                }
            }

            // Two backend rooms may collapse onto one private chat; the last
            // one reported wins.
            match positions.get(&key) {
                Some(&at) => {
                    debug!(
                        chat = %key,
                        dropped = %prepared[at].entity().backend_id(),
                        "duplicate chat in roster"
                    );
                    prepared[at] = chat;
                }
                None => {
                    positions.insert(key, prepared.len());
                    prepared.push(chat);
                }
            }
        }

        let mut store = self.store()?;

        for (chat, _) in &bundled {
            self.caches
                .last_messages
                .get_or_load(chat, || store.load_last_message(chat))?;
        }

        let outcome = merge_roster(&mut **store, user, &prepared, &bundled, delete_missing);
        let (result, events) = match outcome {
            Ok(merged) => merged,
            Err(e) => {
                // The roster may have committed before a bundled batch failed.
                for chat in &prepared {
                    self.caches.evict_chat(chat.entity());
                }
                return Err(e);
            }
        };

        info!(
            user = %user,
            added = result.added.len(),
            updated = result.updated.len(),
            removed = result.removed.len(),
            "merged chats"
        );

        self.emit(events);
        Ok(result)
    }

    /// Persist a chat. Fires `ChatChanged` only if something changed.
    pub fn update_chat(&self, chat: Chat) -> SyncResult<Chat> {
        let mut store = self.store()?;
        let changed = store.update_chat(&chat).map_err(|e| match e {
            StoreError::NotFound => SyncError::ChatNotFound(chat.entity.clone()),
            other => SyncError::Store(other),
        })?;

        if changed {
            self.emit(vec![ChatEvent::ChatChanged(chat.clone())]);
        }
        Ok(chat)
    }

    // ------------------------------------------------------------------
    // Read status and users
    // ------------------------------------------------------------------

    /// Mark a message read. Already-read messages cost nothing; otherwise
    /// one write, followed by `MessageChanged` and `MessageRead` if the
    /// stored flag actually flipped.
    pub fn mark_message_read(&self, chat: &Entity, message: &ChatMessage) -> SyncResult<bool> {
        if message.read {
            return Ok(false);
        }

        let mut store = self.store()?;
        let changed = store.change_read_status(&message.entity, true)?;
        if changed {
            let read = message.clone().as_read();
            self.emit(vec![
                ChatEvent::MessageChanged {
                    chat: chat.clone(),
                    message: read.clone(),
                },
                ChatEvent::MessageRead {
                    chat: chat.clone(),
                    message: read,
                },
            ]);
        }
        Ok(changed)
    }

    /// Announce a new unread count for a known chat.
    pub fn notify_unread_count_changed(&self, chat: &Entity, count: usize) -> SyncResult<()> {
        match self.get_chat_by_id(chat)? {
            Some(chat) => {
                self.emit(vec![ChatEvent::UnreadCountChanged {
                    chat: chat.entity,
                    count,
                }]);
            }
            None => debug!(chat = %chat, "unread count for unknown chat ignored"),
        }
        Ok(())
    }

    /// Store a user. Fires `UserChanged` with the stored user if anything
    /// changed.
    pub fn save_user(&self, user: &User) -> SyncResult<bool> {
        let mut store = self.store()?;
        if !store.save_user(user)? {
            return Ok(false);
        }
        let stored = store.load_user(&user.entity)?.unwrap_or_else(|| user.clone());

        self.emit(vec![ChatEvent::UserChanged(stored)]);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Realm removal
    // ------------------------------------------------------------------

    /// Delete everything stored and cached for a realm. Waits for in-flight
    /// operations on the same realm; other realms are not blocked.
    pub fn remove_realm_data(&self, realm_id: &str) -> SyncResult<usize> {
        let guard = self.realm_guard(realm_id);
        let _exclusive = guard.write().map_err(|_| SyncError::LockPoisoned)?;

        let mut store = self.store()?;
        let removed = store.delete_all_in_realm(realm_id)?;
        self.caches.remove_realm(realm_id);

        info!(realm = %realm_id, chats = removed, "removed realm data");
        Ok(removed)
    }
}

/// Merge the roster, then each chat's bundled messages, collecting the
/// events to emit once everything committed.
fn merge_roster(
    store: &mut dyn ChatStore,
    user: &Entity,
    prepared: &[ApiChat],
    bundled: &[(Entity, Vec<ChatMessage>)],
    delete_missing: bool,
) -> SyncResult<(MergeResult<ApiChat, Entity>, Vec<ChatEvent>)> {
    let mut previous: HashMap<Entity, Vec<User>> = HashMap::new();
    for chat in prepared {
        previous.insert(chat.entity().clone(), store.load_participants(chat.entity())?);
    }

    let result = store.merge_user_chats(user, prepared, delete_missing)?;
    let mut events = Vec::new();

    for added in &result.added {
        let stored = store
            .load_chat_by_id(added.entity())?
            .unwrap_or_else(|| added.chat.clone());
        events.push(ChatEvent::ChatChanged(stored));
        events.extend(added.participants.iter().map(|participant| {
            ChatEvent::ParticipantAdded {
                chat: added.entity().clone(),
                participant: participant.clone(),
            }
        }));
    }

    for updated in &result.updated {
        let stored = store
            .load_chat_by_id(updated.entity())?
            .unwrap_or_else(|| updated.chat.clone());
        events.push(ChatEvent::ChatChanged(stored));
        let before = previous.remove(updated.entity()).unwrap_or_default();
        events.extend(participant_diff(updated.entity(), &before, &updated.participants));
    }

    for removed in &result.removed {
        events.push(ChatEvent::ChatRemoved(removed.clone()));
    }

    for (chat, messages) in bundled {
        let merged = store.merge_messages(chat, MessageWindow::new(messages))?;
        events.extend(message_events(chat, &merged));
    }

    Ok((result, events))
}

/// Stored timestamps keep microseconds; markers are cut to match so the
/// cached chat and the stored one agree.
fn sync_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn read_guard(lock: &RwLock<()>) -> SyncResult<RwLockReadGuard<'_, ()>> {
    lock.read().map_err(|_| SyncError::LockPoisoned)
}

fn backend_error(realm: &dyn Realm, source: RealmError) -> SyncError {
    warn!(realm = %realm.id(), error = %source, "backend call failed");
    SyncError::BackendConnection {
        realm_id: realm.id().to_string(),
        source,
    }
}

/// Rename a realm-created private chat to its derived id, keeping the
/// realm's own id as backend id.
fn prepare_private_chat(chat: Chat, derived: &Entity) -> Chat {
    let backend_id = chat.entity.backend_id().to_string();
    Chat {
        private: true,
        ..chat.with_entity(derived.clone().with_backend_id(backend_id))
    }
}

/// Collapse a realm-reported private chat onto the id derived from its two
/// participants.
fn prepare_chat(realm: &dyn Realm, chat: ApiChat) -> SyncResult<ApiChat> {
    if !chat.chat.private {
        return Ok(chat);
    }

    let me = &realm.user().entity;
    let others = chat.participants_except(me);
    if others.len() != 1 {
        return Ok(chat);
    }

    let derived = Entity::private_chat_id(me, &others[0].entity)?;
    if derived.local_id() == chat.entity().local_id() {
        return Ok(chat);
    }

    let backend_id = chat.entity().backend_id().to_string();
    debug!(from = %chat.entity(), to = %derived, "renamed private chat to derived id");
    Ok(chat.with_entity(derived.with_backend_id(backend_id)))
}

fn message_events(chat: &Entity, result: &MergeResult<ChatMessage, Entity>) -> Vec<ChatEvent> {
    let mut events = Vec::new();

    match result.added.as_slice() {
        [] => {}
        [message] => events.push(ChatEvent::MessageAdded {
            chat: chat.clone(),
            message: message.clone(),
        }),
        messages => events.push(ChatEvent::MessageAddedBatch {
            chat: chat.clone(),
            messages: messages.to_vec(),
        }),
    }

    events.extend(result.updated.iter().map(|message| ChatEvent::MessageChanged {
        chat: chat.clone(),
        message: message.clone(),
    }));

    events
}

fn participant_diff(chat: &Entity, before: &[User], after: &[User]) -> Vec<ChatEvent> {
    let old: HashSet<&Entity> = before.iter().map(|u| &u.entity).collect();
    let new: HashSet<&Entity> = after.iter().map(|u| &u.entity).collect();

    let added = after
        .iter()
        .filter(|u| !old.contains(&u.entity))
        .map(|u| ChatEvent::ParticipantAdded {
            chat: chat.clone(),
            participant: u.clone(),
        });
    let removed = before
        .iter()
        .filter(|u| !new.contains(&u.entity))
        .map(|u| ChatEvent::ParticipantRemoved {
            chat: chat.clone(),
            participant: u.clone(),
        });

    added.chain(removed).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use chrono::TimeZone;
    use concord_store::Database;
    use tempfile::TempDir;

    use super::*;

    const REALM: &str = "xmpp";

    fn ent(realm: &str, local: &str) -> Entity {
        Entity::new(realm, format!("{realm}~0"), local)
    }

    fn e(local: &str) -> Entity {
        ent(REALM, local)
    }

    fn me() -> Entity {
        e("me")
    }

    fn msg(id: &str, author: &str, recipient: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            entity: e(id),
            chat: e("remote-chat"),
            author: e(author),
            recipient: Some(e(recipient)),
            body: format!("body of {id}"),
            send_time: Utc.timestamp_opt(secs, 0).unwrap(),
            read: false,
            private: true,
        }
    }

    // ------------------------------------------------------------------
    // Test realm
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct Calls {
        newer: Vec<(String, Option<DateTime<Utc>>)>,
        older: Vec<(String, String, usize)>,
        created: usize,
    }

    struct TestRealm {
        id: String,
        user: User,
        all: Mutex<Vec<ChatMessage>>,
        newer: Mutex<Vec<ChatMessage>>,
        older: Mutex<Vec<ChatMessage>>,
        create_delay: Duration,
        fetch_delay: Duration,
        offline: AtomicBool,
        calls: Mutex<Calls>,
    }

    impl TestRealm {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                user: User::new_empty(ent(id, "me")),
                all: Mutex::new(Vec::new()),
                newer: Mutex::new(Vec::new()),
                older: Mutex::new(Vec::new()),
                create_delay: Duration::ZERO,
                fetch_delay: Duration::ZERO,
                offline: AtomicBool::new(false),
                calls: Mutex::new(Calls::default()),
            }
        }

        fn with_create_delay(mut self, delay: Duration) -> Self {
            self.create_delay = delay;
            self
        }

        fn with_fetch_delay(mut self, delay: Duration) -> Self {
            self.fetch_delay = delay;
            self
        }

        fn serve_newer(&self, messages: Vec<ChatMessage>) {
            *self.newer.lock().unwrap() = messages;
        }

        fn check_online(&self) -> Result<(), RealmError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(RealmError::Connection("server unreachable".into()));
            }
            Ok(())
        }
    }

    impl Realm for TestRealm {
        fn id(&self) -> &str {
            &self.id
        }

        fn user(&self) -> &User {
            &self.user
        }

        fn fetch_all_messages(&self, _account: &str) -> Result<Vec<ChatMessage>, RealmError> {
            self.check_online()?;
            Ok(self.all.lock().unwrap().clone())
        }

        fn fetch_newer_messages(
            &self,
            chat: &str,
            _account: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<ChatMessage>, RealmError> {
            self.check_online()?;
            self.calls.lock().unwrap().newer.push((chat.to_string(), since));
            thread::sleep(self.fetch_delay);
            Ok(self.newer.lock().unwrap().clone())
        }

        fn fetch_older_messages(
            &self,
            chat: &str,
            account: &str,
            offset: usize,
        ) -> Result<Vec<ChatMessage>, RealmError> {
            self.check_online()?;
            self.calls
                .lock()
                .unwrap()
                .older
                .push((chat.to_string(), account.to_string(), offset));
            Ok(self.older.lock().unwrap().clone())
        }

        fn create_private_chat(
            &self,
            derived: &Entity,
            _user_a: &str,
            _user_b: &str,
        ) -> Result<Chat, RealmError> {
            self.check_online()?;
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.created += 1;
                calls.created
            };
            thread::sleep(self.create_delay);
            // The backend names rooms its own way.
            Ok(Chat::new_private(derived.sibling(format!("room-{n}"))))
        }
    }

    // ------------------------------------------------------------------
    // Test store
    // ------------------------------------------------------------------

    /// Counts read-status writes and can be told to fail message merges.
    struct TestStore {
        inner: Database,
        read_writes: Arc<AtomicUsize>,
        fail_merges: Arc<AtomicBool>,
    }

    impl ChatStore for TestStore {
        fn read_all_chats(&self, user: &Entity) -> concord_store::Result<Vec<Chat>> {
            self.inner.read_all_chats(user)
        }

        fn merge_user_chats(
            &mut self,
            user: &Entity,
            chats: &[ApiChat],
            delete_missing: bool,
        ) -> concord_store::Result<MergeResult<ApiChat, Entity>> {
            self.inner.merge_user_chats(user, chats, delete_missing)
        }

        fn load_chat_by_id(&self, chat: &Entity) -> concord_store::Result<Option<Chat>> {
            self.inner.load_chat_by_id(chat)
        }

        fn update_chat(&mut self, chat: &Chat) -> concord_store::Result<bool> {
            self.inner.update_chat(chat)
        }

        fn load_participants(&self, chat: &Entity) -> concord_store::Result<Vec<User>> {
            self.inner.load_participants(chat)
        }

        fn merge_messages(
            &mut self,
            chat: &Entity,
            window: MessageWindow<'_>,
        ) -> concord_store::Result<MergeResult<ChatMessage, Entity>> {
            if self.fail_merges.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.merge_messages(chat, window)
        }

        fn load_messages(&self, chat: &Entity) -> concord_store::Result<Vec<ChatMessage>> {
            self.inner.load_messages(chat)
        }

        fn count_messages(&self, chat: &Entity) -> concord_store::Result<usize> {
            self.inner.count_messages(chat)
        }

        fn load_last_message(&self, chat: &Entity) -> concord_store::Result<Option<ChatMessage>> {
            self.inner.load_last_message(chat)
        }

        fn change_read_status(&mut self, message: &Entity, read: bool) -> concord_store::Result<bool> {
            self.read_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.change_read_status(message, read)
        }

        fn unread_count(&self, chat: &Entity) -> concord_store::Result<usize> {
            self.inner.unread_count(chat)
        }

        fn unread_chats(&self) -> concord_store::Result<HashMap<Entity, usize>> {
            self.inner.unread_chats()
        }

        fn load_user(&self, user: &Entity) -> concord_store::Result<Option<User>> {
            self.inner.load_user(user)
        }

        fn save_user(&mut self, user: &User) -> concord_store::Result<bool> {
            ChatStore::save_user(&mut self.inner, user)
        }

        fn delete_all_in_realm(&mut self, realm_id: &str) -> concord_store::Result<usize> {
            self.inner.delete_all_in_realm(realm_id)
        }
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Harness {
        _dir: TempDir,
        service: SyncService,
        realm: Arc<TestRealm>,
        events: Arc<Mutex<Vec<ChatEvent>>>,
        read_writes: Arc<AtomicUsize>,
        fail_merges: Arc<AtomicBool>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_realm(TestRealm::new(REALM))
        }

        fn with_realm(realm: TestRealm) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let read_writes = Arc::new(AtomicUsize::new(0));
            let fail_merges = Arc::new(AtomicBool::new(false));
            let store = TestStore {
                inner: Database::open_at(&dir.path().join("concord.db")).unwrap(),
                read_writes: Arc::clone(&read_writes),
                fail_merges: Arc::clone(&fail_merges),
            };

            let service = SyncService::new(Box::new(store), &SyncConfig::default()).unwrap();
            let realm = Arc::new(realm);
            service.register_realm(realm.clone());

            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            service.subscribe(&EventKind::ALL, move |event| {
                sink.lock().unwrap().push(event.clone());
            });

            Self {
                _dir: dir,
                service,
                realm,
                events,
                read_writes,
                fail_merges,
            }
        }

        /// Events delivered since the last call.
        fn take_events(&self) -> Vec<ChatEvent> {
            self.service.flush_events();
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn chat_with(&self, other: &str) -> Chat {
            let chat = self
                .service
                .get_or_create_private_chat(&me(), &e(other))
                .unwrap();
            self.take_events();
            chat
        }

        fn count_messages(&self, chat: &Entity) -> usize {
            self.service.store().unwrap().count_messages(chat).unwrap()
        }
    }

    fn participants(ids: &[&str]) -> Vec<User> {
        ids.iter().map(|id| User::new_empty(e(id))).collect()
    }

    fn kinds(events: &[ChatEvent]) -> Vec<EventKind> {
        events.iter().map(ChatEvent::kind).collect()
    }

    fn last_message_changes(events: &[ChatEvent]) -> Vec<&ChatMessage> {
        events
            .iter()
            .filter_map(|event| match event {
                ChatEvent::LastMessageChanged { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Private chats
    // ------------------------------------------------------------------

    #[test]
    fn private_chat_is_created_once_under_the_derived_id() {
        let h = Harness::new();

        let chat = h.service.get_or_create_private_chat(&me(), &e("bob")).unwrap();

        assert_eq!(chat.entity, Entity::private_chat_id(&me(), &e("bob")).unwrap());
        assert_eq!(chat.entity.backend_id(), "room-1");
        assert!(chat.private);
        assert_eq!(
            kinds(&h.take_events()),
            vec![
                EventKind::ChatChanged,
                EventKind::ParticipantAdded,
                EventKind::ParticipantAdded
            ]
        );

        let again = h.service.get_or_create_private_chat(&me(), &e("bob")).unwrap();
        assert_eq!(again, chat);
        assert_eq!(h.realm.calls.lock().unwrap().created, 1);
        assert!(h.take_events().is_empty());

        let participants: Vec<Entity> = h
            .service
            .get_participants(&chat.entity)
            .unwrap()
            .into_iter()
            .map(|u| u.entity)
            .collect();
        assert_eq!(participants, vec![me(), e("bob")]);
        assert_eq!(h.service.get_second_user(&chat), Some(e("bob")));
        assert_eq!(
            h.service
                .get_participants_except(&chat.entity, &me())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn concurrent_creation_persists_one_chat() {
        let h = Harness::with_realm(
            TestRealm::new(REALM).with_create_delay(Duration::from_millis(50)),
        );
        let service = Arc::new(h.service);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let service = Arc::clone(&service);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    service.get_or_create_private_chat(&me(), &e("bob")).unwrap()
                })
            })
            .collect();

        let chats: Vec<Chat> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(chats[0].entity, chats[1].entity);
        assert_eq!(service.load_user_chats(&me()).unwrap().len(), 1);
    }

    #[test]
    fn chat_with_oneself_is_rejected() {
        let h = Harness::new();

        let err = h.service.get_or_create_private_chat(&me(), &me()).unwrap_err();

        assert!(matches!(err, SyncError::IdentityConflict { .. }));
        assert_eq!(h.realm.calls.lock().unwrap().created, 0);
        assert!(h.service.load_user_chats(&me()).unwrap().is_empty());
    }

    #[test]
    fn unregistered_realm_is_unsupported() {
        let h = Harness::new();
        let chat = ent("vk", "alice:bob");

        match h.service.sync_newer_messages(&chat) {
            Err(SyncError::UnsupportedBackend { realm_id }) => assert_eq!(realm_id, "vk"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Message sync
    // ------------------------------------------------------------------

    #[test]
    fn newer_batch_fires_one_last_message_change() {
        let h = Harness::new();
        let chat = h.chat_with("bob");
        h.realm
            .serve_newer(vec![msg("m1", "bob", "me", 10), msg("m2", "me", "bob", 20)]);

        h.service.sync_newer_messages(&chat.entity).unwrap();

        let events = h.take_events();
        let m2 = msg("m2", "me", "bob", 20).with_chat(chat.entity.clone());
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::ChatChanged,
                EventKind::MessageAddedBatch,
                EventKind::LastMessageChanged
            ]
        );
        assert_eq!(last_message_changes(&events), vec![&m2]);
        assert_eq!(h.service.get_last_message(&chat.entity).unwrap(), Some(m2));

        // Re-delivering an older message changes nothing.
        h.realm.serve_newer(vec![msg("m1", "bob", "me", 10)]);
        h.service.sync_newer_messages(&chat.entity).unwrap();
        assert_eq!(kinds(&h.take_events()), vec![EventKind::ChatChanged]);
    }

    #[test]
    fn newer_sync_advances_the_marker() {
        let h = Harness::new();
        let chat = h.chat_with("bob");
        assert!(chat.last_messages_sync.is_none());

        h.service.sync_chat(&chat.entity).unwrap();
        let marker = h
            .service
            .get_chat_by_id(&chat.entity)
            .unwrap()
            .unwrap()
            .last_messages_sync;
        assert!(marker.is_some());

        h.service.sync_newer_messages(&chat.entity).unwrap();

        let calls = h.realm.calls.lock().unwrap();
        assert_eq!(calls.newer[0], ("room-1".to_string(), None));
        assert_eq!(calls.newer[1], ("room-1".to_string(), marker));

        // The cached chat agrees with the stored one.
        let stored = h.service.load_user_chats(&me()).unwrap();
        assert_eq!(
            stored[0].last_messages_sync,
            h.service
                .get_chat_by_id(&chat.entity)
                .unwrap()
                .unwrap()
                .last_messages_sync
        );
    }

    #[test]
    fn older_sync_uses_known_message_count_as_offset() {
        let h = Harness::new();
        let chat = h.chat_with("bob");
        h.realm.serve_newer(
            (1..=5)
                .map(|i| msg(&format!("m{i}"), "bob", "me", i * 10))
                .collect(),
        );
        h.service.sync_newer_messages(&chat.entity).unwrap();
        let marker = h
            .service
            .get_chat_by_id(&chat.entity)
            .unwrap()
            .unwrap()
            .last_messages_sync;
        h.take_events();

        *h.realm.older.lock().unwrap() = vec![msg("m0", "bob", "me", 5)];
        h.service
            .sync_older_messages(&chat.entity, &me())
            .unwrap();

        assert_eq!(
            h.realm.calls.lock().unwrap().older,
            vec![("room-1".to_string(), "me".to_string(), 5)]
        );
        assert_eq!(h.count_messages(&chat.entity), 6);

        let events = h.take_events();
        assert_eq!(kinds(&events), vec![EventKind::MessageAdded]);
        assert_eq!(
            h.service
                .get_last_message(&chat.entity)
                .unwrap()
                .map(|m| m.entity),
            Some(e("m5"))
        );
        assert_eq!(
            h.service
                .get_chat_by_id(&chat.entity)
                .unwrap()
                .unwrap()
                .last_messages_sync,
            marker
        );
    }

    #[test]
    fn older_window_into_uncached_chat_keeps_the_last_message() {
        let h = Harness::new();
        let chat = h.chat_with("bob");
        h.realm.serve_newer(
            (1..=5)
                .map(|i| msg(&format!("m{i}"), "bob", "me", i * 10))
                .collect(),
        );
        h.service.sync_newer_messages(&chat.entity).unwrap();
        h.take_events();
        h.service.caches.last_messages.evict(&chat.entity);

        *h.realm.older.lock().unwrap() = vec![msg("m0", "bob", "me", 5)];
        h.service.sync_older_messages(&chat.entity, &me()).unwrap();

        assert_eq!(kinds(&h.take_events()), vec![EventKind::MessageAdded]);
        assert_eq!(
            h.service
                .get_last_message(&chat.entity)
                .unwrap()
                .map(|m| m.entity),
            Some(e("m5"))
        );
    }

    #[test]
    fn last_message_with_equal_send_time_matches_the_store() {
        let h = Harness::new();
        let chat = h.chat_with("bob");

        h.service
            .save_chat_message(&chat.entity, msg("m1", "bob", "me", 10))
            .unwrap();
        h.service
            .save_chat_message(&chat.entity, msg("m2", "bob", "me", 10))
            .unwrap();

        let cached = h.service.get_last_message(&chat.entity).unwrap();
        h.service.caches.last_messages.evict(&chat.entity);
        let reloaded = h.service.get_last_message(&chat.entity).unwrap();

        assert_eq!(cached.as_ref().map(|m| m.entity.clone()), Some(e("m2")));
        assert_eq!(cached, reloaded);
    }

    #[test]
    fn sync_all_groups_messages_by_private_chat() {
        let h = Harness::new();
        let team = ApiChat::new_empty(
            Chat::new_group(e("team"), "Team"),
            vec![User::new_empty(me()), User::new_empty(e("bob"))],
        );
        h.service.save_chat(&me(), team).unwrap();

        let mut known_group = msg("g1", "bob", "me", 30);
        known_group.private = false;
        known_group.recipient = None;
        known_group.chat = e("team");
        let mut unknown_group = msg("g2", "bob", "me", 40);
        unknown_group.private = false;
        unknown_group.chat = e("elsewhere");

        *h.realm.all.lock().unwrap() = vec![
            msg("m1", "bob", "me", 10),
            msg("m2", "me", "bob", 20),
            msg("m3", "carol", "me", 15),
            known_group,
            unknown_group,
        ];

        let fetched = h.service.sync_all_messages(&me()).unwrap();
        assert_eq!(fetched.len(), 5);

        let with_bob = Entity::private_chat_id(&me(), &e("bob")).unwrap();
        let with_carol = Entity::private_chat_id(&me(), &e("carol")).unwrap();

        assert_eq!(h.service.load_user_chats(&me()).unwrap().len(), 3);
        assert_eq!(h.count_messages(&with_bob), 2);
        assert_eq!(h.count_messages(&with_carol), 1);
        assert_eq!(h.count_messages(&e("team")), 1);
        assert_eq!(
            h.service
                .get_last_message(&with_bob)
                .unwrap()
                .map(|m| m.entity),
            Some(e("m2"))
        );
        assert_eq!(h.service.get_unread_count(&with_bob).unwrap(), 2);
        assert_eq!(h.service.get_unread_chats().unwrap().len(), 3);
    }

    #[test]
    fn single_pushed_message_is_a_message_added_event() {
        let h = Harness::new();
        let chat = h.chat_with("bob");

        h.service
            .save_chat_message(&chat.entity, msg("m1", "bob", "me", 10))
            .unwrap();

        assert_eq!(
            kinds(&h.take_events()),
            vec![EventKind::MessageAdded, EventKind::LastMessageChanged]
        );
    }

    #[test]
    fn messages_for_unknown_chat_are_rejected() {
        let h = Harness::new();
        let err = h
            .service
            .save_chat_messages(&e("me:nobody"), &[msg("m1", "nobody", "me", 10)], false)
            .unwrap_err();
        assert!(matches!(err, SyncError::ChatNotFound(_)));
    }

    // ------------------------------------------------------------------
    // Failures
    // ------------------------------------------------------------------

    #[test]
    fn failed_merge_commits_nothing_and_fires_nothing() {
        let h = Harness::new();
        let chat = h.chat_with("bob");
        h.realm.serve_newer(vec![msg("m1", "bob", "me", 10)]);
        h.fail_merges.store(true, Ordering::SeqCst);

        let err = h.service.sync_newer_messages(&chat.entity).unwrap_err();

        assert!(matches!(err, SyncError::Store(_)));
        assert!(h.take_events().is_empty());
        assert_eq!(h.count_messages(&chat.entity), 0);
        let cached = h.service.get_chat_by_id(&chat.entity).unwrap().unwrap();
        assert!(cached.last_messages_sync.is_none());
    }

    #[test]
    fn backend_failure_carries_the_realm_id() {
        let h = Harness::new();
        let chat = h.chat_with("bob");
        h.realm.offline.store(true, Ordering::SeqCst);

        match h.service.sync_newer_messages(&chat.entity) {
            Err(SyncError::BackendConnection { realm_id, source }) => {
                assert_eq!(realm_id, REALM);
                assert_eq!(source, RealmError::Connection("server unreachable".into()));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(h.take_events().is_empty());
    }

    // ------------------------------------------------------------------
    // Read status
    // ------------------------------------------------------------------

    #[test]
    fn mark_read_writes_once_and_fires_two_events() {
        let h = Harness::new();
        let chat = h.chat_with("bob");
        h.realm
            .serve_newer(vec![msg("m1", "bob", "me", 10), msg("m2", "bob", "me", 20)]);
        h.service.sync_newer_messages(&chat.entity).unwrap();
        h.take_events();

        let m1 = msg("m1", "bob", "me", 10).with_chat(chat.entity.clone());
        assert!(h.service.mark_message_read(&chat.entity, &m1).unwrap());

        assert_eq!(h.read_writes.load(Ordering::SeqCst), 1);
        assert_eq!(
            kinds(&h.take_events()),
            vec![EventKind::MessageChanged, EventKind::MessageRead]
        );
        assert_eq!(h.service.get_unread_count(&chat.entity).unwrap(), 1);

        // Already read: no write, no event.
        assert!(!h.service.mark_message_read(&chat.entity, &m1.as_read()).unwrap());
        assert_eq!(h.read_writes.load(Ordering::SeqCst), 1);
        assert!(h.take_events().is_empty());
    }

    #[test]
    fn marking_the_last_message_refreshes_it() {
        let h = Harness::new();
        let chat = h.chat_with("bob");
        h.realm.serve_newer(vec![msg("m1", "bob", "me", 10)]);
        h.service.sync_newer_messages(&chat.entity).unwrap();
        h.take_events();

        let m1 = h.service.get_last_message(&chat.entity).unwrap().unwrap();
        h.service.mark_message_read(&chat.entity, &m1).unwrap();

        assert_eq!(
            kinds(&h.take_events()),
            vec![
                EventKind::MessageChanged,
                EventKind::LastMessageChanged,
                EventKind::MessageRead
            ]
        );
        assert!(h.service.get_last_message(&chat.entity).unwrap().unwrap().read);
    }

    #[test]
    fn unread_count_notification_needs_a_known_chat() {
        let h = Harness::new();
        let chat = h.chat_with("bob");

        h.service.notify_unread_count_changed(&chat.entity, 3).unwrap();
        h.service.notify_unread_count_changed(&e("me:nobody"), 1).unwrap();

        assert_eq!(
            h.take_events(),
            vec![ChatEvent::UnreadCountChanged {
                chat: chat.entity,
                count: 3
            }]
        );
    }

    // ------------------------------------------------------------------
    // Roster
    // ------------------------------------------------------------------

    #[test]
    fn merge_chats_renames_private_chats_and_deletes_missing_ones() {
        let h = Harness::new();

        let private = ApiChat::new_empty(
            Chat::new_private(e("room-7")),
            participants(&["me", "bob"]),
        );
        let team = ApiChat::new_empty(
            Chat::new_group(e("team"), "Team"),
            participants(&["me", "bob", "carol"]),
        );

        let result = h.service.merge_chats(&me(), vec![private, team]).unwrap();
        assert_eq!(result.added.len(), 2);

        let with_bob = Entity::private_chat_id(&me(), &e("bob")).unwrap();
        let stored = h.service.get_chat_by_id(&with_bob).unwrap().unwrap();
        assert_eq!(stored.entity.backend_id(), "room-7");
        assert_eq!(h.service.get_participants(&e("team")).unwrap().len(), 3);
        h.take_events();

        let renamed = ApiChat::new_empty(
            Chat::new_group(e("team"), "Core team"),
            participants(&["me", "carol"]),
        );
        let result = h.service.merge_chats(&me(), vec![renamed]).unwrap();

        assert_eq!(result.updated.len(), 1);
        assert_eq!(result.removed, vec![with_bob.clone()]);
        assert_eq!(
            kinds(&h.take_events()),
            vec![
                EventKind::ChatChanged,
                EventKind::ParticipantRemoved,
                EventKind::ChatRemoved
            ]
        );

        // Caches followed the events.
        assert!(h.service.get_chat_by_id(&with_bob).unwrap().is_none());
        assert_eq!(
            h.service.get_chat_by_id(&e("team")).unwrap().unwrap().title.as_deref(),
            Some("Core team")
        );
        assert_eq!(
            h.service.get_participants(&e("team")).unwrap(),
            participants(&["me", "carol"])
        );
    }

    #[test]
    fn two_backend_rooms_collapse_onto_one_private_chat() {
        let h = Harness::new();
        let with_bob = Entity::private_chat_id(&me(), &e("bob")).unwrap();
        let room = |id: &str| {
            ApiChat::new_empty(Chat::new_private(e(id)), participants(&["me", "bob"]))
        };

        let result = h
            .service
            .merge_chats(&me(), vec![room("room-7"), room("room-9")])
            .unwrap();

        assert_eq!(result.added.len(), 1);
        assert_eq!(result.added[0].entity(), &with_bob);
        let stored = h.service.load_user_chats(&me()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].entity, with_bob);
        assert_eq!(stored[0].entity.backend_id(), "room-9");
    }

    #[test]
    fn saving_another_room_of_a_known_private_chat_keeps_one_chat() {
        let h = Harness::new();
        let with_bob = Entity::private_chat_id(&me(), &e("bob")).unwrap();

        for id in ["room-7", "room-9"] {
            let saved = h
                .service
                .save_chat(
                    &me(),
                    ApiChat::new_empty(Chat::new_private(e(id)), participants(&["me", "bob"])),
                )
                .unwrap();
            assert_eq!(saved.entity(), &with_bob);
        }

        let stored = h.service.load_user_chats(&me()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].entity, with_bob);
    }

    #[test]
    fn bundled_messages_are_merged_with_their_chat() {
        let h = Harness::new();
        let mut team = ApiChat::new_empty(
            Chat::new_group(e("team"), "Team"),
            vec![User::new_empty(me()), User::new_empty(e("bob"))],
        );
        team.messages = vec![msg("g1", "bob", "me", 10), msg("g2", "me", "bob", 20)];

        h.service.merge_chats(&me(), vec![team]).unwrap();

        assert_eq!(h.count_messages(&e("team")), 2);
        let events = h.take_events();
        assert!(kinds(&events).contains(&EventKind::MessageAddedBatch));
        assert_eq!(
            last_message_changes(&events)
                .into_iter()
                .map(|m| m.entity.clone())
                .collect::<Vec<_>>(),
            vec![e("g2")]
        );
    }

    #[test]
    fn update_chat_fires_only_on_change() {
        let h = Harness::new();
        let chat = h.chat_with("bob");

        h.service.update_chat(chat.clone()).unwrap();
        assert!(h.take_events().is_empty());

        let titled = Chat {
            title: Some("Bob".into()),
            ..chat
        };
        h.service.update_chat(titled.clone()).unwrap();
        assert_eq!(h.take_events(), vec![ChatEvent::ChatChanged(titled.clone())]);
        assert_eq!(
            h.service.get_chat_by_id(&titled.entity).unwrap(),
            Some(titled)
        );
    }

    #[test]
    fn chat_update_during_a_fetch_survives_the_sync() {
        let h = Harness::with_realm(
            TestRealm::new(REALM).with_fetch_delay(Duration::from_millis(200)),
        );
        let chat = h.chat_with("bob");
        let service = Arc::new(h.service);

        let syncing = {
            let service = Arc::clone(&service);
            let chat = chat.entity.clone();
            thread::spawn(move || service.sync_newer_messages(&chat))
        };
        thread::sleep(Duration::from_millis(50));
        let titled = Chat {
            title: Some("Bob".into()),
            ..chat.clone()
        };
        service.update_chat(titled).unwrap();
        syncing.join().unwrap().unwrap();

        let cached = service.get_chat_by_id(&chat.entity).unwrap().unwrap();
        let stored = service.load_user_chats(&me()).unwrap().remove(0);
        assert_eq!(cached.title.as_deref(), Some("Bob"));
        assert!(cached.last_messages_sync.is_some());
        assert_eq!(cached, stored);
    }

    #[test]
    fn saved_user_replaces_cached_participant() {
        let h = Harness::new();
        let chat = h.chat_with("bob");
        h.service.get_participants(&chat.entity).unwrap();

        let bob = User::new_empty(e("bob")).with_display_name("Bob");
        assert!(h.service.save_user(&bob).unwrap());
        assert!(!h.service.save_user(&bob).unwrap());

        assert_eq!(h.take_events(), vec![ChatEvent::UserChanged(bob.clone())]);
        assert!(h
            .service
            .get_participants(&chat.entity)
            .unwrap()
            .contains(&bob));
    }

    #[test]
    fn chats_sort_by_last_message() {
        let h = Harness::new();
        let bob = h.chat_with("bob");
        let carol = h.chat_with("carol");
        let dave = h.chat_with("dave");
        h.service
            .save_chat_message(&bob.entity, msg("m1", "bob", "me", 10))
            .unwrap();
        h.service
            .save_chat_message(&carol.entity, msg("m2", "carol", "me", 20))
            .unwrap();

        let sorted = h
            .service
            .sort_by_last_message(vec![dave.clone(), bob.clone(), carol.clone()])
            .unwrap();

        assert_eq!(sorted, vec![carol, bob, dave]);
    }

    // ------------------------------------------------------------------
    // Realm removal
    // ------------------------------------------------------------------

    #[test]
    fn removing_a_realm_purges_store_and_caches() {
        let h = Harness::new();
        h.service.register_realm(Arc::new(TestRealm::new("vk")));

        let xmpp_chat = h.chat_with("bob");
        let vk_chat = h
            .service
            .get_or_create_private_chat(&ent("vk", "me"), &ent("vk", "bob"))
            .unwrap();
        h.service
            .save_chat_message(&xmpp_chat.entity, msg("m1", "bob", "me", 10))
            .unwrap();

        assert_eq!(h.service.remove_realm_data(REALM).unwrap(), 1);

        assert!(h.service.get_chat_by_id(&xmpp_chat.entity).unwrap().is_none());
        assert!(h.service.get_last_message(&xmpp_chat.entity).unwrap().is_none());
        assert!(h.service.get_participants(&xmpp_chat.entity).unwrap().is_empty());
        assert_eq!(
            h.service.get_chat_by_id(&vk_chat.entity).unwrap(),
            Some(vk_chat)
        );
    }

    #[test]
    fn removal_waits_for_in_flight_sync_of_the_same_realm() {
        let h = Harness::with_realm(
            TestRealm::new(REALM).with_create_delay(Duration::from_millis(100)),
        );
        let service = Arc::new(h.service);

        let creating = {
            let service = Arc::clone(&service);
            thread::spawn(move || service.get_or_create_private_chat(&me(), &e("bob")))
        };
        // Let the creation enter the realm call.
        thread::sleep(Duration::from_millis(30));
        service.remove_realm_data(REALM).unwrap();

        let created = creating.join().unwrap().unwrap();
        // The purge ran after the creation committed.
        assert!(service.get_chat_by_id(&created.entity).unwrap().is_none());
    }

    #[test]
    fn removal_does_not_wait_for_other_realms() {
        let h = Harness::new();
        h.service.register_realm(Arc::new(
            TestRealm::new("vk").with_create_delay(Duration::from_millis(300)),
        ));
        let xmpp_chat = h.chat_with("bob");
        let service = Arc::new(h.service);

        let creating = {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                service.get_or_create_private_chat(&ent("vk", "me"), &ent("vk", "bob"))
            })
        };
        thread::sleep(Duration::from_millis(30));

        assert_eq!(service.remove_realm_data(REALM).unwrap(), 1);
        assert!(!creating.is_finished());
        assert!(service.get_chat_by_id(&xmpp_chat.entity).unwrap().is_none());

        let vk_chat = creating.join().unwrap().unwrap();
        assert_eq!(
            service.get_chat_by_id(&vk_chat.entity).unwrap(),
            Some(vk_chat)
        );
    }
}
