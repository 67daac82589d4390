//! Typed chat events and the bus delivering them.
//!
//! Listeners register for a set of [`EventKind`]s and are called on a
//! dedicated dispatch thread, one event at a time, in publish order. A slow
//! or panicking listener never reaches back into the publishing thread.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use concord_shared::{Chat, ChatMessage, Entity, User};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChatChanged,
    ChatRemoved,
    MessageAdded,
    MessageAddedBatch,
    MessageChanged,
    MessageRead,
    ParticipantAdded,
    ParticipantRemoved,
    LastMessageChanged,
    UnreadCountChanged,
    UserChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::ChatChanged,
        EventKind::ChatRemoved,
        EventKind::MessageAdded,
        EventKind::MessageAddedBatch,
        EventKind::MessageChanged,
        EventKind::MessageRead,
        EventKind::ParticipantAdded,
        EventKind::ParticipantRemoved,
        EventKind::LastMessageChanged,
        EventKind::UnreadCountChanged,
        EventKind::UserChanged,
    ];
}

/// A committed change. Every variant names its subject (a chat, or a user
/// for [`ChatEvent::UserChanged`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    ChatChanged(Chat),
    ChatRemoved(Entity),
    MessageAdded { chat: Entity, message: ChatMessage },
    MessageAddedBatch { chat: Entity, messages: Vec<ChatMessage> },
    MessageChanged { chat: Entity, message: ChatMessage },
    MessageRead { chat: Entity, message: ChatMessage },
    ParticipantAdded { chat: Entity, participant: User },
    ParticipantRemoved { chat: Entity, participant: User },
    /// Derived by the cache layer when a chat's newest message changes.
    LastMessageChanged { chat: Entity, message: ChatMessage },
    UnreadCountChanged { chat: Entity, count: usize },
    UserChanged(User),
}

impl ChatEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChatEvent::ChatChanged(_) => EventKind::ChatChanged,
            ChatEvent::ChatRemoved(_) => EventKind::ChatRemoved,
            ChatEvent::MessageAdded { .. } => EventKind::MessageAdded,
            ChatEvent::MessageAddedBatch { .. } => EventKind::MessageAddedBatch,
            ChatEvent::MessageChanged { .. } => EventKind::MessageChanged,
            ChatEvent::MessageRead { .. } => EventKind::MessageRead,
            ChatEvent::ParticipantAdded { .. } => EventKind::ParticipantAdded,
            ChatEvent::ParticipantRemoved { .. } => EventKind::ParticipantRemoved,
            ChatEvent::LastMessageChanged { .. } => EventKind::LastMessageChanged,
            ChatEvent::UnreadCountChanged { .. } => EventKind::UnreadCountChanged,
            ChatEvent::UserChanged(_) => EventKind::UserChanged,
        }
    }

    pub fn subject(&self) -> &Entity {
        match self {
            ChatEvent::ChatChanged(chat) => &chat.entity,
            ChatEvent::ChatRemoved(chat) => chat,
            ChatEvent::MessageAdded { chat, .. }
            | ChatEvent::MessageAddedBatch { chat, .. }
            | ChatEvent::MessageChanged { chat, .. }
            | ChatEvent::MessageRead { chat, .. }
            | ChatEvent::ParticipantAdded { chat, .. }
            | ChatEvent::ParticipantRemoved { chat, .. }
            | ChatEvent::LastMessageChanged { chat, .. }
            | ChatEvent::UnreadCountChanged { chat, .. } => chat,
            ChatEvent::UserChanged(user) => &user.entity,
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

type DispatchTable = HashMap<EventKind, Vec<(ListenerId, Listener)>>;

enum Envelope {
    Event(ChatEvent),
    Flush(std_mpsc::SyncSender<()>),
}

pub struct EventBus {
    table: Arc<RwLock<DispatchTable>>,
    next_id: AtomicU64,
    sender: Option<mpsc::UnboundedSender<Envelope>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl EventBus {
    /// Start the dispatch thread.
    pub fn new(thread_name: &str, slow_listener: Duration) -> std::io::Result<Self> {
        let table: Arc<RwLock<DispatchTable>> = Arc::new(RwLock::new(HashMap::new()));
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();

        let worker_table = Arc::clone(&table);
        let worker = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                while let Some(envelope) = receiver.blocking_recv() {
                    match envelope {
                        Envelope::Event(event) => dispatch(&worker_table, &event, slow_listener),
                        Envelope::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                debug!("event dispatch loop stopped");
            })?;

        Ok(Self {
            table,
            next_id: AtomicU64::new(1),
            sender: Some(sender),
            worker_id: worker.thread().id(),
            worker: Some(worker),
        })
    }

    /// Register `listener` for every kind in `kinds`.
    pub fn subscribe<F>(&self, kinds: &[EventKind], listener: F) -> ListenerId
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener = Arc::new(listener);

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        for kind in kinds {
            let entries = table.entry(*kind).or_default();
            if !entries.iter().any(|(existing, _)| *existing == id) {
                entries.push((id, Arc::clone(&listener)));
            }
        }
        id
    }

    /// Remove a listener from every kind it registered for. Events already
    /// queued are not delivered to it any more.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut found = false;
        for entries in table.values_mut() {
            let before = entries.len();
            entries.retain(|(existing, _)| *existing != id);
            found |= entries.len() != before;
        }
        table.retain(|_, entries| !entries.is_empty());
        found
    }

    /// Queue an event for delivery. Never blocks on listeners.
    pub fn publish(&self, event: ChatEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(Envelope::Event(event)).is_err() {
            warn!("event dispatcher stopped, dropping event");
        }
    }

    /// Block until every event published before this call was delivered.
    /// Returns immediately when called from a listener.
    pub fn flush(&self) {
        if thread::current().id() == self.worker_id {
            return;
        }
        let Some(sender) = &self.sender else {
            return;
        };
        let (done_tx, done_rx) = std_mpsc::sync_channel(1);
        if sender.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        // Closing the channel ends the dispatch loop once the queue drains.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                error!("event dispatch thread panicked");
            }
        }
    }
}

fn dispatch(table: &RwLock<DispatchTable>, event: &ChatEvent, slow_listener: Duration) {
    let kind = event.kind();

    // Snapshot so listeners may subscribe or unsubscribe while being called.
    let listeners: Vec<(ListenerId, Listener)> = table
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&kind)
        .cloned()
        .unwrap_or_default();

    for (id, listener) in listeners {
        let started = Instant::now();

        if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            error!(listener = id.0, ?kind, subject = %event.subject(), "event listener panicked");
        }

        let elapsed = started.elapsed();
        if elapsed > slow_listener {
            warn!(
                listener = id.0,
                ?kind,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow event listener"
            );
        }
    }
}
