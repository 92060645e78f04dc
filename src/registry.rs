//! Connection Registry (§4.1). Per-instance, process-local, never persists
//! state. Two indices — user -> sessions, conversation -> sessions — backed
//! by `dashmap` so contention is limited to the affected bucket, matching
//! the "many-readers/single-writer per bucket" resource model in §5.

use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::models::ServerEvent;

pub type SessionId = Uuid;

/// Outbound queue for one session. Bounded per §5 "Resource limits" — a
/// sustained overflow is the caller's signal to close the session.
pub const SEND_QUEUE_CAPACITY: usize = 256;

struct SessionHandle {
    user_id: Uuid,
    outbox: mpsc::Sender<ServerEvent>,
    subscriptions: StdMutex<HashSet<Uuid>>,
    close: Arc<Notify>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    users: DashMap<Uuid, DashSet<SessionId>>,
    conversations: DashMap<Uuid, DashSet<SessionId>>,
    sessions: DashMap<SessionId, SessionHandle>,
}

/// Result of a `detach`: whether the user has no remaining local sessions
/// (triggers an offline-presence broadcast, §4.1) and which topics lost
/// their last local subscriber (triggers a bus unsubscribe, §4.5).
pub struct DetachOutcome {
    pub user_had_last_session: bool,
    pub emptied_conversations: Vec<Uuid>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the outbound channel and register the session under its user.
    /// Called after auth succeeds (§4.1).
    pub fn attach(&self, user_id: Uuid) -> (SessionId, mpsc::Receiver<ServerEvent>, Arc<Notify>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let close = Arc::new(Notify::new());
        self.sessions.insert(
            session_id,
            SessionHandle {
                user_id,
                outbox: tx,
                subscriptions: StdMutex::new(HashSet::new()),
                close: close.clone(),
            },
        );
        self.users.entry(user_id).or_default().insert(session_id);
        (session_id, rx, close)
    }

    /// Force a session's reader loop to wake up and close, used when a
    /// sustained send-queue overflow requires tearing down the connection
    /// (§5 "dropped with a session close on sustained overflow").
    pub fn force_close(&self, session_id: SessionId) {
        if let Some(handle) = self.sessions.get(&session_id) {
            handle.close.notify_one();
        }
    }

    /// Add the session to each topic's local index. Returns the subset of
    /// `conversation_ids` whose local subscriber set was empty before this
    /// call — the caller subscribes the Fan-out Bus to exactly these (§4.1,
    /// "the first local subscriber to a topic triggers a Fan-out Bus
    /// subscription for that topic").
    pub fn subscribe(&self, session_id: SessionId, conversation_ids: &[Uuid]) -> Vec<Uuid> {
        let mut newly_subscribed_topics = Vec::new();
        for &conversation_id in conversation_ids {
            let set = self.conversations.entry(conversation_id).or_default();
            let was_empty = set.is_empty();
            set.insert(session_id);
            if was_empty {
                newly_subscribed_topics.push(conversation_id);
            }
        }
        if let Some(handle) = self.sessions.get(&session_id) {
            let mut subs = handle.subscriptions.lock().unwrap();
            subs.extend(conversation_ids.iter().copied());
        }
        newly_subscribed_topics
    }

    /// Inverse of `subscribe`. Returns topics whose local subscriber set
    /// became empty — the caller releases the bus subscription for these.
    pub fn unsubscribe(&self, session_id: SessionId, conversation_ids: &[Uuid]) -> Vec<Uuid> {
        let mut emptied = Vec::new();
        for &conversation_id in conversation_ids {
            if let Some(set) = self.conversations.get(&conversation_id) {
                set.remove(&session_id);
                if set.is_empty() {
                    emptied.push(conversation_id);
                }
            }
        }
        self.conversations
            .retain(|_, set| !set.is_empty());
        if let Some(handle) = self.sessions.get(&session_id) {
            let mut subs = handle.subscriptions.lock().unwrap();
            for id in conversation_ids {
                subs.remove(id);
            }
        }
        emptied
    }

    /// Remove the session from both indices. Invoked on socket close (§4.1).
    pub fn detach(&self, session_id: SessionId) -> Option<DetachOutcome> {
        let (user_id, subscribed_topics) = {
            let (_, handle) = self.sessions.remove(&session_id)?;
            let subs = handle.subscriptions.into_inner().unwrap();
            (handle.user_id, subs)
        };

        let mut emptied_conversations = Vec::new();
        for conversation_id in subscribed_topics {
            if let Some(set) = self.conversations.get(&conversation_id) {
                set.remove(&session_id);
                if set.is_empty() {
                    emptied_conversations.push(conversation_id);
                }
            }
        }
        self.conversations.retain(|_, set| !set.is_empty());

        let user_had_last_session = match self.users.get(&user_id) {
            Some(set) => {
                set.remove(&session_id);
                set.is_empty()
            }
            None => true,
        };
        if user_had_last_session {
            self.users.remove(&user_id);
        }

        Some(DetachOutcome {
            user_had_last_session,
            emptied_conversations,
        })
    }

    pub fn is_user_locally_online(&self, user_id: Uuid) -> bool {
        self.users
            .get(&user_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// Write `event` to every local subscriber of `conversation_id`, except
    /// (optionally) one session — used so a sender's ack isn't duplicated by
    /// its own `new_message` echo. Sessions whose outbox is full are
    /// returned to the caller so their connection can be torn down; writes
    /// never block (§5 "no handler holds a lock across a suspension").
    pub fn fanout_local(&self, conversation_id: Uuid, event: &ServerEvent) -> Vec<SessionId> {
        let mut overflowed = Vec::new();
        if let Some(set) = self.conversations.get(&conversation_id) {
            for session_id in set.iter() {
                if let Some(handle) = self.sessions.get(&session_id) {
                    if handle.outbox.try_send(event.clone()).is_err() {
                        overflowed.push(*session_id);
                    }
                }
            }
        }
        overflowed
    }

    pub fn send_to_session(&self, session_id: SessionId, event: ServerEvent) -> bool {
        match self.sessions.get(&session_id) {
            Some(handle) => handle.outbox.try_send(event).is_ok(),
            None => false,
        }
    }

    pub fn user_id_of(&self, session_id: SessionId) -> Option<Uuid> {
        self.sessions.get(&session_id).map(|h| h.user_id)
    }

    /// All distinct conversation ids that have at least one local subscriber.
    pub fn locally_subscribed_topics(&self) -> Vec<Uuid> {
        self.conversations.iter().map(|e| *e.key()).collect()
    }

    pub fn local_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn local_topic_count(&self) -> usize {
        self.conversations.len()
    }
}
