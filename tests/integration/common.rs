use std::sync::Arc;

use realtime_chat_core::db::Db;
use realtime_chat_core::message_state::MessageStore;
use realtime_chat_core::presence::PresenceTracker;
use realtime_chat_core::registry::ConnectionRegistry;
use rusqlite::params;
use uuid::Uuid;

pub const EPOCH: &str = "2026-01-01T00:00:00Z";

pub struct Harness {
    pub db: Arc<Db>,
    pub messages: MessageStore,
    pub presence: PresenceTracker,
    pub registry: ConnectionRegistry,
}

impl Harness {
    pub fn new() -> Self {
        let db = Arc::new(Db::in_memory());
        Self {
            messages: MessageStore::new(db.clone()),
            presence: PresenceTracker::new(db.clone()),
            registry: ConnectionRegistry::new(),
            db,
        }
    }

    pub fn add_user(&self, display_name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id, display_name, last_seen_at, created_at) VALUES (?1, ?2, ?3, ?3)",
            params![id.to_string(), display_name, EPOCH],
        )
        .unwrap();
        id
    }

    pub fn add_conversation(&self, variant: &str) -> Uuid {
        let id = Uuid::new_v4();
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversations (id, variant, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![id.to_string(), variant, EPOCH],
        )
        .unwrap();
        id
    }

    pub fn add_member(&self, conversation_id: Uuid, user_id: Uuid, role: &str) {
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_members (conversation_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id.to_string(), user_id.to_string(), role, EPOCH],
        )
        .unwrap();
    }

    /// A direct conversation between `a` and `b`, both as plain members.
    pub fn direct_conversation(&self, a: Uuid, b: Uuid) -> Uuid {
        let conversation_id = self.add_conversation("direct");
        self.add_member(conversation_id, a, "member");
        self.add_member(conversation_id, b, "member");
        conversation_id
    }
}
