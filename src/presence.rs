//! Presence (§4.6). `is_online` is never stored; every read derives it from
//! `last_seen_at` against a fixed window, reconciled with whether this
//! instance currently holds a local session for the user so a just-connected
//! user reads online immediately rather than waiting out the window.

use std::sync::Arc;

use rusqlite::params;
use uuid::Uuid;

use crate::db::Db;
use crate::error::ChatError;
use crate::models::PresenceStatus;
use crate::registry::ConnectionRegistry;

/// How long after `last_seen_at` a user with no local session on this
/// instance is still reported online (§3, §8 "a user offline for 31s
/// transitions to offline; at 29s remains online"). Overridable via
/// `PRESENCE_WINDOW_SECS` per SPEC_FULL.md's ambient configuration list.
pub const DEFAULT_PRESENCE_WINDOW_SECS: i64 = 30;

fn presence_window_secs() -> i64 {
    std::env::var("PRESENCE_WINDOW_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PRESENCE_WINDOW_SECS)
}

#[derive(Clone)]
pub struct PresenceTracker {
    db: Arc<Db>,
}

impl PresenceTracker {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Bump `last_seen_at` to now. Called on attach, detach, and periodically
    /// while a session stays open (heartbeat pings).
    pub fn touch(&self, user_id: Uuid) -> Result<String, ChatError> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.db.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET last_seen_at = ?1 WHERE id = ?2",
            params![now, user_id.to_string()],
        )?;
        Ok(now)
    }

    pub fn last_seen_at(&self, user_id: Uuid) -> Result<Option<String>, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        let seen: Option<String> = conn
            .query_row(
                "SELECT last_seen_at FROM users WHERE id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .ok();
        Ok(seen)
    }

    /// Derive the presence tuple reported on the wire: locally connected
    /// sessions are online immediately; otherwise fall back to the window.
    pub fn status(
        &self,
        user_id: Uuid,
        registry: &ConnectionRegistry,
    ) -> Result<(PresenceStatus, String), ChatError> {
        let last_seen_at = self
            .last_seen_at(user_id)?
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

        if registry.is_user_locally_online(user_id) {
            return Ok((PresenceStatus::Online, last_seen_at));
        }

        let within_window = chrono::DateTime::parse_from_rfc3339(&last_seen_at)
            .map(|seen| {
                chrono::Utc::now().signed_duration_since(seen)
                    < chrono::Duration::seconds(presence_window_secs())
            })
            .unwrap_or(false);

        let status = if within_window {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        };
        Ok((status, last_seen_at))
    }

    /// Every conversation a user belongs to, used to fan a presence
    /// transition out to each conversation's topic (§4.6).
    pub fn conversations_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id FROM conversation_members WHERE user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let ids = rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|s| Uuid::parse_str(&s).unwrap())
            .collect();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locally_connected_user_is_online_regardless_of_last_seen() {
        let db = Arc::new(Db::in_memory());
        let tracker = PresenceTracker::new(db.clone());
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO users (id, display_name, last_seen_at, created_at)
                 VALUES (?1, 'u', '2000-01-01T00:00:00Z', '2000-01-01T00:00:00Z')",
                params![user_id.to_string()],
            )
            .unwrap();
        }
        registry.attach(user_id);

        let (status, _) = tracker.status(user_id, &registry).unwrap();
        assert_eq!(status, PresenceStatus::Online);
    }

    #[test]
    fn disconnected_user_past_window_is_offline() {
        let db = Arc::new(Db::in_memory());
        let tracker = PresenceTracker::new(db.clone());
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO users (id, display_name, last_seen_at, created_at)
                 VALUES (?1, 'u', '2000-01-01T00:00:00Z', '2000-01-01T00:00:00Z')",
                params![user_id.to_string()],
            )
            .unwrap();
        }

        let (status, _) = tracker.status(user_id, &registry).unwrap();
        assert_eq!(status, PresenceStatus::Offline);
    }

    fn status_at_age(seconds_ago: i64) -> PresenceStatus {
        let db = Arc::new(Db::in_memory());
        let tracker = PresenceTracker::new(db.clone());
        let registry = ConnectionRegistry::new();
        let user_id = Uuid::new_v4();
        let last_seen_at = (chrono::Utc::now() - chrono::Duration::seconds(seconds_ago)).to_rfc3339();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO users (id, display_name, last_seen_at, created_at)
                 VALUES (?1, 'u', ?2, ?2)",
                params![user_id.to_string(), last_seen_at],
            )
            .unwrap();
        }
        tracker.status(user_id, &registry).unwrap().0
    }

    #[test]
    fn remains_online_at_29_seconds() {
        assert_eq!(status_at_age(29), PresenceStatus::Online);
    }

    #[test]
    fn transitions_offline_at_31_seconds() {
        assert_eq!(status_at_age(31), PresenceStatus::Offline);
    }
}
