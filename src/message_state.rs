//! Message Ingress & Delivery State Machine (§4.3, §4.4). Every transition is
//! a guarded SQL update (`WHERE ... IS NULL`) so repeated delivery of the
//! same event — a redelivered bus message, a retried client request — is a
//! no-op rather than a second state change (§4.4 "idempotent under replay").

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::Db;
use crate::error::ChatError;
use crate::models::{Attachment, ConversationVariant, MemberRole, Message, MessageVariant, ReactionSummary};

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Default per spec.md §5 ("edit window ... 5 minutes"); overridable via
/// `EDIT_WINDOW_SECS` per SPEC_FULL.md's ambient configuration list.
fn edit_window_secs() -> i64 {
    std::env::var("EDIT_WINDOW_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(300)
}

fn member_role(
    conn: &rusqlite::Connection,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Option<MemberRole>, ChatError> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(role.map(|r| match r.as_str() {
        "admin" => MemberRole::Admin,
        _ => MemberRole::Member,
    }))
}

fn conversation_variant_of(
    conn: &rusqlite::Connection,
    conversation_id: Uuid,
) -> Result<ConversationVariant, ChatError> {
    let variant: String = conn
        .query_row(
            "SELECT variant FROM conversations WHERE id = ?1",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| ChatError::NotFound("conversation not found".into()))?;
    Ok(match variant.as_str() {
        "group" => ConversationVariant::Group,
        "channel" => ConversationVariant::Channel,
        _ => ConversationVariant::Direct,
    })
}

pub struct SendMessageInput {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub variant: MessageVariant,
    pub reply_to: Option<Uuid>,
    pub attachment_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Db>,
}

impl MessageStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Persist a new message. The client chooses `id`, so a retried send with
    /// the same id is an upsert that returns the already-stored message
    /// rather than creating a duplicate (§4.3 "idempotent by client id").
    /// Only a conversation member may send; channels additionally require
    /// the admin role (§3 "Channels differ from groups only in
    /// authorisation: only admin-role members may send").
    pub fn send_message(&self, input: SendMessageInput) -> Result<Message, ChatError> {
        if input.content.is_none() && input.attachment_ids.is_empty() {
            return Err(ChatError::InvalidMessage(
                "message must have content or at least one attachment".into(),
            ));
        }

        let conn = self.db.conn.lock().unwrap();
        if let Some(existing) = fetch_message(&conn, input.id)? {
            if existing.sender_id != input.sender_id || existing.conversation_id != input.conversation_id
            {
                return Err(ChatError::Conflict(
                    "message id already used by a different sender or conversation".into(),
                ));
            }
            return Ok(existing);
        }

        let role = member_role(&conn, input.conversation_id, input.sender_id)?.ok_or(ChatError::Forbidden)?;
        if conversation_variant_of(&conn, input.conversation_id)? == ConversationVariant::Channel
            && role != MemberRole::Admin
        {
            return Err(ChatError::Forbidden);
        }

        let variant = variant_str(input.variant);
        let created_at = now();
        let next_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![input.conversation_id.to_string()],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO messages
                (id, conversation_id, sender_id, content, variant, reply_to, created_at, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                input.id.to_string(),
                input.conversation_id.to_string(),
                input.sender_id.to_string(),
                input.content,
                variant,
                input.reply_to.map(|id| id.to_string()),
                created_at,
                next_seq,
            ],
        )?;

        for attachment_id in &input.attachment_ids {
            conn.execute(
                "UPDATE attachments SET message_id = ?1 WHERE id = ?2 AND message_id IS NULL",
                params![input.id.to_string(), attachment_id.to_string()],
            )?;
        }

        fetch_message(&conn, input.id)?.ok_or_else(|| {
            ChatError::Internal("message vanished immediately after insert".into())
        })
    }

    /// Mark delivered if not already. Returns `None` when the message was
    /// already delivered, so the caller does not re-broadcast a receipt.
    pub fn mark_delivered(&self, message_id: Uuid) -> Result<Option<Message>, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE messages SET delivered_at = ?1 WHERE id = ?2 AND delivered_at IS NULL",
            params![now(), message_id.to_string()],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        fetch_message(&conn, message_id)
    }

    /// Mark read. Per the "first reader wins" resolution for group
    /// conversations, only the first `read` for a message sets its
    /// `read_at`; every reader's own catch-up position is tracked
    /// separately via `last_read_message_id` on their membership row.
    /// Requires delivery first — the storage `CHECK` constraint would
    /// reject an attempt to read an undelivered message, so this delivers
    /// it first if needed.
    pub fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    ) -> Result<Option<Message>, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        member_role(&conn, conversation_id, user_id)?.ok_or(ChatError::Forbidden)?;
        let ts = now();
        conn.execute(
            "UPDATE messages SET delivered_at = ?1 WHERE id = ?2 AND delivered_at IS NULL",
            params![ts, message_id.to_string()],
        )?;

        let became_first_read = conn.execute(
            "UPDATE messages SET read_at = ?1
             WHERE id = ?2 AND read_at IS NULL AND delivered_at IS NOT NULL",
            params![ts, message_id.to_string()],
        )?;

        let target_seq: Option<i64> = conn
            .query_row(
                "SELECT seq FROM messages WHERE id = ?1",
                params![message_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(target_seq) = target_seq {
            conn.execute(
                "UPDATE conversation_members SET last_read_message_id = ?1
                 WHERE conversation_id = ?2 AND user_id = ?3
                   AND (
                       last_read_message_id IS NULL
                       OR (SELECT seq FROM messages WHERE id = last_read_message_id) < ?4
                   )",
                params![
                    message_id.to_string(),
                    conversation_id.to_string(),
                    user_id.to_string(),
                    target_seq,
                ],
            )?;
        }

        if became_first_read == 0 {
            return Ok(None);
        }
        fetch_message(&conn, message_id)
    }

    /// On subscribe, catch up any messages addressed to this user that were
    /// sent while they had no local session anywhere (§4.3 "reconciliation
    /// on (re)subscribe" — the substitute for an out-of-scope fetch/page
    /// endpoint). Returns the messages just transitioned to delivered so the
    /// caller can emit delivery receipts.
    pub fn reconcile_on_subscribe(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Message>, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        if conversation_variant_of(&conn, conversation_id)? == ConversationVariant::Channel {
            // Channels never produce delivery receipts (§4.4, invariant #5).
            return Ok(Vec::new());
        }
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND delivered_at IS NULL",
            )?;
            let rows = stmt.query_map(
                params![conversation_id.to_string(), user_id.to_string()],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<Result<_, _>>()?
        };

        let mut delivered = Vec::with_capacity(ids.len());
        for id in ids {
            conn.execute(
                "UPDATE messages SET delivered_at = ?1 WHERE id = ?2 AND delivered_at IS NULL",
                params![now(), id],
            )?;
            if let Some(message) = fetch_message(&conn, Uuid::parse_str(&id).unwrap())? {
                delivered.push(message);
            }
        }
        Ok(delivered)
    }

    /// Only the sender may edit, only a `text` message, only while not
    /// deleted, and only within the edit window (§3, §8 boundary behaviour).
    pub fn edit_message(
        &self,
        message_id: Uuid,
        sender_id: Uuid,
        content: String,
    ) -> Result<Message, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        let message = fetch_message(&conn, message_id)?
            .ok_or_else(|| ChatError::NotFound("message not found".into()))?;
        if message.sender_id != sender_id {
            return Err(ChatError::Forbidden);
        }
        if message.deleted_at.is_some() {
            return Err(ChatError::Conflict("message has been deleted".into()));
        }
        if message.variant != MessageVariant::Text {
            return Err(ChatError::Conflict("only text messages can be edited".into()));
        }
        let created_at = chrono::DateTime::parse_from_rfc3339(&message.created_at)
            .map_err(|e| ChatError::Internal(e.to_string()))?;
        let age = chrono::Utc::now().signed_duration_since(created_at);
        if age > chrono::Duration::seconds(edit_window_secs()) {
            return Err(ChatError::Conflict("edit window has expired".into()));
        }

        let edited_at = now();
        conn.execute(
            "UPDATE messages SET content = ?1, edited_at = ?2 WHERE id = ?3",
            params![content, edited_at, message_id.to_string()],
        )?;
        fetch_message(&conn, message_id)?
            .ok_or_else(|| ChatError::Internal("message vanished during edit".into()))
    }

    /// Tombstones the message: content is cleared and `deleted_at` is set,
    /// but the row survives so reply threads and `seq` ordering stay intact.
    pub fn delete_message(&self, message_id: Uuid, sender_id: Uuid) -> Result<Message, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        let message = fetch_message(&conn, message_id)?
            .ok_or_else(|| ChatError::NotFound("message not found".into()))?;
        if message.sender_id != sender_id {
            return Err(ChatError::Forbidden);
        }
        if message.deleted_at.is_some() {
            return Ok(message);
        }

        conn.execute(
            "UPDATE messages SET content = NULL, deleted_at = ?1 WHERE id = ?2",
            params![now(), message_id.to_string()],
        )?;
        fetch_message(&conn, message_id)?
            .ok_or_else(|| ChatError::Internal("message vanished during delete".into()))
    }

    /// `emoji = Some` upserts (replacing any prior reaction by this user on
    /// this message); `emoji = None` removes the user's reaction, if any.
    pub fn react(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<String>,
    ) -> Result<(), ChatError> {
        let conn = self.db.conn.lock().unwrap();
        let conversation_id: String = conn
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1",
                params![message_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| ChatError::NotFound("message not found".into()))?;
        member_role(
            &conn,
            Uuid::parse_str(&conversation_id).unwrap(),
            user_id,
        )?
        .ok_or(ChatError::Forbidden)?;
        match emoji {
            Some(emoji) => {
                conn.execute(
                    "INSERT INTO reactions (message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (message_id, user_id)
                     DO UPDATE SET emoji = excluded.emoji, created_at = excluded.created_at",
                    params![message_id.to_string(), user_id.to_string(), emoji, now()],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
                    params![message_id.to_string(), user_id.to_string()],
                )?;
            }
        }
        Ok(())
    }

    pub fn get(&self, message_id: Uuid) -> Result<Option<Message>, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        fetch_message(&conn, message_id)
    }

    pub fn conversation_variant(&self, conversation_id: Uuid) -> Result<ConversationVariant, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        conversation_variant_of(&conn, conversation_id)
    }

    /// Every member of `conversation_id` other than `exclude`, used to decide
    /// whether a just-sent message has an online recipient to deliver to.
    pub fn other_member_ids(&self, conversation_id: Uuid, exclude: Uuid) -> Result<Vec<Uuid>, ChatError> {
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM conversation_members WHERE conversation_id = ?1 AND user_id != ?2",
        )?;
        let rows = stmt.query_map(
            params![conversation_id.to_string(), exclude.to_string()],
            |row| row.get::<_, String>(0),
        )?;
        Ok(rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|s| Uuid::parse_str(&s).unwrap())
            .collect())
    }
}

fn variant_str(variant: MessageVariant) -> &'static str {
    match variant {
        MessageVariant::Text => "text",
        MessageVariant::Image => "image",
        MessageVariant::Video => "video",
        MessageVariant::Voice => "voice",
        MessageVariant::System => "system",
    }
}

fn parse_variant(s: &str) -> MessageVariant {
    match s {
        "image" => MessageVariant::Image,
        "video" => MessageVariant::Video,
        "voice" => MessageVariant::Voice,
        "system" => MessageVariant::System,
        _ => MessageVariant::Text,
    }
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let id: String = row.get("id")?;
    let conversation_id: String = row.get("conversation_id")?;
    let sender_id: String = row.get("sender_id")?;
    let variant: String = row.get("variant")?;
    let reply_to: Option<String> = row.get("reply_to")?;

    Ok(Message {
        id: Uuid::parse_str(&id).unwrap(),
        conversation_id: Uuid::parse_str(&conversation_id).unwrap(),
        sender_id: Uuid::parse_str(&sender_id).unwrap(),
        content: row.get("content")?,
        variant: parse_variant(&variant),
        reply_to: reply_to.map(|s| Uuid::parse_str(&s).unwrap()),
        edited_at: row.get("edited_at")?,
        deleted_at: row.get("deleted_at")?,
        delivered_at: row.get("delivered_at")?,
        read_at: row.get("read_at")?,
        created_at: row.get("created_at")?,
        seq: row.get("seq")?,
        attachments: Vec::new(),
        reactions: Vec::new(),
    })
}

fn fetch_message(
    conn: &rusqlite::Connection,
    message_id: Uuid,
) -> Result<Option<Message>, ChatError> {
    let message = conn
        .query_row(
            "SELECT id, conversation_id, sender_id, content, variant, reply_to,
                    edited_at, deleted_at, delivered_at, read_at, created_at, seq
             FROM messages WHERE id = ?1",
            params![message_id.to_string()],
            message_from_row,
        )
        .optional()?;

    let Some(mut message) = message else {
        return Ok(None);
    };

    message.attachments = fetch_attachments(conn, message_id)?;
    message.reactions = fetch_reaction_summaries(conn, message_id)?;
    Ok(message)
}

fn fetch_attachments(
    conn: &rusqlite::Connection,
    message_id: Uuid,
) -> Result<Vec<Attachment>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT id, message_id, url, mime, size, thumbnail_url, width, height, duration_ms
         FROM attachments WHERE message_id = ?1",
    )?;
    let rows = stmt.query_map(params![message_id.to_string()], |row| {
        let id: String = row.get(0)?;
        let message_id: Option<String> = row.get(1)?;
        Ok(Attachment {
            id: Uuid::parse_str(&id).unwrap(),
            message_id: message_id.map(|s| Uuid::parse_str(&s).unwrap()),
            url: row.get(2)?,
            mime: row.get(3)?,
            size: row.get(4)?,
            thumbnail_url: row.get(5)?,
            width: row.get(6)?,
            height: row.get(7)?,
            duration_ms: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn fetch_reaction_summaries(
    conn: &rusqlite::Connection,
    message_id: Uuid,
) -> Result<Vec<ReactionSummary>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT emoji, user_id FROM reactions WHERE message_id = ?1 ORDER BY created_at",
    )?;
    let rows = stmt.query_map(params![message_id.to_string()], |row| {
        let emoji: String = row.get(0)?;
        let user_id: String = row.get(1)?;
        Ok((emoji, Uuid::parse_str(&user_id).unwrap()))
    })?;

    let mut by_emoji: HashMap<String, Vec<Uuid>> = HashMap::new();
    for entry in rows {
        let (emoji, user_id) = entry?;
        by_emoji.entry(emoji).or_default().push(user_id);
    }
    Ok(by_emoji
        .into_iter()
        .map(|(emoji, user_ids)| ReactionSummary {
            emoji,
            count: user_ids.len() as i64,
            user_ids,
        })
        .collect())
}
