//! Durable Store (§2, §3, §6 "Persisted state layout"). SQLite via `rusqlite`,
//! following the teacher's `Db { conn: Mutex<Connection> }` + `migrate()` shape.

use rusqlite::Connection;
use std::sync::Mutex;

pub struct Db {
    pub conn: Mutex<Connection>,
}

impl Db {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("failed to set pragmas");
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate();
        db
    }

    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("failed to open in-memory database");
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate();
        db
    }

    fn migrate(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                avatar_url TEXT,
                last_seen_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                variant TEXT NOT NULL CHECK (variant IN ('direct','group','channel')),
                name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversation_members (
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role TEXT NOT NULL CHECK (role IN ('admin','member')),
                last_read_message_id TEXT,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_members_user ON conversation_members(user_id);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL REFERENCES users(id),
                content TEXT,
                variant TEXT NOT NULL CHECK (variant IN ('text','image','video','voice','system')),
                reply_to TEXT REFERENCES messages(id),
                edited_at TEXT,
                deleted_at TEXT,
                delivered_at TEXT,
                read_at TEXT,
                created_at TEXT NOT NULL,
                seq INTEGER NOT NULL,
                CHECK (read_at IS NULL OR delivered_at IS NOT NULL)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
                ON messages(conversation_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
                ON messages(conversation_id, seq);
            CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id);

            CREATE TABLE IF NOT EXISTS reactions (
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                emoji TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id);

            CREATE TABLE IF NOT EXISTS attachments (
                id TEXT PRIMARY KEY,
                message_id TEXT REFERENCES messages(id) ON DELETE CASCADE,
                url TEXT NOT NULL,
                mime TEXT NOT NULL,
                size INTEGER NOT NULL,
                thumbnail_url TEXT,
                width INTEGER,
                height INTEGER,
                duration_ms INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);

            CREATE TABLE IF NOT EXISTS refresh_credentials (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                token_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                revoked_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_refresh_user ON refresh_credentials(user_id);

            CREATE TABLE IF NOT EXISTS invite_tokens (
                token TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_invite_conversation ON invite_tokens(conversation_id);

            CREATE TRIGGER IF NOT EXISTS trg_messages_bump_conversation
            AFTER INSERT ON messages
            BEGIN
                UPDATE conversations SET updated_at = NEW.created_at WHERE id = NEW.conversation_id;
            END;
            ",
        )
        .expect("failed to run migrations");
    }
}
