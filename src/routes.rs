//! Ambient HTTP surface (§6 "Retained HTTP surface"). Everything else —
//! conversation CRUD, pagination, token issuance — is an external
//! collaborator per §1 and is intentionally not implemented here.

use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{get, http::Status};

use std::sync::Arc;

use crate::db::Db;
use crate::registry::ConnectionRegistry;

/// Client IP extraction, used to scope rate limiting to the connection
/// attempt rather than per-message (§5 "rate limiting guards the auth gate").
pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| req.remote().map(|r| r.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Outcome::Success(ClientIp(ip))
    }
}

#[get("/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "realtime-chat-core",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[get("/stats")]
pub fn stats(
    db: &rocket::State<Arc<Db>>,
    registry: &rocket::State<Arc<ConnectionRegistry>>,
) -> Json<serde_json::Value> {
    let conn = db.conn.lock().unwrap();
    let conversation_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
        .unwrap_or(0);
    let message_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
        .unwrap_or(0);
    drop(conn);

    Json(serde_json::json!({
        "conversations": conversation_count,
        "messages": message_count,
        "local_sessions": registry.local_session_count(),
        "local_subscribed_topics": registry.local_topic_count(),
    }))
}

#[rocket::catch(429)]
pub fn too_many_requests() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Too many requests"}))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}
