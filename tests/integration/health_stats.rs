use std::sync::Arc;

use realtime_chat_core::db::Db;
use realtime_chat_core::registry::ConnectionRegistry;
use realtime_chat_core::routes;
use rocket::http::Status;
use rocket::local::blocking::Client;

/// Builds just the retained ambient HTTP surface (§6 "Retained HTTP
/// surface") against a throwaway in-memory database, without the Fan-out
/// Bus — `/health` and `/stats` depend on neither Redis nor a WebSocket
/// session, matching what the teacher's own health/stats routes depend on.
fn test_client() -> Client {
    let db = Arc::new(Db::in_memory());
    let registry = Arc::new(ConnectionRegistry::new());
    let rocket = rocket::build()
        .manage(db)
        .manage(registry)
        .mount("/", rocket::routes![routes::health, routes::stats]);
    Client::tracked(rocket).expect("valid rocket instance")
}

#[test]
fn health_reports_ok() {
    let client = test_client();
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "realtime-chat-core");
}

#[test]
fn stats_reports_zero_counts_on_a_fresh_database() {
    let client = test_client();
    let res = client.get("/stats").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["conversations"], 0);
    assert_eq!(body["messages"], 0);
    assert_eq!(body["local_sessions"], 0);
    assert_eq!(body["local_subscribed_topics"], 0);
}
