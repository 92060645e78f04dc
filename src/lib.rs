pub mod auth;
pub mod bus;
pub mod db;
pub mod error;
pub mod message_state;
pub mod models;
pub mod presence;
pub mod rate_limit;
pub mod registry;
pub mod routes;
pub mod ws;

use std::env;
use std::sync::Arc;

use rate_limit::{RateLimitConfig, RateLimiter};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

pub async fn rocket() -> rocket::Rocket<rocket::Build> {
    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "data/chat.db".to_string());
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    rocket_with_config(&db_path, &redis_url).await
}

pub async fn rocket_with_config(db_path: &str, redis_url: &str) -> rocket::Rocket<rocket::Build> {
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db = Arc::new(db::Db::new(db_path));
    let registry = Arc::new(registry::ConnectionRegistry::new());
    let bus = bus::FanoutBus::connect(redis_url, registry.clone())
        .await
        .expect("failed to connect fan-out bus to redis");

    let app_state = ws::AppState {
        auth: auth::AuthGate::from_env(),
        registry: registry.clone(),
        messages: message_state::MessageStore::new(db.clone()),
        presence: presence::PresenceTracker::new(db.clone()),
        bus,
    };

    let rate_limit_config = RateLimitConfig::from_env();
    let rate_limiter = RateLimiter::new();

    let cors = rocket_cors::CorsOptions::default()
        .to_cors()
        .expect("failed to build CORS fairing");

    rocket::build()
        .manage(db)
        .manage(registry)
        .manage(app_state)
        .manage(rate_limit_config)
        .manage(rate_limiter)
        .attach(cors)
        .register("/", rocket::catchers![routes::too_many_requests, routes::not_found])
        .mount(
            "/",
            rocket::routes![routes::health, routes::stats, ws::connect],
        )
}
