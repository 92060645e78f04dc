#[rocket::launch]
async fn launch() -> _ {
    realtime_chat_core::init_tracing();
    realtime_chat_core::rocket().await
}
