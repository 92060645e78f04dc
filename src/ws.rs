//! Protocol Dispatcher (§4.3). One Rocket route upgrades to a WebSocket, then
//! owns a read task (parses `ClientEvent`s, drives state transitions) and a
//! write task (drains the session's outbox), matching the split-stream shape
//! the teacher used for its SSE loop, adapted for a duplex socket.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use rocket::{get, State};
use rocket_ws as ws;
use uuid::Uuid;

use crate::auth::AuthGate;
use crate::bus::FanoutBus;
use crate::error::ChatError;
use crate::message_state::{MessageStore, SendMessageInput};
use crate::models::{AckStatus, ClientEvent, ConversationVariant, PresenceStatus, ServerEvent};
use crate::presence::PresenceTracker;
use crate::rate_limit::{RateLimitConfig, RateLimitedError, RateLimiter};
use crate::registry::ConnectionRegistry;
use crate::routes::ClientIp;

#[derive(Clone)]
pub struct AppState {
    pub auth: AuthGate,
    pub registry: Arc<ConnectionRegistry>,
    pub messages: MessageStore,
    pub presence: PresenceTracker,
    pub bus: FanoutBus,
}

#[get("/ws?<access_token>")]
pub fn connect(
    ws: ws::WebSocket,
    access_token: String,
    ip: ClientIp,
    rate_limiter: &State<RateLimiter>,
    rate_limit_config: &State<RateLimitConfig>,
    state: &State<AppState>,
) -> Result<ws::Channel<'static>, RateLimitedError> {
    let info = rate_limiter.check_with_info(
        &format!("ws_connect:{}", ip.0),
        rate_limit_config.login_max,
        rate_limit_config.login_window_secs,
    );
    if !info.allowed {
        return Err(RateLimitedError {
            info,
            message: "too many connection attempts".into(),
        });
    }

    let state = state.inner().clone();
    Ok(ws.channel(move |mut stream| {
        Box::pin(async move {
            let Ok(user_id) = state.auth.verify_access_token(&access_token) else {
                let frame = ws::frame::CloseFrame {
                    code: 4001u16.into(),
                    reason: "missing or invalid access token".into(),
                };
                let _ = stream.send(ws::Message::Close(Some(frame))).await;
                return Ok(());
            };
            run_session(stream, user_id, state).await
        })
    }))
}

async fn run_session(
    stream: ws::stream::DuplexStream,
    user_id: Uuid,
    state: AppState,
) -> Result<(), ws::result::Error> {
    let had_other_session = state.registry.is_user_locally_online(user_id);
    let (session_id, mut outbox, close) = state.registry.attach(user_id);

    let _ = state.presence.touch(user_id);
    if !had_other_session {
        broadcast_presence(&state, user_id).await;
    }

    let (mut sink, mut source) = stream.split();

    let writer_close = close.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = outbox.recv() => {
                    match event {
                        Some(event) => {
                            let Ok(text) = serde_json::to_string(&event) else { continue };
                            if sink.send(ws::Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = writer_close.notified() => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    let mut malformed_frames = 0u32;

    loop {
        tokio::select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(ws::Message::Text(text))) => {
                        if !handle_text_frame(&state, session_id, user_id, &text).await {
                            malformed_frames += 1;
                            if malformed_frames > malformed_frame_threshold() {
                                tracing::warn!(%session_id, "malformed frame rate exceeded, closing session");
                                break;
                            }
                        }
                    }
                    Some(Ok(ws::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = close.notified() => break,
        }
    }

    writer.abort();
    finish_session(&state, session_id, user_id).await;
    Ok(())
}

/// Default per SPEC_FULL.md's ambient configuration list ("64KiB"); bounds
/// inbound frame size per §5 "Inbound frame size bounded".
fn max_frame_bytes() -> usize {
    std::env::var("WS_MAX_FRAME_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(64 * 1024)
}

/// A session is not torn down for a single bad frame — only once malformed
/// frames exceed this rate (§4.3 "a session is not torn down for bad frames
/// unless the rate exceeds a configured threshold").
fn malformed_frame_threshold() -> u32 {
    20
}

/// Returns `false` when the frame was oversized or failed to parse — the
/// caller counts these towards the malformed-frame threshold.
async fn handle_text_frame(state: &AppState, session_id: Uuid, user_id: Uuid, text: &str) -> bool {
    if text.len() > max_frame_bytes() {
        state.registry.send_to_session(
            session_id,
            ChatError::InvalidMessage("frame exceeds maximum size".into()).to_event(),
        );
        return false;
    }

    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            state.registry.send_to_session(
                session_id,
                ChatError::InvalidMessage(format!("malformed event: {e}")).to_event(),
            );
            return false;
        }
    };

    if let Err(err) = dispatch(state, session_id, user_id, event).await {
        state.registry.send_to_session(session_id, err.to_event());
    }
    true
}

async fn dispatch(
    state: &AppState,
    session_id: Uuid,
    user_id: Uuid,
    event: ClientEvent,
) -> Result<(), ChatError> {
    match event {
        ClientEvent::Ping => {
            state.registry.send_to_session(session_id, ServerEvent::Pong);
        }

        ClientEvent::Subscribe { conversation_ids } => {
            let newly_subscribed = state.registry.subscribe(session_id, &conversation_ids);
            for conversation_id in &newly_subscribed {
                state.bus.subscribe_topic(*conversation_id);
            }
            for conversation_id in conversation_ids {
                let reconciled = state
                    .messages
                    .reconcile_on_subscribe(conversation_id, user_id)?;
                for message in reconciled {
                    let receipt = ServerEvent::DeliveryReceipt {
                        conversation_id,
                        message_id: message.id,
                        delivered_at: message.delivered_at.clone().unwrap_or_default(),
                    };
                    let _ = state.bus.publish(conversation_id, &receipt).await;
                }
            }
        }

        ClientEvent::Unsubscribe { conversation_ids } => {
            let emptied = state.registry.unsubscribe(session_id, &conversation_ids);
            for conversation_id in emptied {
                state.bus.unsubscribe_topic(conversation_id);
            }
        }

        ClientEvent::SendMessage {
            id,
            conversation_id,
            content,
            variant,
            reply_to_id,
            attachment_ids,
        } => {
            let result = state.messages.send_message(SendMessageInput {
                id,
                conversation_id,
                sender_id: user_id,
                content,
                variant,
                reply_to: reply_to_id,
                attachment_ids,
            });
            match result {
                Ok(message) => {
                    state.registry.send_to_session(
                        session_id,
                        ServerEvent::MessageAck {
                            id,
                            status: AckStatus::Ok,
                            timestamp: Some(message.created_at.clone()),
                            error: None,
                        },
                    );
                    let message_id = message.id;
                    let _ = state
                        .bus
                        .publish(conversation_id, &ServerEvent::NewMessage(Box::new(message)))
                        .await;
                    maybe_deliver_immediately(state, conversation_id, user_id, message_id).await;
                }
                Err(err) => {
                    state.registry.send_to_session(
                        session_id,
                        ServerEvent::MessageAck {
                            id,
                            status: AckStatus::Error,
                            timestamp: None,
                            error: Some(err.code().to_string()),
                        },
                    );
                }
            }
        }

        ClientEvent::EditMessage { id, content } => {
            let message = state.messages.edit_message(id, user_id, content)?;
            let _ = state
                .bus
                .publish(
                    message.conversation_id,
                    &ServerEvent::MessageUpdated {
                        id: message.id,
                        conversation_id: message.conversation_id,
                        content: message.content.clone().unwrap_or_default(),
                        edited_at: message.edited_at.clone().unwrap_or_default(),
                    },
                )
                .await;
        }

        ClientEvent::DeleteMessage { id } => {
            let message = state.messages.delete_message(id, user_id)?;
            let _ = state
                .bus
                .publish(
                    message.conversation_id,
                    &ServerEvent::MessageDeleted {
                        id: message.id,
                        conversation_id: message.conversation_id,
                    },
                )
                .await;
        }

        ClientEvent::Typing {
            conversation_id,
            is_typing,
        } => {
            let _ = state
                .bus
                .publish(
                    conversation_id,
                    &ServerEvent::Typing {
                        conversation_id,
                        user_id,
                        is_typing,
                    },
                )
                .await;
        }

        ClientEvent::Read {
            conversation_id,
            message_id,
        } => {
            if let Some(message) = state.messages.mark_read(conversation_id, user_id, message_id)?
            {
                let _ = state
                    .bus
                    .publish(
                        conversation_id,
                        &ServerEvent::ReadReceipt {
                            conversation_id,
                            user_id,
                            message_id,
                            read_at: message.read_at.clone().unwrap_or_default(),
                        },
                    )
                    .await;
            }
        }

        ClientEvent::React { message_id, emoji } => {
            state.messages.react(message_id, user_id, emoji.clone())?;
            if let Some(message) = state.messages.get(message_id)? {
                let _ = state
                    .bus
                    .publish(
                        message.conversation_id,
                        &ServerEvent::ReactionUpdated {
                            message_id,
                            conversation_id: message.conversation_id,
                            user_id,
                            emoji,
                        },
                    )
                    .await;
            }
        }
    }
    Ok(())
}

/// Immediately after a send, advance `delivered_at` if any other member is
/// already online (§4.4 "Delivered"). Channels never get a delivery receipt
/// (§3, §4.4, §8 invariant #5); direct/group conversations do, as soon as at
/// least one recipient is online anywhere.
async fn maybe_deliver_immediately(
    state: &AppState,
    conversation_id: Uuid,
    sender_id: Uuid,
    message_id: Uuid,
) {
    let Ok(variant) = state.messages.conversation_variant(conversation_id) else {
        return;
    };
    if variant == ConversationVariant::Channel {
        return;
    }
    let Ok(others) = state.messages.other_member_ids(conversation_id, sender_id) else {
        return;
    };
    let any_online = others.iter().any(|&other| {
        state
            .presence
            .status(other, &state.registry)
            .map(|(status, _)| status == PresenceStatus::Online)
            .unwrap_or(false)
    });
    if !any_online {
        return;
    }
    if let Ok(Some(message)) = state.messages.mark_delivered(message_id) {
        let receipt = ServerEvent::DeliveryReceipt {
            conversation_id,
            message_id,
            delivered_at: message.delivered_at.unwrap_or_default(),
        };
        let _ = state.bus.publish(conversation_id, &receipt).await;
    }
}

async fn finish_session(state: &AppState, session_id: Uuid, user_id: Uuid) {
    let Some(outcome) = state.registry.detach(session_id) else {
        return;
    };
    for conversation_id in outcome.emptied_conversations {
        state.bus.unsubscribe_topic(conversation_id);
    }
    let _ = state.presence.touch(user_id);
    if outcome.user_had_last_session {
        broadcast_presence(state, user_id).await;
    }
}

async fn broadcast_presence(state: &AppState, user_id: Uuid) {
    let Ok((status, last_seen_at)) = state.presence.status(user_id, &state.registry) else {
        return;
    };
    let Ok(conversation_ids) = state.presence.conversations_for_user(user_id) else {
        return;
    };
    let event = ServerEvent::Presence {
        user_id,
        status,
        last_seen_at,
    };
    for conversation_id in conversation_ids {
        let _ = state.bus.publish(conversation_id, &event).await;
    }
}
