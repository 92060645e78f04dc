//! Inter-Instance Fan-out Bus (§4.5). Topic-per-conversation pub/sub over
//! Redis. Each instance holds one publisher connection and one subscriber
//! connection (§5 "Shared resources"); the Connection Registry decides which
//! topics the subscriber connection actually listens to.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::ServerEvent;
use crate::registry::ConnectionRegistry;

fn topic_channel(conversation_id: Uuid) -> String {
    format!("chat:conversation:{conversation_id}")
}

fn conversation_id_of(channel: &str) -> Option<Uuid> {
    channel
        .strip_prefix("chat:conversation:")
        .and_then(|s| Uuid::parse_str(s).ok())
}

enum BusCommand {
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

/// Handle held by the rest of the process: publish events, and tell the
/// background subscriber task which topics to (un)subscribe from.
#[derive(Clone)]
pub struct FanoutBus {
    publisher: ConnectionManager,
    commands: mpsc::UnboundedSender<BusCommand>,
}

impl FanoutBus {
    pub async fn connect(
        redis_url: &str,
        registry: Arc<ConnectionRegistry>,
    ) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_subscriber_loop(client, rx, registry));
        Ok(Self {
            publisher,
            commands: tx,
        })
    }

    /// Publish the full server-event JSON to a conversation's topic (§4.5,
    /// "messages on the bus are the full server-event JSON").
    pub async fn publish(
        &self,
        conversation_id: Uuid,
        event: &ServerEvent,
    ) -> redis::RedisResult<()> {
        let payload = serde_json::to_string(event).expect("ServerEvent always serializes");
        let mut conn = self.publisher.clone();
        redis::cmd("PUBLISH")
            .arg(topic_channel(conversation_id))
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
    }

    /// Subscribe the shared bus connection to a topic. Idempotent; the
    /// Connection Registry only calls this for a topic's first local
    /// subscriber (§4.1).
    pub fn subscribe_topic(&self, conversation_id: Uuid) {
        let _ = self.commands.send(BusCommand::Subscribe(conversation_id));
    }

    /// Release the bus subscription. The registry calls this once a topic's
    /// local subscriber set becomes empty (§4.1, §4.5).
    pub fn unsubscribe_topic(&self, conversation_id: Uuid) {
        let _ = self
            .commands
            .send(BusCommand::Unsubscribe(conversation_id));
    }
}

/// Owns the one subscriber connection for this instance. Reconnects with a
/// fixed backoff on transport failure; on reconnect it resubscribes to every
/// topic any local session still wants, reconciled from the registry rather
/// than from in-task state so a flapping connection self-heals.
async fn run_subscriber_loop(
    client: redis::Client,
    mut commands: mpsc::UnboundedReceiver<BusCommand>,
    registry: Arc<ConnectionRegistry>,
) {
    let mut wanted: HashSet<Uuid> = HashSet::new();

    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "fan-out bus: subscriber connect failed, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        // Resubscribe to everything still wanted, e.g. after a reconnect.
        for &conversation_id in wanted.iter().chain(
            registry
                .locally_subscribed_topics()
                .iter()
                .filter(|id| !wanted.contains(id)),
        ) {
            if pubsub.subscribe(topic_channel(conversation_id)).await.is_ok() {
                wanted.insert(conversation_id);
            }
        }

        let disconnect_reason = 'conn: loop {
            let mut stream = pubsub.on_message();
            tokio::select! {
                maybe_msg = stream.next() => {
                    match maybe_msg {
                        Some(msg) => {
                            drop(stream);
                            handle_message(&msg, &registry);
                        }
                        None => break 'conn "stream ended",
                    }
                }
                cmd = commands.recv() => {
                    drop(stream);
                    match cmd {
                        Some(BusCommand::Subscribe(id)) => {
                            if pubsub.subscribe(topic_channel(id)).await.is_ok() {
                                wanted.insert(id);
                            }
                        }
                        Some(BusCommand::Unsubscribe(id)) => {
                            let _ = pubsub.unsubscribe(topic_channel(id)).await;
                            wanted.remove(&id);
                        }
                        None => return, // FanoutBus dropped; shut down quietly.
                    }
                }
            }
        };
        tracing::warn!(reason = disconnect_reason, "fan-out bus: subscriber reconnecting");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn handle_message(msg: &redis::Msg, registry: &ConnectionRegistry) {
    let Some(conversation_id) = conversation_id_of(msg.get_channel_name()) else {
        return;
    };
    let Ok(payload) = msg.get_payload::<String>() else {
        return;
    };
    let Ok(event) = serde_json::from_str::<ServerEvent>(&payload) else {
        tracing::warn!(%conversation_id, "fan-out bus: unparseable event, dropping");
        return;
    };
    let overflowed = registry.fanout_local(conversation_id, &event);
    for session_id in overflowed {
        tracing::warn!(%session_id, "send queue overflow, closing session");
        registry.force_close(session_id);
    }
}
