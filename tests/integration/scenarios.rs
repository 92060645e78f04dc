//! End-to-end scenarios from spec.md §8, exercised by wiring the
//! Connection Registry, Message State Machine and Presence Tracker together
//! the way the Protocol Dispatcher does (src/ws.rs's `dispatch`), minus the
//! socket and the Fan-out Bus itself — local fan-out is the same
//! `ConnectionRegistry::fanout_local` call a bus-delivered event would
//! trigger on every subscribed instance.

use realtime_chat_core::message_state::SendMessageInput;
use realtime_chat_core::models::{MessageVariant, PresenceStatus, ServerEvent};
use uuid::Uuid;

use crate::common::Harness;

fn recv(rx: &mut tokio::sync::mpsc::Receiver<ServerEvent>) -> Option<ServerEvent> {
    rx.try_recv().ok()
}

/// S1 — Happy path DM: both online, send, immediate delivery, then read.
#[test]
fn s1_happy_path_dm() {
    let h = Harness::new();
    let alice = h.add_user("alice");
    let bob = h.add_user("bob");
    let convo = h.direct_conversation(alice, bob);

    let (alice_session, mut alice_rx, _) = h.registry.attach(alice);
    let (bob_session, mut bob_rx, _) = h.registry.attach(bob);
    h.registry.subscribe(alice_session, &[convo]);
    h.registry.subscribe(bob_session, &[convo]);

    let msg_id = Uuid::new_v4();
    let sent = h
        .messages
        .send_message(SendMessageInput {
            id: msg_id,
            conversation_id: convo,
            sender_id: alice,
            content: Some("hi".into()),
            variant: MessageVariant::Text,
            reply_to: None,
            attachment_ids: vec![],
        })
        .unwrap();

    // Ack goes directly to the sender's session (never via fan-out).
    h.registry.send_to_session(
        alice_session,
        ServerEvent::MessageAck {
            id: msg_id,
            status: realtime_chat_core::models::AckStatus::Ok,
            timestamp: Some(sent.created_at.clone()),
            error: None,
        },
    );
    assert!(matches!(recv(&mut alice_rx), Some(ServerEvent::MessageAck { status, .. })
        if status == realtime_chat_core::models::AckStatus::Ok));

    // new_message reaches every subscribed session, including the sender's.
    let new_message_event = ServerEvent::NewMessage(Box::new(sent.clone()));
    h.registry.fanout_local(convo, &new_message_event);
    assert!(matches!(recv(&mut alice_rx), Some(ServerEvent::NewMessage(_))));
    assert!(matches!(recv(&mut bob_rx), Some(ServerEvent::NewMessage(_))));

    // Bob is locally online, so the message is immediately deliverable.
    let others = h.messages.other_member_ids(convo, alice).unwrap();
    assert_eq!(others, vec![bob]);
    let bob_status = h.presence.status(bob, &h.registry).unwrap().0;
    assert_eq!(bob_status, PresenceStatus::Online);

    let delivered = h.messages.mark_delivered(msg_id).unwrap().unwrap();
    assert!(delivered.delivered_at.is_some());
    h.registry.fanout_local(
        convo,
        &ServerEvent::DeliveryReceipt {
            conversation_id: convo,
            message_id: msg_id,
            delivered_at: delivered.delivered_at.clone().unwrap(),
        },
    );
    assert!(matches!(recv(&mut alice_rx), Some(ServerEvent::DeliveryReceipt { .. })));

    // Bob reads; Alice gets the read receipt.
    let read = h.messages.mark_read(convo, bob, msg_id).unwrap().unwrap();
    h.registry.fanout_local(
        convo,
        &ServerEvent::ReadReceipt {
            conversation_id: convo,
            user_id: bob,
            message_id: msg_id,
            read_at: read.read_at.clone().unwrap(),
        },
    );
    assert!(matches!(recv(&mut alice_rx), Some(ServerEvent::ReadReceipt { user_id, .. }) if user_id == bob));
}

/// S2 — Idempotent retry: the same client id sent twice yields one row and
/// two acks with identical timestamps.
#[test]
fn s2_idempotent_retry() {
    let h = Harness::new();
    let alice = h.add_user("alice");
    let bob = h.add_user("bob");
    let convo = h.direct_conversation(alice, bob);

    let id = Uuid::new_v4();
    let input = || SendMessageInput {
        id,
        conversation_id: convo,
        sender_id: alice,
        content: Some("hi".into()),
        variant: MessageVariant::Text,
        reply_to: None,
        attachment_ids: vec![],
    };

    let first = h.messages.send_message(input()).unwrap();
    let second = h.messages.send_message(input()).unwrap();
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(first.seq, second.seq);

    let count: i64 = h
        .db
        .conn
        .lock()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM messages WHERE id = ?1", [id.to_string()], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(count, 1);
}

/// S3 — Channel post: only admins may send, and channels never produce a
/// delivery receipt even once the message is fanned out and read.
#[test]
fn s3_channel_post_requires_admin_and_never_delivers() {
    let h = Harness::new();
    let admin = h.add_user("alice");
    let member = h.add_user("bob");
    let channel = h.add_conversation("channel");
    h.add_member(channel, admin, "admin");
    h.add_member(channel, member, "member");

    let forbidden = h.messages.send_message(SendMessageInput {
        id: Uuid::new_v4(),
        conversation_id: channel,
        sender_id: member,
        content: Some("can't post".into()),
        variant: MessageVariant::Text,
        reply_to: None,
        attachment_ids: vec![],
    });
    assert!(matches!(
        forbidden,
        Err(realtime_chat_core::error::ChatError::Forbidden)
    ));

    let posted = h
        .messages
        .send_message(SendMessageInput {
            id: Uuid::new_v4(),
            conversation_id: channel,
            sender_id: admin,
            content: Some("announcement".into()),
            variant: MessageVariant::Text,
            reply_to: None,
            attachment_ids: vec![],
        })
        .unwrap();
    assert!(posted.delivered_at.is_none());

    // Reconciliation on subscribe is the other place a channel message could
    // pick up a delivery receipt; it must not for channels either.
    let reconciled = h.messages.reconcile_on_subscribe(channel, member).unwrap();
    assert!(reconciled.is_empty());
    assert!(h
        .messages
        .get(posted.id)
        .unwrap()
        .unwrap()
        .delivered_at
        .is_none());
}

/// S5 — Reconnect reconciliation: a message sent while the recipient was
/// offline has no delivered_at until the recipient subscribes again.
#[test]
fn s5_reconnect_reconciliation_sets_delivered_on_subscribe() {
    let h = Harness::new();
    let alice = h.add_user("alice");
    let bob = h.add_user("bob");
    let convo = h.direct_conversation(alice, bob);

    let sent = h
        .messages
        .send_message(SendMessageInput {
            id: Uuid::new_v4(),
            conversation_id: convo,
            sender_id: alice,
            content: Some("while you were out".into()),
            variant: MessageVariant::Text,
            reply_to: None,
            attachment_ids: vec![],
        })
        .unwrap();
    assert!(sent.delivered_at.is_none());

    // Bob was never attached locally, so nothing marks it delivered yet.
    let reconciled_before = h.messages.reconcile_on_subscribe(convo, bob).unwrap();
    assert_eq!(reconciled_before.len(), 1);
    assert_eq!(reconciled_before[0].id, sent.id);
    assert!(reconciled_before[0].delivered_at.is_some());

    // A second reconcile (e.g. a second subscribe) is a no-op.
    let reconciled_again = h.messages.reconcile_on_subscribe(convo, bob).unwrap();
    assert!(reconciled_again.is_empty());
}

/// S6 — Multi-device read: both of Alice's sessions see the new message;
/// the first `read` from either session broadcasts once, the second is
/// silent.
#[test]
fn s6_multi_device_read_is_first_reader_only() {
    let h = Harness::new();
    let alice = h.add_user("alice");
    let bob = h.add_user("bob");
    let convo = h.direct_conversation(alice, bob);

    let (s1, mut rx1, _) = h.registry.attach(alice);
    let (s2, mut rx2, _) = h.registry.attach(alice);
    h.registry.subscribe(s1, &[convo]);
    h.registry.subscribe(s2, &[convo]);

    let sent = h
        .messages
        .send_message(SendMessageInput {
            id: Uuid::new_v4(),
            conversation_id: convo,
            sender_id: bob,
            content: Some("hey".into()),
            variant: MessageVariant::Text,
            reply_to: None,
            attachment_ids: vec![],
        })
        .unwrap();

    h.registry
        .fanout_local(convo, &ServerEvent::NewMessage(Box::new(sent.clone())));
    assert!(recv(&mut rx1).is_some());
    assert!(recv(&mut rx2).is_some());

    let first_read = h.messages.mark_read(convo, alice, sent.id).unwrap();
    assert!(first_read.is_some());

    let second_read = h.messages.mark_read(convo, alice, sent.id).unwrap();
    assert!(second_read.is_none(), "second device's read must not re-broadcast");
}
