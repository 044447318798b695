mod common;

use std::time::Duration;

use common::state;
use whispers::{
    auth::ensure_user,
    realtime::{Connection, Outbox, PresenceStatus, ServerEnvelope, Target},
    AppState,
};

async fn connect(state: &AppState, user_id: &str) -> (Connection, Outbox) {
    ensure_user(&state.db, user_id).await.unwrap();
    let (connection, outbox) = Connection::open(state.config.outbound_queue);
    state.hub.register(user_id, connection.clone()).await;
    (connection, outbox)
}

/// Skips presence notices and returns the next other event, if one is queued.
fn next_event(outbox: &mut Outbox) -> Option<ServerEnvelope> {
    while let Ok(event) = outbox.rx.try_recv() {
        match event {
            ServerEnvelope::UserOnline { .. } | ServerEnvelope::UserOffline { .. } => continue,
            other => return Some(other),
        }
    }
    None
}

#[tokio::test]
async fn online_recipient_gets_the_message_live() {
    let (_dir, state) = state().await;
    let (_s, _s_out) = connect(&state, "sam").await;
    let (_r, mut r_out) = connect(&state, "rita").await;

    let sent = state
        .delivery
        .send("sam", Target::Recipient("rita".to_owned()), "hello")
        .await
        .unwrap();

    match next_event(&mut r_out) {
        Some(ServerEnvelope::Message(message)) => {
            assert_eq!(message.content, "hello");
            assert_eq!(message.id, sent.id);
            assert_eq!(message.sender_id, "sam");
        }
        other => panic!("expected a message event, got {other:?}"),
    }
}

#[tokio::test]
async fn offline_recipient_finds_the_message_in_history() {
    let (_dir, state) = state().await;
    let (_s, _s_out) = connect(&state, "sam").await;

    let sent = state
        .delivery
        .send("sam", Target::Recipient("rita".to_owned()), "hello")
        .await
        .unwrap();

    let (_r, mut r_out) = connect(&state, "rita").await;
    assert_eq!(next_event(&mut r_out), None);

    let page = state.messages.page(sent.conversation_id, 20, 0).await.unwrap();
    assert_eq!(page.first().map(|m| m.content.as_str()), Some("hello"));
    assert_eq!(state.messages.unread_count(sent.conversation_id, "rita").await.unwrap(), 1);
}

#[tokio::test]
async fn typing_is_relayed_but_never_stored() {
    let (_dir, state) = state().await;
    let conversation = state
        .directory
        .get_or_create(&["sam".to_owned(), "rita".to_owned()])
        .await
        .unwrap();
    let (_s, mut s_out) = connect(&state, "sam").await;
    let (_r, mut r_out) = connect(&state, "rita").await;

    let reached = state
        .delivery
        .typing("sam", Target::Recipient("rita".to_owned()), true)
        .await
        .unwrap();
    assert_eq!(reached, 1);

    assert_eq!(
        next_event(&mut r_out),
        Some(ServerEnvelope::TypingStart {
            conversation_id: conversation,
            user_id: "sam".to_owned(),
        })
    );
    assert_eq!(next_event(&mut s_out), None);

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
        .fetch_one(&state.db.reader)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn presence_follows_connections() {
    let (_dir, state) = state().await;
    state
        .directory
        .get_or_create(&["sam".to_owned(), "rita".to_owned()])
        .await
        .unwrap();

    let (_r, mut r_out) = connect(&state, "rita").await;
    let (phone, _phone_out) = connect(&state, "sam").await;
    let (laptop, _laptop_out) = connect(&state, "sam").await;
    assert_eq!(state.hub.status("sam"), PresenceStatus::Online);

    assert_eq!(
        r_out.rx.try_recv().ok(),
        Some(ServerEnvelope::UserOnline { user_id: "sam".to_owned() })
    );
    // the second connection is not news
    assert!(r_out.rx.try_recv().is_err());

    state.hub.unregister("sam", phone.id()).await;
    assert_eq!(state.hub.status("sam"), PresenceStatus::Online);

    state.hub.unregister("sam", laptop.id()).await;
    assert_eq!(state.hub.status("sam"), PresenceStatus::Offline);
    assert_eq!(
        r_out.rx.try_recv().ok(),
        Some(ServerEnvelope::UserOffline { user_id: "sam".to_owned() })
    );
}

#[tokio::test]
async fn a_frozen_client_does_not_hold_up_anyone_else() {
    let (_dir, state) = state().await;
    let conversation = state
        .directory
        .get_or_create(&["sam".to_owned(), "rita".to_owned(), "finn".to_owned()])
        .await
        .unwrap();

    // rita never reads her queue
    let (frozen, _frozen_out) = Connection::open(2);
    state.hub.register("rita", frozen.clone()).await;
    let (_f, mut f_out) = connect(&state, "finn").await;
    let (_s, _s_out) = connect(&state, "sam").await;

    for i in 0..5 {
        state
            .delivery
            .send("sam", Target::Conversation(conversation), &format!("m{i}"))
            .await
            .unwrap();
    }

    assert!(frozen.is_closed());
    assert_eq!(state.hub.connection_count("rita"), 0);

    let mut received = Vec::new();
    while let Some(event) = next_event(&mut f_out) {
        if let ServerEnvelope::Message(message) = event {
            received.push(message.content);
        }
    }
    assert_eq!(received, ["m0", "m1", "m2", "m3", "m4"]);

    // everything is still durable
    assert_eq!(state.messages.page(conversation, 10, 0).await.unwrap().len(), 5);
}

#[tokio::test]
async fn conversation_listing_puts_recent_activity_first() {
    let (_dir, state) = state().await;

    let quiet = state
        .directory
        .get_or_create(&["sam".to_owned(), "quinn".to_owned()])
        .await
        .unwrap();
    let older = state
        .delivery
        .send("sam", Target::Recipient("rita".to_owned()), "first")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = state
        .delivery
        .send("finn", Target::Recipient("sam".to_owned()), "second")
        .await
        .unwrap();

    let listed = state.directory.list_for_user("sam").await.unwrap();
    let ids: Vec<_> = listed.iter().map(|c| c.id).collect();
    assert_eq!(ids, [newer.conversation_id, older.conversation_id, quiet]);

    assert_eq!(listed[0].unread_count, 1);
    assert_eq!(listed[0].last_message.as_deref(), Some("second"));
    assert_eq!(listed[1].unread_count, 0);
    assert_eq!(listed[2].last_message_at, None);
    assert_eq!(listed[2].participants, ["quinn", "sam"]);
}
