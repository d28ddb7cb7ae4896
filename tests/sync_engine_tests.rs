// Synchronization engine integration tests
// These tests drive the engine end to end through scripted REST responses
// and a loopback event channel: session lifecycle, event routing,
// optimistic sends, and the cross-source merge guarantees.

// Import common test utilities
mod common;
use common::{build_engine, contact, eventually, identity, setup_logging, wire, ScriptedApi};

// External crate imports
use std::sync::Arc;

// Import the crate functionality
use palaver::models::{DeliveryState, SendPayload};
use palaver::sync::EngineState;

fn scripted_session() -> Arc<ScriptedApi> {
    let api = Arc::new(ScriptedApi::new());
    api.set_identity(identity("me", "Me"));
    api.set_contacts(vec![contact("alice", "Alice"), contact("bob", "Bob")]);
    api
}

#[tokio::test]
async fn sign_in_brings_the_session_up() {
    setup_logging();
    let api = scripted_session();
    let (engine, hub) = build_engine(api);

    let who = engine.sign_in().await.expect("sign in");
    assert_eq!(who.id, "me");
    assert_eq!(engine.state(), EngineState::Connected);

    // The channel is bound to the signed-in identity
    assert_eq!(hub.connected_identity().as_deref(), Some("me"));

    // No conversations yet: directory is alphabetical
    let names: Vec<_> = engine
        .directory_entries()
        .await
        .into_iter()
        .map(|e| e.contact.display_name)
        .collect();
    assert_eq!(names, vec!["Alice", "Bob"]);
}

/// The end-to-end scenario: push activity reorders the directory, an
/// optimistic send is visible immediately, and the ack merges cleanly.
#[tokio::test]
async fn directory_and_conversation_follow_the_message_flow() {
    setup_logging();
    let api = scripted_session();
    let (engine, hub) = build_engine(api.clone());
    engine.sign_in().await.expect("sign in");

    // Alice says hello over the channel before her conversation is open
    hub.push_message(wire("m1", "alice", "me", "hello", 100));
    assert!(
        eventually(|| async {
            let entries = engine.directory_entries().await;
            entries[0].contact.id == "alice"
                && entries[0].last_message_preview.as_deref() == Some("hello")
        })
        .await,
        "directory should put Alice first with her message as preview"
    );

    // Opening the conversation folds the buffered push event in
    engine.select_contact("alice").await.expect("history load");
    let log = engine.messages("alice").await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].server_id.as_deref(), Some("m1"));

    // Optimistic send: visible as pending before the network settles
    api.queue_send_ok(wire("m2", "me", "alice", "hi", 200));
    let key = engine
        .send("alice", SendPayload::text("hi"))
        .await
        .expect("send");
    let log = engine.messages("alice").await;
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].local_key, key);
    assert_eq!(log[1].delivery_state, DeliveryState::Pending);

    // Settlement adopts the server id and timestamp
    assert!(
        eventually(|| async {
            let log = engine.messages("alice").await;
            log.len() == 2
                && log[1].delivery_state == DeliveryState::Sent
                && log[1].server_id.as_deref() == Some("m2")
        })
        .await,
        "ack should flip the entry to Sent with the server id"
    );

    // The push echo of our own message is absorbed, not duplicated
    hub.push_message(wire("m2", "me", "alice", "hi", 200));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let ids: Vec<_> = engine
        .messages("alice")
        .await
        .iter()
        .map(|m| m.server_id.clone().unwrap())
        .collect();
    assert_eq!(ids, vec!["m1", "m2"]);
}

#[tokio::test]
async fn presence_snapshots_replace_membership() {
    setup_logging();
    let api = scripted_session();
    let (engine, hub) = build_engine(api);
    engine.sign_in().await.expect("sign in");

    hub.push_presence(vec!["alice".to_string(), "bob".to_string()]);
    assert!(eventually(|| async { engine.is_online("alice").await && engine.is_online("bob").await }).await);

    hub.push_presence(vec!["bob".to_string()]);
    assert!(
        eventually(|| async { !engine.is_online("alice").await }).await,
        "alice must not stay online after a snapshot without her"
    );
    assert!(engine.is_online("bob").await);
    assert_eq!(engine.online_count().await, 1);
}

#[tokio::test]
async fn messages_between_strangers_are_ignored() {
    setup_logging();
    let api = scripted_session();
    let (engine, hub) = build_engine(api);
    engine.sign_in().await.expect("sign in");

    hub.push_message(wire("mx", "carol", "dave", "psst", 10));
    hub.push_presence(vec!["alice".to_string()]);

    // The presence event proves the message event was already routed
    assert!(eventually(|| async { engine.is_online("alice").await }).await);
    assert!(engine.messages("carol").await.is_empty());
    assert!(engine.messages("dave").await.is_empty());
}

#[tokio::test]
async fn failed_send_stays_visible_and_can_be_retried() {
    setup_logging();
    let api = scripted_session();
    let (engine, _hub) = build_engine(api.clone());
    engine.sign_in().await.expect("sign in");
    engine.select_contact("bob").await.expect("history load");

    api.queue_send_fail();
    let key = engine
        .send("bob", SendPayload::text("are you there?"))
        .await
        .expect("send");

    assert!(
        eventually(|| async {
            engine.messages("bob").await[0].delivery_state == DeliveryState::Failed
        })
        .await,
        "failed send must surface as Failed, not vanish"
    );

    // Retry runs through the same settle path and succeeds this time
    api.queue_send_ok(wire("m7", "me", "bob", "are you there?", 300));
    assert!(engine.retry_send(&key).await.expect("retry"));
    assert!(
        eventually(|| async {
            let log = engine.messages("bob").await;
            log[0].delivery_state == DeliveryState::Sent
                && log[0].server_id.as_deref() == Some("m7")
        })
        .await
    );

    // Retrying a delivered message is a no-op
    assert!(!engine.retry_send(&key).await.expect("retry"));
}

/// loadHistory("A") in flight, loadHistory("B") resolves first: A's late
/// result must not touch B.
#[tokio::test]
async fn stale_history_result_cannot_overwrite_newer_selection() {
    setup_logging();
    let api = scripted_session();
    api.set_history("alice", vec![wire("a1", "alice", "me", "old", 10)]);
    api.set_history("bob", vec![wire("b1", "bob", "me", "new", 20)]);
    let gate = api.gate_history("alice");

    let (engine, _hub) = build_engine(api);
    let engine = Arc::new(engine);
    engine.sign_in().await.expect("sign in");

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.select_contact("alice").await })
    };
    // Give the gated fetch time to issue its load token first
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    engine.select_contact("bob").await.expect("history load");
    gate.notify_one();
    pending.await.expect("join").expect("stale load is not an error");

    let bob: Vec<_> = engine
        .messages("bob")
        .await
        .iter()
        .map(|m| m.server_id.clone().unwrap())
        .collect();
    assert_eq!(bob, vec!["b1"], "bob's conversation must be unaffected");
    assert!(
        engine.messages("alice").await.is_empty(),
        "the superseded result must be discarded"
    );
}

#[tokio::test]
async fn identity_switch_purges_everything() {
    setup_logging();
    let api = scripted_session();
    let (engine, hub) = build_engine(api.clone());
    engine.sign_in().await.expect("sign in");
    engine.select_contact("alice").await.expect("history load");

    hub.push_message(wire("m1", "alice", "me", "for X only", 10));
    hub.push_presence(vec!["alice".to_string()]);
    assert!(eventually(|| async { !engine.messages("alice").await.is_empty() }).await);

    // The session is now user Y's
    api.set_identity(identity("you", "You"));
    api.set_contacts(vec![contact("alice", "Alice")]);
    engine.sign_in().await.expect("sign in as Y");

    assert!(
        engine.messages("alice").await.is_empty(),
        "X's conversation must not be observable under Y"
    );
    assert!(!engine.is_online("alice").await, "X's presence must not leak to Y");
    assert_eq!(hub.connected_identity().as_deref(), Some("you"));

    let entries = engine.directory_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].last_message_preview, None);
}

#[tokio::test]
async fn history_arriving_after_sign_out_is_discarded() {
    setup_logging();
    let api = scripted_session();
    api.set_history("alice", vec![wire("a1", "alice", "me", "late", 10)]);
    let gate = api.gate_history("alice");

    let (engine, _hub) = build_engine(api);
    let engine = Arc::new(engine);
    engine.sign_in().await.expect("sign in");

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.select_contact("alice").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    engine.sign_out().await;
    gate.notify_one();
    pending.await.expect("join").expect("discarded result is not an error");

    assert!(engine.messages("alice").await.is_empty());
    assert_eq!(engine.state(), EngineState::Disconnected);
    assert!(engine.current_identity().await.is_none());
}

#[tokio::test]
async fn transport_drop_reconnects_without_losing_state() {
    setup_logging();
    let api = scripted_session();
    let (engine, hub) = build_engine(api);
    engine.sign_in().await.expect("sign in");
    engine.select_contact("alice").await.expect("history load");

    hub.push_message(wire("m1", "alice", "me", "before the drop", 10));
    assert!(eventually(|| async { !engine.messages("alice").await.is_empty() }).await);

    hub.drop_connection();

    // The engine reconnects through the connector and keeps its state
    assert!(
        eventually(|| async {
            engine.state() == EngineState::Connected && hub.push_presence(vec!["alice".to_string()])
        })
        .await,
        "engine should come back up on the refreshed channel"
    );
    assert!(eventually(|| async { engine.is_online("alice").await }).await);
    assert_eq!(engine.messages("alice").await.len(), 1, "conversation survived the drop");
}

#[tokio::test]
async fn search_is_case_insensitive_and_non_destructive() {
    setup_logging();
    let api = scripted_session();
    let (engine, _hub) = build_engine(api);
    engine.sign_in().await.expect("sign in");

    let hits = engine.search_contacts("ALI").await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].contact.id, "alice");

    assert_eq!(engine.directory_entries().await.len(), 2);
}

#[tokio::test]
async fn empty_payload_is_rejected_before_the_log() {
    setup_logging();
    let api = scripted_session();
    let (engine, _hub) = build_engine(api);
    engine.sign_in().await.expect("sign in");
    engine.select_contact("alice").await.expect("history load");

    assert!(engine.send("alice", SendPayload::default()).await.is_err());
    assert!(engine.messages("alice").await.is_empty());
}
