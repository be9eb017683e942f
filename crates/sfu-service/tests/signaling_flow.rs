//! End-to-end signaling flows.
//!
//! Each test drives one or more `TestClient`s through a real
//! `ConnectionActor`, `SignalingSession`, `RoomActor` and the loopback
//! engine, and checks both the frames clients see and the resources left in
//! the engine.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use serde_json::{json, Value};
use sfu_service::directory::{MeetingDirectory, MeetingSettings};
use sfu_service::engine::{EngineOp, LoopbackEngine};
use sfu_service::errors::EngineError;
use sfu_test_utils::*;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn str_field<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing {pointer} in {value}"))
}

/// Create and connect a transport, returning its id.
async fn connected_transport(client: &mut TestClient, direction: &str) -> String {
    let reply = client
        .request("create-transport", json!({"direction": direction}))
        .await;
    let transport_id = str_field(assert_success(&reply), "/id").to_string();

    let reply = client
        .request(
            "connect-transport",
            json!({
                "transportId": transport_id,
                "dtlsParameters": to_json(&test_dtls_parameters()),
            }),
        )
        .await;
    assert_success(&reply);
    transport_id
}

async fn produce_video(client: &mut TestClient) -> (String, String) {
    let transport_id = connected_transport(client, "send").await;
    let reply = client
        .request(
            "produce",
            json!({
                "transportId": transport_id,
                "kind": "video",
                "rtpParameters": to_json(&vp8_rtp_parameters()),
            }),
        )
        .await;
    let producer_id = str_field(assert_success(&reply), "/producerId").to_string();
    (transport_id, producer_id)
}

// ============================================================================
// Join
// ============================================================================

#[tokio::test]
async fn test_join_reply_carries_router_capabilities() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");

    let data = alice.join("m-1").await;

    assert_eq!(data["meeting"]["id"], json!("m-1"));
    assert_eq!(data["participant"]["userId"], json!("alice"));
    assert!(!data["rtpCapabilities"]["codecs"].as_array().unwrap().is_empty());
    assert_eq!(data["existingParticipants"], json!([]));
    assert_eq!(data["producers"], json!([]));
}

#[tokio::test]
async fn test_requests_before_join_are_rejected() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");

    let reply = alice.request("create-transport", Value::Null).await;
    assert_error_code(&reply, "INVALID_STATE");

    let reply = alice.request("toggle-mute", Value::Null).await;
    assert_error_code(&reply, "INVALID_STATE");

    // Nothing reached the engine.
    assert_eq!(sfu.engine.call_count(EngineOp::CreateRouter), 0);
}

#[tokio::test]
async fn test_state_is_checked_before_payload() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");

    let reply = alice.request("produce", json!({"kind": 42})).await;
    assert_error_code(&reply, "INVALID_STATE");

    alice.join("m-1").await;
    let reply = alice.request("leave-meeting", Value::Null).await;
    assert_success(&reply);

    let reply = alice.request("consume", json!("garbage")).await;
    assert_error_code(&reply, "INVALID_STATE");

    // Unknown types are still a request error in any state.
    let reply = alice.request("launch-rocket", Value::Null).await;
    assert_error_code(&reply, "INVALID_REQUEST");
}

#[tokio::test]
async fn test_malformed_frames_get_invalid_request() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");

    let reply = alice.send_raw("{not json").await;
    assert_error_code(&reply, "INVALID_REQUEST");
    assert_eq!(reply["id"], Value::Null);

    let reply = alice.request("launch-rocket", Value::Null).await;
    assert_error_code(&reply, "INVALID_REQUEST");

    let reply = alice.request("join-meeting", json!({"meeting": 7})).await;
    assert_error_code(&reply, "INVALID_REQUEST");

    // The connection survives bad input.
    alice.join("m-1").await;
}

#[tokio::test]
async fn test_late_joiner_sees_existing_producer_once() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");
    let alice_pid = str_field(&alice.join("m-1").await, "/participant/id").to_string();
    let (_, producer_id) = produce_video(&mut alice).await;

    let mut bob = sfu.connect("bob");
    let data = bob.join("m-1").await;

    let producers = data["producers"].as_array().unwrap();
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0]["producerId"], json!(producer_id));
    assert_eq!(producers[0]["participantId"], json!(alice_pid));
    assert_eq!(producers[0]["kind"], json!("video"));

    let existing = data["existingParticipants"].as_array().unwrap();
    assert_eq!(existing.len(), 1);
    assert_eq!(existing[0]["userId"], json!("alice"));

    // Alice hears about Bob.
    let event = alice.next_event_named("participant-joined").await;
    assert_eq!(event["data"]["participant"]["userId"], json!("bob"));
}

#[tokio::test]
async fn test_password_protected_meeting() {
    let sfu = TestSfu::builder().without_auto_provision().build().await;
    sfu.directory
        .register_meeting(MeetingSettings {
            meeting_id: Some("locked".to_string()),
            title: "Locked".to_string(),
            host_id: "host".to_string(),
            password: Some("hunter2".to_string()),
            ..MeetingSettings::default()
        })
        .await
        .unwrap();

    let mut alice = sfu.connect("alice");
    let reply = alice
        .request("join-meeting", json!({"meetingId": "locked", "password": "nope"}))
        .await;
    assert_error_code(&reply, "FORBIDDEN");

    let reply = alice.request("join-meeting", json!({"meetingId": "other"})).await;
    assert_error_code(&reply, "MEETING_NOT_FOUND");

    let reply = alice
        .request("join-meeting", json!({"meetingId": "locked", "password": "hunter2"}))
        .await;
    assert_success(&reply);
}

#[tokio::test]
async fn test_meeting_capacity() {
    let sfu = TestSfu::builder().max_participants(1).build().await;
    let mut alice = sfu.connect("alice");
    alice.join("m-1").await;

    let mut bob = sfu.connect("bob");
    let reply = bob.request("join-meeting", json!({"meetingId": "m-1"})).await;
    assert_error_code(&reply, "MEETING_FULL");

    // A rejected join leaves nothing in the room.
    let room = sfu.service.registry().get("m-1".to_string()).await.unwrap().unwrap();
    assert_eq!(room.get_state().await.unwrap().participants.len(), 1);
}

// ============================================================================
// Media
// ============================================================================

#[tokio::test]
async fn test_new_producer_reaches_other_members() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");
    let mut bob = sfu.connect("bob");
    alice.join("m-1").await;
    bob.join("m-1").await;

    let (_, producer_id) = produce_video(&mut alice).await;

    let event = bob.next_event_named("new-producer").await;
    assert_eq!(event["data"]["producerId"], json!(producer_id));
    assert_eq!(event["data"]["kind"], json!("video"));

    // The producer never announces itself to its owner.
    while let Some(event) = alice.try_event(Duration::from_millis(50)).await {
        assert_ne!(event["event"], json!("new-producer"), "echoed: {event}");
    }
}

#[tokio::test]
async fn test_produce_requires_connected_transport() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");
    alice.join("m-1").await;

    let reply = alice.request("create-transport", json!({"direction": "send"})).await;
    let transport_id = str_field(assert_success(&reply), "/id").to_string();

    let reply = alice
        .request(
            "produce",
            json!({
                "transportId": transport_id,
                "kind": "audio",
                "rtpParameters": to_json(&opus_rtp_parameters()),
            }),
        )
        .await;
    assert_error_code(&reply, "INVALID_STATE");

    let reply = alice
        .request(
            "produce",
            json!({
                "transportId": "no-such-transport",
                "kind": "audio",
                "rtpParameters": to_json(&opus_rtp_parameters()),
            }),
        )
        .await;
    assert_error_code(&reply, "NOT_FOUND");
    assert_eq!(sfu.engine.resource_counts().producers, 0);
}

#[tokio::test]
async fn test_incompatible_then_compatible_consume() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");
    let mut bob = sfu.connect("bob");
    alice.join("m-1").await;
    bob.join("m-1").await;
    let (_, producer_id) = produce_video(&mut alice).await;

    let recv_transport = connected_transport(&mut bob, "recv").await;

    // Audio-only client cannot decode VP8: success, nothing created.
    let reply = bob
        .request(
            "consume",
            json!({
                "transportId": recv_transport,
                "producerId": producer_id,
                "rtpCapabilities": to_json(&audio_only_capabilities()),
            }),
        )
        .await;
    let data = assert_success(&reply);
    assert_eq!(data["incompatible"], json!(true));
    assert_eq!(data["producerId"], json!(producer_id));
    assert_eq!(sfu.engine.resource_counts().consumers, 0);

    let reply = bob
        .request(
            "consume",
            json!({
                "transportId": recv_transport,
                "producerId": producer_id,
                "rtpCapabilities": to_json(&full_capabilities()),
            }),
        )
        .await;
    let data = assert_success(&reply);
    let consumer_id = str_field(data, "/id").to_string();
    assert_eq!(data["producerId"], json!(producer_id));
    assert_eq!(data["kind"], json!("video"));
    assert_eq!(data["paused"], json!(true));
    assert!(!sfu.engine.is_flowing(&consumer_id));

    let reply = bob
        .request("resume-consumer", json!({"consumerId": consumer_id}))
        .await;
    assert_success(&reply);
    assert!(sfu.engine.is_flowing(&consumer_id));
}

#[tokio::test]
async fn test_consume_unknown_producer() {
    let sfu = TestSfu::start().await;
    let mut bob = sfu.connect("bob");
    bob.join("m-1").await;
    let recv_transport = connected_transport(&mut bob, "recv").await;

    let reply = bob
        .request(
            "consume",
            json!({
                "transportId": recv_transport,
                "producerId": "ghost",
                "rtpCapabilities": to_json(&full_capabilities()),
            }),
        )
        .await;
    assert_error_code(&reply, "NOT_FOUND");
}

#[tokio::test]
async fn test_pause_resume_close_producer_events() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");
    let mut bob = sfu.connect("bob");
    alice.join("m-1").await;
    bob.join("m-1").await;
    let (_, producer_id) = produce_video(&mut alice).await;
    bob.next_event_named("new-producer").await;

    let target = json!({"producerId": producer_id});
    assert_success(&alice.request("pause-producer", target.clone()).await);
    let event = bob.next_event_named("producer-paused").await;
    assert_eq!(event["data"]["producerId"], json!(producer_id));

    assert_success(&alice.request("resume-producer", target.clone()).await);
    bob.next_event_named("producer-resumed").await;

    assert_success(&alice.request("close-producer", target.clone()).await);
    bob.next_event_named("producer-closed").await;
    assert!(!sfu.engine.producer_exists(&producer_id));

    // Only the owner may touch a producer, and a closed one is gone.
    let reply = alice.request("pause-producer", target).await;
    assert_error_code(&reply, "NOT_FOUND");
}

#[tokio::test]
async fn test_engine_rejection_is_reported() {
    let engine = Arc::new(LoopbackEngine::new());
    let sfu = TestSfu::builder().engine(engine.clone()).build().await;
    let mut alice = sfu.connect("alice");
    alice.join("m-1").await;
    let transport_id = connected_transport(&mut alice, "send").await;

    engine.fail_next(EngineOp::Produce, EngineError::Rejected("bad codec".to_string()));
    let reply = alice
        .request(
            "produce",
            json!({
                "transportId": transport_id,
                "kind": "audio",
                "rtpParameters": to_json(&opus_rtp_parameters()),
            }),
        )
        .await;
    assert_error_code(&reply, "ENGINE_ERROR");
    // Engine detail is not leaked.
    assert!(!reply.to_string().contains("bad codec"));
    assert_eq!(engine.resource_counts().producers, 0);
}

// ============================================================================
// Participant status
// ============================================================================

#[tokio::test]
async fn test_toggles_are_broadcast() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");
    let mut bob = sfu.connect("bob");
    let alice_pid = str_field(&alice.join("m-1").await, "/participant/id").to_string();
    bob.join("m-1").await;

    let reply = alice.request("toggle-mute", Value::Null).await;
    assert_eq!(assert_success(&reply)["isMuted"], json!(true));
    let event = bob.next_event_named("participant-updated").await;
    assert_eq!(event["data"]["participantId"], json!(alice_pid));
    assert_eq!(event["data"]["updates"]["isMuted"], json!(true));

    let reply = alice.request("toggle-mute", Value::Null).await;
    assert_eq!(assert_success(&reply)["isMuted"], json!(false));

    let reply = alice.request("start-screen-share", Value::Null).await;
    assert_eq!(assert_success(&reply)["isScreenSharing"], json!(true));
    let reply = alice.request("start-screen-share", Value::Null).await;
    assert_eq!(assert_success(&reply)["isScreenSharing"], json!(true));
    let reply = alice.request("stop-screen-share", Value::Null).await;
    assert_eq!(assert_success(&reply)["isScreenSharing"], json!(false));

    let reply = alice.request("toggle-hand", Value::Null).await;
    assert_eq!(assert_success(&reply)["isHandRaised"], json!(true));

    let active = sfu.directory.active_participants("m-1").await.unwrap();
    let record = active.iter().find(|p| p.id == alice_pid).unwrap();
    assert!(record.is_hand_raised);
    assert!(!record.is_muted);
}

// ============================================================================
// Leave, disconnect and meeting end
// ============================================================================

#[tokio::test]
async fn test_leave_tears_down_and_notifies() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");
    let mut bob = sfu.connect("bob");
    let alice_pid = str_field(&alice.join("m-1").await, "/participant/id").to_string();
    bob.join("m-1").await;
    let (transport_id, producer_id) = produce_video(&mut alice).await;

    assert_success(&alice.request("leave-meeting", Value::Null).await);

    let event = bob.next_event_named("producer-closed").await;
    assert_eq!(event["data"]["producerId"], json!(producer_id));
    let event = bob.next_event_named("participant-left").await;
    assert_eq!(event["data"]["participantId"], json!(alice_pid));

    assert_eq!(sfu.engine.close_count(&producer_id), 1);
    assert_eq!(sfu.engine.close_count(&transport_id), 1);

    // The session is finished.
    let reply = alice.request("create-transport", Value::Null).await;
    assert_error_code(&reply, "INVALID_STATE");
    let reply = alice.request("join-meeting", json!({"meetingId": "m-1"})).await;
    assert_error_code(&reply, "INVALID_STATE");
}

#[tokio::test]
async fn test_disconnect_without_leave_cleans_up_once() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");
    let mut bob = sfu.connect("bob");
    let alice_pid = str_field(&alice.join("m-1").await, "/participant/id").to_string();
    bob.join("m-1").await;
    let (transport_id, producer_id) = produce_video(&mut alice).await;

    alice.disconnect().await;

    let event = bob.next_event_named("participant-left").await;
    assert_eq!(event["data"]["participantId"], json!(alice_pid));
    assert_eq!(sfu.engine.close_count(&producer_id), 1);
    assert_eq!(sfu.engine.close_count(&transport_id), 1);

    let active = sfu.directory.active_participants("m-1").await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].user_id, "bob");

    // No second participant-left.
    while let Some(event) = bob.try_event(Duration::from_millis(50)).await {
        assert_ne!(event["event"], json!("participant-left"), "duplicate: {event}");
    }
}

#[tokio::test]
async fn test_reconnect_keeps_published_media() {
    let sfu = TestSfu::start().await;
    let mut first = sfu.connect("alice");
    let alice_pid = str_field(&first.join("m-1").await, "/participant/id").to_string();
    let (_, producer_id) = produce_video(&mut first).await;

    // Same user on a new connection before the old one is gone.
    let mut second = sfu.connect("alice");
    let data = second.join("m-1").await;
    assert_eq!(data["participant"]["id"], json!(alice_pid));

    // The stale connection closing does not remove the participant.
    first.disconnect().await;
    assert!(sfu.engine.producer_exists(&producer_id));

    let room = sfu.service.registry().get("m-1".to_string()).await.unwrap().unwrap();
    let state = room.get_state().await.unwrap();
    assert_eq!(state.participants.len(), 1);
    assert_eq!(state.participants[0].producers, 1);

    let mut bob = sfu.connect("bob");
    let data = bob.join("m-1").await;
    assert_eq!(data["producers"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_replaced_connection_is_rejected() {
    let sfu = TestSfu::start().await;
    let mut first = sfu.connect("alice");
    let alice_pid = str_field(&first.join("m-1").await, "/participant/id").to_string();
    let (_, producer_id) = produce_video(&mut first).await;

    let mut second = sfu.connect("alice");
    second.join("m-1").await;

    let event = first.next_event_named("session-replaced").await;
    assert_eq!(event["data"]["participantId"], json!(alice_pid));

    let reply = first
        .request("create-transport", json!({"direction": "send"}))
        .await;
    assert_error_code(&reply, "INVALID_STATE");
    let reply = first.request("leave-meeting", Value::Null).await;
    assert_error_code(&reply, "INVALID_STATE");

    // The newer connection still owns the participant and its media.
    assert!(sfu.engine.producer_exists(&producer_id));
    let room = sfu.service.registry().get("m-1".to_string()).await.unwrap().unwrap();
    assert_eq!(room.get_state().await.unwrap().participants.len(), 1);
    let active = sfu.directory.active_participants("m-1").await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, alice_pid);

    let reply = second.request("toggle-mute", Value::Null).await;
    assert_success(&reply);
}

#[tokio::test]
async fn test_end_meeting_closes_sessions() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.connect("alice");
    let mut bob = sfu.connect("bob");
    alice.join("m-1").await;
    bob.join("m-1").await;
    let (_, producer_id) = produce_video(&mut alice).await;

    sfu.service.end_meeting("m-1").await.unwrap();

    let event = alice.next_event_named("room-closed").await;
    assert_eq!(event["data"]["meetingId"], json!("m-1"));
    bob.next_event_named("room-closed").await;
    assert!(!sfu.engine.producer_exists(&producer_id));
    assert_eq!(sfu.engine.resource_counts().routers, 0);

    let reply = alice.request("toggle-mute", Value::Null).await;
    assert_error_code(&reply, "INVALID_STATE");

    let mut carol = sfu.connect("carol");
    let reply = carol.request("join-meeting", json!({"meetingId": "m-1"})).await;
    assert_error_code(&reply, "MEETING_ENDED");
}
