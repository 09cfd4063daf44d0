//! Wire format of transport events as seen by out-of-process collaborators

use kara_common::events::{EventBus, KaraokeEvent};
use uuid::Uuid;

#[test]
fn test_events_carry_type_tag_and_fields() {
    let track_id = Uuid::new_v4();
    let event = KaraokeEvent::BothStreamsEnded {
        track_id,
        timestamp: chrono::Utc::now(),
    };

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "BothStreamsEnded");
    assert_eq!(json["track_id"], track_id.to_string());
    assert!(json["timestamp"].is_string());
}

#[test]
fn test_events_deserialize_from_collaborator_json() {
    let json = r#"{
        "type": "LoopCleared",
        "time": 20.03,
        "timestamp": "2026-01-01T12:00:00Z"
    }"#;

    let event: KaraokeEvent = serde_json::from_str(json).unwrap();
    match event {
        KaraokeEvent::LoopCleared { time, .. } => assert_eq!(time, 20.03),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_unknown_event_type_rejected() {
    let json = r#"{"type": "QueueChanged", "timestamp": "2026-01-01T12:00:00Z"}"#;
    assert!(serde_json::from_str::<KaraokeEvent>(json).is_err());
}

#[tokio::test]
async fn test_buses_are_independent() {
    let first = EventBus::default();
    let second = EventBus::default();
    let mut rx = second.subscribe();

    first.emit_lossy(KaraokeEvent::RateChanged {
        rate: 0.5,
        timestamp: chrono::Utc::now(),
    });
    second.emit_lossy(KaraokeEvent::FollowerUnavailable {
        reason: "404".to_string(),
        timestamp: chrono::Utc::now(),
    });

    assert_eq!(rx.recv().await.unwrap().name(), "follower-unavailable");
    assert!(rx.try_recv().is_err());
    assert_eq!(first.capacity(), 256);
}
