use serde_json::json;
use std::collections::HashSet;
use wa_inbox::ws::{event_matches, WsCommand, WsEvent};

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_ws_event_roundtrip() {
    let event = WsEvent {
        event: "room_created".to_string(),
        payload: json!({"room_id": "r1", "lead": null}),
    };
    let raw = serde_json::to_string(&event).unwrap();
    let parsed: WsEvent = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed.event, "room_created");
    assert!(parsed.payload["lead"].is_null());
}

#[test]
fn test_connect_command_roundtrip() {
    let raw = r#"{"type":"connect","token":"tok-1"}"#;
    let cmd: WsCommand = serde_json::from_str(raw).unwrap();
    match cmd {
        WsCommand::Connect { token } => assert_eq!(token.as_deref(), Some("tok-1")),
        _ => panic!("wrong variant"),
    }
}

#[test]
fn test_subscribe_command_with_rooms_and_events() {
    let raw = r#"{"type":"subscribe","events":["message"],"rooms":["r1"]}"#;
    let cmd: WsCommand = serde_json::from_str(raw).unwrap();
    match cmd {
        WsCommand::Subscribe { events, rooms } => {
            assert_eq!(events.unwrap(), vec!["message".to_string()]);
            assert_eq!(rooms.unwrap(), vec!["r1".to_string()]);
        }
        _ => panic!("wrong variant"),
    }
}

#[test]
fn test_subscribe_command_omitted_filters() {
    let cmd: WsCommand = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
    match cmd {
        WsCommand::Subscribe { events, rooms } => {
            assert!(events.is_none());
            assert!(rooms.is_none());
        }
        _ => panic!("wrong variant"),
    }
}

#[test]
fn test_ping_command() {
    let cmd: WsCommand = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
    assert!(matches!(cmd, WsCommand::Ping));
}

#[test]
fn test_unfiltered_observer_sees_everything() {
    for name in ["room_created", "message", "status"] {
        let event = WsEvent {
            event: name.to_string(),
            payload: json!({"room_id": "r1"}),
        };
        assert!(event_matches(&event, None, None));
    }
}

#[test]
fn test_event_name_filter() {
    let event = WsEvent {
        event: "message".to_string(),
        payload: json!({"room_id": "r1"}),
    };
    assert!(event_matches(&event, Some(&set(&["message", "status"])), None));
    assert!(!event_matches(&event, Some(&set(&["status"])), None));
}

#[test]
fn test_room_scoped_observer_only_sees_its_rooms() {
    let mine = WsEvent {
        event: "message".to_string(),
        payload: json!({"room_id": "r1"}),
    };
    let other = WsEvent {
        event: "message".to_string(),
        payload: json!({"room_id": "r2"}),
    };
    let rooms = set(&["r1"]);
    assert!(event_matches(&mine, None, Some(&rooms)));
    assert!(!event_matches(&other, None, Some(&rooms)));
}

#[test]
fn test_room_created_always_delivered_to_scoped_observer() {
    // A scoped observer still needs to learn about new conversations.
    let event = WsEvent {
        event: "room_created".to_string(),
        payload: json!({"room_id": "brand-new"}),
    };
    assert!(event_matches(&event, None, Some(&set(&["r1"]))));
}

#[test]
fn test_message_without_room_id_blocked_by_scope() {
    let event = WsEvent {
        event: "message".to_string(),
        payload: json!({}),
    };
    assert!(!event_matches(&event, None, Some(&set(&["r1"]))));
}
