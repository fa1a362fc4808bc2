use chrono::{TimeZone, Utc};
use serde_json::json;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::sync::Once;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wa_inbox::config::{Config, StorageConfig, WhatsAppConfig};
use wa_inbox::db::{self, DbKind};
use wa_inbox::media;
use wa_inbox::normalize::{normalize_message, ContentKind, StatusUpdate};
use wa_inbox::outbound::{self, OutboundContent, SendError, SendRequest};
use wa_inbox::publish::Publisher;
use wa_inbox::rooms;
use wa_inbox::status::{self, StatusOutcome};
use wa_inbox::{handle_inbound_message, AppState};

static DRIVERS: Once = Once::new();

async fn test_pool() -> AnyPool {
    DRIVERS.call_once(sqlx::any::install_default_drivers);
    let pool = AnyPoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::init_db(&pool, DbKind::Sqlite).await.unwrap();
    pool
}

fn test_state(pool: AnyPool, whatsapp: WhatsAppConfig) -> AppState {
    let (tx, _) = tokio::sync::broadcast::channel(64);
    AppState {
        config: Config {
            whatsapp,
            ..Config::default()
        },
        pool,
        http: reqwest::Client::new(),
        publisher: Publisher::new(tx),
        db_kind: DbKind::Sqlite,
    }
}

fn inbound_text(from: &str, external_id: &str, body: &str) -> wa_inbox::normalize::NormalizedMessage {
    normalize_message(
        &json!({
            "from": from,
            "id": external_id,
            "timestamp": "1707900000",
            "type": "text",
            "text": {"body": body}
        }),
        &HashMap::new(),
    )
}

#[tokio::test]
async fn test_room_provisioning_is_idempotent() {
    let pool = test_pool().await;

    let first = rooms::resolve_or_create_room(&pool, DbKind::Sqlite, "15551234567", None)
        .await
        .unwrap();
    assert!(first.created);
    let lead = first.lead.expect("lead created with room");
    assert!(lead.name.contains("15551234567"));
    assert_eq!(lead.stage, "new");

    let second = rooms::resolve_or_create_room(&pool, DbKind::Sqlite, "15551234567", None)
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(first.room.id, second.room.id);
    assert_eq!(db::count_rooms(&pool).await, 1);
}

#[tokio::test]
async fn test_room_provisioning_concurrent_single_row() {
    let pool = test_pool().await;

    let (a, b) = tokio::join!(
        rooms::resolve_or_create_room(&pool, DbKind::Sqlite, "15550001111", None),
        rooms::resolve_or_create_room(&pool, DbKind::Sqlite, "15550001111", None),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.room.id, b.room.id);
    assert_eq!(db::count_rooms(&pool).await, 1);
}

#[tokio::test]
async fn test_first_message_composite_then_plain() {
    let pool = test_pool().await;
    let state = test_state(pool, WhatsAppConfig::default());
    let mut rx = state.publisher.subscribe();

    handle_inbound_message(&state, inbound_text("15551234567", "ext-1", "hi"))
        .await
        .unwrap();
    handle_inbound_message(&state, inbound_text("15551234567", "ext-2", "you there?"))
        .await
        .unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.event, "room_created");
    assert_eq!(first.payload["message"]["content_text"], "hi");
    assert_eq!(first.payload["message"]["external_id"], "ext-1");
    assert!(first.payload["lead"]["name"]
        .as_str()
        .unwrap()
        .contains("15551234567"));

    let second = rx.recv().await.unwrap();
    assert_eq!(second.event, "message");
    assert_eq!(second.payload["message"]["external_id"], "ext-2");

    // Exactly one composite, exactly one plain event.
    assert!(rx.try_recv().is_err());
    assert_eq!(db::count_rooms(&state.pool).await, 1);
    assert_eq!(db::count_messages(&state.pool).await, 2);
}

#[tokio::test]
async fn test_inbound_redelivery_deduped() {
    let pool = test_pool().await;
    let state = test_state(pool, WhatsAppConfig::default());

    handle_inbound_message(&state, inbound_text("15551234567", "ext-1", "hi"))
        .await
        .unwrap();
    handle_inbound_message(&state, inbound_text("15551234567", "ext-1", "hi"))
        .await
        .unwrap();

    assert_eq!(db::count_messages(&state.pool).await, 1);
}

#[tokio::test]
async fn test_unsupported_event_is_persisted_not_dropped() {
    let pool = test_pool().await;
    let state = test_state(pool, WhatsAppConfig::default());

    let inbound = normalize_message(
        &json!({"from": "15551234567", "id": "ext-9", "type": "hologram", "hologram": {}}),
        &HashMap::new(),
    );
    handle_inbound_message(&state, inbound).await.unwrap();

    let record = db::get_message_by_external_id(&state.pool, DbKind::Sqlite, "ext-9")
        .await
        .unwrap()
        .expect("placeholder persisted");
    assert_eq!(record.content_kind, ContentKind::Unsupported);
    assert!(record.metadata.is_some());
}

#[tokio::test]
async fn test_status_last_write_wins_by_default() {
    let pool = test_pool().await;
    let state = test_state(pool, WhatsAppConfig::default());
    handle_inbound_message(&state, inbound_text("15551234567", "wamid.out", "hi"))
        .await
        .unwrap();

    let read_at = Utc.timestamp_opt(1_707_900_500, 0).unwrap();
    let sent_at = Utc.timestamp_opt(1_707_900_100, 0).unwrap();

    let (outcome, _) = status::apply_status(
        &state.pool,
        DbKind::Sqlite,
        &StatusUpdate {
            external_id: "wamid.out".to_string(),
            status: "read".to_string(),
            status_at: Some(read_at),
            recipient_id: None,
        },
        false,
    )
    .await
    .unwrap();
    assert_eq!(outcome, StatusOutcome::Applied);

    // Late-arriving earlier status overwrites under last-write-wins.
    let (outcome, record) = status::apply_status(
        &state.pool,
        DbKind::Sqlite,
        &StatusUpdate {
            external_id: "wamid.out".to_string(),
            status: "sent".to_string(),
            status_at: Some(sent_at),
            recipient_id: None,
        },
        false,
    )
    .await
    .unwrap();
    assert_eq!(outcome, StatusOutcome::Applied);
    let record = record.unwrap();
    assert_eq!(record.delivery_status.as_deref(), Some("sent"));
    assert_eq!(record.status_at, Some(sent_at));
}

#[tokio::test]
async fn test_status_rank_guard_blocks_regression() {
    let pool = test_pool().await;
    let state = test_state(pool, WhatsAppConfig::default());
    handle_inbound_message(&state, inbound_text("15551234567", "wamid.out2", "hi"))
        .await
        .unwrap();

    let read_at = Utc.timestamp_opt(1_707_900_500, 0).unwrap();
    status::apply_status(
        &state.pool,
        DbKind::Sqlite,
        &StatusUpdate {
            external_id: "wamid.out2".to_string(),
            status: "read".to_string(),
            status_at: Some(read_at),
            recipient_id: None,
        },
        true,
    )
    .await
    .unwrap();

    let (outcome, _) = status::apply_status(
        &state.pool,
        DbKind::Sqlite,
        &StatusUpdate {
            external_id: "wamid.out2".to_string(),
            status: "sent".to_string(),
            status_at: Some(Utc.timestamp_opt(1_707_900_100, 0).unwrap()),
            recipient_id: None,
        },
        true,
    )
    .await
    .unwrap();
    assert_eq!(outcome, StatusOutcome::Regression);

    let stored = db::get_message_by_external_id(&state.pool, DbKind::Sqlite, "wamid.out2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.delivery_status.as_deref(), Some("read"));
    assert_eq!(stored.status_at, Some(read_at));
}

#[tokio::test]
async fn test_status_for_unknown_message_is_noop() {
    let pool = test_pool().await;
    let (outcome, record) = status::apply_status(
        &pool,
        DbKind::Sqlite,
        &StatusUpdate {
            external_id: "wamid.never-seen".to_string(),
            status: "delivered".to_string(),
            status_at: None,
            recipient_id: None,
        },
        false,
    )
    .await
    .unwrap();
    assert_eq!(outcome, StatusOutcome::Unknown);
    assert!(record.is_none());
}

fn mock_whatsapp_config(base_url: &str) -> WhatsAppConfig {
    WhatsAppConfig {
        access_token: Some("test-token".to_string()),
        phone_number_id: Some("pn-1".to_string()),
        graph_base_url: base_url.to_string(),
        ..WhatsAppConfig::default()
    }
}

#[tokio::test]
async fn test_dispatch_send_persists_after_platform_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pn-1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messaging_product": "whatsapp",
            "messages": [{"id": "wamid.sent-1"}]
        })))
        .mount(&server)
        .await;

    let pool = test_pool().await;
    let state = test_state(pool, mock_whatsapp_config(&server.uri()));
    let mut rx = state.publisher.subscribe();

    let receipt = outbound::dispatch_send(
        &state.pool,
        DbKind::Sqlite,
        &state.http,
        &state.config.whatsapp,
        &state.publisher,
        SendRequest {
            to: "+1 555 987 6543".to_string(),
            agent_id: "agent-7".to_string(),
            reply_to: None,
            content: OutboundContent::Text {
                body: "hello from the desk".to_string(),
            },
        },
        None,
    )
    .await
    .unwrap();

    assert_eq!(receipt.external_id, "wamid.sent-1");
    assert!(receipt.persisted);

    let stored = db::get_message_by_external_id(&state.pool, DbKind::Sqlite, "wamid.sent-1")
        .await
        .unwrap()
        .expect("record persisted with wamid already populated");
    assert_eq!(stored.sender_agent_id.as_deref(), Some("agent-7"));
    assert_eq!(stored.delivery_status.as_deref(), Some("sent"));
    assert_eq!(stored.room_id, receipt.room_id);

    // Outbound to a fresh handle announces the conversation atomically.
    let event = rx.recv().await.unwrap();
    assert_eq!(event.event, "room_created");
    assert_eq!(event.payload["message"]["external_id"], "wamid.sent-1");
}

#[tokio::test]
async fn test_dispatch_send_platform_failure_persists_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pn-1/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"message": "internal platform error"}
        })))
        .mount(&server)
        .await;

    let pool = test_pool().await;
    let state = test_state(pool, mock_whatsapp_config(&server.uri()));

    let result = outbound::dispatch_send(
        &state.pool,
        DbKind::Sqlite,
        &state.http,
        &state.config.whatsapp,
        &state.publisher,
        SendRequest {
            to: "15559876543".to_string(),
            agent_id: "agent".to_string(),
            reply_to: None,
            content: OutboundContent::Text {
                body: "never delivered".to_string(),
            },
        },
        None,
    )
    .await;

    assert!(matches!(result, Err(SendError::Platform(_))));
    assert_eq!(db::count_messages(&state.pool).await, 0);
}

#[tokio::test]
async fn test_dispatch_send_persist_failure_still_returns_wamid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pn-1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{"id": "wamid.orphan"}]
        })))
        .mount(&server)
        .await;

    let pool = test_pool().await;
    let state = test_state(pool, mock_whatsapp_config(&server.uri()));

    // Simulate the store losing the messages table between the external
    // send and the local write.
    sqlx::query("DROP TABLE messages")
        .execute(&state.pool)
        .await
        .unwrap();

    let receipt = outbound::dispatch_send(
        &state.pool,
        DbKind::Sqlite,
        &state.http,
        &state.config.whatsapp,
        &state.publisher,
        SendRequest {
            to: "15559876543".to_string(),
            agent_id: "agent".to_string(),
            reply_to: None,
            content: OutboundContent::Text {
                body: "delivered but unrecorded".to_string(),
            },
        },
        None,
    )
    .await
    .expect("external success is reported to the caller");

    assert_eq!(receipt.external_id, "wamid.orphan");
    assert!(!receipt.persisted);
}

#[tokio::test]
async fn test_media_staging_backup_failure_is_non_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pn-1/media"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "media-77"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let storage = StorageConfig {
        upload_url: Some(format!("{}/upload", server.uri())),
        api_token: None,
    };
    let whatsapp = mock_whatsapp_config(&server.uri());

    let staged = media::stage_outbound_media(
        &reqwest::Client::new(),
        &storage,
        &whatsapp,
        b"fake image bytes".to_vec(),
        "image/png",
        Some("pic.png"),
    )
    .await
    .expect("platform upload alone is enough");

    assert_eq!(staged.media_id, "media-77");
    assert!(staged.backup_path.is_none());
    assert!(staged.backup_url.is_none());
    assert_eq!(staged.size, 16);
}

#[tokio::test]
async fn test_media_staging_platform_failure_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pn-1/media"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"message": "upload refused"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "backups/pic.png",
            "url": "https://store.example.com/backups/pic.png"
        })))
        .mount(&server)
        .await;

    let storage = StorageConfig {
        upload_url: Some(format!("{}/upload", server.uri())),
        api_token: None,
    };
    let whatsapp = mock_whatsapp_config(&server.uri());

    let result = media::stage_outbound_media(
        &reqwest::Client::new(),
        &storage,
        &whatsapp,
        b"fake image bytes".to_vec(),
        "image/png",
        Some("pic.png"),
    )
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_media_staging_both_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pn-1/media"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "media-88"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "backups/doc.pdf",
            "url": "https://store.example.com/backups/doc.pdf"
        })))
        .mount(&server)
        .await;

    let storage = StorageConfig {
        upload_url: Some(format!("{}/upload", server.uri())),
        api_token: Some("storage-token".to_string()),
    };
    let whatsapp = mock_whatsapp_config(&server.uri());

    let staged = media::stage_outbound_media(
        &reqwest::Client::new(),
        &storage,
        &whatsapp,
        b"%PDF-1.4".to_vec(),
        "application/pdf",
        Some("doc.pdf"),
    )
    .await
    .unwrap();

    assert_eq!(staged.media_id, "media-88");
    assert_eq!(staged.backup_path.as_deref(), Some("backups/doc.pdf"));
    assert_eq!(
        staged.backup_url.as_deref(),
        Some("https://store.example.com/backups/doc.pdf")
    );
}
