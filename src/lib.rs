pub mod config;
pub mod db;
pub mod media;
pub mod normalize;
pub mod notify;
pub mod outbound;
pub mod platform;
pub mod publish;
pub mod rooms;
pub mod status;
pub mod verify;
pub mod ws;

pub use config::Config;

use self::config::{load_config, resolve_database_url};
use self::db::DbKind;
use self::normalize::NormalizedMessage;
use self::outbound::{OutboundContent, SendError, SendRequest};
use self::publish::Publisher;

use axum::{
    extract::{Multipart, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub http: reqwest::Client,
    pub publisher: Publisher,
    pub db_kind: DbKind,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub external_id: String,
    pub room_id: String,
    pub persisted: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub rooms: i64,
    pub messages: i64,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let config = load_config();
    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let (ws_tx, _) = broadcast::channel(256);
    let state = AppState {
        config: config.clone(),
        pool,
        http: reqwest::Client::new(),
        publisher: Publisher::new(ws_tx),
        db_kind,
    };

    let app = build_router(&state);
    Ok((state, app))
}

pub fn build_router(state: &AppState) -> Router {
    let authed_routes = Router::new()
        .route("/v1/messages/send", post(send_message))
        .route("/v1/messages/send-media", post(send_media))
        .route("/v1/rooms", get(list_rooms))
        .route("/v1/rooms/:room_id/messages", get(list_room_messages))
        .route("/v1/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_counts))
        .route(
            &state.config.whatsapp.webhook_path,
            get(webhook_verify).post(webhook_inbound),
        );

    Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state.clone())
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers
            .get("X-Wa-Inbox-Token")
            .and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status_counts(State(state): State<AppState>) -> impl IntoResponse {
    let rooms = db::count_rooms(&state.pool).await;
    let messages = db::count_messages(&state.pool).await;
    Json(StatusResponse { rooms, messages })
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.publisher.subscribe();
    let token = state.config.auth.token.clone();
    ws.on_upgrade(move |socket| ws::handle_ws(socket, rx, token))
}

async fn webhook_verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let challenge = verify::handshake_response(
        state.config.whatsapp.verify_token.as_deref(),
        params.get("hub.mode").map(String::as_str),
        params.get("hub.verify_token").map(String::as_str),
        params.get("hub.challenge").map(String::as_str),
    );
    match challenge {
        Some(challenge) => {
            info!("webhook handshake accepted");
            challenge.into_response()
        }
        None => {
            warn!("webhook handshake rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn webhook_inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());
    let check = verify::check_signature(
        state.config.whatsapp.app_secret.as_deref(),
        signature,
        &body,
    );
    if !check.accepted() {
        warn!(result = ?check, "rejecting webhook batch with bad signature");
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad signature"})))
            .into_response();
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "webhook body is not json");
            return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid body"})))
                .into_response();
        }
    };

    let (messages, statuses) = normalize::extract_events(&payload);

    // Per-event failures are logged only; failing the batch would make the
    // platform redeliver every event in it.
    for message in messages {
        if let Err(err) = handle_inbound_message(&state, message).await {
            error!("inbound event error: {err:?}");
        }
    }

    for update in statuses {
        match status::apply_status(
            &state.pool,
            state.db_kind,
            &update,
            state.config.whatsapp.strict_status_order,
        )
        .await
        {
            Ok((status::StatusOutcome::Applied, Some(record))) => {
                state.publisher.status(&record);
            }
            Ok(_) => {}
            Err(err) => {
                error!(external_id = %update.external_id, "status apply error: {err:?}");
            }
        }
    }

    Json(json!({"status": "processed"})).into_response()
}

pub async fn handle_inbound_message(
    state: &AppState,
    inbound: NormalizedMessage,
) -> anyhow::Result<()> {
    let Some(handle) = rooms::normalize_handle(&inbound.from) else {
        warn!(from = %inbound.from, "dropping inbound event without a usable source handle");
        return Ok(());
    };

    // The platform redelivers webhook batches; the wamid is the dedupe key.
    if let Some(external_id) = inbound.external_id.as_deref() {
        if db::message_external_id_exists(&state.pool, state.db_kind, external_id)
            .await
            .unwrap_or(false)
        {
            return Ok(());
        }
    }

    let provision = rooms::resolve_or_create_room(
        &state.pool,
        state.db_kind,
        &handle,
        inbound.sender_name.as_deref(),
    )
    .await?;

    // First-message classification must read store state before this
    // message's own insert; see rooms::is_first_message.
    let first_message =
        rooms::is_first_message(&state.pool, state.db_kind, &provision.room.id).await?;

    let record = inbound.into_record(&provision.room.id);
    db::insert_message(&state.pool, state.db_kind, &record).await?;
    db::touch_room(&state.pool, state.db_kind, &provision.room.id).await?;

    if first_message {
        state
            .publisher
            .room_created(&provision.room, provision.lead.as_ref(), &record);
    } else {
        state.publisher.message(&record);
    }

    tokio::spawn(notify::push(
        state.http.clone(),
        state.config.notify.clone(),
        json!({
            "room_id": provision.room.id,
            "message_id": record.id,
            "preview": record.content_text,
        }),
    ));

    Ok(())
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> impl IntoResponse {
    match outbound::dispatch_send(
        &state.pool,
        state.db_kind,
        &state.http,
        &state.config.whatsapp,
        &state.publisher,
        request,
        None,
    )
    .await
    {
        Ok(receipt) => Json(SendMessageResponse {
            message_id: receipt.message_id,
            external_id: receipt.external_id,
            room_id: receipt.room_id,
            persisted: receipt.persisted,
        })
        .into_response(),
        Err(err) => send_error_response(err),
    }
}

fn send_error_response(err: SendError) -> axum::response::Response {
    let status = match &err {
        SendError::Invalid(_) => StatusCode::BAD_REQUEST,
        SendError::Platform(_) => StatusCode::BAD_GATEWAY,
        SendError::Provision(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!("send_message error: {err}");
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

/// Map an uploaded part's MIME type onto the platform media kind.
pub fn media_kind_from_mime(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or("").trim();
    if base.starts_with("image/") {
        "image"
    } else if base.starts_with("video/") {
        "video"
    } else if base.starts_with("audio/") {
        "audio"
    } else {
        "document"
    }
}

async fn send_media(State(state): State<AppState>, mut multipart: Multipart) -> impl IntoResponse {
    let mut to: Option<String> = None;
    let mut agent_id: Option<String> = None;
    let mut caption: Option<String> = None;
    let mut reply_to: Option<String> = None;
    let mut kind_override: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut mime_type: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("bad multipart body: {err}")})),
                )
                    .into_response();
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                filename = field.file_name().map(|s| s.to_string());
                mime_type = field.content_type().map(|s| s.to_string());
                match field.bytes().await {
                    Ok(bytes) => file_bytes = Some(bytes.to_vec()),
                    Err(err) => {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": format!("failed reading file: {err}")})),
                        )
                            .into_response();
                    }
                }
            }
            "to" => to = field.text().await.ok(),
            "agent_id" => agent_id = field.text().await.ok(),
            "caption" => caption = field.text().await.ok(),
            "reply_to" => reply_to = field.text().await.ok(),
            "kind" => kind_override = field.text().await.ok(),
            _ => {}
        }
    }

    let Some(to) = to.filter(|t| !t.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing to"}))).into_response();
    };
    let Some(bytes) = file_bytes else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing file"}))).into_response();
    };
    let mime_type = mime_type.unwrap_or_else(|| "application/octet-stream".to_string());
    let kind = kind_override.unwrap_or_else(|| media_kind_from_mime(&mime_type).to_string());

    let staged = match media::stage_outbound_media(
        &state.http,
        &state.config.storage,
        &state.config.whatsapp,
        bytes,
        &mime_type,
        filename.as_deref(),
    )
    .await
    {
        Ok(staged) => staged,
        Err(err) => {
            error!("media staging failed: {err}");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": err.to_string()})),
            )
                .into_response();
        }
    };

    let request = SendRequest {
        to,
        agent_id: agent_id.unwrap_or_else(|| "agent".to_string()),
        reply_to,
        content: OutboundContent::Media {
            kind,
            media_id: Some(staged.media_id.clone()),
            link: None,
            caption,
            filename: filename.clone(),
        },
    };

    match outbound::dispatch_send(
        &state.pool,
        state.db_kind,
        &state.http,
        &state.config.whatsapp,
        &state.publisher,
        request,
        Some(&staged),
    )
    .await
    {
        Ok(receipt) => Json(SendMessageResponse {
            message_id: receipt.message_id,
            external_id: receipt.external_id,
            room_id: receipt.room_id,
            persisted: receipt.persisted,
        })
        .into_response(),
        Err(err) => send_error_response(err),
    }
}

async fn list_rooms(State(state): State<AppState>, Query(page): Query<Pagination>) -> impl IntoResponse {
    let limit = page.limit.unwrap_or(100).min(500);
    let offset = page.offset.unwrap_or(0);
    let rooms = db::list_rooms(&state.pool, state.db_kind, limit, offset)
        .await
        .unwrap_or_default();
    Json(rooms)
}

async fn list_room_messages(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(page): Query<Pagination>,
) -> impl IntoResponse {
    let limit = page.limit.unwrap_or(200).min(500);
    let offset = page.offset.unwrap_or(0);
    let messages = db::list_messages(&state.pool, state.db_kind, &room_id, limit, offset)
        .await
        .unwrap_or_default();
    Json(messages)
}
