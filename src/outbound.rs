use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::AnyPool;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::config::WhatsAppConfig;
use crate::db::{self, DbKind, MessageRecord};
use crate::media::StagedMedia;
use crate::normalize::{self, ContentKind};
use crate::platform;
use crate::publish::Publisher;
use crate::rooms;

/// What an agent asked to send. The tag mirrors the platform's message
/// types so the request body reads like the wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundContent {
    Text {
        body: String,
    },
    Media {
        kind: String,
        media_id: Option<String>,
        link: Option<String>,
        caption: Option<String>,
        filename: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    Contacts {
        contacts: Value,
    },
    Reaction {
        target_external_id: String,
        emoji: String,
    },
    Template {
        name: String,
        language: String,
        components: Option<Value>,
    },
}

fn default_agent_id() -> String {
    "agent".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    pub to: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    pub reply_to: Option<String>,
    #[serde(flatten)]
    pub content: OutboundContent,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub external_id: String,
    pub room_id: String,
    /// False only in the known, bounded inconsistency: the platform send
    /// succeeded but the local record could not be written.
    pub persisted: bool,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid send request: {0}")]
    Invalid(String),
    /// The external call never happened or failed; nothing was persisted.
    #[error("platform send failed: {0}")]
    Platform(String),
    /// Provisioning failed before the external call was attempted.
    #[error("room provisioning failed: {0}")]
    Provision(String),
}

/// Build the Cloud API request body for a content descriptor.
pub fn build_message_body(
    to: &str,
    content: &OutboundContent,
    reply_to: Option<&str>,
) -> Result<Value, SendError> {
    let mut body = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
    });

    match content {
        OutboundContent::Text { body: text } => {
            if text.trim().is_empty() {
                return Err(SendError::Invalid("text body is empty".to_string()));
            }
            body["type"] = json!("text");
            body["text"] = json!({"preview_url": false, "body": text});
        }
        OutboundContent::Media {
            kind,
            media_id,
            link,
            caption,
            filename,
        } => {
            if !matches!(
                kind.as_str(),
                "image" | "audio" | "video" | "document" | "sticker"
            ) {
                return Err(SendError::Invalid(format!("unknown media kind {kind}")));
            }
            let mut media = serde_json::Map::new();
            match (media_id, link) {
                (Some(id), _) => {
                    media.insert("id".to_string(), json!(id));
                }
                (None, Some(url)) => {
                    media.insert("link".to_string(), json!(url));
                }
                (None, None) => {
                    return Err(SendError::Invalid(
                        "media requires an id or a link".to_string(),
                    ));
                }
            }
            if let Some(caption) = caption {
                if !caption.trim().is_empty() && kind != "sticker" && kind != "audio" {
                    media.insert("caption".to_string(), json!(caption));
                }
            }
            if kind == "document" {
                if let Some(filename) = filename {
                    media.insert("filename".to_string(), json!(filename));
                }
            }
            body["type"] = json!(kind);
            body[kind.as_str()] = Value::Object(media);
        }
        OutboundContent::Location {
            latitude,
            longitude,
            name,
            address,
        } => {
            let mut location = serde_json::Map::new();
            location.insert("latitude".to_string(), json!(latitude));
            location.insert("longitude".to_string(), json!(longitude));
            if let Some(name) = name {
                location.insert("name".to_string(), json!(name));
            }
            if let Some(address) = address {
                location.insert("address".to_string(), json!(address));
            }
            body["type"] = json!("location");
            body["location"] = Value::Object(location);
        }
        OutboundContent::Contacts { contacts } => {
            if !contacts.is_array() {
                return Err(SendError::Invalid("contacts must be an array".to_string()));
            }
            body["type"] = json!("contacts");
            body["contacts"] = contacts.clone();
        }
        OutboundContent::Reaction {
            target_external_id,
            emoji,
        } => {
            if target_external_id.trim().is_empty() {
                return Err(SendError::Invalid("reaction target is empty".to_string()));
            }
            body["type"] = json!("reaction");
            body["reaction"] = json!({"message_id": target_external_id, "emoji": emoji});
        }
        OutboundContent::Template {
            name,
            language,
            components,
        } => {
            if name.trim().is_empty() {
                return Err(SendError::Invalid("template name is empty".to_string()));
            }
            let mut template = json!({"name": name, "language": {"code": language}});
            if let Some(components) = components {
                template["components"] = components.clone();
            }
            body["type"] = json!("template");
            body["template"] = template;
        }
    }

    // Reactions reference their target via the reaction object itself,
    // not a reply context.
    if let Some(reply_to) = reply_to {
        if !matches!(content, OutboundContent::Reaction { .. }) {
            body["context"] = json!({"message_id": reply_to});
        }
    }

    Ok(body)
}

fn record_for_send(
    room_id: &str,
    request: &SendRequest,
    external_id: &str,
    staged: Option<&StagedMedia>,
) -> MessageRecord {
    let now = Utc::now();
    let mut record = MessageRecord {
        id: Uuid::new_v4().to_string(),
        room_id: room_id.to_string(),
        sender_agent_id: Some(request.agent_id.clone()),
        content_kind: ContentKind::Text,
        content_text: None,
        external_id: Some(external_id.to_string()),
        delivery_status: Some("sent".to_string()),
        status_at: None,
        media_kind: None,
        media_id: None,
        backup_path: None,
        backup_url: None,
        media_size: None,
        mime_type: None,
        filename: None,
        reply_to_external_id: request.reply_to.clone(),
        reaction_emoji: None,
        reaction_to_external_id: None,
        metadata: None,
        created_at: now,
        updated_at: now,
    };

    match &request.content {
        OutboundContent::Text { body } => {
            record.content_kind = ContentKind::Text;
            record.content_text = Some(body.clone());
        }
        OutboundContent::Media {
            kind,
            media_id,
            link,
            caption,
            filename,
        } => {
            record.content_kind = ContentKind::Media;
            record.media_kind = Some(kind.clone());
            record.media_id = media_id.clone();
            record.filename = filename.clone();
            record.content_text = Some(
                caption
                    .clone()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| normalize::media_fallback_text(kind).to_string()),
            );
            if let Some(staged) = staged {
                record.media_id = Some(staged.media_id.clone());
                record.backup_path = staged.backup_path.clone();
                record.backup_url = staged.backup_url.clone();
                record.media_size = Some(staged.size);
                record.mime_type = Some(staged.mime_type.clone());
                if record.filename.is_none() {
                    record.filename = staged.filename.clone();
                }
            }
            if let Some(link) = link {
                record.metadata = Some(json!({"link": link}));
            }
        }
        OutboundContent::Location {
            latitude,
            longitude,
            name,
            address,
        } => {
            record.content_kind = ContentKind::Location;
            let mut location = serde_json::Map::new();
            location.insert("latitude".to_string(), json!(latitude));
            location.insert("longitude".to_string(), json!(longitude));
            if let Some(name) = name {
                location.insert("name".to_string(), json!(name));
            }
            if let Some(address) = address {
                location.insert("address".to_string(), json!(address));
            }
            let metadata = Value::Object(location);
            record.content_text = Some(normalize::location_summary(&metadata));
            record.metadata = Some(metadata);
        }
        OutboundContent::Contacts { contacts } => {
            record.content_kind = ContentKind::Contacts;
            let metadata = json!({"contacts": contacts});
            record.content_text = Some(normalize::contacts_summary(&metadata));
            record.metadata = Some(metadata);
        }
        OutboundContent::Reaction {
            target_external_id,
            emoji,
        } => {
            record.content_kind = ContentKind::Reaction;
            record.reaction_emoji = Some(emoji.clone());
            record.reaction_to_external_id = Some(target_external_id.clone());
            let metadata = json!({"message_id": target_external_id, "emoji": emoji});
            record.content_text = Some(normalize::reaction_summary(&metadata));
            record.metadata = Some(metadata);
        }
        OutboundContent::Template {
            name,
            language,
            components,
        } => {
            record.content_kind = ContentKind::Text;
            record.content_text = Some(format!("Sent template {name}"));
            record.metadata = Some(json!({
                "template": {"name": name, "language": language, "components": components}
            }));
        }
    }

    record
}

/// Agent-originated send. Ordering is fixed: call the platform first,
/// persist the record with the returned wamid second, publish third. A
/// platform failure aborts with nothing persisted; a persistence failure
/// after a successful send is logged loudly and still reported to the
/// caller as a success carrying the wamid.
pub async fn dispatch_send(
    pool: &AnyPool,
    db_kind: DbKind,
    http: &Client,
    whatsapp: &WhatsAppConfig,
    publisher: &Publisher,
    request: SendRequest,
    staged: Option<&StagedMedia>,
) -> Result<SendReceipt, SendError> {
    let handle = rooms::normalize_handle(&request.to)
        .ok_or_else(|| SendError::Invalid(format!("target handle {:?} has no digits", request.to)))?;

    let body = build_message_body(&handle, &request.content, request.reply_to.as_deref())?;

    let provision = rooms::resolve_or_create_room(pool, db_kind, &handle, None)
        .await
        .map_err(|err| SendError::Provision(err.to_string()))?;
    let first_message = rooms::is_first_message(pool, db_kind, &provision.room.id)
        .await
        .unwrap_or(provision.created);

    let external_id = platform::send_message(http, whatsapp, &body)
        .await
        .map_err(|err| SendError::Platform(err.to_string()))?;

    let record = record_for_send(&provision.room.id, &request, &external_id, staged);

    let persisted = match db::insert_message(pool, db_kind, &record).await {
        Ok(()) => {
            let _ = db::touch_room(pool, db_kind, &provision.room.id).await;
            true
        }
        Err(err) => {
            // The message is already on the wire; never retry the external
            // call. Surface the gap as an operational alert instead.
            error!(
                external_id = %external_id,
                room_id = %provision.room.id,
                error = %err,
                "message delivered externally but local record could not be persisted"
            );
            false
        }
    };

    if persisted {
        if first_message {
            publisher.room_created(&provision.room, provision.lead.as_ref(), &record);
        } else {
            publisher.message(&record);
        }
    }

    Ok(SendReceipt {
        message_id: record.id,
        external_id,
        room_id: provision.room.id,
        persisted,
    })
}
