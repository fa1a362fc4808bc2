use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

use crate::db::MessageRecord;

/// Canonical classification of an inbound or outgoing message. Closed set;
/// anything the platform sends that is not listed here lands on
/// `Unsupported` and is persisted as a placeholder, never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Media,
    Location,
    Contacts,
    Reaction,
    Interactive,
    Button,
    Order,
    Referral,
    System,
    Unsupported,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Media => "media",
            ContentKind::Location => "location",
            ContentKind::Contacts => "contacts",
            ContentKind::Reaction => "reaction",
            ContentKind::Interactive => "interactive",
            ContentKind::Button => "button",
            ContentKind::Order => "order",
            ContentKind::Referral => "referral",
            ContentKind::System => "system",
            ContentKind::Unsupported => "unsupported",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "text" => ContentKind::Text,
            "media" => ContentKind::Media,
            "location" => ContentKind::Location,
            "contacts" => ContentKind::Contacts,
            "reaction" => ContentKind::Reaction,
            "interactive" => ContentKind::Interactive,
            "button" => ContentKind::Button,
            "order" => ContentKind::Order,
            "referral" => ContentKind::Referral,
            "system" => ContentKind::System,
            _ => ContentKind::Unsupported,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    /// image, voice, audio, video, document, sticker.
    pub kind: String,
    pub media_id: Option<String>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionInfo {
    pub emoji: Option<String>,
    pub target_external_id: Option<String>,
}

/// One platform event mapped onto the canonical shape, before it is tied
/// to a room.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub external_id: Option<String>,
    pub from: String,
    pub sender_name: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: ContentKind,
    pub content_text: Option<String>,
    pub metadata: Option<Value>,
    pub media: Option<MediaInfo>,
    pub reply_to_external_id: Option<String>,
    pub reaction: Option<ReactionInfo>,
}

/// Delivery-status callback payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub external_id: String,
    pub status: String,
    pub status_at: Option<DateTime<Utc>>,
    pub recipient_id: Option<String>,
}

fn parse_epoch_str(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    let secs = raw.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Profile names keyed by wa_id, taken from the change value's `contacts`
/// array. Used to label the sender on first contact.
pub fn profile_names(value: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(contacts) = value.get("contacts").and_then(Value::as_array) else {
        return map;
    };
    for contact in contacts {
        let Some(wa_id) = contact.get("wa_id").and_then(Value::as_str) else {
            continue;
        };
        if let Some(name) = contact
            .get("profile")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
        {
            let name = name.trim();
            if !name.is_empty() {
                map.insert(wa_id.to_string(), name.to_string());
            }
        }
    }
    map
}

/// Walk the webhook envelope and collect normalized messages and status
/// updates. Returns nothing for envelopes that are not
/// `whatsapp_business_account` notifications.
pub fn extract_events(payload: &Value) -> (Vec<NormalizedMessage>, Vec<StatusUpdate>) {
    let mut messages = Vec::new();
    let mut statuses = Vec::new();

    if payload.get("object").and_then(Value::as_str) != Some("whatsapp_business_account") {
        return (messages, statuses);
    }

    let entries = payload.get("entry").and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let changes = entry.get("changes").and_then(Value::as_array);
        for change in changes.into_iter().flatten() {
            let Some(value) = change.get("value") else {
                continue;
            };
            let names = profile_names(value);

            if let Some(raw_messages) = value.get("messages").and_then(Value::as_array) {
                for raw in raw_messages {
                    messages.push(normalize_message(raw, &names));
                }
            }

            if let Some(raw_statuses) = value.get("statuses").and_then(Value::as_array) {
                for raw in raw_statuses {
                    if let Some(update) = normalize_status(raw) {
                        statuses.push(update);
                    }
                }
            }
        }
    }

    (messages, statuses)
}

fn normalize_status(raw: &Value) -> Option<StatusUpdate> {
    let external_id = str_field(raw, "id")?;
    let status = str_field(raw, "status")?;
    Some(StatusUpdate {
        external_id,
        status,
        status_at: parse_epoch_str(raw.get("timestamp")),
        recipient_id: str_field(raw, "recipient_id"),
    })
}

/// Map one platform message payload onto the canonical shape. Every known
/// and unknown type yields a record carrying non-empty text or lossless
/// metadata.
pub fn normalize_message(raw: &Value, names: &HashMap<String, String>) -> NormalizedMessage {
    let from = str_field(raw, "from").unwrap_or_default();
    let external_id = str_field(raw, "id");
    let sender_name = names.get(&from).cloned();
    let timestamp = parse_epoch_str(raw.get("timestamp"));
    let reply_to = raw
        .get("context")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let mut normalized = NormalizedMessage {
        external_id,
        from,
        sender_name,
        timestamp,
        kind: ContentKind::Unsupported,
        content_text: None,
        metadata: None,
        media: None,
        reply_to_external_id: reply_to,
        reaction: None,
    };

    // Ad-sourced messages carry a referral object alongside their body;
    // the referral is the classification, the body stays as the text.
    if let Some(referral) = raw.get("referral") {
        normalized.kind = ContentKind::Referral;
        let body = raw
            .get("text")
            .and_then(|t| t.get("body"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let headline = str_field(referral, "headline");
        normalized.content_text = body.or(headline);
        normalized.metadata = Some(json!({
            "referral": referral.clone(),
            "text": raw.get("text").cloned().unwrap_or(Value::Null),
        }));
        return normalized;
    }

    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();

    match msg_type.as_str() {
        "text" => {
            normalized.kind = ContentKind::Text;
            let body = raw
                .get("text")
                .and_then(|t| t.get("body"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            if body.is_none() {
                normalized.metadata = raw.get("text").cloned();
            }
            normalized.content_text = body;
        }
        "image" | "audio" | "video" | "document" | "sticker" => {
            normalized.kind = ContentKind::Media;
            let body = raw.get(&msg_type).cloned().unwrap_or_else(|| json!({}));
            let voice = body.get("voice").and_then(Value::as_bool).unwrap_or(false);
            let media_kind = if msg_type == "audio" && voice {
                "voice".to_string()
            } else {
                msg_type.clone()
            };
            let caption = str_field(&body, "caption");
            let media = MediaInfo {
                kind: media_kind,
                media_id: str_field(&body, "id"),
                mime_type: str_field(&body, "mime_type"),
                filename: str_field(&body, "filename"),
                caption: caption.clone(),
            };
            normalized.content_text = Some(
                caption.unwrap_or_else(|| media_fallback_text(&media.kind).to_string()),
            );
            normalized.metadata = Some(body);
            normalized.media = Some(media);
        }
        "location" => {
            normalized.kind = ContentKind::Location;
            let location = raw.get("location").cloned().unwrap_or_else(|| json!({}));
            normalized.content_text = Some(location_summary(&location));
            normalized.metadata = Some(location);
        }
        "contacts" => {
            normalized.kind = ContentKind::Contacts;
            let metadata = json!({
                "contacts": raw.get("contacts").cloned().unwrap_or_else(|| json!([]))
            });
            normalized.content_text = Some(contacts_summary(&metadata));
            normalized.metadata = Some(metadata);
        }
        "reaction" => {
            normalized.kind = ContentKind::Reaction;
            let reaction = raw.get("reaction").cloned().unwrap_or_else(|| json!({}));
            normalized.content_text = Some(reaction_summary(&reaction));
            normalized.reaction = Some(ReactionInfo {
                emoji: str_field(&reaction, "emoji"),
                target_external_id: str_field(&reaction, "message_id"),
            });
            normalized.metadata = Some(reaction);
        }
        "interactive" => {
            normalized.kind = ContentKind::Interactive;
            let interactive = raw.get("interactive").cloned().unwrap_or_else(|| json!({}));
            let title = interactive
                .get("button_reply")
                .and_then(|r| r.get("title"))
                .and_then(Value::as_str)
                .or_else(|| {
                    interactive
                        .get("list_reply")
                        .and_then(|r| r.get("title"))
                        .and_then(Value::as_str)
                })
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            normalized.content_text = title;
            normalized.metadata = Some(interactive);
        }
        "button" => {
            normalized.kind = ContentKind::Button;
            let button = raw.get("button").cloned().unwrap_or_else(|| json!({}));
            normalized.content_text = str_field(&button, "text");
            normalized.metadata = Some(button);
        }
        "order" => {
            normalized.kind = ContentKind::Order;
            let order = raw.get("order").cloned().unwrap_or_else(|| json!({}));
            let items = order
                .get("product_items")
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            normalized.content_text = Some(match items {
                0 => "Placed an order".to_string(),
                1 => "Placed an order (1 item)".to_string(),
                n => format!("Placed an order ({n} items)"),
            });
            normalized.metadata = Some(order);
        }
        "system" => {
            normalized.kind = ContentKind::System;
            let system = raw.get("system").cloned().unwrap_or_else(|| json!({}));
            normalized.content_text = str_field(&system, "body");
            normalized.metadata = Some(system);
        }
        "request_welcome" => {
            normalized.kind = ContentKind::System;
            normalized.content_text = Some("Opened the conversation".to_string());
            normalized.metadata = Some(json!({"event": "request_welcome"}));
        }
        other => {
            warn!(message_type = other, payload = %raw, "unsupported inbound message type");
            normalized.kind = ContentKind::Unsupported;
            normalized.content_text = if other.is_empty() {
                Some("Sent an unsupported message".to_string())
            } else {
                Some(format!("Sent an unsupported message ({other})"))
            };
            normalized.metadata = Some(json!({"raw": raw.clone()}));
        }
    }

    normalized
}

pub(crate) fn media_fallback_text(kind: &str) -> &'static str {
    match kind {
        "image" => "Sent an image",
        "voice" => "Sent a voice message",
        "audio" => "Sent an audio file",
        "video" => "Sent a video",
        "document" => "Sent a document",
        "sticker" => "Sent a sticker",
        _ => "Sent an attachment",
    }
}

/// Human summary derived from a location metadata payload. Reapplying this
/// to a stored record's metadata reproduces its `content_text`.
pub fn location_summary(location: &Value) -> String {
    let name = str_field(location, "name");
    let address = str_field(location, "address");
    if let Some(name) = name {
        return format!("Shared location: {name}");
    }
    if let Some(address) = address {
        return format!("Shared location: {address}");
    }
    let lat = location.get("latitude").and_then(Value::as_f64);
    let lng = location.get("longitude").and_then(Value::as_f64);
    match (lat, lng) {
        (Some(lat), Some(lng)) => format!("Shared location: {lat},{lng}"),
        _ => "Shared a location".to_string(),
    }
}

/// Human summary derived from a contacts metadata payload.
pub fn contacts_summary(metadata: &Value) -> String {
    let cards = metadata
        .get("contacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let first_name = cards.first().and_then(|c| {
        c.get("name")
            .and_then(|n| n.get("formatted_name"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    });
    match (cards.len(), first_name) {
        (0, _) => "Shared a contact card".to_string(),
        (1, Some(name)) => format!("Shared contact card: {name}"),
        (1, None) => "Shared a contact card".to_string(),
        (n, _) => format!("Shared {n} contact cards"),
    }
}

/// Human summary derived from a reaction metadata payload. An absent emoji
/// means the reaction was withdrawn.
pub fn reaction_summary(reaction: &Value) -> String {
    match str_field(reaction, "emoji") {
        Some(emoji) => format!("Reacted {emoji} to a message"),
        None => "Removed a reaction".to_string(),
    }
}

impl NormalizedMessage {
    /// Tie this event to a room, producing the record the store persists.
    /// Inbound records start in the `received` delivery state.
    pub fn into_record(self, room_id: &str) -> MessageRecord {
        let now = Utc::now();
        let created_at = self.timestamp.unwrap_or(now);
        let (media_kind, media_id, mime_type, filename) = match &self.media {
            Some(m) => (
                Some(m.kind.clone()),
                m.media_id.clone(),
                m.mime_type.clone(),
                m.filename.clone(),
            ),
            None => (None, None, None, None),
        };
        let (reaction_emoji, reaction_to) = match &self.reaction {
            Some(r) => (r.emoji.clone(), r.target_external_id.clone()),
            None => (None, None),
        };
        MessageRecord {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            sender_agent_id: None,
            content_kind: self.kind,
            content_text: self.content_text,
            external_id: self.external_id,
            delivery_status: Some("received".to_string()),
            status_at: None,
            media_kind,
            media_id,
            backup_path: None,
            backup_url: None,
            media_size: None,
            mime_type,
            filename,
            reply_to_external_id: self.reply_to_external_id,
            reaction_emoji,
            reaction_to_external_id: reaction_to,
            metadata: self.metadata,
            created_at,
            updated_at: now,
        }
    }
}
