use anyhow::Result;
use chrono::Utc;
use sqlx::AnyPool;
use tracing::warn;
use uuid::Uuid;

use crate::db::{self, DbKind, LeadRecord, RoomRecord};

/// Outcome of resolving a room for a source handle.
#[derive(Debug, Clone)]
pub struct ProvisionedRoom {
    pub room: RoomRecord,
    pub lead: Option<LeadRecord>,
    pub created: bool,
}

fn placeholder_lead_name(handle: &str) -> String {
    format!("WhatsApp {handle}")
}

/// Resolve or create the room for an external handle. Idempotent under
/// concurrency: the unique constraint on `rooms.handle` is authoritative,
/// and an insert conflict is treated as "already exists, re-read".
pub async fn resolve_or_create_room(
    pool: &AnyPool,
    kind: DbKind,
    handle: &str,
    display_name: Option<&str>,
) -> Result<ProvisionedRoom> {
    if let Some(room) = db::get_room_by_handle(pool, kind, handle).await? {
        let lead = match room.lead_id.as_deref() {
            Some(lead_id) => db::get_lead(pool, kind, lead_id).await?,
            None => None,
        };
        return Ok(ProvisionedRoom {
            room,
            lead,
            created: false,
        });
    }

    // Contact creation is best-effort: the room must exist even when the
    // lead store misbehaves.
    let lead = match resolve_or_create_lead(pool, kind, handle).await {
        Ok(lead) => Some(lead),
        Err(err) => {
            warn!(handle, error = %err, "lead provisioning failed; room keeps null contact link");
            None
        }
    };

    let now = Utc::now();
    let room = RoomRecord {
        id: Uuid::new_v4().to_string(),
        handle: handle.to_string(),
        display_name: display_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        lead_id: lead.as_ref().map(|l| l.id.clone()),
        created_at: now,
        updated_at: now,
    };

    match db::insert_room(pool, kind, &room).await {
        Ok(()) => Ok(ProvisionedRoom {
            room,
            lead,
            created: true,
        }),
        Err(insert_err) => {
            // Lost the race to a concurrent insert for the same handle.
            match db::get_room_by_handle(pool, kind, handle).await? {
                Some(existing) => {
                    let lead = match existing.lead_id.as_deref() {
                        Some(lead_id) => db::get_lead(pool, kind, lead_id).await?,
                        None => None,
                    };
                    Ok(ProvisionedRoom {
                        room: existing,
                        lead,
                        created: false,
                    })
                }
                None => Err(insert_err),
            }
        }
    }
}

/// Create-if-absent for the contact record behind a room. Same
/// conflict-as-exists discipline as room creation.
pub async fn resolve_or_create_lead(
    pool: &AnyPool,
    kind: DbKind,
    handle: &str,
) -> Result<LeadRecord> {
    if let Some(lead) = db::get_lead_by_handle(pool, kind, handle).await? {
        return Ok(lead);
    }

    let now = Utc::now();
    let lead = LeadRecord {
        id: Uuid::new_v4().to_string(),
        handle: handle.to_string(),
        name: placeholder_lead_name(handle),
        stage: "new".to_string(),
        created_at: now,
        updated_at: now,
    };

    match db::insert_lead(pool, kind, &lead).await {
        Ok(()) => Ok(lead),
        Err(insert_err) => match db::get_lead_by_handle(pool, kind, handle).await? {
            Some(existing) => Ok(existing),
            None => Err(insert_err),
        },
    }
}

/// Whether the arriving message is the room's first. Must be computed from
/// store state BEFORE that message's own insert; computing it after would
/// let two concurrent first messages both observe an empty room and each
/// publish a composite event. Observers dedupe composites by room id as
/// the documented fallback for the residual window.
pub async fn is_first_message(pool: &AnyPool, kind: DbKind, room_id: &str) -> Result<bool> {
    Ok(!db::room_has_messages(pool, kind, room_id).await?)
}

/// Normalize a phone-equivalent handle: strip a leading `+` and anything
/// that is not a digit.
pub fn normalize_handle(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}
