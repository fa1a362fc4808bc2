use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::AnyPool;
use tracing::{debug, info};

use crate::db::{self, DbKind, MessageRecord};
use crate::normalize::StatusUpdate;

/// Delivery lifecycle of a message on the platform side. Ranks are
/// monotonic: sent < delivered < read. `failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Received,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "received" => Some(DeliveryStatus::Received),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Received => "received",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Received => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Failed => 4,
        }
    }
}

/// What happened to a status callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    Applied,
    /// Rank guard held back a regression (strict mode only).
    Regression,
    /// No local record carries this external id yet; acceptable, the
    /// platform can deliver status before the send response is processed.
    Unknown,
    /// Unparseable status vocabulary from the platform.
    Unrecognized,
}

/// Decide whether `incoming` may overwrite `stored` under rank guarding.
pub fn would_regress(stored: Option<&str>, incoming: DeliveryStatus) -> bool {
    let Some(stored) = stored.and_then(DeliveryStatus::parse) else {
        return false;
    };
    incoming.rank() < stored.rank()
}

/// Apply one delivery-status callback to the record it references. The
/// stored timestamp is always the callback's own timestamp, never the
/// wall clock at processing time. Every callback is appended to the audit
/// trail regardless of outcome.
pub async fn apply_status(
    pool: &AnyPool,
    kind: DbKind,
    update: &StatusUpdate,
    strict_order: bool,
) -> Result<(StatusOutcome, Option<MessageRecord>)> {
    let _ = db::insert_status_event(
        pool,
        kind,
        &update.external_id,
        &update.status,
        update.status_at,
    )
    .await;

    let Some(status) = DeliveryStatus::parse(&update.status) else {
        debug!(status = %update.status, external_id = %update.external_id, "unrecognized delivery status");
        return Ok((StatusOutcome::Unrecognized, None));
    };

    let Some(record) = db::get_message_by_external_id(pool, kind, &update.external_id).await? else {
        debug!(external_id = %update.external_id, "status callback for unknown message");
        return Ok((StatusOutcome::Unknown, None));
    };

    if strict_order && would_regress(record.delivery_status.as_deref(), status) {
        info!(
            external_id = %update.external_id,
            stored = record.delivery_status.as_deref().unwrap_or("none"),
            incoming = status.as_str(),
            "out-of-order status held back"
        );
        return Ok((StatusOutcome::Regression, Some(record)));
    }

    let status_at: DateTime<Utc> = update.status_at.unwrap_or_else(Utc::now);
    db::update_message_status(pool, kind, &record.id, status.as_str(), status_at).await?;

    let mut updated = record;
    updated.delivery_status = Some(status.as_str().to_string());
    updated.status_at = Some(status_at);
    Ok((StatusOutcome::Applied, Some(updated)))
}
