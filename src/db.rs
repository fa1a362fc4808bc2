use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row, TypeInfo, ValueRef};
use std::borrow::Cow;
use uuid::Uuid;

use crate::normalize::ContentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql<'a>(sql: &'a str, kind: DbKind) -> Cow<'a, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

/// Canonical message record. Every field is serialized explicitly so
/// realtime observers always see the full shape, nulls included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub room_id: String,
    /// None = external contact, Some = internal agent identifier.
    pub sender_agent_id: Option<String>,
    pub content_kind: ContentKind,
    pub content_text: Option<String>,
    /// Platform-assigned message id (wamid).
    pub external_id: Option<String>,
    pub delivery_status: Option<String>,
    pub status_at: Option<DateTime<Utc>>,
    pub media_kind: Option<String>,
    pub media_id: Option<String>,
    pub backup_path: Option<String>,
    pub backup_url: Option<String>,
    pub media_size: Option<i64>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub reply_to_external_id: Option<String>,
    pub reaction_emoji: Option<String>,
    pub reaction_to_external_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: String,
    /// External source identity, e.g. a phone-equivalent handle. Unique.
    pub handle: String,
    pub display_name: Option<String>,
    pub lead_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: String,
    pub handle: String,
    pub name: String,
    pub stage: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEventRecord {
    pub id: String,
    pub external_id: String,
    pub status: String,
    pub status_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn i64_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn datetime_to_i64(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS rooms (
            id TEXT PRIMARY KEY,
            handle TEXT NOT NULL UNIQUE,
            display_name TEXT,
            lead_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS leads (
            id TEXT PRIMARY KEY,
            handle TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            stage TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            room_id TEXT NOT NULL,
            sender_agent_id TEXT,
            content_kind TEXT NOT NULL,
            content_text TEXT,
            external_id TEXT,
            delivery_status TEXT,
            status_at INTEGER,
            media_kind TEXT,
            media_id TEXT,
            backup_path TEXT,
            backup_url TEXT,
            media_size INTEGER,
            mime_type TEXT,
            filename TEXT,
            reply_to_external_id TEXT,
            reaction_emoji TEXT,
            reaction_to_external_id TEXT,
            metadata TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room_id, created_at)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_messages_external ON messages(external_id)"#,
        r#"CREATE TABLE IF NOT EXISTS status_events (
            id TEXT PRIMARY KEY,
            external_id TEXT NOT NULL,
            status TEXT NOT NULL,
            status_at INTEGER,
            created_at INTEGER NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_status_events_external ON status_events(external_id)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }

    Ok(())
}

/// Decode a nullable column into `Option<T>`.
///
/// The `Any` driver's `ValueRef::is_null()` misreports genuine SQL NULLs as
/// non-null, so `try_get::<Option<T>>` both fails the type-compat precheck and
/// falls through to the inner decoder. Detect the NULL via the column's type
/// name (reported as "NULL") and short-circuit to `None`; otherwise decode the
/// present value unchecked.
fn get_opt<'r, T>(row: &'r AnyRow, col: &str) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, sqlx::Any> + sqlx::Type<sqlx::Any>,
{
    let raw = row.try_get_raw(col)?;
    if raw.type_info().name() == "NULL" {
        Ok(None)
    } else {
        Ok(Some(row.try_get_unchecked(col)?))
    }
}

fn message_from_row(row: &AnyRow) -> Result<MessageRecord> {
    let metadata: Option<String> = get_opt(row, "metadata")?;
    let status_at: Option<i64> = get_opt(row, "status_at")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    let kind: String = row.try_get("content_kind")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        sender_agent_id: get_opt(row, "sender_agent_id")?,
        content_kind: ContentKind::from_str(&kind),
        content_text: get_opt(row, "content_text")?,
        external_id: get_opt(row, "external_id")?,
        delivery_status: get_opt(row, "delivery_status")?,
        status_at: status_at.map(i64_to_datetime),
        media_kind: get_opt(row, "media_kind")?,
        media_id: get_opt(row, "media_id")?,
        backup_path: get_opt(row, "backup_path")?,
        backup_url: get_opt(row, "backup_url")?,
        media_size: get_opt(row, "media_size")?,
        mime_type: get_opt(row, "mime_type")?,
        filename: get_opt(row, "filename")?,
        reply_to_external_id: get_opt(row, "reply_to_external_id")?,
        reaction_emoji: get_opt(row, "reaction_emoji")?,
        reaction_to_external_id: get_opt(row, "reaction_to_external_id")?,
        metadata: metadata.and_then(|v| serde_json::from_str(&v).ok()),
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

fn room_from_row(row: &AnyRow) -> Result<RoomRecord> {
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(RoomRecord {
        id: row.try_get("id")?,
        handle: row.try_get("handle")?,
        display_name: get_opt(row, "display_name")?,
        lead_id: get_opt(row, "lead_id")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

fn lead_from_row(row: &AnyRow) -> Result<LeadRecord> {
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    Ok(LeadRecord {
        id: row.try_get("id")?,
        handle: row.try_get("handle")?,
        name: row.try_get("name")?,
        stage: row.try_get("stage")?,
        created_at: i64_to_datetime(created_at),
        updated_at: i64_to_datetime(updated_at),
    })
}

const MESSAGE_COLUMNS: &str = "id, room_id, sender_agent_id, content_kind, content_text, external_id, \
     delivery_status, status_at, media_kind, media_id, backup_path, backup_url, media_size, \
     mime_type, filename, reply_to_external_id, reaction_emoji, reaction_to_external_id, \
     metadata, created_at, updated_at";

pub async fn insert_message(pool: &AnyPool, kind: DbKind, record: &MessageRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO messages (
            id, room_id, sender_agent_id, content_kind, content_text, external_id,
            delivery_status, status_at, media_kind, media_id, backup_path, backup_url,
            media_size, mime_type, filename, reply_to_external_id, reaction_emoji,
            reaction_to_external_id, metadata, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.room_id)
        .bind(record.sender_agent_id.as_deref())
        .bind(record.content_kind.as_str())
        .bind(record.content_text.as_deref())
        .bind(record.external_id.as_deref())
        .bind(record.delivery_status.as_deref())
        .bind(record.status_at.map(datetime_to_i64))
        .bind(record.media_kind.as_deref())
        .bind(record.media_id.as_deref())
        .bind(record.backup_path.as_deref())
        .bind(record.backup_url.as_deref())
        .bind(record.media_size)
        .bind(record.mime_type.as_deref())
        .bind(record.filename.as_deref())
        .bind(record.reply_to_external_id.as_deref())
        .bind(record.reaction_emoji.as_deref())
        .bind(record.reaction_to_external_id.as_deref())
        .bind(record.metadata.as_ref().map(|v| v.to_string()))
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn message_external_id_exists(
    pool: &AnyPool,
    kind: DbKind,
    external_id: &str,
) -> Result<bool> {
    let sql = rewrite_sql(
        "SELECT 1 FROM messages WHERE external_id = ? LIMIT 1",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn get_message(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<MessageRecord>> {
    let base = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?");
    let sql = rewrite_sql(&base, kind);
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(message_from_row).transpose()
}

pub async fn get_message_by_external_id(
    pool: &AnyPool,
    kind: DbKind,
    external_id: &str,
) -> Result<Option<MessageRecord>> {
    let base = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ? LIMIT 1");
    let sql = rewrite_sql(&base, kind);
    let row = sqlx::query(sql.as_ref())
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(message_from_row).transpose()
}

pub async fn list_messages(
    pool: &AnyPool,
    kind: DbKind,
    room_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<MessageRecord>> {
    let base = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? \
         ORDER BY created_at DESC LIMIT ? OFFSET ?"
    );
    let sql = rewrite_sql(&base, kind);
    let rows = sqlx::query(sql.as_ref())
        .bind(room_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(message_from_row).collect()
}

pub async fn update_message_status(
    pool: &AnyPool,
    kind: DbKind,
    message_id: &str,
    status: &str,
    status_at: DateTime<Utc>,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE messages SET delivery_status = ?, status_at = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(status)
        .bind(datetime_to_i64(status_at))
        .bind(datetime_to_i64(Utc::now()))
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn room_has_messages(pool: &AnyPool, kind: DbKind, room_id: &str) -> Result<bool> {
    let sql = rewrite_sql("SELECT 1 FROM messages WHERE room_id = ? LIMIT 1", kind);
    let row = sqlx::query(sql.as_ref())
        .bind(room_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn insert_room(pool: &AnyPool, kind: DbKind, record: &RoomRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO rooms (id, handle, display_name, lead_id, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.handle)
        .bind(record.display_name.as_deref())
        .bind(record.lead_id.as_deref())
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_room(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<RoomRecord>> {
    let sql = rewrite_sql(
        "SELECT id, handle, display_name, lead_id, created_at, updated_at FROM rooms WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(room_from_row).transpose()
}

pub async fn get_room_by_handle(
    pool: &AnyPool,
    kind: DbKind,
    handle: &str,
) -> Result<Option<RoomRecord>> {
    let sql = rewrite_sql(
        "SELECT id, handle, display_name, lead_id, created_at, updated_at FROM rooms WHERE handle = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(handle)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(room_from_row).transpose()
}

pub async fn list_rooms(
    pool: &AnyPool,
    kind: DbKind,
    limit: i64,
    offset: i64,
) -> Result<Vec<RoomRecord>> {
    let sql = rewrite_sql(
        "SELECT id, handle, display_name, lead_id, created_at, updated_at FROM rooms \
         ORDER BY updated_at DESC LIMIT ? OFFSET ?",
        kind,
    );
    let rows = sqlx::query(sql.as_ref())
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    rows.iter().map(room_from_row).collect()
}

pub async fn touch_room(pool: &AnyPool, kind: DbKind, room_id: &str) -> Result<()> {
    let sql = rewrite_sql("UPDATE rooms SET updated_at = ? WHERE id = ?", kind);
    sqlx::query(sql.as_ref())
        .bind(datetime_to_i64(Utc::now()))
        .bind(room_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_room_display_name(
    pool: &AnyPool,
    kind: DbKind,
    room_id: &str,
    display_name: &str,
) -> Result<()> {
    let sql = rewrite_sql(
        "UPDATE rooms SET display_name = ?, updated_at = ? WHERE id = ?",
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(display_name)
        .bind(datetime_to_i64(Utc::now()))
        .bind(room_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_lead(pool: &AnyPool, kind: DbKind, record: &LeadRecord) -> Result<()> {
    let sql = rewrite_sql(
        r#"INSERT INTO leads (id, handle, name, stage, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.handle)
        .bind(&record.name)
        .bind(&record.stage)
        .bind(datetime_to_i64(record.created_at))
        .bind(datetime_to_i64(record.updated_at))
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_lead(pool: &AnyPool, kind: DbKind, id: &str) -> Result<Option<LeadRecord>> {
    let sql = rewrite_sql(
        "SELECT id, handle, name, stage, created_at, updated_at FROM leads WHERE id = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref()).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(lead_from_row).transpose()
}

pub async fn get_lead_by_handle(
    pool: &AnyPool,
    kind: DbKind,
    handle: &str,
) -> Result<Option<LeadRecord>> {
    let sql = rewrite_sql(
        "SELECT id, handle, name, stage, created_at, updated_at FROM leads WHERE handle = ?",
        kind,
    );
    let row = sqlx::query(sql.as_ref())
        .bind(handle)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(lead_from_row).transpose()
}

pub async fn insert_status_event(
    pool: &AnyPool,
    kind: DbKind,
    external_id: &str,
    status: &str,
    status_at: Option<DateTime<Utc>>,
) -> Result<StatusEventRecord> {
    let record = StatusEventRecord {
        id: Uuid::new_v4().to_string(),
        external_id: external_id.to_string(),
        status: status.to_string(),
        status_at,
        created_at: Utc::now(),
    };
    let sql = rewrite_sql(
        r#"INSERT INTO status_events (id, external_id, status, status_at, created_at)
           VALUES (?, ?, ?, ?, ?)"#,
        kind,
    );
    sqlx::query(sql.as_ref())
        .bind(&record.id)
        .bind(&record.external_id)
        .bind(&record.status)
        .bind(record.status_at.map(datetime_to_i64))
        .bind(datetime_to_i64(record.created_at))
        .execute(pool)
        .await?;
    Ok(record)
}

pub async fn count_rooms(pool: &AnyPool) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM rooms")
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}

pub async fn count_messages(pool: &AnyPool) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM messages")
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}
