use anyhow::Result;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{StorageConfig, WhatsAppConfig};
use crate::platform;

/// Artifact of a successful durable-storage backup.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub path: String,
    pub url: String,
}

/// Outgoing media after staging: the platform id is always present, the
/// backup fields only when the backup branch succeeded.
#[derive(Debug, Clone)]
pub struct StagedMedia {
    pub media_id: String,
    pub backup_path: Option<String>,
    pub backup_url: Option<String>,
    pub size: i64,
    pub mime_type: String,
    pub filename: Option<String>,
}

/// Upload bytes to the durable object store. Returns the storage path and
/// a retrievable URL.
pub async fn backup_upload(
    client: &Client,
    storage: &StorageConfig,
    bytes: Vec<u8>,
    mime_type: &str,
    filename: Option<&str>,
) -> Result<BackupArtifact> {
    let upload_url = storage
        .upload_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("storage upload url not configured"))?;

    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(filename.unwrap_or("file").to_string())
        .mime_str(mime_type)?;
    let form = reqwest::multipart::Form::new().part("file", part);

    let mut req = client.post(upload_url).multipart(form);
    if let Some(token) = storage.api_token.as_deref() {
        req = req.header("X-Wa-Inbox-Token", token);
    }

    let resp = req.send().await?;
    let status = resp.status();
    let value: Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow::anyhow!("storage upload failed: {status} {value}"));
    }

    let path = value
        .get("path")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("storage upload returned no path: {value}"))?;
    let url = value
        .get("url")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("storage upload returned no url: {value}"))?;

    Ok(BackupArtifact { path, url })
}

/// Stage outgoing media: the platform upload and the durable backup run
/// concurrently and settle independently, so a backup failure is visible
/// on its own and never blocks the send path. The platform upload is
/// mandatory; without it there is nothing to send.
pub async fn stage_outbound_media(
    client: &Client,
    storage: &StorageConfig,
    whatsapp: &WhatsAppConfig,
    bytes: Vec<u8>,
    mime_type: &str,
    filename: Option<&str>,
) -> Result<StagedMedia> {
    let size = bytes.len() as i64;

    let (backup_result, upload_result) = if storage.upload_url.is_some() {
        tokio::join!(
            backup_upload(client, storage, bytes.clone(), mime_type, filename),
            platform::upload_media(client, whatsapp, bytes, mime_type, filename),
        )
    } else {
        debug!("no storage configured; skipping media backup");
        let upload = platform::upload_media(client, whatsapp, bytes, mime_type, filename).await;
        (Err(anyhow::anyhow!("storage upload url not configured")), upload)
    };

    let media_id = upload_result?;

    let (backup_path, backup_url) = match backup_result {
        Ok(artifact) => (Some(artifact.path), Some(artifact.url)),
        Err(err) => {
            warn!(error = %err, "media backup failed; continuing without backup copy");
            (None, None)
        }
    };

    Ok(StagedMedia {
        media_id,
        backup_path,
        backup_url,
        size,
        mime_type: mime_type.to_string(),
        filename: filename.map(|s| s.to_string()),
    })
}
