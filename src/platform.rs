use anyhow::Result;
use reqwest::Client;
use serde_json::Value;

use crate::config::WhatsAppConfig;

fn credentials(cfg: &WhatsAppConfig) -> Result<(&str, &str)> {
    let token = cfg
        .access_token
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("whatsapp access token missing"))?;
    let phone_id = cfg
        .phone_number_id
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("whatsapp phone number id missing"))?;
    Ok((token, phone_id))
}

fn api_error(status: reqwest::StatusCode, body: &Value) -> anyhow::Error {
    let detail = body
        .get("error")
        .and_then(Value::as_object)
        .and_then(|err| err.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown api error");
    anyhow::anyhow!("whatsapp api error {status}: {detail}")
}

/// POST a prepared message body to the Cloud API and return the
/// platform-assigned message id (wamid) from the response.
pub async fn send_message(client: &Client, cfg: &WhatsAppConfig, body: &Value) -> Result<String> {
    let (token, phone_id) = credentials(cfg)?;
    let endpoint = format!("{}/{}/messages", cfg.graph_base_url, phone_id);

    let resp = client
        .post(&endpoint)
        .bearer_auth(token)
        .json(body)
        .send()
        .await?;

    let status = resp.status();
    let value: Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        return Err(api_error(status, &value));
    }

    extract_external_id(&value)
        .ok_or_else(|| anyhow::anyhow!("whatsapp response carried no message id: {value}"))
}

/// Pull `messages[0].id` out of a send response.
pub fn extract_external_id(response: &Value) -> Option<String> {
    response
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.first())
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// Upload raw media bytes to the Cloud API, returning the platform media
/// id to reference in a subsequent send.
pub async fn upload_media(
    client: &Client,
    cfg: &WhatsAppConfig,
    bytes: Vec<u8>,
    mime_type: &str,
    filename: Option<&str>,
) -> Result<String> {
    let (token, phone_id) = credentials(cfg)?;
    let endpoint = format!("{}/{}/media", cfg.graph_base_url, phone_id);

    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(filename.unwrap_or("file").to_string())
        .mime_str(mime_type)?;
    let form = reqwest::multipart::Form::new()
        .text("messaging_product", "whatsapp")
        .text("type", mime_type.to_string())
        .part("file", part);

    let resp = client
        .post(&endpoint)
        .bearer_auth(token)
        .multipart(form)
        .send()
        .await?;

    let status = resp.status();
    let value: Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        return Err(api_error(status, &value));
    }

    value
        .get("id")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("whatsapp media upload returned no id: {value}"))
}
