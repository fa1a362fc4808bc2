use reqwest::Client;
use serde_json::Value;
use tracing::warn;

use crate::config::NotifyConfig;

/// Fire-and-forget push dispatch for a conversation's observers. Failures
/// degrade to a log line; the message flow never waits on this.
pub async fn push(client: Client, cfg: NotifyConfig, payload: Value) {
    let Some(url) = cfg.push_url.as_deref() else {
        return;
    };

    let mut req = client.post(url).json(&payload);
    if let Some(token) = cfg.api_token.as_deref() {
        req = req.header("X-Wa-Inbox-Token", token);
    }

    match req.send().await {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => {
            warn!(status = %resp.status(), "push notification rejected");
        }
        Err(err) => {
            warn!(error = %err, "push notification failed");
        }
    }
}
