use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub whatsapp: WhatsAppConfig,
    pub storage: StorageConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.wa-inbox/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// App secret used to verify the X-Hub-Signature-256 header.
    /// When unset, inbound signature verification is skipped.
    pub app_secret: Option<String>,
    /// Token echoed back during the hub.challenge webhook handshake.
    pub verify_token: Option<String>,
    pub access_token: Option<String>,
    pub phone_number_id: Option<String>,
    pub graph_base_url: String,
    pub webhook_path: String,
    /// When true, a delivery status callback never regresses a stored
    /// status to an earlier lifecycle stage.
    pub strict_status_order: bool,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            app_secret: None,
            verify_token: None,
            access_token: None,
            phone_number_id: None,
            graph_base_url: "https://graph.facebook.com/v19.0".to_string(),
            webhook_path: "/v1/webhook".to_string(),
            strict_status_order: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Durable object-storage upload endpoint. Backups are best-effort;
    /// when unset, outgoing media is sent without a backup copy.
    pub upload_url: Option<String>,
    pub api_token: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_url: None,
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub push_url: Option<String>,
    pub api_token: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            push_url: None,
            api_token: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8094,
            },
            auth: AuthConfig { token: None },
            database: DatabaseConfig::default(),
            whatsapp: WhatsAppConfig::default(),
            storage: StorageConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("WA_INBOX_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.wa-inbox/wa-inbox.json"))
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_cfg) = serde_json::from_str::<Config>(&raw) {
                cfg = file_cfg;
            }
        }
    }

    // Override from environment
    if let Ok(token) = env::var("WA_INBOX_TOKEN") {
        if !token.trim().is_empty() {
            cfg.auth.token = Some(token);
        }
    }

    if let Ok(url) = env::var("WA_INBOX_DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database.url = Some(url);
        }
    }

    if let Ok(path) = env::var("WA_INBOX_SQLITE_PATH") {
        if !path.trim().is_empty() {
            cfg.database.sqlite_path = path;
        }
    }

    if let Ok(secret) = env::var("WA_INBOX_APP_SECRET") {
        if !secret.trim().is_empty() {
            cfg.whatsapp.app_secret = Some(secret);
        }
    }

    if let Ok(token) = env::var("WA_INBOX_VERIFY_TOKEN") {
        if !token.trim().is_empty() {
            cfg.whatsapp.verify_token = Some(token);
        }
    }

    if let Ok(token) = env::var("WA_INBOX_ACCESS_TOKEN") {
        if !token.trim().is_empty() {
            cfg.whatsapp.access_token = Some(token);
        }
    }

    if let Ok(id) = env::var("WA_INBOX_PHONE_NUMBER_ID") {
        if !id.trim().is_empty() {
            cfg.whatsapp.phone_number_id = Some(id);
        }
    }

    if let Ok(url) = env::var("WA_INBOX_GRAPH_BASE_URL") {
        if !url.trim().is_empty() {
            cfg.whatsapp.graph_base_url = url;
        }
    }

    if let Ok(url) = env::var("WA_INBOX_STORAGE_UPLOAD_URL") {
        if !url.trim().is_empty() {
            cfg.storage.upload_url = Some(url);
        }
    }

    if let Ok(token) = env::var("WA_INBOX_STORAGE_TOKEN") {
        if !token.trim().is_empty() {
            cfg.storage.api_token = Some(token);
        }
    }

    if let Ok(url) = env::var("WA_INBOX_PUSH_URL") {
        if !url.trim().is_empty() {
            cfg.notify.push_url = Some(url);
        }
    }

    cfg
}

pub fn ensure_config_dir() {
    let path = resolve_config_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}", path.to_string_lossy())
}
