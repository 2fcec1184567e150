use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Settings exactly as they appear in the configuration file, before
/// defaulting and validation. Every optional field may be omitted.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawSettings {
    #[serde(default)]
    pub server: RawServerSettings,
    #[serde(default)]
    pub camera: RawCameraSettings,
    #[serde(default)]
    pub ingest: RawIngestSettings,
    #[serde(default)]
    pub logging: RawLoggingSettings,
    #[serde(default)]
    pub api: RawApiSettings,
    #[serde(default)]
    pub secrets: RawSecretSettings,
}

/// Embedded HTTP server options. Validated for operational compatibility;
/// the server itself is hosted outside this workspace.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawServerSettings {
    pub port: Option<u16>,
    pub read_timeout_seconds: Option<u64>,
    pub write_timeout_seconds: Option<u64>,
    pub max_header_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawCameraSettings {
    /// Operator-chosen camera identity, used in URLs and alert ids.
    #[serde(default)]
    pub id: String,
    pub usb_poll_minutes: Option<u64>,
    pub usb_device_folder: Option<PathBuf>,
    pub usb_device_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawIngestSettings {
    pub history_folder: Option<PathBuf>,
    /// Extension -> MIME type. Keys are normalized to lowercase with a
    /// leading dot.
    pub mime_types: Option<HashMap<String, String>>,
    pub monitor_for_minutes: Option<u64>,
    pub expire_after_days: Option<i64>,
    #[serde(default)]
    pub deny_list: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawLoggingSettings {
    pub folder: Option<PathBuf>,
    pub file_size_mb: Option<u64>,
    pub file_number: Option<u64>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawApiSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub skip_verify: bool,
    pub refresh_minutes: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawSecretSettings {
    #[serde(default)]
    pub api_key: String,
}
