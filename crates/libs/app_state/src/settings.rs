use crate::{normalize_extension, RawSettings};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("camera.id is required")]
    MissingCameraId,
    #[error("api.username is required")]
    MissingApiUsername,
    #[error("secrets.api_key is required")]
    MissingApiKey,
    #[error("api.url is required")]
    MissingApiUrl,
    #[error("failed to read configuration: {0}")]
    Config(#[from] config::ConfigError),
}

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub server: ServerSettings,
    pub camera: CameraSettings,
    pub ingest: IngestSettings,
    pub logging: LoggingSettings,
    pub api: ApiSettings,
    pub secrets: SecretSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_header_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub id: String,
    pub usb_poll: Duration,
    pub usb_device_folder: PathBuf,
    pub usb_device_prefix: String,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub history_folder: PathBuf,
    pub mime_types: HashMap<String, String>,
    pub monitor_for: Duration,
    /// Zero means history entries never expire.
    pub expire_after: Duration,
    pub deny_list: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub folder: PathBuf,
    pub file_size_mb: u64,
    pub file_number: u64,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub url: String,
    pub username: String,
    pub skip_verify: bool,
    pub refresh_interval: Duration,
    pub timeout: Duration,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct SecretSettings {
    pub api_key: String,
}

impl AppSettings {
    /// Applies the defaulting rules to raw settings and rejects
    /// configurations missing required values. `config_dir` anchors the
    /// default history and log folders.
    pub fn from_raw(raw: RawSettings, config_dir: &Path) -> Result<Self, SettingsError> {
        if raw.camera.id.is_empty() {
            return Err(SettingsError::MissingCameraId);
        }
        if raw.api.username.is_empty() {
            return Err(SettingsError::MissingApiUsername);
        }
        if raw.secrets.api_key.is_empty() {
            return Err(SettingsError::MissingApiKey);
        }
        if raw.api.url.is_empty() {
            return Err(SettingsError::MissingApiUrl);
        }

        let port = match raw.server.port {
            Some(port) if port >= 1024 => port,
            _ => 8080,
        };
        let server = ServerSettings {
            port,
            read_timeout: Duration::from_secs(raw.server.read_timeout_seconds.unwrap_or(5).max(1)),
            write_timeout: Duration::from_secs(
                raw.server.write_timeout_seconds.unwrap_or(7).max(1),
            ),
            max_header_bytes: match raw.server.max_header_bytes {
                Some(bytes) if bytes >= 4096 => bytes,
                _ => 1 << 20,
            },
        };

        let camera = CameraSettings {
            id: raw.camera.id,
            usb_poll: Duration::from_secs(60 * raw.camera.usb_poll_minutes.unwrap_or(1).max(1)),
            usb_device_folder: raw
                .camera
                .usb_device_folder
                .unwrap_or_else(|| PathBuf::from("/dev")),
            usb_device_prefix: raw
                .camera
                .usb_device_prefix
                .unwrap_or_else(|| "video".to_string()),
        };

        let mime_types = raw
            .ingest
            .mime_types
            .filter(|types| !types.is_empty())
            .unwrap_or_else(default_mime_types)
            .into_iter()
            .map(|(ext, mime)| (normalize_extension(&ext), mime))
            .collect();
        let expire_days = raw.ingest.expire_after_days.unwrap_or(0).max(0) as u64;
        let ingest = IngestSettings {
            history_folder: raw
                .ingest
                .history_folder
                .unwrap_or_else(|| config_dir.join("history")),
            mime_types,
            monitor_for: Duration::from_secs(
                60 * raw.ingest.monitor_for_minutes.unwrap_or(5).max(1),
            ),
            expire_after: Duration::from_secs(24 * 3600 * expire_days),
            deny_list: raw
                .ingest
                .deny_list
                .into_iter()
                .map(|entry| entry.to_lowercase())
                .collect(),
        };

        let logging = LoggingSettings {
            folder: raw
                .logging
                .folder
                .unwrap_or_else(|| config_dir.join("logs")),
            file_size_mb: raw.logging.file_size_mb.unwrap_or(100),
            file_number: raw.logging.file_number.unwrap_or(10),
            debug: raw.logging.debug,
        };

        let api = ApiSettings {
            url: raw.api.url.trim_end_matches('/').to_string(),
            username: raw.api.username,
            skip_verify: raw.api.skip_verify,
            refresh_interval: Duration::from_secs(60 * raw.api.refresh_minutes.unwrap_or(5).max(1)),
            timeout: Duration::from_secs(raw.api.timeout_seconds.unwrap_or(10).max(1)),
            concurrency: raw.api.concurrency.unwrap_or(3).max(1),
        };

        Ok(Self {
            server,
            camera,
            ingest,
            logging,
            api,
            secrets: SecretSettings {
                api_key: raw.secrets.api_key,
            },
        })
    }
}

impl IngestSettings {
    /// The set of recognized extensions, lowercased with a leading dot.
    #[must_use]
    pub fn file_types(&self) -> HashSet<String> {
        self.mime_types.keys().cloned().collect()
    }

    /// Looks up the configured MIME type for a file, by extension.
    #[must_use]
    pub fn mime_for(&self, file: &Path) -> Option<&str> {
        let extension = file.extension()?.to_string_lossy().to_lowercase();
        self.mime_types
            .get(&normalize_extension(&extension))
            .map(String::as_str)
    }

    /// A file is denied when its basename contains any deny-list entry,
    /// compared case-insensitively.
    #[must_use]
    pub fn is_denied(&self, file: &Path) -> bool {
        let Some(name) = file.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
            return false;
        };
        self.deny_list.iter().any(|entry| name.contains(entry))
    }
}

fn default_mime_types() -> HashMap<String, String> {
    [
        (".4gpp", "video/4gpp"),
        (".3gpp2", "video/3gpp2"),
        (".3gp2", "video/3gp2"),
        (".mpg", "video/mpeg"),
        (".mp4", "video/mp4"),
        (".ogg", "video/ogg"),
        (".quicktime", "video/quicktime"),
        (".webm", "video/webm"),
        (".avi", "video/x-msvideo"),
        (".jpg", "image/jpeg"),
        (".png", "image/png"),
    ]
    .into_iter()
    .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
    .collect()
}
