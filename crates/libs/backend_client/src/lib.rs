#![allow(clippy::missing_errors_doc)]

//! HTTP client for the camera backend: credential management, generic
//! resource upserts with retry, media uploads with streaming multipart
//! bodies, alert lifecycle and watch-folder polling.

mod alert;
mod auth;
mod error;
mod folder;
mod media;
mod metrics;
mod multipart;
mod resource;
pub mod retry;

pub use alert::Severity;
pub use auth::{AuthQuery, AuthReply};
pub use error::BackendError;
pub use media::MediaKind;

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub camera_id: String,
    pub timeout: Duration,
    pub skip_verify: bool,
    pub concurrency: usize,
    pub debug: bool,
}

/// Client for the camera backend. Credentials are owned by the attender
/// task ([`Backend::watch_auth`]); everything else reaches the token
/// through the query channel.
pub struct Backend {
    client: Client,
    upload_client: Client,
    api_url: String,
    camera_id: String,
    username: String,
    password: String,
    auth_tx: mpsc::Sender<AuthQuery>,
    uploads: Semaphore,
    debug: bool,
}

impl Backend {
    /// Builds the backend client. The returned receiver must be handed to
    /// [`Backend::watch_auth`], which owns token state for the process.
    pub fn new(config: BackendConfig) -> Result<(Arc<Self>, mpsc::Receiver<AuthQuery>), BackendError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.skip_verify)
            .build()?;
        // No overall timeout: a slow backend must still be able to drain
        // large uploads.
        let upload_client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(config.skip_verify)
            .build()?;

        let (auth_tx, auth_rx) = mpsc::channel(16);
        let backend = Arc::new(Self {
            client,
            upload_client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            camera_id: config.camera_id,
            username: config.username,
            password: config.password,
            auth_tx,
            uploads: Semaphore::new(config.concurrency.max(1)),
            debug: config.debug,
        });
        Ok((backend, auth_rx))
    }

    #[must_use]
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    pub(crate) fn upload_http(&self) -> &Client {
        &self.upload_client
    }

    pub(crate) fn api_url(&self) -> &str {
        &self.api_url
    }
}
