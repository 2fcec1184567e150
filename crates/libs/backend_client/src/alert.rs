use crate::resource::{api_url, Resource, SendOptions};
use crate::{Backend, BackendError};
use chrono::{SecondsFormat, Utc};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
struct Alert {
    id: String,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    camera: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolved_at: Option<String>,
}

/// Reply to `GET /api/alert?q:id:eq=<id>`. A non-empty `data` array means
/// the alert record exists.
#[derive(Debug, Deserialize)]
struct AlertQueryReply {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[allow(dead_code)]
    #[serde(default)]
    next: Option<String>,
}

impl Resource for Alert {
    fn post(&self, backend: &Backend) -> Result<RequestBuilder, BackendError> {
        let url = api_url(backend.api_url(), &["api", "alert"])?;
        Ok(backend.http().post(url).json(self))
    }

    fn put(&self, backend: &Backend) -> Option<Result<RequestBuilder, BackendError>> {
        let url = match api_url(backend.api_url(), &["api", "alert", &self.id]) {
            Ok(url) => url,
            Err(err) => return Some(Err(err)),
        };
        Some(Ok(backend.http().put(url).json(self)))
    }
}

impl Backend {
    /// POSTs an alert record. Failures are logged, not propagated; alerting
    /// must never take an upload down with it.
    pub async fn send_alert(
        &self,
        cancel: &CancellationToken,
        id: &str,
        name: &str,
        severity: Severity,
        message: &str,
    ) {
        let alert = Alert {
            id: id.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            name: Some(name.to_string()),
            camera: Some(self.camera_id().to_string()),
            severity: Some(severity),
            message: Some(message.to_string()),
            resolved_at: None,
        };
        if let Err(err) = self
            .send_resource(cancel, &alert, SendOptions::post_only(3))
            .await
        {
            if !err.is_cancelled() {
                error!(id, error = %err, "failed to send alert");
            }
        }
    }

    /// Resolves an alert, but only if the backend has a record of it:
    /// probe by id first, then PUT a `resolved_at` timestamp.
    pub async fn clear_alert(&self, cancel: &CancellationToken, id: &str) {
        let url = match api_url(self.api_url(), &["api", "alert"]) {
            Ok(mut url) => {
                // the query key is literally "q:id:eq"; only the id value is
                // form-encoded
                let encoded: String = url::form_urlencoded::byte_serialize(id.as_bytes()).collect();
                url.set_query(Some(&format!("q:id:eq={encoded}")));
                url
            }
            Err(err) => {
                error!(id, error = %err, "failed to build alert query url");
                return;
            }
        };
        let reply: AlertQueryReply = match self.get_json(cancel, url, Some(3)).await {
            Ok(reply) => reply,
            Err(err) => {
                if !err.is_cancelled() {
                    error!(id, error = %err, "failed to get alert status");
                }
                return;
            }
        };
        if reply.data.is_empty() {
            debug!(id, "alert does not exist, nothing to clear");
            return;
        }
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let alert = Alert {
            id: id.to_string(),
            timestamp: now.clone(),
            name: None,
            camera: None,
            severity: None,
            message: None,
            resolved_at: Some(now),
        };
        if let Err(err) = self
            .send_resource(cancel, &alert, SendOptions::put_only(3))
            .await
        {
            if !err.is_cancelled() {
                error!(id, error = %err, "failed to clear alert");
            }
        }
    }
}
