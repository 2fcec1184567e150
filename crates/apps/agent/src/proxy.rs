use app_state::normalize_extension;
use async_trait::async_trait;
use backend_client::{Backend, BackendError, Severity};
use file_watcher::{UploadError, UploadServer};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::warn;

/// Adapts the backend client to the watcher's [`UploadServer`] seam. One
/// proxy exists per watcher subtree, carrying that subtree's cancellation
/// token so a folder switch aborts in-flight uploads.
pub struct ServerProxy {
    backend: Arc<Backend>,
    cancel: CancellationToken,
    alerts: TaskTracker,
    mime_types: HashMap<String, String>,
    keepalive: mpsc::Sender<()>,
}

impl ServerProxy {
    pub fn new(
        backend: Arc<Backend>,
        cancel: CancellationToken,
        alerts: TaskTracker,
        mime_types: HashMap<String, String>,
        keepalive: mpsc::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            cancel,
            alerts,
            mime_types,
            keepalive,
        })
    }
}

#[async_trait]
impl UploadServer for ServerProxy {
    fn camera_id(&self) -> &str {
        self.backend.camera_id()
    }

    async fn upload(&self, path: &Path) -> Result<(), UploadError> {
        let extension = path
            .extension()
            .map(|ext| normalize_extension(&ext.to_string_lossy()))
            .unwrap_or_default();
        let Some(mime_type) = self.mime_types.get(&extension) else {
            return Err(UploadError::UnknownMediaType(extension));
        };
        // tell the watchdog an upload attempt is happening
        let _ = self.keepalive.try_send(());
        self.backend
            .upload_media(&self.cancel, mime_type, path)
            .await
            .map_err(|err| match err {
                BackendError::UnknownMediaType(mime) => UploadError::UnknownMediaType(mime),
                BackendError::Cancelled => UploadError::Cancelled,
                other => UploadError::Failed(other.to_string()),
            })
    }

    async fn send_alert(&self, id: &str, name: &str, severity: &str, message: &str) {
        let severity = Severity::from_name(severity).unwrap_or_else(|| {
            warn!(severity, "unknown alert severity, reporting as error");
            Severity::Error
        });
        let backend = self.backend.clone();
        let cancel = self.cancel.clone();
        let (id, name, message) = (id.to_string(), name.to_string(), message.to_string());
        // fire and forget; the tracker is joined at shutdown
        self.alerts.spawn(async move {
            backend
                .send_alert(&cancel, &id, &name, severity, &message)
                .await;
        });
    }

    async fn clear_alert(&self, id: &str) {
        let backend = self.backend.clone();
        let cancel = self.cancel.clone();
        let id = id.to_string();
        self.alerts.spawn(async move {
            backend.clear_alert(&cancel, &id).await;
        });
    }
}
