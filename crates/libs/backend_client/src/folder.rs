use crate::resource::api_url;
use crate::retry::{retry, ExponentialBackoff, RetryError};
use crate::{Backend, BackendError};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Reply to `GET /api/camera/<id>`.
#[derive(Debug, Deserialize)]
struct CameraReply {
    #[allow(dead_code)]
    #[serde(default)]
    id: String,
    #[serde(default)]
    local_path: String,
}

impl Backend {
    /// Polls the backend for the folder this camera should be watching and
    /// emits every change on `folders`. Runs until cancelled.
    pub async fn watch_folder(
        &self,
        cancel: CancellationToken,
        folders: mpsc::Sender<String>,
        interval: Duration,
    ) {
        let mut backoff = ExponentialBackoff::eternal();
        let mut last_folder: Option<String> = None;
        loop {
            match self.fetch_folder(&cancel, &mut backoff).await {
                Ok(folder) => {
                    if last_folder.as_deref() != Some(folder.as_str()) {
                        info!(folder, "watch folder changed");
                        if folders.send(folder.clone()).await.is_err() {
                            return;
                        }
                        last_folder = Some(folder);
                    }
                }
                Err(err) => {
                    if err.is_cancelled() {
                        return;
                    }
                    error!(error = %err, "failed to get watch folder");
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn fetch_folder(
        &self,
        cancel: &CancellationToken,
        backoff: &mut ExponentialBackoff,
    ) -> Result<String, BackendError> {
        let url = api_url(self.api_url(), &["api", "camera", self.camera_id()])?;
        let this = self;
        let url_ref = &url;
        retry(cancel, backoff, None, move || async move {
            let reply: CameraReply = this.get_json_once(url_ref.clone()).await?;
            if reply.local_path.is_empty() {
                return Err(RetryError::Transient(BackendError::EmptyFolder));
            }
            Ok(reply.local_path)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_reply_parses_the_backend_shape() {
        let reply: CameraReply =
            serde_json::from_str(r#"{"id":"cam1","local_path":"C:/media"}"#).unwrap();
        assert_eq!(reply.local_path, "C:/media");
    }

    #[test]
    fn camera_reply_tolerates_a_missing_path() {
        let reply: CameraReply = serde_json::from_str(r#"{"id":"cam1"}"#).unwrap();
        assert!(reply.local_path.is_empty());
    }
}
