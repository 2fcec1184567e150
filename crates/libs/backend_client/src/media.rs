use crate::multipart::FileResource;
use crate::resource::{api_url, Resource, SendOptions};
use crate::{Backend, BackendError};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::RequestBuilder;
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Media classification derived from the MIME type prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Picture,
    Video,
}

impl MediaKind {
    /// `image/*` is a picture, `video/*` is a video, anything else is not
    /// uploadable.
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        if mime_type.starts_with("image") {
            Some(Self::Picture)
        } else if mime_type.starts_with("video") {
            Some(Self::Video)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Picture => "picture",
            Self::Video => "video",
        }
    }
}

/// Descriptive metadata POSTed before the media body.
#[derive(Debug, Serialize)]
pub(crate) struct MediaDescriptor {
    pub id: String,
    pub timestamp: String,
    pub camera: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip)]
    pub media_type: MediaKind,
    #[serde(skip)]
    pub mime_type: String,
}

impl Resource for MediaDescriptor {
    fn post(&self, backend: &Backend) -> Result<RequestBuilder, BackendError> {
        let url = api_url(backend.api_url(), &["api", self.media_type.as_str()])?;
        Ok(backend.http().post(url).json(self))
    }

    fn put(&self, backend: &Backend) -> Option<Result<RequestBuilder, BackendError>> {
        let url = match api_url(
            backend.api_url(),
            &["api", self.media_type.as_str(), &self.id],
        ) {
            Ok(url) => url,
            Err(err) => return Some(Err(err)),
        };
        Some(Ok(backend.http().put(url).json(self)))
    }
}

impl Backend {
    /// Uploads one media file end-to-end: metadata first, then the
    /// multipart body. Concurrency is limited by the upload semaphore; the
    /// permit spans both requests.
    pub async fn upload_media(
        &self,
        cancel: &CancellationToken,
        mime_type: &str,
        path: &Path,
    ) -> Result<(), BackendError> {
        let Some(media_type) = MediaKind::from_mime(mime_type) else {
            warn!(path = %path.display(), mime_type, "failed to detect media type");
            return Err(BackendError::UnknownMediaType(mime_type.to_string()));
        };

        debug!(path = %path.display(), "waiting for an upload slot");
        let _permit = self
            .uploads
            .acquire()
            .await
            .map_err(|_| BackendError::Cancelled)?;
        debug!(path = %path.display(), "got an upload slot");

        let basename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = format!("{}_{}", self.camera_id(), basename);
        let meta = tokio::fs::metadata(path).await?;
        let modified: DateTime<Utc> = meta.modified()?.into();

        let descriptor = MediaDescriptor {
            id: id.clone(),
            timestamp: modified.to_rfc3339_opts(SecondsFormat::Secs, true),
            camera: self.camera_id().to_string(),
            tags: vec!["automatic".to_string()],
            media_type,
            mime_type: mime_type.to_string(),
        };
        self.send_resource(cancel, &descriptor, SendOptions::post_only(3))
            .await?;

        info!(path = %path.display(), id, "sending media contents");
        let file = FileResource {
            id,
            path: path.to_path_buf(),
            media_type,
            mime_type: mime_type.to_string(),
            stop: cancel.child_token(),
        };
        self.send_resource(cancel, &file, SendOptions::post_only(3))
            .await?;
        debug!(path = %path.display(), "done sending media contents");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_follows_the_mime_prefix() {
        assert_eq!(MediaKind::from_mime("image/jpeg"), Some(MediaKind::Picture));
        assert_eq!(MediaKind::from_mime("image/png"), Some(MediaKind::Picture));
        assert_eq!(MediaKind::from_mime("video/mp4"), Some(MediaKind::Video));
        assert_eq!(
            MediaKind::from_mime("video/x-msvideo"),
            Some(MediaKind::Video)
        );
        assert_eq!(MediaKind::from_mime("application/pdf"), None);
        assert_eq!(MediaKind::from_mime(""), None);
    }

    #[test]
    fn descriptor_serializes_only_wire_fields() {
        let descriptor = MediaDescriptor {
            id: "cam1_shot.jpg".into(),
            timestamp: "2024-05-01T10:00:00Z".into(),
            camera: "cam1".into(),
            tags: vec!["automatic".into()],
            media_type: MediaKind::Picture,
            mime_type: "image/jpeg".into(),
        };
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": "cam1_shot.jpg",
                "timestamp": "2024-05-01T10:00:00Z",
                "camera": "cam1",
                "tags": ["automatic"],
            })
        );
    }
}
