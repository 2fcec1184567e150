use crate::error::UploadError;
use crate::history::TaskResult;
use crate::metrics::{
    UPLOAD_CANCEL, UPLOAD_DETECT, UPLOAD_DROPPED, UPLOAD_DURATION, UPLOAD_ERROR, UPLOAD_SUCCESS,
};
use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// The backend seam the watcher tree talks to. One implementation uploads
/// through the real HTTP client; tests substitute a recorder.
#[async_trait]
pub trait UploadServer: Send + Sync + 'static {
    fn camera_id(&self) -> &str;
    async fn upload(&self, path: &Path) -> Result<(), UploadError>;
    async fn send_alert(&self, id: &str, name: &str, severity: &str, message: &str);
    async fn clear_alert(&self, id: &str);
}

/// Collapses a burst of filesystem events into a single upload attempt
/// once the file has been quiet for `monitor_for`. Exactly one result is
/// delivered per invocation; afterwards the event channel is drained so
/// the dispatch loop can never block on a stale sender.
pub(crate) async fn debounce<S: UploadServer>(
    path: std::path::PathBuf,
    uploaded: Option<DateTime<Utc>>,
    mut events: mpsc::Receiver<()>,
    results: mpsc::Sender<TaskResult>,
    server: Arc<S>,
    monitor_for: Duration,
) {
    let folder = path
        .parent()
        .map(|parent| parent.display().to_string())
        .unwrap_or_default();
    let mut uploaded = uploaded;

    // Notifications arrive while the camera is still writing the file, so
    // wait for a quiet window before uploading. Long exposures mean long
    // waits.
    let inactivity = tokio::time::sleep(monitor_for);
    tokio::pin!(inactivity);
    loop {
        tokio::select! {
            () = &mut inactivity => {
                uploaded = fire(&path, &folder, uploaded, server.as_ref()).await;
                break;
            }
            event = events.recv() => match event {
                Some(()) => {
                    debug!(path = %path.display(), "reset of inactivity timer");
                    inactivity.as_mut().reset(tokio::time::Instant::now() + monitor_for);
                }
                None => {
                    // channel closed: the file was removed, stop monitoring
                    debug!(path = %path.display(), "file removed, quitting");
                    UPLOAD_CANCEL.with_label_values(&[&folder]).inc();
                    break;
                }
            },
        }
    }

    let _ = results
        .send(TaskResult {
            path: path.clone(),
            uploaded,
        })
        .await;
    // exhaust late writers so the dispatch loop's sends never land in a
    // dead slot
    while events.recv().await.is_some() {}
}

/// The quiet window elapsed: decide whether the file actually needs an
/// upload and do it. Returns the new `uploaded` timestamp, unchanged on
/// every failure path so the next event re-triggers.
async fn fire<S: UploadServer>(
    path: &Path,
    folder: &str,
    uploaded: Option<DateTime<Utc>>,
    server: &S,
) -> Option<DateTime<Utc>> {
    info!(path = %path.display(), "inactivity expired, triggering upload");
    UPLOAD_DETECT.with_label_values(&[folder]).inc();
    let alert_name = "upload_file";
    let alert_id = format!("{alert_name}_{}_{}", server.camera_id(), path.display());

    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(err) => {
            error!(path = %path.display(), error = %err, "failed to stat file");
            UPLOAD_ERROR.with_label_values(&[folder]).inc();
            server
                .send_alert(&alert_id, alert_name, "error", &err.to_string())
                .await;
            return uploaded;
        }
    };
    let Ok(modified) = meta.modified() else {
        UPLOAD_ERROR.with_label_values(&[folder]).inc();
        return uploaded;
    };
    // The history file keeps second resolution, so round before comparing;
    // otherwise every nanosecond of mtime looks like a new write.
    let modtime: DateTime<Utc> = DateTime::<Utc>::from(modified);
    let modtime = modtime
        .duration_round(TimeDelta::seconds(1))
        .unwrap_or(modtime);
    if let Some(uploaded) = uploaded {
        if modtime <= uploaded {
            info!(path = %path.display(), "file not modified since last upload");
            UPLOAD_DROPPED.with_label_values(&[folder]).inc();
            return Some(uploaded);
        }
    }

    debug!(path = %path.display(), %modtime, "uploading file");
    let start = Instant::now();
    match server.upload(path).await {
        Ok(()) => {
            UPLOAD_SUCCESS.with_label_values(&[folder]).inc();
            UPLOAD_DURATION
                .with_label_values(&[folder])
                .observe(start.elapsed().as_secs_f64());
            server.clear_alert(&alert_id).await;
            // bump by one second so the next comparison is strictly newer
            Some(modtime + TimeDelta::seconds(1))
        }
        Err(UploadError::UnknownMediaType(mime)) => {
            // permanent for this file; alerting would only repeat forever
            error!(path = %path.display(), mime, "unknown media type");
            UPLOAD_ERROR.with_label_values(&[folder]).inc();
            uploaded
        }
        Err(UploadError::Cancelled) => {
            debug!(path = %path.display(), "upload cancelled");
            UPLOAD_CANCEL.with_label_values(&[folder]).inc();
            uploaded
        }
        Err(UploadError::Failed(message)) => {
            error!(path = %path.display(), error = %message, "failed to upload file");
            UPLOAD_ERROR.with_label_values(&[folder]).inc();
            server
                .send_alert(&alert_id, alert_name, "error", &message)
                .await;
            uploaded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    enum Call {
        Upload(PathBuf),
        Alert(String, String),
        Clear(String),
    }

    struct FakeServer {
        calls: Mutex<Vec<Call>>,
        outcome: Mutex<Option<UploadError>>,
    }

    impl FakeServer {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                outcome: Mutex::new(None),
            })
        }

        fn failing(err: UploadError) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                outcome: Mutex::new(Some(err)),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().drain(..).collect()
        }
    }

    #[async_trait]
    impl UploadServer for FakeServer {
        fn camera_id(&self) -> &str {
            "cam1"
        }

        async fn upload(&self, path: &Path) -> Result<(), UploadError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Upload(path.to_path_buf()));
            match self.outcome.lock().unwrap().take() {
                None => Ok(()),
                Some(err) => Err(err),
            }
        }

        async fn send_alert(&self, id: &str, name: &str, _severity: &str, _message: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Alert(id.to_string(), name.to_string()));
        }

        async fn clear_alert(&self, id: &str) {
            self.calls.lock().unwrap().push(Call::Clear(id.to_string()));
        }
    }

    fn media_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"payload").unwrap();
        path
    }

    fn rounded_mtime(path: &Path) -> DateTime<Utc> {
        let modified: DateTime<Utc> = std::fs::metadata(path).unwrap().modified().unwrap().into();
        modified.duration_round(TimeDelta::seconds(1)).unwrap()
    }

    #[tokio::test]
    async fn quiet_file_is_uploaded_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir, "shot.jpg");
        let server = FakeServer::succeeding();
        let (_events_tx, events_rx) = mpsc::channel(1);
        let (results_tx, mut results_rx) = mpsc::channel(1);

        tokio::spawn(debounce(
            path.clone(),
            None,
            events_rx,
            results_tx,
            server.clone(),
            Duration::from_millis(50),
        ));

        let result = results_rx.recv().await.unwrap();
        assert_eq!(result.path, path);
        assert_eq!(
            result.uploaded,
            Some(rounded_mtime(&path) + TimeDelta::seconds(1))
        );
        let calls = server.calls();
        assert_eq!(calls[0], Call::Upload(path.clone()));
        let expected_id = format!("upload_file_cam1_{}", path.display());
        assert_eq!(calls[1], Call::Clear(expected_id));
    }

    #[tokio::test]
    async fn events_keep_resetting_the_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir, "movie.avi");
        let server = FakeServer::succeeding();
        let (events_tx, events_rx) = mpsc::channel(1);
        let (results_tx, mut results_rx) = mpsc::channel(1);

        tokio::spawn(debounce(
            path.clone(),
            None,
            events_rx,
            results_tx,
            server.clone(),
            Duration::from_millis(400),
        ));

        // a stream of writes keeps the debouncer armed
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = events_tx.try_send(());
            assert!(results_rx.try_recv().is_err());
        }
        // once the writes stop, exactly one upload happens
        let result = results_rx.recv().await.unwrap();
        assert!(result.uploaded.is_some());
        let uploads = server
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Upload(_)))
            .count();
        assert_eq!(uploads, 1);
    }

    #[tokio::test]
    async fn closed_channel_means_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir, "gone.jpg");
        let server = FakeServer::succeeding();
        let (events_tx, events_rx) = mpsc::channel(1);
        let (results_tx, mut results_rx) = mpsc::channel(1);

        tokio::spawn(debounce(
            path.clone(),
            None,
            events_rx,
            results_tx,
            server.clone(),
            Duration::from_secs(60),
        ));
        drop(events_tx);

        let result = results_rx.recv().await.unwrap();
        assert_eq!(result.uploaded, None);
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn unmodified_file_is_not_reuploaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir, "shot.jpg");
        let server = FakeServer::succeeding();
        // as if this exact mtime had already been uploaded, post-bump
        let already = rounded_mtime(&path) + TimeDelta::seconds(1);
        let (_events_tx, events_rx) = mpsc::channel(1);
        let (results_tx, mut results_rx) = mpsc::channel(1);

        tokio::spawn(debounce(
            path.clone(),
            Some(already),
            events_rx,
            results_tx,
            server.clone(),
            Duration::from_millis(50),
        ));

        let result = results_rx.recv().await.unwrap();
        assert_eq!(result.uploaded, Some(already));
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_upload_sends_an_alert_and_keeps_the_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir, "shot.jpg");
        let server = FakeServer::failing(UploadError::Failed("backend said no".into()));
        let (_events_tx, events_rx) = mpsc::channel(1);
        let (results_tx, mut results_rx) = mpsc::channel(1);

        tokio::spawn(debounce(
            path.clone(),
            None,
            events_rx,
            results_tx,
            server.clone(),
            Duration::from_millis(50),
        ));

        let result = results_rx.recv().await.unwrap();
        assert_eq!(result.uploaded, None);
        let calls = server.calls();
        let expected_id = format!("upload_file_cam1_{}", path.display());
        assert_eq!(calls[1], Call::Alert(expected_id, "upload_file".into()));
    }

    #[tokio::test]
    async fn unknown_media_type_does_not_alert() {
        let dir = tempfile::tempdir().unwrap();
        let path = media_file(&dir, "notes.txt");
        let server = FakeServer::failing(UploadError::UnknownMediaType("text/plain".into()));
        let (_events_tx, events_rx) = mpsc::channel(1);
        let (results_tx, mut results_rx) = mpsc::channel(1);

        tokio::spawn(debounce(
            path.clone(),
            None,
            events_rx,
            results_tx,
            server.clone(),
            Duration::from_millis(50),
        ));

        let result = results_rx.recv().await.unwrap();
        assert_eq!(result.uploaded, None);
        let calls = server.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Upload(_)));
    }

    #[tokio::test]
    async fn missing_file_alerts_and_keeps_the_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vanished.jpg");
        let server = FakeServer::succeeding();
        let (_events_tx, events_rx) = mpsc::channel(1);
        let (results_tx, mut results_rx) = mpsc::channel(1);

        tokio::spawn(debounce(
            path.clone(),
            None,
            events_rx,
            results_tx,
            server.clone(),
            Duration::from_millis(50),
        ));

        let result = results_rx.recv().await.unwrap();
        assert_eq!(result.uploaded, None);
        let calls = server.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Alert(_, _)));
    }
}
