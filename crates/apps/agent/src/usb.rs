use chrono::{SecondsFormat, Utc};
use file_watcher::UploadServer;
use once_cell::sync::Lazy;
use prometheus::{register_int_gauge_vec, IntGaugeVec};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

static CONNECTED_CAMERAS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "connected_cameras",
        "Number of cameras connected",
        &["cameraID"]
    )
    .expect("register connected_cameras")
});

/// USB-presence poll contract. The camera SDK itself lives outside this
/// workspace; anything that can count attached cameras fits here.
pub trait CameraCount: Send + Sync + 'static {
    fn connected_cameras(&self) -> io::Result<usize>;
}

/// Counts camera device nodes by name prefix in a device folder, e.g.
/// `video*` under `/dev`.
pub struct DeviceNodeCount {
    folder: PathBuf,
    prefix: String,
}

impl DeviceNodeCount {
    #[must_use]
    pub fn new(folder: PathBuf, prefix: String) -> Self {
        Self { folder, prefix }
    }
}

impl CameraCount for DeviceNodeCount {
    fn connected_cameras(&self) -> io::Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.folder)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(&self.prefix)
            {
                count += 1;
            }
        }
        Ok(count)
    }
}

fn rotate_alert_id(camera_id: &str) -> String {
    format!(
        "{camera_id}_usb_connection_{}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Polls the camera count and maintains the `usb_connection` alert: an
/// error alert when the camera disappears, resolved when it comes back,
/// with a fresh alert id per occurrence.
pub async fn monitor_usb<S: UploadServer, C: CameraCount>(
    cancel: CancellationToken,
    proxy: Arc<S>,
    probe: C,
    poll: Duration,
) {
    let alert_name = "usb_connection";
    let mut usb_detected = false; // a camera has been seen at least once
    let mut usb_missing = false; // a camera went from seen to missing
    let mut usb_id = rotate_alert_id(proxy.camera_id());
    loop {
        let connected = match probe.connected_cameras() {
            Ok(connected) => connected,
            Err(err) => {
                error!(error = %err, "failed to count connected cameras");
                0
            }
        };
        if connected == 0 && (usb_detected || !usb_missing) {
            error!("no USB camera detected");
            proxy
                .send_alert(&usb_id, alert_name, "error", "No USB camera detected")
                .await;
            usb_detected = false;
            usb_missing = true;
        }
        if connected > 0 {
            usb_detected = true;
            if usb_missing {
                info!("USB camera detected");
                proxy.clear_alert(&usb_id).await;
                // the next disconnection is a fresh record
                usb_id = rotate_alert_id(proxy.camera_id());
                usb_missing = false;
            }
        }
        CONNECTED_CAMERAS
            .with_label_values(&[proxy.camera_id()])
            .set(connected as i64);

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(poll) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use file_watcher::UploadError;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    struct ScriptedProbe {
        counts: Mutex<VecDeque<usize>>,
        /// what the probe keeps reporting once the script runs out
        then: usize,
    }

    impl CameraCount for ScriptedProbe {
        fn connected_cameras(&self) -> io::Result<usize> {
            let mut counts = self.counts.lock().unwrap();
            Ok(counts.pop_front().unwrap_or(self.then))
        }
    }

    #[derive(Debug, PartialEq)]
    enum Call {
        Alert(String),
        Clear(String),
    }

    struct RecordingProxy {
        calls: Mutex<Vec<Call>>,
    }

    #[async_trait]
    impl UploadServer for RecordingProxy {
        fn camera_id(&self) -> &str {
            "cam1"
        }

        async fn upload(&self, _path: &Path) -> Result<(), UploadError> {
            Ok(())
        }

        async fn send_alert(&self, id: &str, name: &str, severity: &str, _message: &str) {
            assert_eq!(name, "usb_connection");
            assert_eq!(severity, "error");
            self.calls.lock().unwrap().push(Call::Alert(id.to_string()));
        }

        async fn clear_alert(&self, id: &str) {
            self.calls.lock().unwrap().push(Call::Clear(id.to_string()));
        }
    }

    #[tokio::test]
    async fn disconnection_alerts_and_reconnection_resolves_the_same_id() {
        let proxy = Arc::new(RecordingProxy {
            calls: Mutex::new(Vec::new()),
        });
        let probe = ScriptedProbe {
            counts: Mutex::new(VecDeque::from([1, 0, 1])),
            then: 1,
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor_usb(
            cancel.clone(),
            proxy.clone(),
            probe,
            Duration::from_millis(20),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = proxy.calls.lock().unwrap();
        assert!(calls.len() >= 2, "expected an alert and a clear: {calls:?}");
        let Call::Alert(alert_id) = &calls[0] else {
            panic!("expected an alert first: {calls:?}");
        };
        assert!(alert_id.starts_with("cam1_usb_connection_"));
        assert_eq!(calls[1], Call::Clear(alert_id.clone()));
    }

    #[tokio::test]
    async fn never_seen_camera_still_alerts_once() {
        let proxy = Arc::new(RecordingProxy {
            calls: Mutex::new(Vec::new()),
        });
        let probe = ScriptedProbe {
            counts: Mutex::new(VecDeque::new()),
            then: 0,
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor_usb(
            cancel.clone(),
            proxy.clone(),
            probe,
            Duration::from_millis(20),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        handle.await.unwrap();

        let calls = proxy.calls.lock().unwrap();
        // repeated zero polls do not repeat the alert
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Alert(_)));
    }

    #[test]
    fn device_node_count_matches_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("video0"), b"").unwrap();
        std::fs::write(dir.path().join("video1"), b"").unwrap();
        std::fs::write(dir.path().join("null"), b"").unwrap();

        let probe = DeviceNodeCount::new(dir.path().to_path_buf(), "video".to_string());
        assert_eq!(probe.connected_cameras().unwrap(), 2);
    }
}
