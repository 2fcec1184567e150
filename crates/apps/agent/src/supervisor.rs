use crate::proxy::ServerProxy;
use crate::usb::{monitor_usb, DeviceNodeCount};
use app_state::AppSettings;
use backend_client::retry::ExponentialBackoff;
use backend_client::{Backend, BackendConfig};
use chrono::{SecondsFormat, Utc};
use color_eyre::Result;
use file_watcher::{FileWatch, UploadServer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Grace period a restarted watcher must survive before its failure alert
/// is cleared and the restart backoff resets.
const WATCHER_GRACE: Duration = Duration::from_secs(30);
/// How long the camera may stay silent before the watchdog fires.
const WATCHDOG_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// Wires the task tree: credential attender, USB monitor, folder
/// coordinator, recording watchdog, and one watcher subtree per folder the
/// backend designates. Returns when the root token is cancelled and every
/// child has been joined.
pub async fn run(settings: AppSettings, cancel: CancellationToken) -> Result<()> {
    let settings = Arc::new(settings);
    let (backend, auth_rx) = Backend::new(BackendConfig {
        api_url: settings.api.url.clone(),
        username: settings.api.username.clone(),
        password: settings.secrets.api_key.clone(),
        camera_id: settings.camera.id.clone(),
        timeout: settings.api.timeout,
        skip_verify: settings.api.skip_verify,
        concurrency: settings.api.concurrency,
        debug: settings.logging.debug,
    })?;

    let tasks = TaskTracker::new();
    let alerts = TaskTracker::new();

    {
        let backend = backend.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { backend.watch_auth(cancel, auth_rx).await });
    }

    let (keepalive_tx, keepalive_rx) = mpsc::channel(1);
    let root_proxy = ServerProxy::new(
        backend.clone(),
        cancel.clone(),
        alerts.clone(),
        settings.ingest.mime_types.clone(),
        keepalive_tx.clone(),
    );

    tasks.spawn(monitor_usb(
        cancel.clone(),
        root_proxy.clone(),
        DeviceNodeCount::new(
            settings.camera.usb_device_folder.clone(),
            settings.camera.usb_device_prefix.clone(),
        ),
        settings.camera.usb_poll,
    ));

    tasks.spawn(recording_watchdog(
        cancel.clone(),
        root_proxy.clone(),
        keepalive_rx,
    ));

    let (folder_tx, mut folder_rx) = mpsc::channel(16);
    {
        let backend = backend.clone();
        let cancel = cancel.clone();
        let interval = settings.api.refresh_interval;
        tasks.spawn(async move { backend.watch_folder(cancel, folder_tx, interval).await });
    }

    // Each folder update tears down the previous watcher subtree before a
    // new one starts, so two watchers never race on the same history file.
    let mut current: Option<(CancellationToken, JoinHandle<()>)> = None;
    loop {
        let folder = tokio::select! {
            () = cancel.cancelled() => break,
            folder = folder_rx.recv() => match folder {
                Some(folder) => folder,
                None => break,
            },
        };
        if let Some((subtree, handle)) = current.take() {
            subtree.cancel();
            if let Err(err) = handle.await {
                error!(error = %err, "watcher subtree panicked");
            }
        }
        let subtree = cancel.child_token();
        let proxy = ServerProxy::new(
            backend.clone(),
            subtree.clone(),
            alerts.clone(),
            settings.ingest.mime_types.clone(),
            keepalive_tx.clone(),
        );
        let handle = tokio::spawn(watch_supervised(
            settings.clone(),
            folder,
            subtree.clone(),
            proxy,
        ));
        current = Some((subtree, handle));
    }

    if let Some((_, handle)) = current.take() {
        let _ = handle.await;
    }
    tasks.close();
    tasks.wait().await;
    alerts.close();
    alerts.wait().await;
    info!("supervisor stopped");
    Ok(())
}

fn rotate_watch_alert_id(camera_id: &str) -> String {
    format!(
        "{camera_id}_watch_folder_{}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Runs one watcher subtree under slow eternal backoff. An attempt that
/// dies within the grace period raises a `watch_folder` error alert; an
/// attempt that survives it clears the alert, rotates the alert id and
/// resets the backoff.
async fn watch_supervised(
    settings: Arc<AppSettings>,
    folder: String,
    cancel: CancellationToken,
    proxy: Arc<ServerProxy>,
) {
    let mut backoff = ExponentialBackoff::slow_eternal();
    let camera_id = settings.camera.id.clone();
    let mut alert_id = rotate_watch_alert_id(&camera_id);
    let mut alert_triggered = false;
    let mut watch = FileWatch::new(
        &settings.ingest.history_folder,
        proxy.clone(),
        Path::new(&folder),
        settings.ingest.file_types(),
        settings.ingest.deny_list.clone(),
        settings.ingest.monitor_for,
        settings.ingest.expire_after,
    );
    loop {
        if cancel.is_cancelled() {
            return;
        }
        info!(folder, "started watching folder");
        let watch_fut = watch.watch(cancel.clone());
        tokio::pin!(watch_fut);
        let grace = tokio::time::sleep(WATCHER_GRACE);
        tokio::pin!(grace);
        let mut survived = false;
        let result = loop {
            tokio::select! {
                result = &mut watch_fut => break result,
                () = &mut grace, if !survived => {
                    survived = true;
                    if alert_triggered {
                        proxy.clear_alert(&alert_id).await;
                        alert_triggered = false;
                    }
                    alert_id = rotate_watch_alert_id(&camera_id);
                    backoff.reset();
                }
            }
        };
        match result {
            // cancelled: the subtree is being torn down
            Ok(()) => return,
            Err(err) => {
                error!(folder, error = %err, "folder watcher failed");
                if !survived && !alert_triggered {
                    proxy
                        .send_alert(&alert_id, "watch_folder", "error", &err.to_string())
                        .await;
                    alert_triggered = true;
                }
                let delay = backoff.next_delay();
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Fires a `camera_not_recording` warning when no upload attempt has been
/// observed for a whole watchdog window. Every upload attempt re-arms the
/// timer.
async fn recording_watchdog<S: UploadServer>(
    cancel: CancellationToken,
    proxy: Arc<S>,
    mut keepalive: mpsc::Receiver<()>,
) {
    let window = tokio::time::sleep(WATCHDOG_WINDOW);
    tokio::pin!(window);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            ping = keepalive.recv() => match ping {
                Some(()) => window
                    .as_mut()
                    .reset(tokio::time::Instant::now() + WATCHDOG_WINDOW),
                None => return,
            },
            () = &mut window => {
                warn!("no new recordings detected in 24 hours");
                let alert_id = format!(
                    "{}_camera_not_recording_{}",
                    proxy.camera_id(),
                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
                );
                proxy
                    .send_alert(
                        &alert_id,
                        "camera_not_recording",
                        "warning",
                        "No new recordings detected in 24 hours",
                    )
                    .await;
                window
                    .as_mut()
                    .reset(tokio::time::Instant::now() + WATCHDOG_WINDOW);
            }
        }
    }
}
