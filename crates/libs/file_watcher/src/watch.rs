use crate::debounce::{debounce, UploadServer};
use crate::error::WatchError;
use crate::history::{FileHistory, TaskResult};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Full rescan cadence; the first scan runs at startup.
const RESCAN_INTERVAL: Duration = Duration::from_secs(2 * 3600);
/// History compaction cadence.
const REMAP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq)]
enum FileOp {
    Update,
    Remove,
}

/// Watches one folder tree for media files and drives a debouncer per
/// active file. Several watchers may share a history folder; each derives
/// its own history file from the watched path.
pub struct FileWatch<S> {
    history: FileHistory,
    server: Arc<S>,
    folder: PathBuf,
    file_types: HashSet<String>,
    deny_list: Vec<String>,
    monitor_for: Duration,
}

impl<S: UploadServer> FileWatch<S> {
    #[must_use]
    pub fn new(
        history_folder: &Path,
        server: Arc<S>,
        folder: &Path,
        file_types: HashSet<String>,
        deny_list: Vec<String>,
        monitor_for: Duration,
        expire_after: Duration,
    ) -> Self {
        // the history file is named after the absolute root, so relative
        // spellings of the same folder share a checkpoint
        let root = std::path::absolute(folder).unwrap_or_else(|_| folder.to_path_buf());
        Self {
            history: FileHistory::new(history_folder, &root, expire_after),
            server,
            folder: root,
            file_types: file_types
                .into_iter()
                .map(|ext| ext.to_lowercase())
                .collect(),
            deny_list: deny_list
                .into_iter()
                .map(|entry| entry.to_lowercase())
                .collect(),
            monitor_for,
        }
    }

    /// Where this watcher checkpoints its history.
    #[must_use]
    pub fn history_file(&self) -> &Path {
        self.history.history_file()
    }

    /// Runs the watcher until cancellation (clean return) or a source
    /// failure (error return, the supervisor restarts with backoff).
    pub async fn watch(&mut self, cancel: CancellationToken) -> Result<(), WatchError> {
        let root = std::path::absolute(&self.folder)?;
        let stat = std::fs::metadata(&root)?;
        if !stat.is_dir() {
            return Err(WatchError::NotDirectory(root));
        }
        self.history.load()?;

        let (notify_tx, mut notify_rx) = mpsc::channel(100);
        let mut watcher = RecommendedWatcher::new(
            move |event| {
                let _ = notify_tx.blocking_send(event);
            },
            Config::default(),
        )?;
        // Subdirectories are subscribed one by one as they appear, so a
        // directory created mid-run is picked up the same way as one found
        // during a scan.
        watcher.watch(&root, RecursiveMode::NonRecursive)?;
        let mut watched: HashSet<PathBuf> = HashSet::from([root.clone()]);

        let (tasks_tx, mut tasks_rx) = mpsc::channel::<TaskResult>(16);
        let debouncers = TaskTracker::new();
        let mut rescan = tokio::time::interval(RESCAN_INTERVAL);
        let mut remap = tokio::time::interval_at(
            tokio::time::Instant::now() + REMAP_INTERVAL,
            REMAP_INTERVAL,
        );

        info!(folder = %root.display(), "started dispatching events");
        let result = loop {
            tokio::select! {
                // completions take priority: a burst of new events must not
                // starve upload accounting
                biased;
                () = cancel.cancelled() => {
                    debug!(folder = %root.display(), "event dispatch cancelled");
                    break Ok(());
                }
                Some(result) = tasks_rx.recv() => {
                    self.history.complete_task(&result);
                    if let Err(err) = self.history.save() {
                        error!(error = %err, "failed to save history");
                    }
                }
                _ = remap.tick() => {
                    debug!("remapping file history");
                    self.history.remap();
                }
                _ = rescan.tick() => {
                    self.scan(&root, &mut watcher, &mut watched, &tasks_tx, &debouncers);
                }
                event = notify_rx.recv() => match event {
                    None => break Err(WatchError::EventsClosed),
                    Some(Err(err)) => {
                        error!(folder = %root.display(), error = %err, "watcher error");
                        break Err(err.into());
                    }
                    Some(Ok(event)) => {
                        let op = match event.kind {
                            EventKind::Remove(_) => FileOp::Remove,
                            EventKind::Create(_) | EventKind::Modify(_) => FileOp::Update,
                            _ => continue,
                        };
                        for path in &event.paths {
                            self.handle_path(path, op, &mut watcher, &mut watched, &tasks_tx, &debouncers);
                        }
                    }
                },
            }
        };

        // Close every per-file channel and wait for the debouncers; their
        // late results land in a dropped receiver, which is fine.
        self.history.cleanup();
        drop(tasks_rx);
        debouncers.close();
        debouncers.wait().await;
        result
    }

    /// Screens one path and routes it: new directories get subscribed,
    /// recognized files get debounced, everything else is dropped.
    fn handle_path(
        &mut self,
        path: &Path,
        op: FileOp,
        watcher: &mut RecommendedWatcher,
        watched: &mut HashSet<PathBuf>,
        tasks_tx: &mpsc::Sender<TaskResult>,
        debouncers: &TaskTracker,
    ) {
        if op == FileOp::Remove {
            if watched.remove(path) {
                debug!(path = %path.display(), "stopped watching directory");
                let _ = watcher.unwatch(path);
            }
            self.history.remove_task(path);
            return;
        }

        if path.is_dir() {
            self.subscribe_dir(path, watcher, watched);
            return;
        }

        let extension = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if !self.file_types.contains(&extension) {
            debug!(path = %path.display(), extension, "unrecognized extension");
            return;
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if self.deny_list.iter().any(|entry| name.contains(entry)) {
            debug!(path = %path.display(), "file name is denied");
            return;
        }

        debug!(path = %path.display(), "dispatch detected file");
        let (events, new_task) = self.history.create_task(path);
        if let Some(task) = new_task {
            info!(path = %path.display(), "started monitoring file");
            debouncers.spawn(debounce(
                task.path,
                task.uploaded,
                task.events,
                tasks_tx.clone(),
                self.server.clone(),
                self.monitor_for,
            ));
        }
        // non-blocking: overflow is dropped, one pending signal is enough
        // to reset the debounce timer
        let _ = events.try_send(());
    }

    fn subscribe_dir(
        &self,
        path: &Path,
        watcher: &mut RecommendedWatcher,
        watched: &mut HashSet<PathBuf>,
    ) {
        // filters spurious "." and ".." entries from some event sources
        if path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().ends_with('.'))
        {
            debug!(path = %path.display(), "skipping directory");
            return;
        }
        if watched.contains(path) {
            return;
        }
        match watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                debug!(path = %path.display(), "watching new directory");
                watched.insert(path.to_path_buf());
            }
            Err(err) => {
                // it will be retried on the next scan
                warn!(path = %path.display(), error = %err, "failed to watch directory");
            }
        }
    }

    /// Walks the whole tree emitting synthetic create events, so files
    /// that appeared while notifications were lost still get uploaded.
    fn scan(
        &mut self,
        root: &Path,
        watcher: &mut RecommendedWatcher,
        watched: &mut HashSet<PathBuf>,
        tasks_tx: &mpsc::Sender<TaskResult>,
        debouncers: &TaskTracker,
    ) {
        debug!(folder = %root.display(), "scanning folder");
        for entry in WalkDir::new(root).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(folder = %root.display(), error = %err, "failed to read folder");
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            self.handle_path(
                entry.path(),
                FileOp::Update,
                watcher,
                watched,
                tasks_tx,
                debouncers,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    struct RecordingServer {
        uploads: Mutex<Vec<PathBuf>>,
    }

    impl RecordingServer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                uploads: Mutex::new(Vec::new()),
            })
        }

        fn uploads(&self) -> Vec<PathBuf> {
            self.uploads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UploadServer for RecordingServer {
        fn camera_id(&self) -> &str {
            "cam1"
        }

        async fn upload(&self, path: &Path) -> Result<(), UploadError> {
            self.uploads.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        async fn send_alert(&self, _id: &str, _name: &str, _severity: &str, _message: &str) {}

        async fn clear_alert(&self, _id: &str) {}
    }

    fn new_watch(
        history: &tempfile::TempDir,
        media: &tempfile::TempDir,
        server: Arc<RecordingServer>,
    ) -> FileWatch<RecordingServer> {
        FileWatch::new(
            history.path(),
            server,
            media.path(),
            HashSet::from([".jpg".to_string(), ".mp4".to_string()]),
            vec!["denied".to_string()],
            Duration::from_millis(100),
            Duration::ZERO,
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached within 10s");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrap_scan_uploads_existing_files() {
        let history = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let shot = media.path().join("shot.jpg");
        std::fs::write(&shot, b"jpeg").unwrap();
        std::fs::write(media.path().join("notes.txt"), b"skip me").unwrap();
        std::fs::write(media.path().join("denied.jpg"), b"skip me too").unwrap();

        let server = RecordingServer::new();
        let mut watch = new_watch(&history, &media, server.clone());
        let history_file = watch.history_file().to_path_buf();
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { watch.watch(cancel).await })
        };

        wait_for(|| !server.uploads().is_empty()).await;
        // history is checkpointed with the bumped timestamp
        wait_for(|| history_file.exists()).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let uploads = server.uploads();
        assert_eq!(uploads, vec![shot.clone()]);
        let saved = std::fs::read_to_string(&history_file).unwrap();
        assert!(saved.contains(&shot.display().to_string()));
        let (timestamp, _) = saved.trim().split_once(',').unwrap();
        let stored: DateTime<Utc> = DateTime::parse_from_rfc3339(timestamp)
            .unwrap()
            .with_timezone(&Utc);
        let modified: DateTime<Utc> =
            std::fs::metadata(&shot).unwrap().modified().unwrap().into();
        assert!(stored > modified);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_files_in_new_subdirectories_are_picked_up() {
        let history = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let server = RecordingServer::new();
        let mut watch = new_watch(&history, &media, server.clone());
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { watch.watch(cancel).await })
        };
        // let the watcher subscribe before creating files
        tokio::time::sleep(Duration::from_millis(300)).await;

        let subdir = media.path().join("2024-05-01");
        std::fs::create_dir(&subdir).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let clip = subdir.join("clip.mp4");
        std::fs::write(&clip, b"video").unwrap();

        wait_for(|| server.uploads().contains(&clip)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watching_a_file_instead_of_a_directory_fails() {
        let history = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let file = media.path().join("file.jpg");
        std::fs::write(&file, b"x").unwrap();

        let server = RecordingServer::new();
        let mut watch = FileWatch::new(
            history.path(),
            server,
            &file,
            HashSet::from([".jpg".to_string()]),
            Vec::new(),
            Duration::from_millis(100),
            Duration::ZERO,
        );
        let result = watch.watch(CancellationToken::new()).await;
        assert!(matches!(result, Err(WatchError::NotDirectory(_))));
    }
}
