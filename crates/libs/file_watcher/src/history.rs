use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// FNV-1a 64-bit, used to derive a stable history file name per watch
/// folder.
#[must_use]
pub(crate) fn fnv1a64(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

#[derive(Debug)]
pub(crate) struct HistoryEntry {
    /// Timestamp of the last successful upload, at second resolution.
    /// `None` means the file has never been uploaded.
    pub uploaded: Option<DateTime<Utc>>,
    /// Live event channel to the file's debouncer. Its presence is the
    /// authoritative sign that a debouncer is running for this path.
    pub events: Option<mpsc::Sender<()>>,
}

/// Everything a freshly spawned debouncer needs.
pub(crate) struct NewTask {
    pub path: PathBuf,
    pub uploaded: Option<DateTime<Utc>>,
    pub events: mpsc::Receiver<()>,
}

/// Result delivered by a debouncer when it finishes with a file.
#[derive(Debug)]
pub struct TaskResult {
    pub path: PathBuf,
    pub uploaded: Option<DateTime<Utc>>,
}

/// Durable record of uploaded files for one watch folder, checkpointed as
/// a CSV of `<RFC3339 timestamp>,<path>` lines. All mutation goes through
/// the watcher's dispatch loop.
pub struct FileHistory {
    history_folder: PathBuf,
    history_file: PathBuf,
    expire_after: Duration,
    entries: HashMap<PathBuf, HistoryEntry>,
    last_update: Option<DateTime<Utc>>,
}

impl FileHistory {
    #[must_use]
    pub fn new(history_folder: &Path, watch_folder: &Path, expire_after: Duration) -> Self {
        let hash = fnv1a64(watch_folder.to_string_lossy().as_bytes());
        let history_file = history_folder.join(format!("{hash:x}.csv"));
        Self {
            history_folder: history_folder.to_path_buf(),
            history_file,
            expire_after,
            entries: HashMap::new(),
            last_update: None,
        }
    }

    #[must_use]
    pub fn history_file(&self) -> &Path {
        &self.history_file
    }

    /// The most recent upload timestamp across all entries.
    #[must_use]
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Loads the checkpoint. Unparseable lines are skipped; entries whose
    /// file no longer exists are dropped.
    pub fn load(&mut self) -> io::Result<()> {
        if !self.history_folder.exists() {
            std::fs::create_dir_all(&self.history_folder)?;
        }
        self.entries.clear();
        let file = match std::fs::File::open(&self.history_file) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((timestamp, path)) = line.split_once(',') else {
                warn!(line, "invalid history line");
                continue;
            };
            let Ok(uploaded) = DateTime::parse_from_rfc3339(timestamp) else {
                warn!(line, "invalid date in history line");
                continue;
            };
            let path = PathBuf::from(path);
            if !path.exists() {
                debug!(path = %path.display(), "file from history no longer exists");
                continue;
            }
            self.entries.insert(
                path,
                HistoryEntry {
                    uploaded: Some(uploaded.with_timezone(&Utc)),
                    events: None,
                },
            );
        }
        Ok(())
    }

    /// Persists the checkpoint crash-atomically: write a sibling temp file,
    /// then rename it over the target. On failure the temp file is removed.
    pub fn save(&mut self) -> io::Result<()> {
        debug!(file = %self.history_file.display(), "updating history file");
        let mut last_update = None;
        let mut temp = tempfile::NamedTempFile::new_in(&self.history_folder)?;
        for (path, entry) in &self.entries {
            let Some(uploaded) = entry.uploaded else {
                continue;
            };
            writeln!(
                temp,
                "{},{}",
                uploaded.to_rfc3339_opts(SecondsFormat::Secs, true),
                path.display()
            )?;
            if last_update.is_none_or(|last| uploaded > last) {
                last_update = Some(uploaded);
            }
        }
        temp.flush()?;
        temp.persist(&self.history_file).map_err(|err| err.error)?;
        self.last_update = last_update;
        Ok(())
    }

    /// Ensures an entry with a live debouncer exists for `path`. Returns
    /// the event sender, plus the receiver half when a new debouncer has to
    /// be spawned for it.
    pub(crate) fn create_task(&mut self, path: &Path) -> (mpsc::Sender<()>, Option<NewTask>) {
        let entry = self
            .entries
            .entry(path.to_path_buf())
            .or_insert(HistoryEntry {
                uploaded: None,
                events: None,
            });
        if let Some(events) = &entry.events {
            return (events.clone(), None);
        }
        // one pending signal is enough to reset the debounce timer
        let (tx, rx) = mpsc::channel(1);
        entry.events = Some(tx.clone());
        let task = NewTask {
            path: path.to_path_buf(),
            uploaded: entry.uploaded,
            events: rx,
        };
        (tx, Some(task))
    }

    /// Records a debouncer result: stops monitoring the file and keeps the
    /// newer upload timestamp.
    pub(crate) fn complete_task(&mut self, result: &TaskResult) {
        let entry = self
            .entries
            .entry(result.path.clone())
            .or_insert(HistoryEntry {
                uploaded: None,
                events: None,
            });
        if entry.events.take().is_some() {
            info!(path = %result.path.display(), "stopped monitoring file");
        }
        if result.uploaded.is_some() {
            entry.uploaded = result.uploaded;
        }
    }

    /// Forgets a removed file. Dropping the sender closes the debouncer's
    /// event channel, which makes it exit without uploading.
    pub(crate) fn remove_task(&mut self, path: &Path) {
        if self.entries.remove(path).is_some() {
            info!(path = %path.display(), "file removed from history");
        }
    }

    /// Compacts the map: entries whose file is gone or turned into a
    /// directory are dropped, and entries older than the expiration are
    /// dropped after removing the file itself. Entries with a live
    /// debouncer are left alone.
    pub fn remap(&mut self) {
        let expire_before = if self.expire_after.is_zero() {
            None
        } else {
            chrono::Duration::from_std(self.expire_after)
                .ok()
                .map(|expiry| Utc::now() - expiry)
        };
        self.entries.retain(|path, entry| {
            if entry.events.is_some() {
                return true;
            }
            if !path.exists() {
                debug!(path = %path.display(), "dropping history entry for missing file");
                return false;
            }
            if path.is_dir() {
                debug!(path = %path.display(), "dropping history entry for directory");
                return false;
            }
            let expired = match (expire_before, entry.uploaded) {
                (Some(expire_before), Some(uploaded)) => uploaded < expire_before,
                _ => false,
            };
            if !expired {
                return true;
            }
            match std::fs::remove_file(path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed expired file");
                    false
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => false,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove expired file");
                    true
                }
            }
        });
    }

    /// Closes every live event channel. Called on watcher shutdown so no
    /// debouncer outlives its dispatch loop.
    pub fn cleanup(&mut self) {
        for entry in self.entries.values_mut() {
            entry.events = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn uploaded(&self, path: &Path) -> Option<DateTime<Utc>> {
        self.entries.get(path).and_then(|entry| entry.uploaded)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fnv1a64_matches_known_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn history_file_name_is_the_folder_hash() {
        let history = FileHistory::new(
            Path::new("/var/history"),
            Path::new("C:/A"),
            Duration::ZERO,
        );
        let expected = format!("{:x}.csv", fnv1a64(b"C:/A"));
        assert_eq!(
            history.history_file(),
            Path::new("/var/history").join(expected)
        );

        let other = FileHistory::new(
            Path::new("/var/history"),
            Path::new("C:/B"),
            Duration::ZERO,
        );
        assert_ne!(history.history_file(), other.history_file());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let file_a = media.path().join("a.jpg");
        let file_b = media.path().join("b.mp4");
        std::fs::write(&file_a, b"a").unwrap();
        std::fs::write(&file_b, b"b").unwrap();

        let mut history = FileHistory::new(dir.path(), media.path(), Duration::ZERO);
        history.load().unwrap();
        let when = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 1).unwrap();
        history.complete_task(&TaskResult {
            path: file_a.clone(),
            uploaded: Some(when),
        });
        history.complete_task(&TaskResult {
            path: file_b.clone(),
            uploaded: Some(when + chrono::Duration::seconds(5)),
        });
        history.save().unwrap();
        assert_eq!(
            history.last_update(),
            Some(when + chrono::Duration::seconds(5))
        );

        let mut reloaded = FileHistory::new(dir.path(), media.path(), Duration::ZERO);
        reloaded.load().unwrap();
        assert_eq!(reloaded.uploaded(&file_a), Some(when));
        assert_eq!(
            reloaded.uploaded(&file_b),
            Some(when + chrono::Duration::seconds(5))
        );

        // writing again yields the same set of entries
        reloaded.save().unwrap();
        let mut again = FileHistory::new(dir.path(), media.path(), Duration::ZERO);
        again.load().unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again.uploaded(&file_a), Some(when));
    }

    #[test]
    fn load_skips_bad_lines_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let present = media.path().join("present.jpg");
        std::fs::write(&present, b"x").unwrap();

        let mut history = FileHistory::new(dir.path(), media.path(), Duration::ZERO);
        std::fs::write(
            history.history_file(),
            format!(
                "not-a-line\nbogus-date,{}\n2024-05-01T10:00:01Z,{}\n2024-05-01T10:00:01Z,{}\n",
                present.display(),
                present.display(),
                media.path().join("gone.jpg").display()
            ),
        )
        .unwrap();

        history.load().unwrap();
        assert_eq!(history.len(), 1);
        assert!(history.uploaded(&present).is_some());
    }

    #[test]
    fn remap_drops_missing_expired_and_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let fresh = media.path().join("fresh.jpg");
        let stale = media.path().join("stale.jpg");
        let subdir = media.path().join("clips");
        std::fs::write(&fresh, b"x").unwrap();
        std::fs::write(&stale, b"x").unwrap();
        std::fs::create_dir(&subdir).unwrap();

        let mut history =
            FileHistory::new(dir.path(), media.path(), Duration::from_secs(24 * 3600));
        history.complete_task(&TaskResult {
            path: fresh.clone(),
            uploaded: Some(Utc::now()),
        });
        history.complete_task(&TaskResult {
            path: stale.clone(),
            uploaded: Some(Utc::now() - chrono::Duration::days(7)),
        });
        history.complete_task(&TaskResult {
            path: media.path().join("missing.jpg"),
            uploaded: Some(Utc::now()),
        });
        history.complete_task(&TaskResult {
            path: subdir.clone(),
            uploaded: Some(Utc::now()),
        });

        history.remap();
        assert_eq!(history.len(), 1);
        assert!(history.uploaded(&fresh).is_some());
        // the expired file itself is removed from disk
        assert!(!stale.exists());
    }

    #[test]
    fn zero_expiration_keeps_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let old = media.path().join("old.jpg");
        std::fs::write(&old, b"x").unwrap();

        let mut history = FileHistory::new(dir.path(), media.path(), Duration::ZERO);
        history.complete_task(&TaskResult {
            path: old.clone(),
            uploaded: Some(Utc::now() - chrono::Duration::days(365)),
        });
        history.remap();
        assert_eq!(history.len(), 1);
        assert!(old.exists());
    }

    #[tokio::test]
    async fn create_task_reuses_the_live_channel() {
        let dir = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let path = media.path().join("clip.mp4");

        let mut history = FileHistory::new(dir.path(), media.path(), Duration::ZERO);
        let (_tx1, task) = history.create_task(&path);
        assert!(task.is_some());
        // a second event for the same path must not spawn a second debouncer
        let (_tx2, task) = history.create_task(&path);
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn complete_task_closes_the_channel_and_keeps_the_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let path = media.path().join("clip.mp4");

        let mut history = FileHistory::new(dir.path(), media.path(), Duration::ZERO);
        let (tx, task) = history.create_task(&path);
        let mut task = task.unwrap();
        drop(tx);

        let when = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 1).unwrap();
        history.complete_task(&TaskResult {
            path: path.clone(),
            uploaded: Some(when),
        });
        assert_eq!(history.uploaded(&path), Some(when));
        // the debouncer side observes the closed channel
        assert!(task.events.recv().await.is_none());

        // a later result without an upload keeps the stored timestamp
        history.complete_task(&TaskResult {
            path: path.clone(),
            uploaded: None,
        });
        assert_eq!(history.uploaded(&path), Some(when));
    }
}
