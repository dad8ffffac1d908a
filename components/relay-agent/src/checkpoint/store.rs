// Local crates
use crate::tailer::models::file_inode;

// External crates
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// On-disk file name holding the persisted positions. The `.tmp` sibling is
/// the atomic-replace staging file.
const POSITIONS_FILE: &str = "positions.pos";
const POSITIONS_TMP: &str = "positions.tmp";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted position for one tailed path.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEntry {
    pub offset: u64,
    pub inode: u64,
    pub updated_at: DateTime<Utc>,
}

/// Durable `{path -> (offset, inode)}` map. Updates are in-memory and cheap;
/// a periodic saver flushes the map to `positions.pos` with write-to-temp,
/// fsync, rename.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    interval: Duration,
    entries: RwLock<HashMap<PathBuf, CheckpointEntry>>,
    cancel: CancellationToken,
    saver: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointStore {
    pub fn new(dir: impl AsRef<Path>, interval: Duration) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            interval,
            entries: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            saver: Mutex::new(None),
        }
    }

    fn positions_path(&self) -> PathBuf {
        self.dir.join(POSITIONS_FILE)
    }

    pub async fn get(&self, path: &Path) -> Option<CheckpointEntry> {
        self.entries.read().await.get(path).cloned()
    }

    /// Record the current position for `path`. In-memory only; persistence
    /// happens on the saver interval and on [`CheckpointStore::stop`].
    pub async fn update(&self, path: &Path, offset: u64, inode: u64) {
        let entry = CheckpointEntry {
            offset,
            inode,
            updated_at: Utc::now(),
        };
        self.entries.write().await.insert(path.to_path_buf(), entry);
    }

    pub async fn remove(&self, path: &Path) {
        self.entries.write().await.remove(path);
    }

    /// Read the persisted positions file into memory. A missing file is an
    /// empty state, not an error. Records whose path no longer resolves to
    /// the recorded inode are dropped: the file was rotated away while the
    /// agent was down and the stored offset belongs to a dead identity.
    pub async fn load(&self) -> Result<(), CheckpointError> {
        let path = self.positions_path();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(positions_file = %path.display(), "No positions file found, starting empty");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut loaded = HashMap::new();
        for line in contents.lines() {
            let Some((path, entry)) = parse_record(line) else {
                if !line.trim().is_empty() {
                    tracing::warn!(record = %line, "Skipping malformed positions record");
                }
                continue;
            };
            match tokio::fs::metadata(&path).await {
                Ok(meta) if file_inode(&meta) == entry.inode => {
                    loaded.insert(path, entry);
                }
                Ok(meta) => {
                    tracing::info!(
                        path = %path.display(),
                        stored_inode = entry.inode,
                        disk_inode = file_inode(&meta),
                        "Dropping stale position, file was replaced while agent was down"
                    );
                }
                Err(_) => {
                    tracing::info!(
                        path = %path.display(),
                        "Dropping position for file that no longer exists"
                    );
                }
            }
        }

        tracing::info!(
            positions_file = %path.display(),
            entries = loaded.len(),
            "Loaded positions file"
        );
        *self.entries.write().await = loaded;
        Ok(())
    }

    /// Serialize the in-memory map and atomically replace the positions
    /// file. The temp file is fsynced before the rename so a crash after a
    /// successful save never loses positions from before it.
    pub async fn save(&self) -> Result<(), CheckpointError> {
        let snapshot: Vec<(PathBuf, CheckpointEntry)> = {
            let entries = self.entries.read().await;
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut body = String::new();
        for (path, entry) in &snapshot {
            body.push_str(&format_record(path, entry));
            body.push('\n');
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(POSITIONS_TMP);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.positions_path()).await?;

        tracing::debug!(
            positions_file = %self.positions_path().display(),
            entries = snapshot.len(),
            "Positions saved"
        );
        Ok(())
    }

    /// Spawn the periodic saver. Saves every `interval` until stopped.
    pub async fn start(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.save().await {
                            tracing::error!(error = %e, "Periodic positions save failed");
                        }
                    }
                }
            }
        });
        *self.saver.lock().await = Some(handle);
    }

    /// Stop the periodic saver and flush once more.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.saver.lock().await.take() {
            let _ = handle.await;
        }
        if let Err(e) = self.save().await {
            tracing::error!(error = %e, "Final positions save failed");
        }
    }
}

/// One record per line, tab-separated `key=value` pairs. Key names are part
/// of the on-disk contract and must stay stable across versions; readers
/// ignore keys they do not know.
fn format_record(path: &Path, entry: &CheckpointEntry) -> String {
    format!(
        "path={}\toffset={}\tinode={}\tupdated_at={}",
        path.display(),
        entry.offset,
        entry.inode,
        entry.updated_at.to_rfc3339(),
    )
}

fn parse_record(line: &str) -> Option<(PathBuf, CheckpointEntry)> {
    let mut path = None;
    let mut offset = None;
    let mut inode = None;
    let mut updated_at = None;
    for pair in line.split('\t') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "path" => path = Some(PathBuf::from(value)),
            "offset" => offset = value.parse::<u64>().ok(),
            "inode" => inode = value.parse::<u64>().ok(),
            "updated_at" => {
                updated_at = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }
            _ => {} // forward compatibility
        }
    }
    Some((
        path?,
        CheckpointEntry {
            offset: offset?,
            inode: inode?,
            updated_at: updated_at.unwrap_or_else(Utc::now),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let log = write_file(&dir, "a.log", "hello\n");
        let inode = file_inode(&std::fs::metadata(&log).unwrap());

        let store = CheckpointStore::new(dir.path(), Duration::from_secs(60));
        store.update(&log, 6, inode).await;
        store.save().await.unwrap();

        let restored = CheckpointStore::new(dir.path(), Duration::from_secs(60));
        restored.load().await.unwrap();
        let entry = restored.get(&log).await.unwrap();
        assert_eq!(entry.offset, 6);
        assert_eq!(entry.inode, inode);
    }

    #[tokio::test]
    async fn stale_inode_dropped_on_load() {
        let dir = TempDir::new().unwrap();
        let log = write_file(&dir, "a.log", "hello\n");
        let inode = file_inode(&std::fs::metadata(&log).unwrap());

        let store = CheckpointStore::new(dir.path(), Duration::from_secs(60));
        store.update(&log, 6, inode).await;
        store.save().await.unwrap();

        // Replace the file under the same path: new inode on disk.
        std::fs::remove_file(&log).unwrap();
        write_file(&dir, "a.log", "replacement\n");

        let restored = CheckpointStore::new(dir.path(), Duration::from_secs(60));
        restored.load().await.unwrap();
        assert!(restored.get(&log).await.is_none());
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), Duration::from_secs(60));
        store.load().await.unwrap();
        assert!(store.get(Path::new("/nope")).await.is_none());
    }

    #[tokio::test]
    async fn unknown_keys_ignored() {
        let dir = TempDir::new().unwrap();
        let log = write_file(&dir, "a.log", "hello\n");
        let inode = file_inode(&std::fs::metadata(&log).unwrap());

        let record = format!(
            "path={}\toffset=3\tinode={}\tupdated_at=2026-01-01T00:00:00Z\tfuture_key=whatever",
            log.display(),
            inode,
        );
        write_file(&dir, POSITIONS_FILE, &format!("{record}\n"));

        let store = CheckpointStore::new(dir.path(), Duration::from_secs(60));
        store.load().await.unwrap();
        assert_eq!(store.get(&log).await.unwrap().offset, 3);
    }

    #[tokio::test]
    async fn atomic_replace_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path(), Duration::from_secs(60));
        store.save().await.unwrap();
        assert!(!dir.path().join(POSITIONS_TMP).exists());
        assert!(dir.path().join(POSITIONS_FILE).exists());
    }
}
