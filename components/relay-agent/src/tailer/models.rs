// External crates
use serde::Deserialize;
use std::fs::Metadata;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Filesystem identity of a tailed file; survives rename, not recreate.
pub type Inode = u64;

/// Offset advance between throttled checkpoint updates.
pub const CHECKPOINT_EVERY_BYTES: u64 = 10_000;

/// Poll interval at EOF and grace delay before reopening after rotation.
pub const POLL_INTERVAL_MS: u64 = 100;

fn default_checkpoint_interval_secs() -> u64 {
    10
}

/// Where a file with no usable checkpoint is first read from. Files that
/// appear after startup are always read in full regardless.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadFrom {
    #[default]
    Beginning,
    End,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TailerConfig {
    /// Files to tail, or directories whose `*.log` files are tailed.
    pub paths: Vec<String>,
    /// Directory holding the positions file.
    pub checkpoint_dir: String,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default)]
    pub read_from: ReadFrom,
}

/// Control messages the manager sends to one file's reader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileCommand {
    /// The path was renamed or removed: flush, close, reopen the
    /// replacement from offset zero.
    Rotate,
}

/// Control-plane handle for one running file reader.
#[derive(Debug)]
pub struct ReaderHandle {
    pub join: JoinHandle<()>,
    pub cancel: CancellationToken,
    pub control_tx: mpsc::Sender<FileCommand>,
}

#[cfg(unix)]
pub fn file_inode(metadata: &Metadata) -> Inode {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
pub fn file_inode(metadata: &Metadata) -> Inode {
    // No inode on this platform; hash size and mtime as a best-effort
    // identity so rotation is still detectable in the common case.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    metadata.len().hash(&mut hasher);
    if let Ok(modified) = metadata.modified() {
        modified.hash(&mut hasher);
    }
    hasher.finish()
}
