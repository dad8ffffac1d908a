// Local crates
use crate::checkpoint::store::CheckpointStore;
use crate::model::event::LogEvent;
use crate::tailer::models::{
    CHECKPOINT_EVERY_BYTES, FileCommand, Inode, POLL_INTERVAL_MS, ReadFrom, file_inode,
};

// External crates
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

/// Mutable tailing state for one path: the open handle, the byte offset
/// consumed so far, and the inode the offset belongs to.
#[derive(Debug)]
pub struct TailedFile {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    inode: Inode,
    /// Bytes advanced since the last throttled checkpoint update.
    unflushed: u64,
    /// Partial line carried across reads until its newline arrives.
    pending: String,
}

impl TailedFile {
    /// Open `path` and seek: a checkpoint with a matching inode wins,
    /// otherwise `read_from` decides between existing content and only new
    /// bytes. Files that appear after startup are opened with `Beginning`.
    pub async fn open(
        path: PathBuf,
        checkpoint: &CheckpointStore,
        read_from: ReadFrom,
    ) -> Result<Self> {
        let file = File::open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let metadata = file.metadata().await?;
        let inode = file_inode(&metadata);

        let offset = match checkpoint.get(&path).await {
            Some(entry) if entry.inode == inode => {
                tracing::info!(
                    path = %path.display(),
                    offset = entry.offset,
                    "Resuming from checkpointed offset"
                );
                entry.offset.min(metadata.len())
            }
            _ => match read_from {
                ReadFrom::Beginning => 0,
                ReadFrom::End => metadata.len(),
            },
        };

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset)).await?;

        Ok(Self {
            path,
            reader,
            offset,
            inode,
            unflushed: 0,
            pending: String::new(),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn inode(&self) -> Inode {
        self.inode
    }
}

/// Drive one file's read loop: emit a [`LogEvent`] per complete line,
/// checkpoint the offset on a byte-count throttle, survive rotation and
/// truncation, and flush the final offset on cancellation.
pub async fn run_reader(
    mut file: TailedFile,
    checkpoint: Arc<CheckpointStore>,
    output: mpsc::Sender<LogEvent>,
    mut control_rx: mpsc::Receiver<FileCommand>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        // Rotation signals queued while we were reading take priority over
        // further reads from the dead inode.
        if let Ok(FileCommand::Rotate) = control_rx.try_recv() {
            if !rotate(&mut file, &checkpoint, &cancel).await {
                break;
            }
            continue;
        }

        match file.reader.read_line(&mut file.pending).await {
            Ok(0) => {
                // At EOF: check for in-place truncation, then wait for more
                // bytes, a rotation signal, or shutdown.
                match tokio::fs::metadata(&file.path).await {
                    Ok(meta) if meta.len() < file.offset => {
                        tracing::info!(
                            path = %file.path.display(),
                            offset = file.offset,
                            size = meta.len(),
                            "File truncated in place, restarting from zero"
                        );
                        if !reopen_at_zero(&mut file, &checkpoint).await {
                            break;
                        }
                        continue;
                    }
                    _ => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = control_rx.recv() => {
                        match command {
                            Some(FileCommand::Rotate) => {
                                if !rotate(&mut file, &checkpoint, &cancel).await {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
                }
            }
            Ok(_) => {
                if !file.pending.ends_with('\n') {
                    // Incomplete line at EOF; hold it until the newline
                    // arrives so a mid-write read never emits a fragment.
                    continue;
                }
                let line = std::mem::take(&mut file.pending);
                let advance = line.len() as u64;

                let event = LogEvent::from_line(&file.path.display().to_string(), &line);
                if output.send(event).await.is_err() {
                    // Downstream gone; nothing left to read for.
                    break;
                }

                file.offset += advance;
                file.unflushed += advance;
                if file.unflushed >= CHECKPOINT_EVERY_BYTES {
                    checkpoint.update(&file.path, file.offset, file.inode).await;
                    file.unflushed = 0;
                }
            }
            Err(e) => {
                tracing::error!(
                    path = %file.path.display(),
                    error = %e,
                    "Read error, stopping this file's reader"
                );
                break;
            }
        }
    }

    // Persist where we stopped; lines consumed but unflushed would
    // otherwise replay on the next start.
    checkpoint.update(&file.path, file.offset, file.inode).await;
    tracing::debug!(path = %file.path.display(), offset = file.offset, "Reader exited");
}

/// Flush the dead inode's offset, then reopen the replacement file from
/// offset zero (or a checkpoint recorded for the new inode). Returns false
/// when cancelled while waiting for the replacement.
async fn rotate(file: &mut TailedFile, checkpoint: &Arc<CheckpointStore>, cancel: &CancellationToken) -> bool {
    checkpoint.update(&file.path, file.offset, file.inode).await;

    // Let the writer finish putting the replacement in place.
    sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;

    loop {
        match File::open(&file.path).await {
            Ok(handle) => {
                let Ok(metadata) = handle.metadata().await else {
                    return false;
                };
                let new_inode = file_inode(&metadata);
                if new_inode == file.inode {
                    // Same identity: the create event raced a rotation we
                    // already completed, or the rename was a no-op.
                    tracing::debug!(
                        path = %file.path.display(),
                        inode = new_inode,
                        "Rotation signal for current inode, keeping position"
                    );
                    return true;
                }

                let offset = match checkpoint.get(&file.path).await {
                    Some(entry) if entry.inode == new_inode => entry.offset.min(metadata.len()),
                    _ => 0,
                };
                let mut reader = BufReader::new(handle);
                if reader.seek(SeekFrom::Start(offset)).await.is_err() {
                    return false;
                }

                tracing::info!(
                    path = %file.path.display(),
                    old_inode = file.inode,
                    new_inode,
                    offset,
                    "Rotated file reopened"
                );
                file.reader = reader;
                file.inode = new_inode;
                file.offset = offset;
                file.unflushed = 0;
                file.pending.clear();
                checkpoint.update(&file.path, offset, new_inode).await;
                return true;
            }
            Err(_) => {
                // Replacement not there yet; keep polling until it shows up
                // or we are told to stop.
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
                }
            }
        }
    }
}

/// In-place truncation: same inode, content restarted. Reset to zero.
async fn reopen_at_zero(file: &mut TailedFile, checkpoint: &Arc<CheckpointStore>) -> bool {
    let Ok(handle) = File::open(&file.path).await else {
        return false;
    };
    file.reader = BufReader::new(handle);
    file.offset = 0;
    file.unflushed = 0;
    file.pending.clear();
    checkpoint.update(&file.path, 0, file.inode).await;
    true
}
