// Local crates
use crate::checkpoint::store::CheckpointStore;
use crate::model::event::LogEvent;
use crate::tailer::models::{FileCommand, ReadFrom, ReaderHandle, TailerConfig};
use crate::tailer::reader::{TailedFile, run_reader};

// External crates
use anyhow::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

const WATCH_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const READER_CONTROL_CAPACITY: usize = 8;

/// Supervises one reader task per tailed file plus a filesystem watcher
/// loop translating notify events into rotation signals and new-file
/// discovery. Only this supervisor inserts into or removes from the file
/// table.
pub struct FileTailer {
    config: TailerConfig,
    checkpoint: Arc<CheckpointStore>,
    cancel: CancellationToken,
    files: Arc<RwLock<HashMap<PathBuf, ReaderHandle>>>,
    /// Directories being watched for newly created log files.
    watched_dirs: HashSet<PathBuf>,
    /// Dropped on stop so the event stream terminates once the last reader
    /// exits.
    event_tx: Option<mpsc::Sender<LogEvent>>,
    event_rx: Option<mpsc::Receiver<LogEvent>>,
    watcher_join: Option<JoinHandle<()>>,
    // Dropping the notify watcher tears the watches down, so it lives here.
    watcher: Option<RecommendedWatcher>,
}

impl std::fmt::Debug for FileTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTailer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FileTailer {
    pub fn new(
        config: TailerConfig,
        checkpoint: Arc<CheckpointStore>,
        cancel: CancellationToken,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            checkpoint,
            cancel,
            files: Arc::new(RwLock::new(HashMap::new())),
            watched_dirs: HashSet::new(),
            event_tx: Some(event_tx),
            event_rx: Some(event_rx),
            watcher_join: None,
            watcher: None,
        }
    }

    /// The tailed line stream. Each event carries the file path as its
    /// source and the line, trailing newline included, as its message.
    /// Callable once; subsequent calls return `None`.
    pub fn events(&mut self) -> Option<mpsc::Receiver<LogEvent>> {
        self.event_rx.take()
    }

    /// Resolve configured paths, spawn a reader per existing file, and
    /// register filesystem watches. Open failures are logged per path and
    /// do not abort startup.
    pub async fn start(&mut self) -> Result<()> {
        let (watch_tx, watch_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    // A failed send means the watcher loop is gone.
                    let _ = watch_tx.blocking_send(event);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Filesystem watcher callback error");
                }
            },
            notify::Config::default(),
        )?;

        // `watch_targets` dedups notify registrations; `watched_dirs` only
        // holds explicitly configured directories, the ones new files are
        // discovered in.
        let mut watch_targets: HashSet<PathBuf> = HashSet::new();
        let mut initial_files = Vec::new();
        for configured in &self.config.paths {
            let path = PathBuf::from(configured);
            if path.is_dir() {
                self.watched_dirs.insert(path.clone());
                for entry in WalkDir::new(&path)
                    .max_depth(1)
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    let child = entry.path().to_path_buf();
                    if child.extension().is_some_and(|ext| ext == "log") {
                        initial_files.push(child);
                    }
                }
                if watch_targets.insert(path.clone()) {
                    if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                        tracing::error!(path = %path.display(), error = %e, "Failed to watch directory");
                    }
                }
            } else {
                initial_files.push(path.clone());
                // Watch the parent so rename and recreate of the path itself
                // are observed even while the file is briefly absent.
                let watch_target = path.parent().map(Path::to_path_buf).unwrap_or(path);
                if watch_targets.insert(watch_target.clone()) {
                    if let Err(e) = watcher.watch(&watch_target, RecursiveMode::NonRecursive) {
                        tracing::error!(
                            path = %watch_target.display(),
                            error = %e,
                            "Failed to watch parent directory"
                        );
                    }
                }
            }
        }

        for path in initial_files {
            self.spawn_reader(path, self.config.read_from).await;
        }

        self.watcher = Some(watcher);
        self.watcher_join = Some(self.spawn_watcher_loop(watch_rx));

        let files = self.files.read().await;
        tracing::info!(files = files.len(), "File tailer started");
        Ok(())
    }

    async fn spawn_reader(&self, path: PathBuf, read_from: ReadFrom) {
        let Some(event_tx) = self.event_tx.clone() else {
            return;
        };
        {
            let files = self.files.read().await;
            if files.contains_key(&path) {
                return;
            }
        }
        let file = match TailedFile::open(path.clone(), &self.checkpoint, read_from).await {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to open file for tailing");
                return;
            }
        };

        let (control_tx, control_rx) = mpsc::channel(READER_CONTROL_CAPACITY);
        let cancel = self.cancel.child_token();
        let join = tokio::spawn(run_reader(
            file,
            Arc::clone(&self.checkpoint),
            event_tx,
            control_rx,
            cancel.clone(),
        ));

        tracing::debug!(path = %path.display(), "Reader spawned");
        self.files.write().await.insert(
            path,
            ReaderHandle {
                join,
                cancel,
                control_tx,
            },
        );
    }

    fn spawn_watcher_loop(&self, watch_rx: mpsc::Receiver<notify::Event>) -> JoinHandle<()> {
        let files = Arc::clone(&self.files);
        let watched_dirs = self.watched_dirs.clone();
        let checkpoint = Arc::clone(&self.checkpoint);
        let event_tx = self.event_tx.clone();
        let root_cancel = self.cancel.clone();
        let files_for_spawn = Arc::clone(&self.files);
        let Some(event_tx) = event_tx else {
            // Already stopped; nothing to watch for.
            return tokio::spawn(async {});
        };

        tokio::spawn(async move {
            let mut stream = tokio_stream::wrappers::ReceiverStream::new(watch_rx);
            loop {
                let event = tokio::select! {
                    _ = root_cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event.kind {
                    notify::EventKind::Remove(_) | notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                        for path in &event.paths {
                            let files = files.read().await;
                            if let Some(handle) = files.get(path) {
                                tracing::debug!(path = %path.display(), "Rotation signal (remove/rename)");
                                let _ = handle.control_tx.try_send(FileCommand::Rotate);
                            }
                        }
                    }
                    notify::EventKind::Create(_) => {
                        for path in &event.paths {
                            let tracked = files.read().await.contains_key(path);
                            if tracked {
                                // Late rotation completion: the replacement
                                // appeared under an already-tracked path.
                                let files = files.read().await;
                                if let Some(handle) = files.get(path) {
                                    tracing::debug!(path = %path.display(), "Rotation signal (create)");
                                    let _ = handle.control_tx.try_send(FileCommand::Rotate);
                                }
                            } else if path.extension().is_some_and(|ext| ext == "log")
                                && path
                                    .parent()
                                    .is_some_and(|parent| watched_dirs.contains(parent))
                            {
                                // Brand-new file in a watched directory:
                                // read it from the beginning.
                                spawn_discovered_reader(
                                    path.clone(),
                                    &files_for_spawn,
                                    &checkpoint,
                                    &event_tx,
                                    &root_cancel,
                                )
                                .await;
                            }
                        }
                    }
                    // Readers observe appended bytes through their EOF
                    // retry and detect truncation themselves.
                    notify::EventKind::Modify(_) | notify::EventKind::Access(_) => {}
                    other => {
                        tracing::trace!(kind = ?other, "Unhandled filesystem event");
                    }
                }
            }
            tracing::debug!("Watcher loop exited");
        })
    }

    /// Flush every file's offset, stop all readers and the watcher, and
    /// close the event stream.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher.take() {
            drop(watcher);
        }
        if let Some(join) = self.watcher_join.take() {
            let _ = join.await;
        }
        let mut files = self.files.write().await;
        for (path, handle) in files.drain() {
            handle.cancel.cancel();
            if handle.join.await.is_err() {
                tracing::error!(path = %path.display(), "Reader task aborted uncleanly");
            }
        }
        drop(files);
        // Last sender gone: the event stream ends once in-flight events are
        // consumed.
        self.event_tx.take();
        if let Err(e) = self.checkpoint.save().await {
            tracing::error!(error = %e, "Failed to persist positions on tailer stop");
        }
        tracing::info!("File tailer stopped");
    }
}

/// Discovery from the watcher loop, outside `FileTailer` so the loop task
/// does not borrow the supervisor.
async fn spawn_discovered_reader(
    path: PathBuf,
    files: &Arc<RwLock<HashMap<PathBuf, ReaderHandle>>>,
    checkpoint: &Arc<CheckpointStore>,
    event_tx: &mpsc::Sender<LogEvent>,
    root_cancel: &CancellationToken,
) {
    {
        let files = files.read().await;
        if files.contains_key(&path) {
            return;
        }
    }
    let file = match TailedFile::open(path.clone(), checkpoint, ReadFrom::Beginning).await {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to open discovered file");
            return;
        }
    };
    let (control_tx, control_rx) = mpsc::channel(READER_CONTROL_CAPACITY);
    let cancel = root_cancel.child_token();
    let join = tokio::spawn(run_reader(
        file,
        Arc::clone(checkpoint),
        event_tx.clone(),
        control_rx,
        cancel.clone(),
    ));
    tracing::info!(path = %path.display(), "Discovered new file, tailing from start");
    files.write().await.insert(
        path,
        ReaderHandle {
            join,
            cancel,
            control_tx,
        },
    );
}
