use relay_agent::checkpoint::store::CheckpointStore;
use relay_agent::model::event::LogEvent;
use relay_agent::tailer::manager::FileTailer;
use relay_agent::tailer::models::{ReadFrom, TailerConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Build a started tailer over `paths` with its checkpoint store rooted in
/// `state_dir`, returning the supervisor and its event stream.
pub async fn start_tailer(
    state_dir: &Path,
    paths: &[&Path],
) -> (FileTailer, mpsc::Receiver<LogEvent>, Arc<CheckpointStore>) {
    let checkpoint = Arc::new(CheckpointStore::new(state_dir, Duration::from_secs(60)));
    checkpoint.load().await.unwrap();

    let config = TailerConfig {
        paths: paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        checkpoint_dir: state_dir.to_string_lossy().into_owned(),
        checkpoint_interval_secs: 60,
        read_from: ReadFrom::Beginning,
    };
    let mut tailer = FileTailer::new(config, Arc::clone(&checkpoint), CancellationToken::new());
    tailer.start().await.unwrap();
    let events = tailer.events().unwrap();
    (tailer, events, checkpoint)
}

/// Wait for the next event or panic after the shared deadline.
pub async fn next_event(events: &mut mpsc::Receiver<LogEvent>) -> LogEvent {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .expect("timed out waiting for a tailed event")
        .expect("event stream closed early")
}

/// Assert that nothing further arrives within a short window.
pub async fn expect_silence(events: &mut mpsc::Receiver<LogEvent>) {
    let extra = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
    if let Ok(Some(event)) = extra {
        panic!("unexpected extra event: {:?}", event.message);
    }
}

pub fn append(path: &Path, contents: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
}
