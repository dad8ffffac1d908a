mod common;

use common::{append, next_event, start_tailer};
use tempfile::TempDir;

#[tokio::test]
async fn lines_survive_rename_rotation() {
    let dir = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let log = dir.path().join("a.log");
    append(&log, "X\n");

    let (mut tailer, mut events, _checkpoint) = start_tailer(state.path(), &[&log]).await;
    assert_eq!(next_event(&mut events).await.message, "X\n");

    // logrotate-style: move the file aside, recreate under the same path.
    std::fs::rename(&log, dir.path().join("a.log.1")).unwrap();
    append(&log, "Y\n");

    let event = next_event(&mut events).await;
    assert_eq!(event.message, "Y\n");
    assert_eq!(event.source, log.display().to_string());
    tailer.stop().await;
}

#[tokio::test]
async fn rotation_resets_checkpoint_to_new_inode() {
    let dir = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let log = dir.path().join("a.log");
    append(&log, "before rotation\n");

    let (mut tailer, mut events, checkpoint) = start_tailer(state.path(), &[&log]).await;
    assert_eq!(next_event(&mut events).await.message, "before rotation\n");

    std::fs::rename(&log, dir.path().join("a.log.1")).unwrap();
    append(&log, "after\n");
    assert_eq!(next_event(&mut events).await.message, "after\n");
    tailer.stop().await;

    let entry = checkpoint.get(&log).await.unwrap();
    let meta = std::fs::metadata(&log).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        assert_eq!(entry.inode, meta.ino());
    }
    assert_eq!(entry.offset, "after\n".len() as u64);
}

#[tokio::test]
async fn truncation_in_place_restarts_from_zero() {
    let dir = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let log = dir.path().join("a.log");
    append(&log, "a fairly long first line\n");

    let (mut tailer, mut events, _checkpoint) = start_tailer(state.path(), &[&log]).await;
    assert_eq!(
        next_event(&mut events).await.message,
        "a fairly long first line\n"
    );

    // Truncate without replacing the inode, then write fresh content.
    std::fs::write(&log, "").unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    append(&log, "tiny\n");

    assert_eq!(next_event(&mut events).await.message, "tiny\n");
    tailer.stop().await;
}
