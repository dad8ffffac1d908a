mod common;

use common::{append, expect_silence, next_event, start_tailer};
use tempfile::TempDir;

#[tokio::test]
async fn restart_resumes_exactly_after_consumed_lines() {
    let dir = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let log = dir.path().join("a.log");
    append(&log, "A\nB\nC\n");

    // First session: consume everything, then stop (which persists the
    // final offsets).
    let (mut tailer, mut events, _checkpoint) = start_tailer(state.path(), &[&log]).await;
    for expected in ["A\n", "B\n", "C\n"] {
        assert_eq!(next_event(&mut events).await.message, expected);
    }
    tailer.stop().await;
    drop(events);

    append(&log, "D\n");

    // Second session: only the line written while down.
    let (mut tailer, mut events, _checkpoint) = start_tailer(state.path(), &[&log]).await;
    assert_eq!(next_event(&mut events).await.message, "D\n");
    expect_silence(&mut events).await;
    tailer.stop().await;
}

#[tokio::test]
async fn no_duplicates_across_sessions() {
    let dir = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let log = dir.path().join("a.log");

    let mut written = Vec::new();
    for n in 0..20 {
        written.push(format!("line-{n}\n"));
    }
    append(&log, &written[..10].concat());

    let (mut tailer, mut events, _checkpoint) = start_tailer(state.path(), &[&log]).await;
    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.push(next_event(&mut events).await.message);
    }
    tailer.stop().await;
    drop(events);

    append(&log, &written[10..].concat());

    let (mut tailer, mut events, _checkpoint) = start_tailer(state.path(), &[&log]).await;
    for _ in 0..10 {
        seen.push(next_event(&mut events).await.message);
    }
    expect_silence(&mut events).await;
    tailer.stop().await;

    assert_eq!(seen, written);
}
