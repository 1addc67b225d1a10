//! Upstream manager tests against a real log file on disk, tailed the same
//! way production does.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sandboxd::devtools::{CommandTailer, UpstreamManager};
use tempfile::TempDir;

fn manager(log_path: &Path) -> Arc<UpstreamManager> {
    UpstreamManager::new(log_path.to_path_buf(), Arc::new(CommandTailer))
}

fn append_line(path: &Path, line: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(file, "{line}").unwrap();
}

/// Poll until `current()` equals `want` or the timeout passes.
async fn wait_for_url(mgr: &UpstreamManager, want: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if mgr.current() == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn discovers_url_already_in_the_log() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("chromium.log");
    append_line(&log, "some unrelated startup noise");
    append_line(&log, "DevTools listening on ws://127.0.0.1:9223/devtools/browser/abc");

    let mgr = manager(&log);
    mgr.start();

    let url = mgr.wait_for_initial(Duration::from_secs(3)).await.unwrap();
    assert_eq!(url, "ws://127.0.0.1:9223/devtools/browser/abc");
    mgr.stop();
}

#[tokio::test]
async fn observes_url_appended_after_start() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("chromium.log");
    std::fs::write(&log, "").unwrap();

    let mgr = manager(&log);
    mgr.start();
    assert_eq!(mgr.current(), "");

    append_line(&log, "DevTools listening on ws://127.0.0.1:9223/devtools/browser/abc");
    assert!(
        wait_for_url(
            &mgr,
            "ws://127.0.0.1:9223/devtools/browser/abc",
            Duration::from_secs(2)
        )
        .await
    );
    mgr.stop();
}

#[tokio::test]
async fn survives_a_missing_log_file_at_startup() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("not-yet.log");

    let mgr = manager(&log);
    mgr.start();

    // Nothing there yet.
    assert!(mgr.wait_for_initial(Duration::from_millis(300)).await.is_err());

    // The supervisor shows up later; the backoff loop picks the file up.
    append_line(&log, "DevTools listening on ws://127.0.0.1:9223/devtools/browser/late");
    let url = mgr.wait_for_initial(Duration::from_secs(5)).await.unwrap();
    assert_eq!(url, "ws://127.0.0.1:9223/devtools/browser/late");
    mgr.stop();
}

#[tokio::test]
async fn subscriber_between_updates_sees_exactly_the_second() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("chromium.log");
    append_line(&log, "DevTools listening on ws://127.0.0.1:9223/devtools/browser/first");

    let mgr = manager(&log);
    mgr.start();
    mgr.wait_for_initial(Duration::from_secs(3)).await.unwrap();

    let mut sub = mgr.subscribe();
    append_line(&log, "DevTools listening on ws://127.0.0.1:9223/devtools/browser/second");

    let url = tokio::time::timeout(Duration::from_secs(2), sub.updated())
        .await
        .expect("subscriber should be notified")
        .unwrap();
    assert_eq!(url, "ws://127.0.0.1:9223/devtools/browser/second");

    // Exactly once: no second notification is pending.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), sub.updated())
            .await
            .is_err()
    );
    mgr.stop();
}

#[tokio::test]
async fn repeated_lines_do_not_renotify() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("chromium.log");
    append_line(&log, "DevTools listening on ws://127.0.0.1:9223/devtools/browser/same");

    let mgr = manager(&log);
    mgr.start();
    mgr.wait_for_initial(Duration::from_secs(3)).await.unwrap();

    let mut sub = mgr.subscribe();
    append_line(&log, "DevTools listening on ws://127.0.0.1:9223/devtools/browser/same");

    assert!(
        tokio::time::timeout(Duration::from_millis(500), sub.updated())
            .await
            .is_err(),
        "identical URL must not notify subscribers"
    );
    mgr.stop();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("chromium.log");
    std::fs::write(&log, "").unwrap();

    let mgr = manager(&log);
    mgr.start();
    mgr.stop();
    mgr.stop();
}
