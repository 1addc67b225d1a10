// Upstream manager: discovers and republishes the browser's DevTools
// WebSocket URL.
//
// Chromium prints `DevTools listening on ws://...` to the supervisor log on
// every (re)start. A background task tails that log, extracts the URL, and
// publishes it through a watch channel: `current()` is a cheap lock-free
// read on the hot handshake path, and subscribers get exactly one
// notification per change.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::devtools::tail::LogTailer;

static DEVTOOLS_LISTENING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"DevTools listening on (ws://\S+)").expect("valid regex"));

fn extract_devtools_url(line: &str) -> Option<&str> {
    DEVTOOLS_LISTENING_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

pub struct UpstreamManager {
    log_path: PathBuf,
    tailer: Arc<dyn LogTailer>,
    url_tx: watch::Sender<String>,
    url_rx: watch::Receiver<String>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    self_ref: Weak<UpstreamManager>,
}

/// A one-shot notification for the next upstream URL change after the
/// subscribe call. Dropping it cancels cleanly.
pub struct UpstreamSubscription {
    rx: watch::Receiver<String>,
}

impl UpstreamSubscription {
    /// Resolves with the first URL published after this subscription was
    /// created, or `None` if the manager went away.
    pub async fn updated(&mut self) -> Option<String> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

impl UpstreamManager {
    pub fn new(log_path: PathBuf, tailer: Arc<dyn LogTailer>) -> Arc<Self> {
        let (url_tx, url_rx) = watch::channel(String::new());
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            log_path,
            tailer,
            url_tx,
            url_rx,
            shutdown_tx,
            started: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Launch the background tailer. Subsequent calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        // &self can only exist through the owning Arc, so the upgrade holds.
        let manager = self.self_ref.upgrade().expect("manager is owned by an Arc");
        tokio::spawn(async move { manager.tail_loop().await });
    }

    /// Cancel the background tailer. Idempotent.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// The current upstream URL, empty until first discovery.
    pub fn current(&self) -> String {
        self.url_rx.borrow().clone()
    }

    /// Subscribe to the next URL change. Changes published before the call
    /// are not replayed; the subscribe-before-trigger discipline in the
    /// restart path depends on exactly this.
    pub fn subscribe(&self) -> UpstreamSubscription {
        UpstreamSubscription {
            rx: self.url_tx.subscribe(),
        }
    }

    /// Poll `current()` until non-empty or the deadline passes. Startup uses
    /// this to refuse to come up without a browser to front.
    pub async fn wait_for_initial(&self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let url = self.current();
            if !url.is_empty() {
                return Ok(url);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("devtools upstream not found within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn tail_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let matched = tokio::select! {
                matched = self.run_tail_once() => matched,
                _ = shutdown_rx.wait_for(|stop| *stop) => return,
            };
            if matched {
                backoff = INITIAL_BACKOFF;
            }

            // The tail ended (rotation, supervisor restart, missing file);
            // retry after a pause.
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown_rx.wait_for(|stop| *stop) => return,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// One tail session; returns whether any DevTools line was matched.
    async fn run_tail_once(&self) -> bool {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let tail = self.tailer.tail(&self.log_path, tx);
        tokio::pin!(tail);

        let mut tail_done = false;
        let mut matched = false;
        loop {
            tokio::select! {
                result = &mut tail, if !tail_done => {
                    tail_done = true;
                    if let Err(err) = result {
                        debug!(err = %err, "log tail ended; will retry");
                    }
                }
                line = rx.recv() => match line {
                    Some(line) => {
                        if let Some(url) = extract_devtools_url(&line) {
                            self.publish(url);
                            matched = true;
                        }
                    }
                    // Sender dropped: the session is over.
                    None => break,
                }
            }
        }
        matched
    }

    fn publish(&self, url: &str) {
        if url.is_empty() {
            return;
        }
        let updated = self.url_tx.send_if_modified(|current| {
            if current != url {
                *current = url.to_string();
                true
            } else {
                false
            }
        });
        if updated {
            info!(url, "devtools upstream updated");
        }
    }
}
