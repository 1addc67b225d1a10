// SPDX-License-Identifier: MIT
// Follow-mode log tailing as a swappable dependency.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// One tail session: stream lines from `path` (from the start of the file,
/// following growth) into `tx` until the tail ends, fails, or the receiver
/// is dropped. The upstream manager re-runs sessions with backoff, so a
/// tailer only has to cover a single pass.
#[async_trait]
pub trait LogTailer: Send + Sync {
    async fn tail(&self, path: &Path, tx: mpsc::Sender<String>) -> Result<()>;
}

/// Tails with a `tail -f -n +1` subprocess, same as the supervisor images
/// do. The child is killed when the session future is dropped.
pub struct CommandTailer;

#[async_trait]
impl LogTailer for CommandTailer {
    async fn tail(&self, path: &Path, tx: mpsc::Sender<String>) -> Result<()> {
        // `tail -f` on a missing file exits immediately anyway; checking
        // first gives the manager a quieter retry message.
        if !path.exists() {
            bail!("log file {} not found yet", path.display());
        }

        let mut child = Command::new("tail")
            .args(["-f", "-n", "+1"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("spawn tail")?;

        let stdout = child.stdout.take().context("tail stdout unavailable")?;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if tx.send(line).await.is_err() {
                break;
            }
        }

        // Reap the child; it only exits on its own if the file was rotated
        // away or truncated out from under it.
        let _ = child.kill().await;
        let _ = child.wait().await;
        Ok(())
    }
}
