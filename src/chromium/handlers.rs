// SPDX-License-Identifier: MIT
// Extension upload + orchestrated browser restart.
//
// The multipart body is consecutive (extensions.name, extensions.zip_file)
// pairs in either order; each pair must be complete before the next begins.
// After unpacking, the runtime flag overlay is rewritten to load the new
// extensions and the browser is restarted through the process supervisor,
// blocking until a fresh DevTools URL shows up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::chromium::{flags, install};
use crate::error::{ApiError, ApiResult};
use crate::AppContext;

static EXTENSION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,255}$").expect("valid regex"));

/// How long we give the supervisor's restart command itself.
const RESTART_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// How long we wait for the restarted browser to publish a DevTools URL.
const DEVTOOLS_READY_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn upload_extensions(
    State(ctx): State<Arc<AppContext>>,
    multipart: Multipart,
) -> ApiResult<StatusCode> {
    // The whole upload+restart runs under its own idle lease.
    if let Err(err) = ctx.idle.disable().await {
        warn!(err = %err, "failed to take idle lease for extension upload");
    }
    let result = upload_and_restart(&ctx, multipart).await;
    if let Err(err) = ctx.idle.enable().await {
        warn!(err = %err, "failed to release idle lease");
    }
    result
}

#[derive(Default)]
struct PendingItem {
    name: Option<String>,
    zip: Option<PathBuf>,
}

async fn upload_and_restart(
    ctx: &Arc<AppContext>,
    mut multipart: Multipart,
) -> ApiResult<StatusCode> {
    let started = std::time::Instant::now();
    info!("upload extensions: begin");

    // Uploaded zips land in a temp dir that disappears with this request.
    let scratch = tempfile::tempdir()
        .context("create upload scratch dir")
        .map_err(ApiError::Internal)?;

    let mut items: Vec<(String, PathBuf)> = Vec::new();
    let mut pending = PendingItem::default();
    let mut upload_index = 0usize;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("failed to read form part: {err}")))?
    {
        match field.name() {
            Some("extensions.name") => {
                if pending.name.is_some() {
                    return Err(ApiError::BadRequest(
                        "duplicate extensions.name before pair completed".to_string(),
                    ));
                }
                let name = field
                    .text()
                    .await
                    .map_err(|_| ApiError::BadRequest("failed to read name".to_string()))?
                    .trim()
                    .to_string();
                if !EXTENSION_NAME_RE.is_match(&name) {
                    return Err(ApiError::BadRequest(format!(
                        "invalid extension name '{name}'"
                    )));
                }
                pending.name = Some(name);
            }
            Some("extensions.zip_file") => {
                if pending.zip.is_some() {
                    return Err(ApiError::BadRequest(
                        "duplicate extensions.zip_file before pair completed".to_string(),
                    ));
                }
                let path = scratch.path().join(format!("ext-{upload_index}.zip"));
                upload_index += 1;
                let mut file = tokio::fs::File::create(&path)
                    .await
                    .context("create zip scratch file")
                    .map_err(ApiError::Internal)?;
                while let Some(chunk) = field.chunk().await.map_err(|_| {
                    ApiError::BadRequest("failed to read zip file".to_string())
                })? {
                    file.write_all(&chunk)
                        .await
                        .context("write zip scratch file")
                        .map_err(ApiError::Internal)?;
                }
                file.flush()
                    .await
                    .context("flush zip scratch file")
                    .map_err(ApiError::Internal)?;
                pending.zip = Some(path);
            }
            other => {
                return Err(ApiError::BadRequest(format!(
                    "invalid form field: {}",
                    other.unwrap_or("<unnamed>")
                )));
            }
        }

        if pending.name.is_some() && pending.zip.is_some() {
            items.push((pending.name.take().unwrap(), pending.zip.take().unwrap()));
        }
    }

    if pending.name.is_some() || pending.zip.is_some() {
        return Err(ApiError::BadRequest(
            "each extension must include both name and zip_file".to_string(),
        ));
    }
    if items.is_empty() {
        return Err(ApiError::BadRequest("no extensions provided".to_string()));
    }
    info!(items = items.len(), "parsed multipart fields");

    // Unpack each zip under the extensions root.
    let mut extension_paths: Vec<String> = Vec::new();
    for (name, zip_path) in &items {
        let dest = ctx.config.extensions_dir.join(name);
        info!(name, dest = %dest.display(), "processing extension");

        tokio::fs::create_dir_all(&dest)
            .await
            .context("create extension dir")
            .map_err(ApiError::Internal)?;

        let (zip_path, unzip_dest) = (zip_path.clone(), dest.clone());
        tokio::task::spawn_blocking(move || install::unzip(&zip_path, &unzip_dest))
            .await
            .context("join unzip task")
            .map_err(ApiError::Internal)?
            .map_err(|err| ApiError::BadZip(err.to_string()))?;

        if let Some(owner) = &ctx.config.extensions_owner {
            let status = Command::new("chown")
                .arg("-R")
                .arg(owner)
                .arg(&dest)
                .status()
                .await
                .context("run chown")
                .map_err(ApiError::Internal)?;
            if !status.success() {
                return Err(ApiError::Internal(anyhow!(
                    "failed to chown extension dir {}",
                    dest.display()
                )));
            }
        }

        info!(name, "installed extension");
        extension_paths.push(dest.to_string_lossy().into_owned());
    }

    // Fold the new extensions into the runtime flag overlay.
    let existing = flags::read_overlay(&ctx.config.flags_path).map_err(ApiError::Internal)?;
    let csv = extension_paths.join(",");
    let contributed = vec![
        format!("--disable-extensions-except={csv}"),
        format!("--load-extension={csv}"),
    ];
    let merged = flags::merge_flags(&existing, &contributed);
    flags::write_overlay(&ctx.config.flags_path, &merged).map_err(ApiError::Internal)?;
    info!(flags = %merged.join(" "), "wrote runtime flag overlay");

    // Subscribe to upstream updates BEFORE triggering the restart; the new
    // URL can arrive faster than we could subscribe afterwards.
    let mut updates = ctx.upstream.subscribe();

    info!("restarting chromium via process supervisor");
    let argv = ctx.config.restart_argv();
    let (restart_tx, mut restart_rx) = tokio::sync::oneshot::channel::<Result<()>>();
    tokio::spawn(async move {
        let _ = restart_tx.send(run_restart_command(argv).await);
    });

    let deadline = tokio::time::sleep(DEVTOOLS_READY_TIMEOUT);
    tokio::pin!(deadline);

    tokio::select! {
        _ = updates.updated() => {
            info!(elapsed = ?started.elapsed(), "devtools ready");
            Ok(StatusCode::CREATED)
        }
        restart = &mut restart_rx => {
            match restart {
                Ok(Err(err)) => Err(ApiError::Internal(err.context("supervisor restart failed"))),
                // Command finished cleanly (or the task vanished): the
                // browser is still coming up, keep waiting for its URL.
                Ok(Ok(())) | Err(_) => {
                    tokio::select! {
                        _ = updates.updated() => {
                            info!(elapsed = ?started.elapsed(), "devtools ready (after restart completed)");
                            Ok(StatusCode::CREATED)
                        }
                        _ = &mut deadline => {
                            Err(ApiError::Timeout("devtools not ready in time".to_string()))
                        }
                    }
                }
            }
        }
        _ = &mut deadline => {
            Err(ApiError::Timeout("devtools not ready in time".to_string()))
        }
    }
}

async fn run_restart_command(argv: Vec<String>) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .context("restart command is empty")?;
    let output = tokio::time::timeout(
        RESTART_COMMAND_TIMEOUT,
        Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| anyhow!("restart command timed out"))?
    .with_context(|| format!("run {program}"))?;

    if !output.status.success() {
        bail!(
            "restart command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
