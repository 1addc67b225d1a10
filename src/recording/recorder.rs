// SPDX-License-Identifier: MIT
// Screen-recording lifecycle around one encoder subprocess.
//
// The encoder runs in its own process group so a signal to -pgid reaches any
// helper children it spawns. Graceful stop escalates CONT+INT → TERM → KILL
// with per-phase waits; the fragmented-MP4 output stays playable even when
// the process dies mid-file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::idle::IdleController;

/// Recording parameters. Unset fields inherit the server defaults at merge
/// time; after the merge everything but the duration cap is required.
#[derive(Debug, Clone, Default)]
pub struct RecordingParams {
    pub output_dir: Option<PathBuf>,
    pub frame_rate: Option<u32>,
    pub display_num: Option<u32>,
    pub max_size_mb: Option<u32>,
    pub max_duration_secs: Option<u32>,
}

impl RecordingParams {
    /// Field-by-field overlay of `self` over `defaults`.
    pub fn merge_over(&self, defaults: &RecordingParams) -> RecordingParams {
        RecordingParams {
            output_dir: self.output_dir.clone().or_else(|| defaults.output_dir.clone()),
            frame_rate: self.frame_rate.or(defaults.frame_rate),
            display_num: self.display_num.or(defaults.display_num),
            max_size_mb: self.max_size_mb.or(defaults.max_size_mb),
            max_duration_secs: self.max_duration_secs.or(defaults.max_duration_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.output_dir.as_deref() {
            None => bail!("output directory is required"),
            Some(dir) if dir.as_os_str().is_empty() => bail!("output directory is required"),
            Some(_) => {}
        }
        match self.frame_rate {
            None => bail!("frame rate is required"),
            Some(0) => bail!("frame rate must be positive"),
            Some(_) => {}
        }
        if self.display_num.is_none() {
            bail!("display number is required");
        }
        match self.max_size_mb {
            None => bail!("max size in MB is required"),
            Some(0) => bail!("max size must be positive"),
            Some(_) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Running,
    Exited,
}

/// Metadata returned alongside the artifact handle.
#[derive(Debug, Clone)]
pub struct RecordingMeta {
    pub size: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time view used by the list endpoint.
#[derive(Debug, Clone)]
pub struct RecorderSnapshot {
    pub id: String,
    pub is_recording: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: RecorderState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    failure: Option<String>,
    /// Process-group id of the spawned encoder (== its pid).
    pgid: Option<i32>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder").field("id", &self.id).finish()
    }
}

pub struct Recorder {
    id: String,
    encoder_path: PathBuf,
    output_path: PathBuf,
    params: RecordingParams,
    idle: Arc<IdleController>,
    inner: Mutex<Inner>,
    /// Flips to true exactly once, when the exit waiter has published the
    /// final state. Everything that needs to know the subprocess is gone
    /// waits on this; nothing polls.
    exited_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
    /// Handle to ourselves so `start` can hand the exit waiter an owned
    /// reference. Weak, so dropping the registry entry still frees us.
    self_ref: Weak<Recorder>,
}

impl Recorder {
    fn new(
        id: String,
        encoder_path: PathBuf,
        output_path: PathBuf,
        params: RecordingParams,
        idle: Arc<IdleController>,
    ) -> Arc<Self> {
        let (exited_tx, exited_rx) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            id,
            encoder_path,
            output_path,
            params,
            idle,
            inner: Mutex::new(Inner {
                state: RecorderState::Idle,
                started_at: None,
                finished_at: None,
                exit_code: None,
                failure: None,
                pgid: None,
            }),
            exited_tx,
            exited_rx,
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub async fn is_recording(&self) -> bool {
        self.inner.lock().await.state == RecorderState::Running
    }

    pub async fn snapshot(&self) -> RecorderSnapshot {
        let inner = self.inner.lock().await;
        RecorderSnapshot {
            id: self.id.clone(),
            is_recording: inner.state == RecorderState::Running,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
        }
    }

    /// Spawn the encoder and transition Idle → Running.
    ///
    /// Holds the idle lease for the whole recording; the exit waiter releases
    /// it. Encoders that die within 500 ms are treated as startup failures
    /// and reported with their exit code.
    pub async fn start(&self) -> Result<(), ApiError> {
        let args = encoder_args(&self.params, &self.output_path).map_err(ApiError::Internal)?;

        let mut inner = self.inner.lock().await;
        if inner.state != RecorderState::Idle {
            return Err(ApiError::AlreadyRunning);
        }

        info!(
            id = %self.id,
            "starting encoder: {} {}",
            self.encoder_path.display(),
            args.join(" ")
        );

        if let Err(err) = self.idle.disable().await {
            warn!(id = %self.id, err = %err, "failed to take idle lease for recording");
        }

        let mut cmd = Command::new(&self.encoder_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                if let Err(err) = self.idle.enable().await {
                    warn!(id = %self.id, err = %err, "failed to release idle lease");
                }
                return Err(ApiError::StartupFailed {
                    detail: err.to_string(),
                    exit_code: None,
                });
            }
        };

        inner.pgid = child.id().map(|pid| pid as i32);
        inner.state = RecorderState::Running;
        inner.started_at = Some(Utc::now());
        drop(inner);

        // &self can only exist through the owning Arc, so the upgrade holds.
        let recorder = self.self_ref.upgrade().expect("recorder is owned by an Arc");
        tokio::spawn(async move { recorder.wait_for_exit(child).await });

        // Encoders with a bad display or bad arguments die almost instantly;
        // surface that as a startup failure instead of a silent dead recording.
        if self.wait_exited(Duration::from_millis(500)).await {
            let inner = self.inner.lock().await;
            return Err(ApiError::StartupFailed {
                detail: inner
                    .failure
                    .clone()
                    .unwrap_or_else(|| "encoder exited during startup".to_string()),
                exit_code: inner.exit_code,
            });
        }

        Ok(())
    }

    /// Exit waiter: the only place that observes subprocess termination and
    /// the only writer of the final state.
    async fn wait_for_exit(self: Arc<Self>, mut child: Child) {
        let status = child.wait().await;

        let mut inner = self.inner.lock().await;
        inner.finished_at = Some(Utc::now());
        match &status {
            Ok(st) => {
                inner.exit_code = st.code();
                if !st.success() {
                    inner.failure = Some(format!("encoder exited with {st}"));
                }
            }
            Err(err) => {
                inner.failure = Some(format!("wait for encoder: {err}"));
            }
        }
        inner.state = RecorderState::Exited;
        let exit_code = inner.exit_code;
        drop(inner);

        let _ = self.exited_tx.send(true);

        if let Err(err) = self.idle.enable().await {
            warn!(id = %self.id, err = %err, "failed to release idle lease");
        }

        match status {
            Ok(st) if st.success() => {
                info!(id = %self.id, "encoder completed successfully")
            }
            _ => info!(id = %self.id, exit_code = ?exit_code, "encoder completed with error"),
        }
    }

    /// Graceful stop: escalate signals against the process group, moving to
    /// the next phase only if the exit signal has not fired in time. After
    /// the kill phase the process is gone either way.
    pub async fn stop(&self) -> Result<(), ApiError> {
        let pgid = {
            let inner = self.inner.lock().await;
            match inner.state {
                RecorderState::Exited => {
                    debug!(id = %self.id, "encoder already exited");
                    return Ok(());
                }
                RecorderState::Idle => return Err(ApiError::NotRunning),
                RecorderState::Running => inner.pgid,
            }
        };
        let Some(pgid) = pgid else {
            return Err(anyhow::anyhow!("running encoder has no pid").into());
        };

        let phases: [(&[Sig], Duration, &str); 3] = [
            (
                &[Sig::Cont, Sig::Int],
                Duration::from_secs(5),
                "graceful stop",
            ),
            (&[Sig::Term], Duration::from_secs(2), "forceful termination"),
            (&[Sig::Kill], Duration::from_secs(1), "immediate kill"),
        ];

        for (signals, timeout, desc) in phases {
            // The process may have exited before this phase started.
            if *self.exited_rx.borrow() {
                return Ok(());
            }
            info!(id = %self.id, phase = desc, "encoder shutdown phase");
            for sig in signals {
                // Errors ignored: the group may already be gone.
                signal_group(pgid, *sig);
            }
            if self.wait_exited(timeout).await {
                info!(id = %self.id, phase = desc, "encoder shutdown complete");
                return Ok(());
            }
        }

        // Nothing survives SIGKILL; report success.
        Ok(())
    }

    /// Immediate kill, bypassing the graceful phases.
    pub async fn force_stop(&self) -> Result<(), ApiError> {
        let pgid = {
            let inner = self.inner.lock().await;
            match inner.state {
                RecorderState::Idle => return Err(ApiError::NotRunning),
                RecorderState::Exited => {
                    debug!(id = %self.id, "encoder already exited, no force stop needed");
                    return Ok(());
                }
                RecorderState::Running => inner.pgid,
            }
        };
        let Some(pgid) = pgid else {
            return Err(anyhow::anyhow!("running encoder has no pid").into());
        };

        warn!(id = %self.id, "force killing encoder");
        signal_group(pgid, Sig::Kill);
        self.wait_exited(Duration::from_secs(1)).await;
        Ok(())
    }

    /// Open the finished artifact for streaming.
    pub async fn artifact(&self) -> Result<(tokio::fs::File, RecordingMeta), ApiError> {
        let (state, started_at, finished_at) = {
            let inner = self.inner.lock().await;
            (inner.state, inner.started_at, inner.finished_at)
        };
        if state == RecorderState::Running {
            return Err(ApiError::InProgress);
        }

        let file = match tokio::fs::File::open(&self.output_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ApiError::NotFound("recording file not found".to_string()));
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context("open recording file")
                    .into());
            }
        };
        let meta = file
            .metadata()
            .await
            .context("stat recording file")
            .map_err(ApiError::Internal)?;

        Ok((
            file,
            RecordingMeta {
                size: meta.len(),
                started_at,
                finished_at,
            },
        ))
    }

    async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut rx = self.exited_rx.clone();
        let result = tokio::time::timeout(timeout, rx.wait_for(|exited| *exited)).await;
        matches!(result, Ok(Ok(_)))
    }
}

/// Creates recorders with the server defaults merged under caller overrides.
pub struct RecorderFactory {
    encoder_path: PathBuf,
    defaults: RecordingParams,
    idle: Arc<IdleController>,
}

impl RecorderFactory {
    pub fn new(
        encoder_path: PathBuf,
        defaults: RecordingParams,
        idle: Arc<IdleController>,
    ) -> Result<Self> {
        defaults
            .validate()
            .context("invalid default recording parameters")?;
        Ok(Self {
            encoder_path,
            defaults,
            idle,
        })
    }

    pub fn create(&self, id: &str, overrides: RecordingParams) -> Result<Arc<Recorder>, ApiError> {
        let params = overrides.merge_over(&self.defaults);
        params
            .validate()
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;
        let output_dir = params
            .output_dir
            .clone()
            .expect("validated params have an output dir");
        let output_path = output_dir.join(format!("{id}.mp4"));
        Ok(Recorder::new(
            id.to_string(),
            self.encoder_path.clone(),
            output_path,
            params,
            self.idle.clone(),
        ))
    }
}

#[derive(Debug, Clone, Copy)]
enum Sig {
    Cont,
    Int,
    Term,
    Kill,
}

/// Signal the whole process group behind `pgid`.
#[cfg(unix)]
fn signal_group(pgid: i32, sig: Sig) {
    let signo = match sig {
        Sig::Cont => libc::SIGCONT,
        Sig::Int => libc::SIGINT,
        Sig::Term => libc::SIGTERM,
        Sig::Kill => libc::SIGKILL,
    };
    // SAFETY: pgid is the pid of a child we spawned with process_group(0);
    // negating it targets that group. The group may have exited already, in
    // which case kill(2) fails with ESRCH and we don't care.
    unsafe {
        libc::kill(-pgid, signo);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _sig: Sig) {
    tracing::warn!("process-group signalling is not supported on this platform");
}

/// Build the encoder argv for the merged parameters.
///
/// Both capture backends share the same output discipline: wall-clock
/// timestamps reset to zero, negative timestamps clamped, exit on any error,
/// fragmented MP4 with 2 s fragments (keeps interrupted files playable), a
/// hard size cap, and overwrite of the target path.
fn encoder_args(params: &RecordingParams, output_path: &Path) -> Result<Vec<String>> {
    let frame_rate = params.frame_rate.context("frame rate is required")?;
    let display_num = params.display_num.context("display number is required")?;
    let max_size_mb = params.max_size_mb.context("max size in MB is required")?;

    let mut args: Vec<String> = if cfg!(target_os = "macos") {
        // AVFoundation capture for local development; no audio.
        vec![
            "-f".into(),
            "avfoundation".into(),
            "-framerate".into(),
            frame_rate.to_string(),
            "-pixel_format".into(),
            "nv12".into(),
            "-i".into(),
            format!("{display_num}:none"),
        ]
    } else if cfg!(unix) {
        // X11 screen grab.
        vec![
            "-f".into(),
            "x11grab".into(),
            "-framerate".into(),
            frame_rate.to_string(),
            "-i".into(),
            format!(":{display_num}"),
        ]
    } else {
        bail!("unsupported platform for screen capture");
    };

    args.extend(
        [
            "-c:v",
            "libx264",
            "-use_wallclock_as_timestamps",
            "1",
            "-reset_timestamps",
            "1",
            "-avoid_negative_ts",
            "make_zero",
            "-xerror",
            "-movflags",
            "+frag_keyframe+empty_moov",
            "-frag_duration",
            "2000000",
        ]
        .map(String::from),
    );
    args.push("-fs".into());
    args.push(format!("{max_size_mb}M"));
    if let Some(secs) = params.max_duration_secs {
        args.push("-t".into());
        args.push(secs.to_string());
    }
    args.push("-y".into());
    args.push(output_path.to_string_lossy().into_owned());

    Ok(args)
}
