use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

/// Runtime configuration for the control plane.
///
/// Every knob can be set either as a CLI flag or through the environment
/// variable named in its `env` attribute; the container image sets the env
/// vars, the flags exist for local development.
#[derive(Debug, Clone, Parser)]
#[command(name = "sandboxd", about = "Browser sandbox control plane", version)]
pub struct ServerConfig {
    /// HTTP API port.
    #[arg(long, default_value_t = 10001, env = "PORT")]
    pub port: u16,

    /// DevTools WebSocket proxy port.
    #[arg(long, default_value_t = 9222, env = "DEVTOOLS_PROXY_PORT")]
    pub devtools_proxy_port: u16,

    /// Directory screen recordings are written to.
    #[arg(long, default_value = "/recordings", env = "OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Default recording frame rate.
    #[arg(long, default_value_t = 10, env = "FRAME_RATE")]
    pub frame_rate: u32,

    /// Default display (X11 display number / capture index).
    #[arg(long, default_value_t = 1, env = "DISPLAY_NUM")]
    pub display_num: u32,

    /// Default recording size cap in megabytes.
    #[arg(long, default_value_t = 500, env = "MAX_SIZE_MB")]
    pub max_size_mb: u32,

    /// Screen-capture encoder binary.
    #[arg(long, default_value = "ffmpeg", env = "ENCODER_PATH")]
    pub encoder_path: PathBuf,

    /// Log every proxied CDP message with extracted fields.
    #[arg(long, default_value_t = false, env = "LOG_CDP_MESSAGES")]
    pub log_cdp_messages: bool,

    /// Directory uploaded extensions are unpacked into.
    #[arg(long, default_value = "/home/sandbox/extensions", env = "EXTENSIONS_DIR")]
    pub extensions_dir: PathBuf,

    /// `user:group` handed to `chown -R` after unpacking an extension.
    /// Unset skips the chown (local development, tests).
    #[arg(long, env = "EXTENSIONS_OWNER")]
    pub extensions_owner: Option<String>,

    /// Runtime Chromium flag overlay file (JSON `{"flags":[...]}`).
    #[arg(long, default_value = "/chromium/flags", env = "FLAGS_PATH")]
    pub flags_path: PathBuf,

    /// Platform scale-to-zero control file. Unset means the platform has no
    /// such file and idle control is a no-op.
    #[arg(long, env = "IDLE_CONTROL_FILE")]
    pub idle_control_file: Option<PathBuf>,

    /// Supervisor log file tailed for the DevTools listening line.
    #[arg(long, default_value = "/var/log/supervisord/chromium", env = "CHROMIUM_LOG_PATH")]
    pub chromium_log_path: PathBuf,

    /// Command that restarts the browser via the process supervisor.
    #[arg(
        long,
        default_value = "supervisorctl -c /etc/supervisor/supervisord.conf restart chromium",
        env = "CHROMIUM_RESTART_CMD"
    )]
    pub chromium_restart_cmd: String,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, default_value = "info", env = "SANDBOXD_LOG")]
    pub log: String,
}

impl ServerConfig {
    /// Check the server defaults before anything is spawned. Called once at
    /// startup; a failure here is a non-zero exit.
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            bail!("OUTPUT_DIR is required");
        }
        if self.encoder_path.as_os_str().is_empty() {
            bail!("ENCODER_PATH is required");
        }
        if !(1..=120).contains(&self.frame_rate) {
            bail!("FRAME_RATE must be between 1 and 120");
        }
        if self.display_num > 99 {
            bail!("DISPLAY_NUM must be between 0 and 99");
        }
        if !(1..=10_000).contains(&self.max_size_mb) {
            bail!("MAX_SIZE_MB must be between 1 and 10000");
        }
        if self.chromium_restart_cmd.split_whitespace().next().is_none() {
            bail!("CHROMIUM_RESTART_CMD must not be empty");
        }
        Ok(())
    }

    /// The restart command as an argv vector.
    pub fn restart_argv(&self) -> Vec<String> {
        self.chromium_restart_cmd
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}
