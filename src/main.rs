use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use sandboxd::config::ServerConfig;
use sandboxd::devtools::{proxy, CommandTailer, UpstreamManager};
use sandboxd::idle::{FilePlatform, IdleController, NoopPlatform, Platform};
use sandboxd::recording::{RecorderFactory, RecordingParams, Registry};
use sandboxd::{api, AppContext};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    config.validate().context("invalid configuration")?;
    info!(
        port = config.port,
        proxy_port = config.devtools_proxy_port,
        output_dir = %config.output_dir.display(),
        "server configuration"
    );

    ensure_encoder(&config).await?;

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("create output dir {}", config.output_dir.display()))?;

    let platform: Arc<dyn Platform> = match &config.idle_control_file {
        Some(path) => Arc::new(FilePlatform::new(path.clone())),
        None => Arc::new(NoopPlatform),
    };
    let idle = IdleController::new(platform);

    let defaults = RecordingParams {
        output_dir: Some(config.output_dir.clone()),
        frame_rate: Some(config.frame_rate),
        display_num: Some(config.display_num),
        max_size_mb: Some(config.max_size_mb),
        max_duration_secs: None,
    };
    let factory = RecorderFactory::new(config.encoder_path.clone(), defaults, idle.clone())?;
    let registry = Registry::new();

    let upstream = UpstreamManager::new(config.chromium_log_path.clone(), Arc::new(CommandTailer));
    upstream.start();

    // Refuse to come up without a browser to front.
    upstream
        .wait_for_initial(Duration::from_secs(10))
        .await
        .context("devtools upstream not available")?;

    let ctx = Arc::new(AppContext {
        registry: registry.clone(),
        factory,
        upstream: upstream.clone(),
        idle: idle.clone(),
        started_at: std::time::Instant::now(),
        config: config.clone(),
    });

    let api_listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("bind API port {}", config.port))?;
    let proxy_listener = TcpListener::bind(("0.0.0.0", config.devtools_proxy_port))
        .await
        .with_context(|| format!("bind proxy port {}", config.devtools_proxy_port))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!(port = config.port, "http api starting");
    let api_task = tokio::spawn({
        let router = api::build_router(ctx.clone());
        let mut shutdown = shutdown_rx.clone();
        async move {
            axum::serve(api_listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await
        }
    });

    info!(port = config.devtools_proxy_port, "devtools proxy starting");
    let proxy_task = tokio::spawn(proxy::serve(
        proxy_listener,
        upstream.clone(),
        idle.clone(),
        config.log_cdp_messages,
        shutdown_rx.clone(),
    ));

    shutdown_signal().await;
    info!("shutdown signal received");

    shutdown_tx.send_replace(true);
    upstream.stop();
    if let Err(err) = registry.stop_all().await {
        error!(err = %err, "failed to stop all recorders during shutdown");
    }

    let drain = Duration::from_secs(10);
    let _ = tokio::time::timeout(drain, api_task).await;
    let _ = tokio::time::timeout(drain, proxy_task).await;

    info!("server shut down");
    Ok(())
}

/// Probe the encoder binary so a missing ffmpeg fails the boot, not the
/// first recording.
async fn ensure_encoder(config: &ServerConfig) -> Result<()> {
    let status = Command::new(&config.encoder_path)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => bail!(
            "encoder {} exited with {status}",
            config.encoder_path.display()
        ),
        Err(err) => bail!(
            "encoder {} not found or not executable: {err}",
            config.encoder_path.display()
        ),
    }
}

/// Resolves on SIGTERM (Unix) or Ctrl-C.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
