// idle — scale-to-zero lease control.
//
// The platform suspends an idle instance by watching a control file: `"+"`
// disables idle shutdown, `"-"` re-enables it. Long operations (an active
// recording, a browser restart, a live DevTools session) must hold the
// lease so the instance is not reclaimed under them, and every inbound
// request briefly holds it too.
//
// The controller is reference counted and debounced: only the 0→1 and 1→0
// transitions reach the platform file, so N concurrent requests produce two
// writes, not 2N.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::middleware::Next;
use axum::response::Response;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The platform capability the controller drives. Variants exist so tests
/// and file-less environments can substitute an in-memory writer.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn disable(&self) -> Result<()>;
    async fn enable(&self) -> Result<()>;
}

/// Writes the platform control file.
pub struct FilePlatform {
    control_file: PathBuf,
}

impl FilePlatform {
    pub fn new(control_file: PathBuf) -> Self {
        Self { control_file }
    }
}

#[async_trait]
impl Platform for FilePlatform {
    async fn disable(&self) -> Result<()> {
        tokio::fs::write(&self.control_file, "+")
            .await
            .with_context(|| format!("write {}", self.control_file.display()))
    }

    async fn enable(&self) -> Result<()> {
        tokio::fs::write(&self.control_file, "-")
            .await
            .with_context(|| format!("write {}", self.control_file.display()))
    }
}

/// For environments without a control file.
pub struct NoopPlatform;

#[async_trait]
impl Platform for NoopPlatform {
    async fn disable(&self) -> Result<()> {
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        Ok(())
    }
}

/// What the last successful platform write said.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Written {
    Disabled,
    Enabled,
}

#[derive(Default)]
struct LeaseState {
    holders: u64,
    last: Option<Written>,
}

/// Reference-counted, debounced wrapper around a [`Platform`].
pub struct IdleController {
    platform: Arc<dyn Platform>,
    state: Mutex<LeaseState>,
}

impl IdleController {
    pub fn new(platform: Arc<dyn Platform>) -> Arc<Self> {
        Arc::new(Self {
            platform,
            state: Mutex::new(LeaseState::default()),
        })
    }

    /// Take the lease. Writes `"+"` only when this is the first holder and
    /// the file does not already say so; a write failure leaves the counter
    /// untouched so the next call retries.
    pub async fn disable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.holders == 0 && state.last != Some(Written::Disabled) {
            self.platform.disable().await?;
            state.last = Some(Written::Disabled);
            debug!("idle shutdown disabled");
        }
        state.holders += 1;
        Ok(())
    }

    /// Release the lease. Writes `"-"` once the last holder is gone. A
    /// failed write keeps `last` pointing at the disabled state, so a later
    /// call at zero holders retries the write instead of losing it.
    pub async fn enable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.holders > 0 {
            state.holders -= 1;
        }
        if state.holders == 0 && state.last == Some(Written::Disabled) {
            self.platform.enable().await?;
            state.last = Some(Written::Enabled);
            debug!("idle shutdown enabled");
        }
        Ok(())
    }
}

/// Wraps every inbound request in a disable/enable pair so the platform
/// never reclaims the instance mid-request. Write errors are logged, not
/// surfaced; the request itself must still run.
pub async fn middleware(
    State(idle): State<Arc<IdleController>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if let Err(err) = idle.disable().await {
        warn!(err = %err, "failed to take idle lease");
    }
    let response = next.run(request).await;
    if let Err(err) = idle.enable().await {
        warn!(err = %err, "failed to release idle lease");
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockPlatform {
        disable_calls: AtomicUsize,
        enable_calls: AtomicUsize,
        disable_fails: AtomicBool,
        enable_fails: AtomicBool,
    }

    #[async_trait]
    impl Platform for MockPlatform {
        async fn disable(&self) -> Result<()> {
            self.disable_calls.fetch_add(1, Ordering::SeqCst);
            if self.disable_fails.load(Ordering::SeqCst) {
                anyhow::bail!("disable write failed");
            }
            Ok(())
        }

        async fn enable(&self) -> Result<()> {
            self.enable_calls.fetch_add(1, Ordering::SeqCst);
            if self.enable_fails.load(Ordering::SeqCst) {
                anyhow::bail!("enable write failed");
            }
            Ok(())
        }
    }

    fn setup() -> (Arc<MockPlatform>, Arc<IdleController>) {
        let mock = Arc::new(MockPlatform::default());
        let ctrl = IdleController::new(mock.clone());
        (mock, ctrl)
    }

    #[tokio::test]
    async fn single_disable_enable() {
        let (mock, ctrl) = setup();
        ctrl.disable().await.unwrap();
        ctrl.enable().await.unwrap();
        assert_eq!(mock.disable_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.enable_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multiple_disables_debounced() {
        let (mock, ctrl) = setup();
        ctrl.disable().await.unwrap();
        ctrl.disable().await.unwrap();
        ctrl.disable().await.unwrap();
        assert_eq!(mock.disable_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enable_only_on_last_holder() {
        let (mock, ctrl) = setup();
        ctrl.disable().await.unwrap();
        ctrl.disable().await.unwrap();
        ctrl.enable().await.unwrap();
        assert_eq!(mock.enable_calls.load(Ordering::SeqCst), 0);
        ctrl.enable().await.unwrap();
        assert_eq!(mock.enable_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disable_failure_rolls_back() {
        let (mock, ctrl) = setup();
        mock.disable_fails.store(true, Ordering::SeqCst);
        assert!(ctrl.disable().await.is_err());
        assert_eq!(mock.disable_calls.load(Ordering::SeqCst), 1);

        // Clear the fault; the next disable must write again.
        mock.disable_fails.store(false, Ordering::SeqCst);
        ctrl.disable().await.unwrap();
        assert_eq!(mock.disable_calls.load(Ordering::SeqCst), 2);

        ctrl.enable().await.unwrap();
        assert_eq!(mock.enable_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enable_failure_is_retried() {
        let (mock, ctrl) = setup();
        ctrl.disable().await.unwrap();

        mock.enable_fails.store(true, Ordering::SeqCst);
        assert!(ctrl.enable().await.is_err());
        assert_eq!(mock.enable_calls.load(Ordering::SeqCst), 1);

        mock.enable_fails.store(false, Ordering::SeqCst);
        ctrl.enable().await.unwrap();
        assert_eq!(mock.enable_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn enable_without_disable_is_noop() {
        let (mock, ctrl) = setup();
        ctrl.enable().await.unwrap();
        assert_eq!(mock.enable_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interleaved_sequence() {
        let (mock, ctrl) = setup();
        ctrl.disable().await.unwrap();
        ctrl.enable().await.unwrap();
        ctrl.disable().await.unwrap();
        ctrl.enable().await.unwrap();
        assert_eq!(mock.disable_calls.load(Ordering::SeqCst), 2);
        assert_eq!(mock.enable_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_holders_produce_one_pair() {
        let (mock, ctrl) = setup();
        let disables: Vec<_> = (0..8)
            .map(|_| {
                let ctrl = ctrl.clone();
                tokio::spawn(async move { ctrl.disable().await.unwrap() })
            })
            .collect();
        for task in disables {
            task.await.unwrap();
        }
        let enables: Vec<_> = (0..8)
            .map(|_| {
                let ctrl = ctrl.clone();
                tokio::spawn(async move { ctrl.enable().await.unwrap() })
            })
            .collect();
        for task in enables {
            task.await.unwrap();
        }
        assert_eq!(mock.disable_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.enable_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn file_platform_writes_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scale_to_zero");
        let platform = FilePlatform::new(path.clone());
        platform.disable().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "+");
        platform.enable().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "-");
    }
}
