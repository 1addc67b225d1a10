// Registry multiplexing recorders by id.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::ApiError;
use crate::recording::recorder::Recorder;

/// Process-wide id → recorder map. The map itself is guarded by one lock;
/// the lock is never held across a stop (recorders are snapshotted first).
#[derive(Default)]
pub struct Registry {
    recorders: Mutex<HashMap<String, Arc<Recorder>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a recorder under its id. At most one recorder per id exists at
    /// any instant.
    pub async fn register(&self, recorder: Arc<Recorder>) -> Result<(), ApiError> {
        let mut recorders = self.recorders.lock().await;
        if recorders.contains_key(recorder.id()) {
            return Err(ApiError::Conflict(format!(
                "recorder with id '{}' already exists",
                recorder.id()
            )));
        }
        info!(id = %recorder.id(), "registered new recorder");
        recorders.insert(recorder.id().to_string(), recorder);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Recorder>> {
        self.recorders.lock().await.get(id).cloned()
    }

    /// Remove the entry. Does not stop the recorder.
    pub async fn deregister(&self, id: &str) {
        self.recorders.lock().await.remove(id);
    }

    pub async fn snapshot(&self) -> Vec<Arc<Recorder>> {
        self.recorders.lock().await.values().cloned().collect()
    }

    /// Recorders whose subprocess is currently alive.
    pub async fn list_active(&self) -> Vec<Arc<Recorder>> {
        let mut active = Vec::new();
        for recorder in self.snapshot().await {
            if recorder.is_recording().await {
                active.push(recorder);
            }
        }
        active
    }

    /// Gracefully stop every active recorder. Failures are collected and
    /// joined; a failing recorder never prevents the others from stopping.
    pub async fn stop_all(&self) -> Result<()> {
        let recorders = self.snapshot().await;
        let count = recorders.len();

        let mut failures = Vec::new();
        for recorder in recorders {
            if !recorder.is_recording().await {
                continue;
            }
            if let Err(err) = recorder.stop().await {
                error!(id = %recorder.id(), err = %err, "failed to stop recorder during shutdown");
                failures.push(format!("failed to stop recorder '{}': {err}", recorder.id()));
            }
        }
        info!(count, "stopped all recorders");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }
}
