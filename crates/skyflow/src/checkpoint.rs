use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifact::ArtifactStore;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    task_id: Uuid,
    attempt: i32,
    state: Value,
}

/// Advisory progress marker a handler may leave mid-batch, plus the
/// cooperative cancellation signal.
///
/// Checkpoints are keyed by `(task_id, attempt)` but stored per batch, so the
/// next attempt of the same batch observes whatever the previous attempt left
/// behind. Corrupt files are discarded; correctness never depends on a
/// checkpoint being present.
#[derive(Clone)]
pub struct CheckpointHandle {
    artifacts: ArtifactStore,
    job_id: Uuid,
    batch_id: Uuid,
    task_id: Uuid,
    attempt: i32,
    cancel: CancellationToken,
}

impl CheckpointHandle {
    pub fn new(
        artifacts: ArtifactStore,
        job_id: Uuid,
        batch_id: Uuid,
        task_id: Uuid,
        attempt: i32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            artifacts,
            job_id,
            batch_id,
            task_id,
            attempt,
            cancel,
        }
    }

    pub async fn save(&self, state: &Value) -> anyhow::Result<()> {
        let path = self.artifacts.checkpoint_path(self.job_id, self.batch_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = CheckpointFile {
            task_id: self.task_id,
            attempt: self.attempt,
            state: state.clone(),
        };
        tokio::fs::write(&path, serde_json::to_vec(&file)?).await?;
        Ok(())
    }

    /// Last saved state for this batch, from any attempt. A file that does
    /// not parse is removed and reported as absent, forcing a from-scratch
    /// run.
    pub async fn load(&self) -> Option<Value> {
        let path = self.artifacts.checkpoint_path(self.job_id, self.batch_id);
        let bytes = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<CheckpointFile>(&bytes) {
            Ok(file) => Some(file.state),
            Err(_) => {
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        let path = self.artifacts.checkpoint_path(self.job_id, self.batch_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// True once the runtime wants this task to stop (soft timeout, lost
    /// heartbeats, or job cancellation). Handlers must check this at loop
    /// boundaries.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
