//! ExecutionStore — one JSON file per execution under a state directory.
//!
//! Storage path: `<state_dir>/<execution_id>.json`
//!
//! Writes go to a hidden temp file in the same directory and are renamed over
//! the record, so readers see either the previous or the new state in full.
//! Each execution only ever touches its own file.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{ExecutionError, StoreError};
use crate::models::{ExecutionState, ExecutionStatus, StepStatus};
use crate::workflow::schema::WorkflowExecutionRequest;

const RECORD_EXT: &str = "json";

#[derive(Debug, Clone)]
pub struct ExecutionStore {
    state_dir: PathBuf,
}

impl ExecutionStore {
    /// Open (and create if needed) a store rooted at `state_dir`.
    pub async fn open(state_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let state_dir = state_dir.as_ref().to_path_buf();
        fs::create_dir_all(&state_dir)
            .await
            .map_err(|e| StoreError::io(&state_dir, e))?;
        Ok(Self { state_dir })
    }

    /// Open the per-user default store.
    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open(Self::default_state_dir()?).await
    }

    /// `<data_local_dir>/flowline/executions`, or `~/.flowline/executions`.
    pub fn default_state_dir() -> Result<PathBuf, StoreError> {
        if let Some(dir) = dirs::data_local_dir() {
            return Ok(dir.join("flowline").join("executions"));
        }
        dirs::home_dir()
            .map(|home| home.join(".flowline").join("executions"))
            .ok_or(StoreError::NoStateDir)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn record_path(&self, execution_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !execution_id.is_empty()
            && execution_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(execution_id.to_string()));
        }
        Ok(self
            .state_dir
            .join(format!("{}.{}", execution_id, RECORD_EXT)))
    }

    /// Create and persist a new `running` execution for `request`.
    pub async fn create(
        &self,
        request: &WorkflowExecutionRequest,
        runner: &str,
    ) -> Result<ExecutionState, StoreError> {
        let mut state = ExecutionState::new(uuid::Uuid::new_v4().to_string(), request, runner);
        self.save(&mut state).await?;
        tracing::info!(
            "[ExecutionStore] Created execution {} for '{}' ({} steps)",
            state.execution_id,
            state.workflow_name,
            state.total_steps
        );
        Ok(state)
    }

    /// Create an execution that starts at `start_step`.
    ///
    /// Earlier steps are recorded as skipped and the stored request is the
    /// one actually submitted, so a resume replays the same slice.
    pub async fn create_from_step(
        &self,
        request: &WorkflowExecutionRequest,
        runner: &str,
        start_step: &str,
    ) -> Result<ExecutionState, ExecutionError> {
        let (first, submitted) = request.from_step(start_step)?;
        let mut state = ExecutionState::new(uuid::Uuid::new_v4().to_string(), request, runner);
        state.workflow_name = submitted.name.clone();
        state.original_request = submitted;
        state.skip_steps_before(first);
        self.save(&mut state).await?;
        tracing::info!(
            "[ExecutionStore] Created execution {} starting at step '{}' ({} skipped)",
            state.execution_id,
            start_step,
            first
        );
        Ok(state)
    }

    /// Stamp `lastUpdate` and atomically replace the record.
    pub async fn save(&self, state: &mut ExecutionState) -> Result<(), StoreError> {
        let path = self.record_path(&state.execution_id)?;
        state.last_update = Utc::now();
        let json = serde_json::to_vec_pretty(state)?;

        let tmp = self
            .state_dir
            .join(format!(".{}.{}.tmp", state.execution_id, RECORD_EXT));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    pub async fn load(&self, execution_id: &str) -> Result<ExecutionState, StoreError> {
        let path = self.record_path(execution_id)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(execution_id.to_string()))
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Apply a step transition and persist it if anything changed.
    pub async fn update_step(
        &self,
        state: &mut ExecutionState,
        name: &str,
        status: StepStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let changed = state.apply_step_update(name, status, output, error);
        if changed {
            self.save(state).await?;
        }
        Ok(changed)
    }

    /// Record a lost connection; counts as one reconnect attempt.
    pub async fn mark_connection_lost(&self, state: &mut ExecutionState) -> Result<(), StoreError> {
        state.connection_lost = true;
        state.retry_count += 1;
        self.save(state).await
    }

    pub async fn mark_connection_restored(
        &self,
        state: &mut ExecutionState,
    ) -> Result<(), StoreError> {
        if !state.connection_lost {
            return Ok(());
        }
        state.connection_lost = false;
        self.save(state).await
    }

    /// Finalize with `status`. Returns `false` (and writes nothing) if the
    /// record is already terminal or already in that status.
    pub async fn complete(
        &self,
        state: &mut ExecutionState,
        status: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        if !state.finish(status) {
            return Ok(false);
        }
        self.save(state).await?;
        tracing::info!(
            "[ExecutionStore] Execution {} marked {}",
            state.execution_id,
            status
        );
        Ok(true)
    }

    /// Executions that are `running` or have lost their connection.
    pub async fn list_active(&self) -> Result<Vec<ExecutionState>, StoreError> {
        let mut states = self.list_all().await?;
        states.retain(|s| s.status == ExecutionStatus::Running || s.connection_lost);
        Ok(states)
    }

    /// Every readable record, newest first.
    pub async fn list_all(&self) -> Result<Vec<ExecutionState>, StoreError> {
        let mut states = Vec::new();
        for (path, _) in self.record_files().await? {
            match read_record(&path).await {
                Ok(state) => states.push(state),
                Err(e) => {
                    tracing::debug!("[ExecutionStore] Skipping {}: {}", path.display(), e);
                }
            }
        }
        states.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(states)
    }

    /// Delete terminal records last modified more than `max_age` ago.
    /// Non-terminal records are kept regardless of age.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize, StoreError> {
        let now = SystemTime::now();
        let mut removed = 0;

        for (path, modified) in self.record_files().await? {
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }
            let state = match read_record(&path).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::debug!("[ExecutionStore] Not cleaning {}: {}", path.display(), e);
                    continue;
                }
            };
            if !state.is_terminal() {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!("[ExecutionStore] Removed {}", path.display());
                }
                Err(e) => {
                    tracing::warn!("[ExecutionStore] Failed to remove {}: {}", path.display(), e);
                }
            }
        }

        if removed > 0 {
            tracing::info!("[ExecutionStore] Cleaned up {} execution(s)", removed);
        }
        Ok(removed)
    }

    /// Remove one record. A missing record is not an error.
    pub async fn delete(&self, execution_id: &str) -> Result<(), StoreError> {
        let path = self.record_path(execution_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// `(path, mtime)` of every `*.json` record in the state directory.
    async fn record_files(&self) -> Result<Vec<(PathBuf, SystemTime)>, StoreError> {
        let mut entries = fs::read_dir(&self.state_dir)
            .await
            .map_err(|e| StoreError::io(&self.state_dir, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.state_dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
            files.push((path, modified));
        }
        Ok(files)
    }
}

async fn read_record(path: &Path) -> Result<ExecutionState, StoreError> {
    let bytes = fs::read(path).await.map_err(|e| StoreError::io(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}
