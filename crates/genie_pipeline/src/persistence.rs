//! Project persistence: snapshots, stores, and the debounced saver.
//!
//! # Storage Format
//!
//! ```text
//! <store_dir>/
//! ├── {org_id_1}.json
//! ├── {org_id_2}.json
//! └── ...
//! ```
//!
//! Each file holds one [`ProjectSnapshot`]. Timestamps inside the project
//! document are epoch milliseconds.

use crate::error::{PipelineError, Result as PipelineResult};
use crate::project::Project;
use crate::stage::StageId;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized project document as handed to a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub version: u32,
    pub org_id: String,
    /// Epoch milliseconds
    pub saved_at: i64,
    pub current_stage: StageId,
    pub project: Value,
}

impl ProjectSnapshot {
    pub fn capture(org_id: &str, project: &Project, current_stage: StageId) -> PipelineResult<Self> {
        let mut document = serde_json::to_value(project)
            .map_err(|e| PipelineError::Persistence(format!("failed to serialize project: {}", e)))?;
        strip_null_holes(&mut document);
        Ok(Self {
            version: SNAPSHOT_VERSION,
            org_id: org_id.to_string(),
            saved_at: Utc::now().timestamp_millis(),
            current_stage,
            project: document,
        })
    }

    pub fn restore(&self) -> PipelineResult<Project> {
        if self.version > SNAPSHOT_VERSION {
            return Err(PipelineError::Persistence(format!(
                "snapshot version {} is newer than supported version {}",
                self.version, SNAPSHOT_VERSION
            )));
        }
        serde_json::from_value(self.project.clone())
            .map_err(|e| PipelineError::Persistence(format!("failed to parse project: {}", e)))
    }
}

/// Remove `null` entries from every array, recursively.
pub fn strip_null_holes(value: &mut Value) {
    match value {
        Value::Array(items) => {
            items.retain(|item| !item.is_null());
            items.iter_mut().for_each(strip_null_holes);
        }
        Value::Object(map) => map.values_mut().for_each(strip_null_holes),
        _ => {}
    }
}

/// Durable storage for project snapshots, one per organization.
pub trait ProjectStore: Send + Sync {
    fn persist(&self, snapshot: &ProjectSnapshot) -> Result<()>;

    fn load(&self, org_id: &str) -> Result<Option<ProjectSnapshot>>;
}

/// JSON file per organization.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| {
            format!("Failed to create project store directory: {}", dir.display())
        })?;
        Ok(Self { dir })
    }

    fn snapshot_path(&self, org_id: &str) -> PathBuf {
        let safe: String = org_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ProjectStore for JsonFileStore {
    fn persist(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        let path = self.snapshot_path(&snapshot.org_id);
        let json = serde_json::to_string_pretty(snapshot)?;
        atomic_write(&path, json.as_bytes())
            .with_context(|| format!("Failed to write project file: {}", path.display()))?;
        debug!("Saved project for {} to {}", snapshot.org_id, path.display());
        Ok(())
    }

    fn load(&self, org_id: &str) -> Result<Option<ProjectSnapshot>> {
        let path = self.snapshot_path(org_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read project file: {}", path.display()))?;
        let snapshot = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse project file: {}", path.display()))?;
        Ok(Some(snapshot))
    }
}

/// Atomic write via temp file + rename
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".tmp_{}", uuid::Uuid::new_v4()));
    fs::write(&temp_path, content)
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file to {}", path.display()))?;
    Ok(())
}

/// In-memory store, mostly for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<String, ProjectSnapshot>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `persist` calls.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProjectStore for MemoryStore {
    fn persist(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.org_id.clone(), snapshot.clone());
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn load(&self, org_id: &str) -> Result<Option<ProjectSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(org_id)
            .cloned())
    }
}

// ============================================================================
// Debounced saver
// ============================================================================

enum SaveCommand {
    Save(Box<ProjectSnapshot>),
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Background writer that batches snapshots after a quiet period.
///
/// Only the latest snapshot inside a quiet period is written. A crash loses
/// at most one quiet period of edits.
pub struct DebouncedSaver {
    tx: mpsc::UnboundedSender<SaveCommand>,
    task: JoinHandle<()>,
}

impl DebouncedSaver {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<dyn ProjectStore>, quiet: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_saver(store, quiet, rx));
        Self { tx, task }
    }

    /// Queue a snapshot. Replaces anything queued but not yet written.
    pub fn schedule(&self, snapshot: ProjectSnapshot) {
        if self.tx.send(SaveCommand::Save(Box::new(snapshot))).is_err() {
            warn!("Project saver has stopped; dropping snapshot");
        }
    }

    /// Write anything queued now and wait for it.
    pub async fn flush(&self) -> PipelineResult<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(SaveCommand::Flush(ack))
            .map_err(|_| PipelineError::Persistence("project saver has stopped".to_string()))?;
        done.await
            .map_err(|_| PipelineError::Persistence("project saver has stopped".to_string()))?
            .map_err(PipelineError::Persistence)
    }

    /// Flush and stop the writer task.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!("Project saver task failed: {}", e);
        }
    }
}

async fn run_saver(
    store: Arc<dyn ProjectStore>,
    quiet: Duration,
    mut rx: mpsc::UnboundedReceiver<SaveCommand>,
) {
    let mut pending: Option<Box<ProjectSnapshot>> = None;
    let mut last_error: Option<String> = None;

    loop {
        let command = if pending.is_some() {
            match tokio::time::timeout(quiet, rx.recv()).await {
                Ok(command) => command,
                Err(_) => {
                    write_snapshot(store.as_ref(), pending.take(), &mut last_error);
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match command {
            Some(SaveCommand::Save(snapshot)) => pending = Some(snapshot),
            Some(SaveCommand::Flush(ack)) => {
                write_snapshot(store.as_ref(), pending.take(), &mut last_error);
                let _ = ack.send(match last_error.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                });
            }
            None => {
                write_snapshot(store.as_ref(), pending.take(), &mut last_error);
                info!("Project saver stopped");
                break;
            }
        }
    }
}

fn write_snapshot(
    store: &dyn ProjectStore,
    snapshot: Option<Box<ProjectSnapshot>>,
    last_error: &mut Option<String>,
) {
    let Some(snapshot) = snapshot else {
        return;
    };
    match store.persist(&snapshot) {
        Ok(()) => debug!("Persisted project snapshot for {}", snapshot.org_id),
        Err(e) => {
            warn!("Failed to persist project for {}: {:#}", snapshot.org_id, e);
            *last_error = Some(format!("{:#}", e));
        }
    }
}
