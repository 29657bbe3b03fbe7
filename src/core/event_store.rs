//! Append-only run journal with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) at
//! `<runs_dir>/<run_id>/events.jsonl`, one file per run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{Event, EventType, Lane, StepKind};

/// One run's journal on disk
pub struct EventStore {
    /// `<runs_dir>/<run_id>`
    run_dir: PathBuf,

    events_path: PathBuf,

    /// Serializes appends from concurrently running lanes
    append_lock: Mutex<()>,
}

impl EventStore {
    /// Create or open the journal of a run under `runs_dir`
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
            append_lock: Mutex::new(()),
        })
    }

    /// Open an existing journal; fails if the run is unknown
    pub async fn open_existing(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let events_path = runs_dir.join(run_id.to_string()).join("events.jsonl");
        if !fs::try_exists(&events_path).await.unwrap_or(false) {
            anyhow::bail!("Run not found: {}", run_id);
        }
        Self::open(runs_dir, run_id).await
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one event as a single JSON line
    pub async fn append(&self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        let _guard = self.append_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order.
    ///
    /// A torn final line (the process died mid-append) is dropped; a bad
    /// line anywhere else is an error.
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !fs::try_exists(&self.events_path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut raw = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                raw.push(line);
            }
        }

        let last = raw.len().saturating_sub(1);
        let mut events = Vec::with_capacity(raw.len());
        for (i, line) in raw.iter().enumerate() {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) if i == last => {
                    tracing::warn!(path = %self.events_path.display(), error = %e, "Dropping torn journal tail");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to parse event: {}", line));
                }
            }
        }

        Ok(events)
    }

    /// Whether the latest step outcome journalled under this key is a completion
    pub async fn is_step_completed(&self, idempotency_key: &str) -> Result<bool> {
        let events = self.replay().await?;

        let latest = events.iter().rev().find(|e| {
            e.idempotency_key == idempotency_key
                && matches!(
                    e.event_type,
                    EventType::StepCompleted | EventType::StepFailed | EventType::StepSkipped
                )
        });

        Ok(latest.is_some_and(|e| e.event_type == EventType::StepCompleted))
    }

    /// Latest event of a type, if any
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// List all run IDs under `runs_dir`, oldest journal first
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !fs::try_exists(runs_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        let modified = entry
                            .metadata()
                            .await
                            .and_then(|m| m.modified())
                            .ok();
                        runs.push((modified, uuid));
                    }
                }
            }
        }

        runs.sort();
        Ok(runs.into_iter().map(|(_, id)| id).collect())
    }
}

/// Generate an idempotency key for one step of one lane
pub fn generate_idempotency_key(run_id: Uuid, lane: &Lane, step: StepKind, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}:{}", run_id, lane.key(), step, input_hash)
}

/// First 8 bytes of the SHA-256 of `input`, hex encoded
pub fn hash_input(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}
