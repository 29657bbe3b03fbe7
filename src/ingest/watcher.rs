//! Trigger drop folder watcher.
//!
//! Watches the inbox directory for `*.json` trigger payloads. Each payload
//! that has stopped changing is run through the orchestrator and then moved
//! to `processed/` (run finished) or `failed/` (unreadable payload or the
//! run could not start).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::Orchestrator;
use crate::domain::TriggerPayload;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Inbox directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Directory payloads are dropped into
    pub inbox_dir: PathBuf,

    /// How long a file must be unchanged before it is picked up (seconds)
    pub stability_delay_secs: u64,
}

impl InboxConfig {
    pub fn new(inbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            inbox_dir: inbox_dir.into(),
            stability_delay_secs: 2,
        }
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.inbox_dir.join("processed")
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.inbox_dir.join("failed")
    }

    /// Create the inbox and its outcome folders
    pub fn prepare(&self) -> Result<(), WatcherError> {
        std::fs::create_dir_all(self.processed_dir())?;
        std::fs::create_dir_all(self.failed_dir())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.inbox_dir.is_dir() {
            return Err(WatcherError::DirectoryNotFound(self.inbox_dir.clone()));
        }
        Ok(())
    }
}

/// What became of one dropped payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadOutcome {
    /// The run finished (possibly with failed steps)
    Ran { run_id: Uuid, moved_to: PathBuf },

    /// The payload was rejected before any step ran
    Rejected { error: String, moved_to: PathBuf },
}

/// Result of a directory scan
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub ran: usize,
    pub rejected: usize,
}

impl ScanResult {
    pub fn total(&self) -> usize {
        self.ran + self.rejected
    }
}

fn is_payload(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
}

/// Move `path` into `dir`, keeping the name unless it is already taken
async fn move_into(path: &Path, dir: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .with_context(|| format!("Not a file: {}", path.display()))?;
    let mut target = dir.join(name);
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        target = dir.join(format!("{}-{}", stamp, name.to_string_lossy()));
    }
    tokio::fs::rename(path, &target)
        .await
        .with_context(|| format!("Failed to move {} to {}", path.display(), target.display()))?;
    Ok(target)
}

/// Run one dropped payload and file it away
pub async fn process_payload(
    config: &InboxConfig,
    orchestrator: &Orchestrator,
    path: &Path,
) -> Result<PayloadOutcome> {
    let started = async {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let payload = TriggerPayload::from_json(&content)?;
        orchestrator.run(payload).await
    }
    .await;

    match started {
        Ok(run) => {
            let moved_to = move_into(path, &config.processed_dir()).await?;
            tracing::info!(run_id = %run.id, payload = %path.display(), state = ?run.state, "Payload processed");
            Ok(PayloadOutcome::Ran {
                run_id: run.id,
                moved_to,
            })
        }
        Err(e) => {
            let moved_to = move_into(path, &config.failed_dir()).await?;
            tracing::warn!(payload = %path.display(), error = %e, "Payload rejected");
            Ok(PayloadOutcome::Rejected {
                error: format!("{:#}", e),
                moved_to,
            })
        }
    }
}

/// Drop folder watcher with stability checking
pub struct InboxWatcher {
    config: InboxConfig,
}

impl InboxWatcher {
    pub fn new(config: InboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InboxConfig {
        &self.config
    }

    /// Process every payload already in the inbox, oldest name first
    pub async fn scan_once(&self, orchestrator: &Orchestrator) -> Result<ScanResult> {
        self.config.prepare()?;
        self.config.validate()?;

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.inbox_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_payload(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut result = ScanResult::default();
        for path in paths {
            match process_payload(&self.config, orchestrator, &path).await? {
                PayloadOutcome::Ran { .. } => result.ran += 1,
                PayloadOutcome::Rejected { .. } => result.rejected += 1,
            }
        }

        Ok(result)
    }

    /// Watch the inbox and process payloads as they arrive.
    ///
    /// Outcomes are sent on the returned channel until the handle is stopped.
    pub async fn watch(
        &self,
        orchestrator: Arc<Orchestrator>,
    ) -> Result<(mpsc::Receiver<PayloadOutcome>, WatchHandle)> {
        self.config.prepare()?;
        self.config.validate()?;

        let (outcome_tx, outcome_rx) = mpsc::channel::<PayloadOutcome>(100);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_watcher(config, orchestrator, outcome_tx, &mut stop_rx).await {
                tracing::error!("Watcher error: {}", e);
            }
        });

        Ok((
            outcome_rx,
            WatchHandle {
                stop_tx,
                task: handle,
            },
        ))
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

/// Internal watcher loop
async fn run_watcher(
    config: InboxConfig,
    orchestrator: Arc<Orchestrator>,
    outcome_tx: mpsc::Sender<PayloadOutcome>,
    stop_rx: &mut mpsc::Receiver<()>,
) -> Result<()> {
    // Files being stabilized (path -> (size, last_seen))
    let mut pending: HashMap<PathBuf, (u64, Instant)> = HashMap::new();

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(500), tx)?;
    debouncer
        .watcher()
        .watch(&config.inbox_dir, RecursiveMode::NonRecursive)?;

    let stability_delay = Duration::from_secs(config.stability_delay_secs);

    tracing::info!("Watching {} for trigger payloads", config.inbox_dir.display());

    loop {
        if stop_rx.try_recv().is_ok() {
            tracing::info!("Watcher stopping...");
            break;
        }

        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(Ok(events)) => {
                for event in events {
                    if !is_payload(&event.path) {
                        continue;
                    }
                    if let Ok(metadata) = std::fs::metadata(&event.path) {
                        pending.insert(event.path, (metadata.len(), Instant::now()));
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watcher error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                tracing::error!("Watcher channel disconnected");
                break;
            }
        }

        let now = Instant::now();
        let mut stable = Vec::new();
        for (path, (last_size, last_seen)) in pending.iter_mut() {
            if now.duration_since(*last_seen) < stability_delay {
                continue;
            }
            match std::fs::metadata(path) {
                Ok(metadata) if metadata.len() == *last_size && *last_size > 0 => stable.push(path.clone()),
                Ok(metadata) => {
                    *last_size = metadata.len();
                    *last_seen = now;
                }
                // Gone (moved away or deleted before it settled)
                Err(_) => stable.push(path.clone()),
            }
        }

        for path in stable {
            pending.remove(&path);
            if !path.exists() {
                continue;
            }
            match process_payload(&config, &orchestrator, &path).await {
                Ok(outcome) => {
                    let _ = outcome_tx.send(outcome).await;
                }
                Err(e) => tracing::warn!("Failed to process {}: {:#}", path.display(), e),
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Collaborators;
    use crate::config::PipelineSettings;
    use crate::core::StepContext;
    use crate::storage::Storage;
    use tempfile::TempDir;

    fn orchestrator(temp: &TempDir) -> Orchestrator {
        let ctx = StepContext::new(
            Storage::in_memory(),
            PipelineSettings::default(),
            Arc::new(Collaborators::new()),
        );
        Orchestrator::new(ctx, temp.path().join("runs"), temp.path().join("locks"))
    }

    #[test]
    fn test_only_json_files_are_payloads() {
        let temp = TempDir::new().unwrap();
        let json = temp.path().join("a.JSON");
        let other = temp.path().join("a.txt");
        std::fs::write(&json, "{}").unwrap();
        std::fs::write(&other, "{}").unwrap();

        assert!(is_payload(&json));
        assert!(!is_payload(&other));
        assert!(!is_payload(temp.path()));
    }

    #[tokio::test]
    async fn test_unusable_payloads_move_to_failed() {
        let temp = TempDir::new().unwrap();
        let config = InboxConfig::new(temp.path().join("inbox"));
        config.prepare().unwrap();

        std::fs::write(config.inbox_dir.join("broken.json"), "not json").unwrap();
        // Parses, but no scraper is registered for recom
        std::fs::write(config.inbox_dir.join("recom.json"), r#"{"manufacturer": "recom"}"#).unwrap();
        std::fs::write(config.inbox_dir.join("notes.txt"), "ignored").unwrap();

        let watcher = InboxWatcher::new(config.clone());
        let result = watcher.scan_once(&orchestrator(&temp)).await.unwrap();

        assert_eq!(result.rejected, 2);
        assert_eq!(result.ran, 0);
        assert!(config.failed_dir().join("broken.json").exists());
        assert!(config.failed_dir().join("recom.json").exists());
        assert!(config.inbox_dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_name_clash_keeps_both_files() {
        let temp = TempDir::new().unwrap();
        let config = InboxConfig::new(temp.path().join("inbox"));
        config.prepare().unwrap();

        std::fs::write(config.failed_dir().join("p.json"), "old").unwrap();
        let dropped = config.inbox_dir.join("p.json");
        std::fs::write(&dropped, "new").unwrap();

        let target = move_into(&dropped, &config.failed_dir()).await.unwrap();
        assert_ne!(target, config.failed_dir().join("p.json"));
        assert_eq!(std::fs::read_to_string(target).unwrap(), "new");
    }
}
