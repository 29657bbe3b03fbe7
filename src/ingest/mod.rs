//! Trigger ingestion.
//!
//! Payloads reach the orchestrator through the CLI or through a drop folder:
//!
//! ```text
//! inbox/*.json → Watcher → Orchestrator::run → inbox/processed/
//!                                            ↘ inbox/failed/
//! ```

pub mod watcher;

pub use watcher::{process_payload, InboxConfig, InboxWatcher, PayloadOutcome, ScanResult, WatchHandle};
