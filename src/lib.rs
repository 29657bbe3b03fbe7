//! powerflow - resumable ETL pipeline for power-converter datasheets
//!
//! Scrapes manufacturer product listings, downloads datasheets, extracts
//! their text and structured specifications, validates the result and
//! loads it into SQLite.
//!
//! # Architecture
//!
//! - Every step reads the artifact of the step before it and writes its own
//!   under a versioned step name (`recom5_structured_product_data/schema_v11`)
//! - Downloaded and extracted content is stored once, keyed by SHA-256
//! - Expensive extraction calls are memoised in an extraction cache
//! - Each run is journaled; `status` replays the journal and `resume`
//!   re-executes only the steps that produced nothing
//!
//! # Modules
//!
//! - `adapters`: External collaborators (HTTP, text extraction, chat completions, SQLite)
//! - `cache`: Extraction cache and hash side tables
//! - `core`: Orchestration (journal, pipeline, step contract, lane locks)
//! - `domain`: Data structures (lanes, records, converters, results, events)
//! - `steps`: The six pipeline stages
//! - `storage`: Content-addressed and per-step artifact stores
//! - `ingest`: Drop folder for trigger payloads
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run every step for recom's DC/DC converters
//! powerflow run --manufacturer recom --product-type dc-dc-converters
//!
//! # Check run status
//! powerflow status <run-id>
//!
//! # Resume after fixing a failure
//! powerflow resume <run-id>
//! ```

pub mod adapters;
pub mod cache;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod steps;
pub mod storage;

// Re-export main types at crate root for convenience
pub use crate::core::{Orchestrator, Pipeline, StepContext};
pub use adapters::Collaborators;
pub use config::ResolvedConfig;
pub use domain::{Event, EventType, Lane, Run, RunState, StepKind, StepResult, StepStatus, TriggerPayload};
pub use storage::Storage;
