//! Domain types for the powerflow pipeline.
//!
//! This module contains the core data structures:
//! - Lanes: manufacturers, product types and trigger payloads
//! - Records: flat rows and CSV tables
//! - Converters: the structured extraction schema
//! - Results: step identities, statuses and summaries
//! - Events / Run: the run journal and its replayed state

pub mod converter;
pub mod events;
pub mod lane;
pub mod record;
pub mod result;
pub mod run;

// Re-export commonly used types
pub use converter::{ConverterBatch, Issue, PowerConverter};
pub use events::{Event, EventType};
pub use lane::{Lane, LaneError, Manufacturer, ManufacturerProfile, ProductType, TriggerPayload};
pub use record::{Record, Table};
pub use result::{StepKind, StepResult, StepStatus, UnitCounts};
pub use run::{Run, RunState};
