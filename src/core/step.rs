//! Step contract.
//!
//! Every stage reads the artifact of the step it declares as input, does
//! its work unit by unit, and writes one artifact under its own step name.
//! A failing unit is counted and the step moves on; only problems that make
//! the whole step meaningless (missing upstream data, misconfiguration,
//! storage failures) end it early.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::adapters::{Collaborators, ExternalError};
use crate::cache::ExtractionCache;
use crate::config::{ConfigError, PipelineSettings};
use crate::domain::{Lane, Manufacturer, StepKind, StepResult, Table, UnitCounts};
use crate::storage::{Storage, StorageError};

/// Failures that end a step without output
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Previous step data not found: {step}/{file}")]
    UpstreamMissing { step: String, file: String },

    #[error("Malformed upstream data: {0}")]
    MalformedData(String),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Everything a step may touch
pub struct StepContext {
    pub storage: Storage,
    pub cache: ExtractionCache,
    pub settings: PipelineSettings,
    pub collaborators: Arc<Collaborators>,
}

impl StepContext {
    pub fn new(storage: Storage, settings: PipelineSettings, collaborators: Arc<Collaborators>) -> Self {
        Self {
            cache: ExtractionCache::new(storage.steps.clone()),
            storage,
            settings,
            collaborators,
        }
    }

    /// The input step's table for the invocation's lane
    pub async fn input_table(&self, invocation: &StepInvocation) -> Result<Table, StepError> {
        let step = invocation.input()?;
        self.read_table(step, &invocation.lane.product_type.table_file())
            .await
    }

    /// Read a table, reporting absence as missing upstream data
    pub async fn read_table(&self, step: &str, file: &str) -> Result<Table, StepError> {
        match self.storage.steps.read_table(step, file).await {
            Ok(table) => Ok(table),
            Err(StorageError::NotFound(_)) => Err(StepError::UpstreamMissing {
                step: step.to_string(),
                file: file.to_string(),
            }),
            Err(e @ StorageError::Csv { .. }) => Err(StepError::MalformedData(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// One execution request: which lane, and where to read and write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInvocation {
    pub lane: Lane,
    pub step: StepKind,
    pub step_name: String,
    pub input_step_name: Option<String>,
}

impl StepInvocation {
    pub fn input(&self) -> Result<&str, StepError> {
        self.input_step_name.as_deref().ok_or_else(|| {
            StepError::Configuration(ConfigError::Invalid {
                setting: "pipeline",
                reason: format!("step '{}' declares no input", self.step),
            })
        })
    }

    /// Error for a collaborator the lane's manufacturer lacks
    pub fn missing(&self, collaborator: &'static str) -> StepError {
        StepError::Configuration(ConfigError::MissingCollaborator {
            collaborator,
            manufacturer: self.lane.manufacturer,
            step: self.step,
        })
    }
}

/// What a finished step produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub file_name: String,
    pub counts: UnitCounts,
    pub first_error: Option<String>,
}

/// A pipeline stage
#[async_trait]
pub trait Step: Send + Sync {
    fn kind(&self) -> StepKind;

    /// Collaborator this step lacks for `manufacturer`, checked before a run starts
    fn missing_collaborator(
        &self,
        collaborators: &Collaborators,
        manufacturer: Manufacturer,
    ) -> Option<&'static str> {
        collaborators.missing_for(self.kind(), manufacturer)
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        invocation: &StepInvocation,
    ) -> Result<StepOutput, StepError>;
}

/// Per-unit bookkeeping shared by the step implementations
#[derive(Debug, Default)]
pub struct UnitTally {
    counts: UnitCounts,
    first_error: Option<String>,
}

impl UnitTally {
    pub fn new(total: usize) -> Self {
        Self {
            counts: UnitCounts {
                total,
                ..Default::default()
            },
            first_error: None,
        }
    }

    pub fn succeeded(&mut self) {
        self.counts.count += 1;
    }

    /// A unit satisfied from earlier work; it still counts as produced
    pub fn reused(&mut self) {
        self.counts.count += 1;
        self.counts.reused += 1;
    }

    /// A unit with nothing to do (no link, no hash)
    pub fn skipped(&mut self) {
        self.counts.skipped += 1;
    }

    pub fn failed(&mut self, unit: &str, error: impl Display) {
        self.counts.failures += 1;
        if self.first_error.is_none() {
            self.first_error = Some(format!("{}: {}", unit, error));
        }
    }

    pub fn counts(&self) -> UnitCounts {
        self.counts
    }

    pub fn into_output(self, file_name: impl Into<String>) -> StepOutput {
        StepOutput {
            file_name: file_name.into(),
            counts: self.counts,
            first_error: self.first_error,
        }
    }
}

/// Signals when accumulated progress should be flushed
#[derive(Debug)]
pub struct Checkpointer {
    every: usize,
    since: usize,
}

impl Checkpointer {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            since: 0,
        }
    }

    /// Record one finished unit; true when a checkpoint is due
    pub fn tick(&mut self) -> bool {
        self.since += 1;
        if self.since >= self.every {
            self.since = 0;
            true
        } else {
            false
        }
    }
}

/// Execute a step and turn its outcome into a result record
pub async fn run_step(step: &dyn Step, ctx: &StepContext, invocation: &StepInvocation) -> StepResult {
    let started = Instant::now();
    info!(lane = %invocation.lane, step = %invocation.step, step_name = %invocation.step_name, "Step started");

    let result = match step.execute(ctx, invocation).await {
        Ok(output) => StepResult::from_counts(
            invocation.step,
            &invocation.lane,
            invocation.step_name.clone(),
            output.file_name,
            output.counts,
            output.first_error,
        ),
        Err(e) => StepResult::failed(
            invocation.step,
            &invocation.lane,
            invocation.step_name.clone(),
            e.to_string(),
        ),
    };
    let result = result.with_duration(started.elapsed().as_millis() as u64);

    info!(
        lane = %invocation.lane,
        step = %invocation.step,
        status = %result.status,
        count = result.counts.count,
        failures = result.counts.failures,
        duration_ms = result.duration_ms,
        "Step finished"
    );
    result
}
