//! Main orchestrator for pipeline execution.
//!
//! Drives every lane of a trigger payload through the step sequence,
//! journaling each step's start and result. Step failures never abort a
//! run: they are recorded, and the lane's failure policy decides whether
//! the remaining steps run or are recorded as skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::Collaborators;
use crate::config::{ConfigError, FailurePolicy, ResolvedConfig};
use crate::domain::{Event, EventType, Lane, Run, StepKind, StepResult, StepStatus, TriggerPayload};
use crate::steps::standard_steps;
use crate::storage::Storage;

use super::event_store::{generate_idempotency_key, EventStore};
use super::lane_lock::LaneLock;
use super::pipeline::{Pipeline, PipelineError, StepSpec};
use super::step::{run_step, Step, StepContext, StepInvocation};

/// Data of the run-start event: the payload and where the run began
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunStart {
    #[serde(flatten)]
    payload: TriggerPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<StepKind>,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    ctx: StepContext,
    pipeline: Pipeline,
    steps: HashMap<StepKind, Arc<dyn Step>>,
    runs_dir: PathBuf,
    locks_dir: PathBuf,
}

impl Orchestrator {
    /// Orchestrator with the standard pipeline and step implementations
    pub fn new(ctx: StepContext, runs_dir: impl Into<PathBuf>, locks_dir: impl Into<PathBuf>) -> Self {
        let mut orchestrator = Self {
            ctx,
            pipeline: Pipeline::standard(),
            steps: HashMap::new(),
            runs_dir: runs_dir.into(),
            locks_dir: locks_dir.into(),
        };
        for step in standard_steps() {
            orchestrator = orchestrator.with_step(step);
        }
        orchestrator
    }

    /// Orchestrator over the local store of a resolved configuration
    pub fn from_config(config: &ResolvedConfig, collaborators: Collaborators) -> Self {
        let ctx = StepContext::new(
            Storage::local(config.store_dir()),
            config.pipeline.clone(),
            Arc::new(collaborators),
        );
        Self::new(ctx, config.runs_dir(), config.locks_dir())
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Register (or replace) the implementation of a step
    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.insert(step.kind(), step);
        self
    }

    pub fn context(&self) -> &StepContext {
        &self.ctx
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Run every step for every lane of the payload
    pub async fn run(&self, payload: TriggerPayload) -> Result<Run> {
        self.start(payload, None).await
    }

    /// Run from `start` onwards, reading the artifacts earlier steps left
    pub async fn run_from(&self, payload: TriggerPayload, start: StepKind) -> Result<Run> {
        self.start(payload, Some(start)).await
    }

    #[instrument(skip(self, payload), fields(manufacturer = %payload.manufacturer))]
    async fn start(&self, payload: TriggerPayload, from: Option<StepKind>) -> Result<Run> {
        let specs = self.selected(from)?;
        self.preflight(&payload, &specs)?;

        let run_id = Uuid::new_v4();
        let store = EventStore::open(&self.runs_dir, run_id).await?;
        info!(%run_id, lanes = payload.lanes().len(), "Starting run");

        let start = RunStart {
            payload: payload.clone(),
            from,
        };
        let event = Event::new(
            run_id,
            EventType::RunStarted,
            format!("{}:start", run_id),
            format!(
                "Run started for {} ({})",
                payload.manufacturer,
                payload
                    .product_types
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            StepStatus::Running,
        )
        .with_data(serde_json::to_value(&start)?);
        store.append(&event).await?;

        self.execute(&store, Run::new(run_id, payload), &specs, &[]).await
    }

    /// Continue a run: steps whose latest journalled outcome is a completion
    /// are kept, everything from a lane's first incomplete step is executed
    /// again.
    #[instrument(skip(self))]
    pub async fn resume(&self, run_id: Uuid) -> Result<Run> {
        let store = EventStore::open_existing(&self.runs_dir, run_id).await?;
        let events = store.replay().await?;
        let mut run = Run::from_events(&events).context("Run journal does not start with a run-start event")?;

        let from = store
            .last_event_of_type(EventType::RunStarted)
            .await?
            .and_then(|e| e.data)
            .and_then(|d| serde_json::from_value::<RunStart>(d).ok())
            .and_then(|s| s.from);
        let specs = self.selected(from)?;

        let mut kept: Vec<StepResult> = Vec::new();
        let mut pending: Vec<&StepSpec> = Vec::new();
        for lane in run.payload.lanes() {
            let mut rerun = false;
            for spec in &specs {
                if !rerun {
                    let key = generate_idempotency_key(run_id, &lane, spec.kind, &spec.step_name(lane.manufacturer));
                    let recorded = run.result(&lane, spec.kind).filter(|r| r.status.produced_output());
                    if let Some(result) = recorded {
                        if store.is_step_completed(&key).await? {
                            kept.push(result.clone());
                            continue;
                        }
                    }
                }
                // Later steps of the lane read what this one rewrites
                rerun = true;
                if !pending.iter().any(|p| p.kind == spec.kind) {
                    pending.push(*spec);
                }
            }
        }
        self.preflight(&run.payload, &pending)?;

        info!(%run_id, kept = kept.len(), "Resuming run");
        let event = Event::new(
            run_id,
            EventType::RunResumed,
            format!("{}:resume:{}", run_id, events.len()),
            format!("Run resumed with {} step results kept", kept.len()),
            StepStatus::Running,
        );
        store.append(&event).await?;
        run.apply_event(&event);

        self.execute(&store, run, &specs, &kept).await
    }

    /// Current state of a run, rebuilt from its journal
    pub async fn status(&self, run_id: Uuid) -> Result<Run> {
        let store = EventStore::open_existing(&self.runs_dir, run_id).await?;
        let events = store.replay().await?;
        Run::from_events(&events).with_context(|| format!("Run {} has no run-start event", run_id))
    }

    /// Most recent runs first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        for run_id in EventStore::list_runs(&self.runs_dir).await? {
            match self.status(run_id).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn selected(&self, from: Option<StepKind>) -> Result<Vec<&StepSpec>, PipelineError> {
        match from {
            Some(kind) => self.pipeline.starting_at(kind),
            None => Ok(self.pipeline.steps().iter().collect()),
        }
    }

    /// Everything that would make the run meaningless, checked before it starts
    fn preflight(&self, payload: &TriggerPayload, specs: &[&StepSpec]) -> Result<()> {
        payload.validate()?;

        let implemented: Vec<StepKind> = self.steps.keys().copied().collect();
        self.pipeline.validate(&implemented)?;

        for spec in specs {
            let step = self
                .steps
                .get(&spec.kind)
                .ok_or(PipelineError::NotImplemented(spec.kind))?;
            if let Some(collaborator) = step.missing_collaborator(&self.ctx.collaborators, payload.manufacturer) {
                return Err(ConfigError::MissingCollaborator {
                    collaborator,
                    manufacturer: payload.manufacturer,
                    step: spec.kind,
                }
                .into());
            }
        }

        Ok(())
    }

    async fn execute(
        &self,
        store: &EventStore,
        mut run: Run,
        specs: &[&StepSpec],
        kept: &[StepResult],
    ) -> Result<Run> {
        let lanes = run.payload.lanes();
        let run_id = run.id;

        let outcomes: Vec<Vec<StepResult>> = stream::iter(lanes)
            .map(|lane| self.run_lane(store, run_id, lane, specs, kept))
            .buffered(self.ctx.settings.lane_concurrency)
            .collect()
            .await;

        for result in outcomes.into_iter().flatten() {
            run.record(result);
        }

        run.complete();
        let event = Event::new(
            run_id,
            EventType::RunCompleted,
            format!("{}:complete", run_id),
            format!("Run finished: {:?}", run.state),
            StepStatus::Succeeded,
        )
        .with_data(run.report());
        self.journal(store, &event).await;

        info!(%run_id, state = ?run.state, "Run finished");
        Ok(run)
    }

    /// Append to the run journal. A failed append is logged and the run
    /// carries on with its in-memory state.
    async fn journal(&self, store: &EventStore, event: &Event) {
        if let Err(e) = store.append(event).await {
            error!(
                event_type = ?event.event_type,
                key = %event.idempotency_key,
                error = %format!("{:#}", e),
                "Failed to journal event"
            );
        }
    }

    /// Execute the selected steps of one lane in order
    #[instrument(skip(self, store, specs, kept), fields(lane = %lane))]
    async fn run_lane(
        &self,
        store: &EventStore,
        run_id: Uuid,
        lane: Lane,
        specs: &[&StepSpec],
        kept: &[StepResult],
    ) -> Vec<StepResult> {
        let manufacturer = lane.manufacturer;
        let mut results = Vec::with_capacity(specs.len());

        let (lock, mut halted) = match LaneLock::try_acquire(&self.locks_dir, &lane) {
            Ok(Some(lock)) => (Some(lock), None),
            Ok(None) => {
                warn!("Lane is locked by another process");
                (None, Some(format!("Lane {} is locked by another run", lane)))
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Lane lock unavailable");
                (None, Some(format!("Could not lock lane {}: {:#}", lane, e)))
            }
        };
        let mut locked = halted.is_some();

        for spec in specs {
            let step_name = spec.step_name(manufacturer);
            let key = generate_idempotency_key(run_id, &lane, spec.kind, &step_name);

            if let Some(previous) = kept.iter().find(|r| r.lane() == lane && r.step == spec.kind) {
                info!(step = %spec.kind, status = %previous.status, "Keeping recorded result");
                results.push(previous.clone());
                continue;
            }

            if let Some(reason) = &halted {
                // The first step of a locked lane is the one that could not start
                let result = if locked {
                    locked = false;
                    StepResult::failed(spec.kind, &lane, step_name, reason.clone())
                } else {
                    StepResult::skipped(spec.kind, &lane, step_name, reason.clone())
                };
                self.journal(store, &Event::step_finished(run_id, key, &result)).await;
                results.push(result);
                continue;
            }

            let Some(step) = self.steps.get(&spec.kind) else {
                let error = PipelineError::NotImplemented(spec.kind).to_string();
                let result = StepResult::failed(spec.kind, &lane, step_name, error);
                self.journal(store, &Event::step_finished(run_id, key, &result)).await;
                halted = Some(format!("Upstream step '{}' failed", spec.kind));
                results.push(result);
                continue;
            };
            let invocation = StepInvocation {
                lane,
                step: spec.kind,
                step_name,
                input_step_name: self.pipeline.input_name(spec, manufacturer),
            };

            let started = Event::new(
                run_id,
                EventType::StepStarted,
                key.clone(),
                format!("Step '{}' started", spec.kind),
                StepStatus::Running,
            )
            .for_step(lane, spec.kind);
            self.journal(store, &started).await;

            let result = run_step(step.as_ref(), &self.ctx, &invocation).await;
            self.journal(store, &Event::step_finished(run_id, key, &result)).await;

            if result.status == StepStatus::Failed
                && self.ctx.settings.failure_policy == FailurePolicy::HaltLane
            {
                halted = Some(format!("Upstream step '{}' failed", spec.kind));
            }
            results.push(result);
        }

        drop(lock);
        results
    }
}
