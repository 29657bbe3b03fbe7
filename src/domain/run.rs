//! Run state and reconstruction from journal events.
//!
//! A Run is one execution of the step sequence for every lane of a trigger
//! payload. Its only durable trace besides the artifacts is the journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType};
use super::lane::{Lane, ProductType, TriggerPayload};
use super::result::{StepKind, StepResult, StepStatus};

/// A pipeline execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Payload the run was triggered with
    pub payload: TriggerPayload,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run completed (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Latest result per (lane, step), in the order steps finished
    pub results: Vec<StepResult>,
}

impl Run {
    /// Create a new run for a payload
    pub fn new(id: Uuid, payload: TriggerPayload) -> Self {
        Self {
            id,
            payload,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            results: Vec::new(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;
        if first_event.event_type != EventType::RunStarted {
            return None;
        }

        let payload = first_event
            .data
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())?;

        let mut run = Self::new(first_event.run_id, payload);
        run.started_at = first_event.timestamp;

        for event in &events[1..] {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
            }
            EventType::RunResumed => {
                self.state = RunState::Running;
                self.completed_at = None;
            }
            EventType::RunCompleted => {
                self.state = self.final_state();
                self.completed_at = Some(event.timestamp);
            }
            EventType::StepStarted => {}
            EventType::StepCompleted | EventType::StepFailed | EventType::StepSkipped => {
                if let Some(result) = event.step_result() {
                    self.record(result);
                }
            }
        }
    }

    /// Store a step result, replacing any earlier one for the same lane and step
    pub fn record(&mut self, result: StepResult) {
        self.results
            .retain(|r| !(r.lane() == result.lane() && r.step == result.step));
        self.results.push(result);
    }

    pub fn result(&self, lane: &Lane, step: StepKind) -> Option<&StepResult> {
        self.results
            .iter()
            .find(|r| r.lane() == *lane && r.step == step)
    }

    /// Lookup by product type, the key the report is organised by
    pub fn result_for(&self, product_type: ProductType, step: StepKind) -> Option<&StepResult> {
        self.results
            .iter()
            .find(|r| r.product_type == product_type && r.step == step)
    }

    /// Mark the run as finished
    pub fn complete(&mut self) {
        self.state = self.final_state();
        self.completed_at = Some(Utc::now());
    }

    fn final_state(&self) -> RunState {
        let failed = self
            .results
            .iter()
            .filter(|r| !r.status.produced_output())
            .count();
        let partial = self
            .results
            .iter()
            .filter(|r| r.status == StepStatus::PartialSuccess)
            .count();

        if failed == 0 && partial == 0 {
            RunState::Completed
        } else {
            RunState::CompletedWithFailures { failed, partial }
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Structured report keyed `"{product_type}_{label}"`
    pub fn report(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for result in &self.results {
            if let Ok(value) = serde_json::to_value(result) {
                map.insert(result.report_key(), value);
            }
        }
        serde_json::Value::Object(map)
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing (or interrupted before completion)
    Running,

    /// Every step of every lane succeeded
    Completed,

    /// Finished, but some steps failed, were skipped or lost units
    CompletedWithFailures { failed: usize, partial: usize },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}
