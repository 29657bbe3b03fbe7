//! Journal events for pipeline runs.
//!
//! Every run appends its progress to an append-only log. The orchestrator
//! performs no I/O besides this journal, so replaying it reproduces the
//! run's sequencing after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lane::Lane;
use super::result::{StepKind, StepResult, StepStatus};

/// A single event in the append-only run journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Lane the event concerns (absent for run-level events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<Lane>,

    /// Step the event concerns (absent for run-level events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepKind>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{step}:{envelope_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Status of the step/run at this point
    pub status: StepStatus,

    /// Time taken in milliseconds (for finished steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Trigger payload (run start) or step result (step end)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            lane: None,
            step: None,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
            data: None,
        }
    }

    /// Event recording the end of a step, carrying its full result
    pub fn step_finished(run_id: Uuid, idempotency_key: String, result: &StepResult) -> Self {
        let event_type = match result.status {
            StepStatus::Skipped => EventType::StepSkipped,
            StepStatus::Failed => EventType::StepFailed,
            _ => EventType::StepCompleted,
        };

        let mut event = Self::new(
            run_id,
            event_type,
            idempotency_key,
            format!(
                "Step '{}' {}: {} of {} units",
                result.step, result.status, result.counts.count, result.counts.total
            ),
            result.status,
        )
        .for_step(result.lane(), result.step)
        .with_duration(result.duration_ms);

        if let Some(ref error) = result.error {
            event = event.with_error(error.clone());
        }
        event.data = serde_json::to_value(result).ok();
        event
    }

    pub fn for_step(mut self, lane: Lane, step: StepKind) -> Self {
        self.lane = Some(lane);
        self.step = Some(step);
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Step result carried by a step-end event
    pub fn step_result(&self) -> Option<StepResult> {
        self.data
            .as_ref()
            .and_then(|d| serde_json::from_value(d.clone()).ok())
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started (data: trigger payload)
    RunStarted,

    /// Every lane of the run has been processed
    RunCompleted,

    /// A run was picked up again after an interruption
    RunResumed,

    /// A step has started execution
    StepStarted,

    /// A step finished with usable output (data: step result)
    StepCompleted,

    /// A step finished without usable output (data: step result)
    StepFailed,

    /// A step was not started because its lane halted (data: step result)
    StepSkipped,
}
