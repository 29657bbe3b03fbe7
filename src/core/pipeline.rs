//! Pipeline definition.
//!
//! The pipeline is an explicit linear sequence of step specifications.
//! Each spec declares the step it reads from, so dependencies are checked
//! once when a run starts instead of being discovered from step names.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Manufacturer, StepKind};

/// Errors found while validating a pipeline definition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Pipeline must have at least one step")]
    Empty,

    #[error("Step '{0}' appears more than once")]
    DuplicateStep(StepKind),

    #[error("Steps share the output name '{0}'")]
    DuplicateName(String),

    #[error("Step '{step}' reads from '{input}', which does not run before it")]
    ForwardReference { step: StepKind, input: StepKind },

    #[error("No implementation registered for step '{0}'")]
    NotImplemented(StepKind),

    #[error("Step '{0}' is not part of this pipeline")]
    UnknownStep(StepKind),
}

/// One node of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub kind: StepKind,

    /// Position in the manufacturer's step numbering (`recom3_...`)
    pub ordinal: u8,

    /// Purpose part of the output step name
    pub purpose: String,

    /// Optional namespace suffix (`schema_v11`); bump it to start a fresh cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Step whose output this one reads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<StepKind>,
}

impl StepSpec {
    pub fn new(kind: StepKind, ordinal: u8, purpose: &str) -> Self {
        Self {
            kind,
            ordinal,
            purpose: purpose.to_string(),
            namespace: None,
            input: None,
        }
    }

    pub fn reads(mut self, input: StepKind) -> Self {
        self.input = Some(input);
        self
    }

    pub fn namespaced(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Output step name, e.g. `recom5_structured_product_data/schema_v11`
    pub fn step_name(&self, manufacturer: Manufacturer) -> String {
        let base = format!("{}{}_{}", manufacturer, self.ordinal, self.purpose);
        match &self.namespace {
            Some(ns) => format!("{}/{}", base, ns),
            None => base,
        }
    }
}

/// Ordered step sequence shared by every lane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    steps: Vec<StepSpec>,
}

impl Pipeline {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self { steps }
    }

    /// Series → products → assets → text → structure → validate
    pub fn standard() -> Self {
        Self::new(vec![
            StepSpec::new(StepKind::ScrapeSeries, 1, "scrape_series"),
            StepSpec::new(StepKind::ScrapeProducts, 2, "scrape_products")
                .reads(StepKind::ScrapeSeries),
            StepSpec::new(StepKind::DownloadAssets, 3, "download_pdf")
                .reads(StepKind::ScrapeProducts),
            StepSpec::new(StepKind::ExtractText, 4, "extract_pdf_data")
                .reads(StepKind::DownloadAssets),
            StepSpec::new(StepKind::StructureData, 5, "structured_product_data")
                .namespaced("schema_v11")
                .reads(StepKind::ExtractText),
            StepSpec::new(StepKind::Validate, 9, "validate_data")
                .namespaced("schema_v8")
                .reads(StepKind::StructureData),
        ])
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn spec(&self, kind: StepKind) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.kind == kind)
    }

    /// Output step name of `kind` for a manufacturer
    pub fn step_name(&self, kind: StepKind, manufacturer: Manufacturer) -> Option<String> {
        self.spec(kind).map(|s| s.step_name(manufacturer))
    }

    /// Output step name of the step `spec` reads from
    pub fn input_name(&self, spec: &StepSpec, manufacturer: Manufacturer) -> Option<String> {
        spec.input
            .and_then(|input| self.step_name(input, manufacturer))
    }

    /// Check structure and that every step has an implementation
    pub fn validate(&self, implemented: &[StepKind]) -> Result<(), PipelineError> {
        if self.steps.is_empty() {
            return Err(PipelineError::Empty);
        }

        for (i, spec) in self.steps.iter().enumerate() {
            if self.steps[..i].iter().any(|s| s.kind == spec.kind) {
                return Err(PipelineError::DuplicateStep(spec.kind));
            }

            // Names are compared for one manufacturer; the prefix is shared
            let name = spec.step_name(Manufacturer::default());
            if self.steps[..i]
                .iter()
                .any(|s| s.step_name(Manufacturer::default()) == name)
            {
                return Err(PipelineError::DuplicateName(name));
            }

            if let Some(input) = spec.input {
                if !self.steps[..i].iter().any(|s| s.kind == input) {
                    return Err(PipelineError::ForwardReference {
                        step: spec.kind,
                        input,
                    });
                }
            }

            if !implemented.contains(&spec.kind) {
                return Err(PipelineError::NotImplemented(spec.kind));
            }
        }

        Ok(())
    }

    /// Steps from `start` onwards. Inputs of the first kept step are left in
    /// place: they name artifacts earlier runs (or an operator) produced.
    pub fn starting_at(&self, start: StepKind) -> Result<Vec<&StepSpec>, PipelineError> {
        let idx = self
            .steps
            .iter()
            .position(|s| s.kind == start)
            .ok_or(PipelineError::UnknownStep(start))?;
        Ok(self.steps[idx..].iter().collect())
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::standard()
    }
}

/// Retry policy for transient failures of a single external call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
