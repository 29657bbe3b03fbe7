//! Step identities, statuses and the result summary every step returns.

use serde::{Deserialize, Serialize};

use super::lane::{Lane, Manufacturer, ProductType};

/// The six stages of a lane, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    ScrapeSeries,
    ScrapeProducts,
    DownloadAssets,
    ExtractText,
    StructureData,
    Validate,
}

impl StepKind {
    pub const ALL: [StepKind; 6] = [
        Self::ScrapeSeries,
        Self::ScrapeProducts,
        Self::DownloadAssets,
        Self::ExtractText,
        Self::StructureData,
        Self::Validate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScrapeSeries => "scrape_series",
            Self::ScrapeProducts => "scrape_products",
            Self::DownloadAssets => "download_assets",
            Self::ExtractText => "extract_text",
            Self::StructureData => "structure_data",
            Self::Validate => "validate",
        }
    }

    /// Report label (`{product_type}_{label}`)
    pub fn label(&self) -> &'static str {
        match self {
            Self::ScrapeSeries => "series",
            Self::ScrapeProducts => "products",
            Self::DownloadAssets => "pdfs",
            Self::ExtractText => "extracted",
            Self::StructureData => "structured",
            Self::Validate => "validated",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted || k.label() == wanted)
            .ok_or_else(|| anyhow::anyhow!("Unknown step: {}", s))
    }
}

/// Status of a step invocation
///
/// `Pending → Running → {Succeeded, PartialSuccess, Failed}`; `Skipped` marks
/// steps never started because an earlier step of the lane failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    PartialSuccess,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the step left a usable output artifact
    pub fn produced_output(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartialSuccess)
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Per-unit accounting. `total = count + skipped + failures`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    /// Units considered
    pub total: usize,
    /// Units present in the output
    pub count: usize,
    /// Of `count`, units satisfied by earlier work (hash index, cache, existing file)
    pub reused: usize,
    /// Units that do not apply (e.g. no datasheet link)
    pub skipped: usize,
    /// Units that failed and are absent from the output
    pub failures: usize,
}

impl UnitCounts {
    pub fn processed(&self) -> usize {
        self.count + self.failures
    }
}

/// JSON-serializable summary returned by every step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub status: StepStatus,
    pub step: StepKind,
    pub manufacturer: Manufacturer,
    pub product_type: ProductType,

    /// Mutable-store namespace the step writes to
    pub step_name: String,

    /// Primary output artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    #[serde(flatten)]
    pub counts: UnitCounts,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub duration_ms: u64,
}

impl StepResult {
    fn base(step: StepKind, lane: &Lane, step_name: String, status: StepStatus) -> Self {
        Self {
            success: status.produced_output(),
            status,
            step,
            manufacturer: lane.manufacturer,
            product_type: lane.product_type,
            step_name,
            file_name: None,
            counts: UnitCounts::default(),
            error: None,
            duration_ms: 0,
        }
    }

    /// Result derived from unit counts: any failure makes it partial, no output makes it failed
    pub fn from_counts(
        step: StepKind,
        lane: &Lane,
        step_name: String,
        file_name: String,
        counts: UnitCounts,
        first_error: Option<String>,
    ) -> Self {
        let status = if counts.count == 0 {
            StepStatus::Failed
        } else if counts.failures > 0 {
            StepStatus::PartialSuccess
        } else {
            StepStatus::Succeeded
        };

        let error = match status {
            StepStatus::Failed => Some(
                first_error
                    .map(|e| format!("No units succeeded: {}", e))
                    .unwrap_or_else(|| "No units succeeded".to_string()),
            ),
            _ => first_error,
        };

        let mut result = Self::base(step, lane, step_name, status);
        result.counts = counts;
        result.error = error;
        if status.produced_output() {
            result.file_name = Some(file_name);
        }
        result
    }

    /// A step that could not run at all
    pub fn failed(step: StepKind, lane: &Lane, step_name: String, error: impl Into<String>) -> Self {
        let mut result = Self::base(step, lane, step_name, StepStatus::Failed);
        result.error = Some(error.into());
        result
    }

    /// A step not started because an earlier step of the lane failed
    pub fn skipped(step: StepKind, lane: &Lane, step_name: String, reason: impl Into<String>) -> Self {
        let mut result = Self::base(step, lane, step_name, StepStatus::Skipped);
        result.error = Some(reason.into());
        result
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn lane(&self) -> Lane {
        Lane::new(self.manufacturer, self.product_type)
    }

    /// Report key, e.g. `dc-dc-converters_pdfs`
    pub fn report_key(&self) -> String {
        format!("{}_{}", self.product_type, self.step.label())
    }
}
