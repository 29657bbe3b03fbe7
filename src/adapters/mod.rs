//! Adapter interfaces for external systems.
//!
//! Steps never talk to the network or a database directly; they go through
//! these collaborators, registered once per process in `Collaborators`:
//! - `Scraper`: per-manufacturer series and product listings
//! - `Downloader`: datasheet and image fetches
//! - `TextExtractor`: PDF → text
//! - `StructuredExtractor`: text + context → converter JSON
//! - `FieldExtractor`: per-manufacturer regex fields from text
//! - `RecordSink`: relational loader for validated output

pub mod document_intelligence;
pub mod fields;
pub mod http;
pub mod openai;
pub mod sqlite;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::config::ConfigError;
use crate::core::pipeline::RetryPolicy;
use crate::domain::{Lane, Manufacturer, Record, StepKind};

pub use document_intelligence::DocumentIntelligenceClient;
pub use fields::RegexFieldExtractor;
pub use http::HttpDownloader;
pub use openai::ChatCompletionsExtractor;
pub use sqlite::SqliteSink;

/// Failure of a single external call
#[derive(Debug, Error)]
pub enum ExternalError {
    /// Timeouts, connection failures, 5xx, 429: worth another attempt
    #[error("Transient failure from {service}: {message}")]
    Transient { service: String, message: String },

    /// The service refused the request (4xx other than 429)
    #[error("{service} rejected the request: {message}")]
    Rejected { service: String, message: String },

    /// The service answered with something unusable
    #[error("Malformed response from {service}: {message}")]
    Malformed { service: String, message: String },
}

impl ExternalError {
    pub fn transient(service: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn rejected(service: &str, message: impl Into<String>) -> Self {
        Self::Rejected {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed(service: &str, message: impl Into<String>) -> Self {
        Self::Malformed {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Classify an HTTP status code
    pub fn from_status(service: &str, status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, truncate(body, 200));
        if status == 429 || (500..600).contains(&status) {
            Self::transient(service, message)
        } else {
            Self::rejected(service, message)
        }
    }

    /// Classify a transport-level failure
    pub fn from_reqwest(service: &str, err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(service, status.as_u16(), &err.to_string());
        }
        if err.is_decode() {
            return Self::malformed(service, err.to_string());
        }
        // Timeouts, connects, bodies cut short
        Self::transient(service, err.to_string())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push('…');
    }
    out
}

/// Run `call` under a timeout, retrying transient failures with backoff
pub async fn with_retry<T, F, Fut>(
    service: &str,
    policy: &RetryPolicy,
    timeout: Duration,
    mut call: F,
) -> Result<T, ExternalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExternalError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ExternalError::transient(
                service,
                format!("timed out after {:?}", timeout),
            )),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    service,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "External call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per-manufacturer listing scraper
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Series rows for a product type (one row per series, with at least a
    /// name and a link)
    async fn scrape_series(&self, lane: &Lane) -> Result<Vec<Record>, ExternalError>;

    /// Product rows for one series row
    async fn scrape_products(&self, lane: &Lane, series: &Record) -> Result<Vec<Record>, ExternalError>;
}

/// Fetches a URL's full body
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ExternalError>;
}

/// Turns a document (PDF bytes) into plain text
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, document: &[u8]) -> Result<String, ExternalError>;

    /// Upper bound for one `extract_text` call when each request may take
    /// `per_request`. Polling extractors need more than a single request.
    fn time_budget(&self, per_request: Duration) -> Duration {
        per_request
    }
}

/// Language-model call: `(document text, JSON context, product count)` → raw JSON
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        context: &serde_json::Value,
        count: usize,
    ) -> Result<String, ExternalError>;
}

/// Per-manufacturer flat field extraction from document text
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, text: &str, reference: &Record) -> Record;
}

/// Destination for validated output
pub trait RecordSink: Send + Sync {
    /// Store one validated entry; returns the number of converters written
    fn load(&self, lane: &Lane, entry: &crate::steps::ValidatedEntry) -> anyhow::Result<usize>;
}

/// Every collaborator a run may need, registered once
#[derive(Clone, Default)]
pub struct Collaborators {
    scrapers: HashMap<Manufacturer, Arc<dyn Scraper>>,
    field_extractors: HashMap<Manufacturer, Arc<dyn FieldExtractor>>,
    downloader: Option<Arc<dyn Downloader>>,
    text_extractor: Option<Arc<dyn TextExtractor>>,
    structured_extractor: Option<Arc<dyn StructuredExtractor>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// The HTTP, document-intelligence and chat-completions clients the
    /// configuration allows, plus the regex field extractors. Scrapers are
    /// registered by the embedding application.
    pub fn from_config(config: &crate::config::ResolvedConfig) -> Result<Self, ConfigError> {
        let mut collaborators = Self::new()
            .with_downloader(Arc::new(HttpDownloader::new(config.pipeline.call_timeout)?));

        for manufacturer in Manufacturer::ALL {
            collaborators = collaborators
                .with_field_extractor(manufacturer, Arc::new(RegexFieldExtractor::for_manufacturer(manufacturer)));
        }

        let di = &config.document_intelligence;
        if let (Some(endpoint), Some(key)) = (&di.endpoint, &di.key) {
            collaborators = collaborators.with_text_extractor(Arc::new(
                DocumentIntelligenceClient::new(endpoint, key, di, config.pipeline.call_timeout)?,
            ));
        }

        if let Some(ref key) = config.openai.api_key {
            collaborators = collaborators.with_structured_extractor(Arc::new(
                ChatCompletionsExtractor::new(&config.openai, key)?,
            ));
        }

        Ok(collaborators)
    }

    pub fn with_scraper(mut self, manufacturer: Manufacturer, scraper: Arc<dyn Scraper>) -> Self {
        self.scrapers.insert(manufacturer, scraper);
        self
    }

    pub fn with_field_extractor(
        mut self,
        manufacturer: Manufacturer,
        extractor: Arc<dyn FieldExtractor>,
    ) -> Self {
        self.field_extractors.insert(manufacturer, extractor);
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_text_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.text_extractor = Some(extractor);
        self
    }

    pub fn with_structured_extractor(mut self, extractor: Arc<dyn StructuredExtractor>) -> Self {
        self.structured_extractor = Some(extractor);
        self
    }

    pub fn scraper(&self, manufacturer: Manufacturer) -> Option<Arc<dyn Scraper>> {
        self.scrapers.get(&manufacturer).cloned()
    }

    pub fn field_extractor(&self, manufacturer: Manufacturer) -> Option<Arc<dyn FieldExtractor>> {
        self.field_extractors.get(&manufacturer).cloned()
    }

    pub fn downloader(&self) -> Option<Arc<dyn Downloader>> {
        self.downloader.clone()
    }

    pub fn text_extractor(&self) -> Option<Arc<dyn TextExtractor>> {
        self.text_extractor.clone()
    }

    pub fn structured_extractor(&self) -> Option<Arc<dyn StructuredExtractor>> {
        self.structured_extractor.clone()
    }

    /// Collaborator a step needs for a manufacturer but lacks, if any
    pub fn missing_for(&self, step: StepKind, manufacturer: Manufacturer) -> Option<&'static str> {
        let present = match step {
            StepKind::ScrapeSeries | StepKind::ScrapeProducts => {
                self.scrapers.contains_key(&manufacturer)
            }
            StepKind::DownloadAssets => self.downloader.is_some(),
            StepKind::ExtractText => self.text_extractor.is_some(),
            StepKind::StructureData => self.structured_extractor.is_some(),
            StepKind::Validate => self.field_extractors.contains_key(&manufacturer),
        };

        if present {
            return None;
        }

        Some(match step {
            StepKind::ScrapeSeries | StepKind::ScrapeProducts => "scraper",
            StepKind::DownloadAssets => "downloader",
            StepKind::ExtractText => {
                "text extractor (set DOCUMENT_INTELLIGENCE_ENDPOINT and DOCUMENT_INTELLIGENCE_KEY)"
            }
            StepKind::StructureData => "structured extractor (set OPENAI_API_KEY)",
            StepKind::Validate => "field extractor",
        })
    }
}
