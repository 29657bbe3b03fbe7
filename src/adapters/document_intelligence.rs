//! Layout analysis through the Azure Document Intelligence REST API.
//!
//! Submitting a document returns `202 Accepted` with an `Operation-Location`
//! header; the result is polled from there until the operation settles or
//! the poll budget runs out.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info};

use super::{ExternalError, TextExtractor};
use crate::config::{ConfigError, DocumentIntelligenceSettings};

const SERVICE: &str = "document-intelligence";
const KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

pub struct DocumentIntelligenceClient {
    client: reqwest::Client,
    analyze_url: String,
    key: String,
    poll_interval: Duration,
    max_polls: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatus {
    status: String,
    #[serde(default)]
    analyze_result: Option<AnalyzeResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResult {
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    lines: Vec<Line>,
}

#[derive(Debug, Deserialize)]
struct Line {
    content: String,
}

impl AnalyzeResult {
    /// One line per text line, a blank line after every page
    fn text(&self) -> String {
        let mut text = String::new();
        for page in &self.pages {
            for line in &page.lines {
                text.push_str(&line.content);
                text.push('\n');
            }
            text.push('\n');
        }
        text
    }
}

impl DocumentIntelligenceClient {
    pub fn new(
        endpoint: &str,
        key: &str,
        settings: &DocumentIntelligenceSettings,
        request_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if settings.max_polls == 0 {
            return Err(ConfigError::Invalid {
                setting: "document_intelligence.max_polls",
                reason: "must be at least 1".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                setting: "document intelligence client",
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            analyze_url: format!(
                "{}/documentintelligence/documentModels/prebuilt-layout:analyze?api-version={}",
                endpoint.trim_end_matches('/'),
                settings.api_version
            ),
            key: key.to_string(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            max_polls: settings.max_polls,
        })
    }

    async fn submit(&self, document: &[u8]) -> Result<String, ExternalError> {
        let body = serde_json::json!({
            "base64Source": base64::engine::general_purpose::STANDARD.encode(document),
        });

        let response = self
            .client
            .post(&self.analyze_url)
            .header(KEY_HEADER, &self.key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExternalError::from_reqwest(SERVICE, &e))?;

        let status = response.status();
        if status.as_u16() != 202 {
            let body = response.text().await.unwrap_or_default();
            if status.is_success() {
                return Err(ExternalError::malformed(
                    SERVICE,
                    format!("expected 202 Accepted, got {}", status),
                ));
            }
            return Err(ExternalError::from_status(SERVICE, status.as_u16(), &body));
        }

        response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ExternalError::malformed(SERVICE, "missing Operation-Location header"))
    }

    async fn poll(&self, operation_url: &str) -> Result<OperationStatus, ExternalError> {
        let response = self
            .client
            .get(operation_url)
            .header(KEY_HEADER, &self.key)
            .send()
            .await
            .map_err(|e| ExternalError::from_reqwest(SERVICE, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalError::from_status(SERVICE, status.as_u16(), &body));
        }

        response
            .json::<OperationStatus>()
            .await
            .map_err(|e| ExternalError::malformed(SERVICE, e.to_string()))
    }
}

#[async_trait]
impl TextExtractor for DocumentIntelligenceClient {
    async fn extract_text(&self, document: &[u8]) -> Result<String, ExternalError> {
        let operation_url = self.submit(document).await?;
        debug!(operation = %operation_url, "Analysis submitted");

        for attempt in 1..=self.max_polls {
            let status = self.poll(&operation_url).await?;
            match status.status.as_str() {
                "succeeded" => {
                    let result = status.analyze_result.ok_or_else(|| {
                        ExternalError::malformed(SERVICE, "succeeded without analyzeResult")
                    })?;
                    let text = result.text();
                    info!(pages = result.pages.len(), chars = text.len(), polls = attempt, "Layout analysis finished");
                    return Ok(text);
                }
                "failed" => {
                    let detail = status
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no error detail".to_string());
                    return Err(ExternalError::rejected(
                        SERVICE,
                        format!("analysis failed: {}", detail),
                    ));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }

        Err(ExternalError::transient(
            SERVICE,
            format!("analysis still running after {} polls", self.max_polls),
        ))
    }

    fn time_budget(&self, per_request: Duration) -> Duration {
        per_request * 2 + self.poll_interval * self.max_polls
    }
}
