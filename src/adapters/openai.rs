//! Structured extraction over an OpenAI-compatible chat-completions API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{ExternalError, StructuredExtractor};
use crate::config::{ConfigError, OpenAiSettings};

const SERVICE: &str = "openai";

const INSTRUCTIONS: &str = "You are an assistant specialized in extracting technical specifications from datasheets of AC/DC and DC/DC converters. \
You will be prompted with the contents of a PDF datasheet. Your task is to extract key performance metrics, \
technical parameters, protection features, and other relevant specifications from the datasheet. \
For each extracted metric, also provide the unit of measurement (e.g., 'V' for voltage, 'A' for current) \
and, where applicable, the condition under which the metric was measured (e.g., nominal voltage, full load, etc.). \
If the value is given in a scaled form (e.g., '3.3kV', '5mA'), extract the full value in standard units \
(e.g., '3300V', '0.005A'). Additionally, identify time-dependent parameters like recovery time, voltage dips, \
or isolation time and provide the time in milliseconds, seconds, etc. as appropriate. \
Extract as many details as possible, including protection types (e.g., OCP, OVP), input/output voltage ranges, \
load regulation, and operational temperature ranges.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionsExtractor {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl ChatCompletionsExtractor {
    pub fn new(settings: &OpenAiSettings, api_key: &str) -> Result<Self, ConfigError> {
        if api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential {
                setting: "OPENAI_API_KEY",
                needed_by: "structured extraction".to_string(),
            });
        }

        // The per-call deadline is enforced by the caller
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::Invalid {
                setting: "openai client",
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: settings.model.clone(),
        })
    }

    /// System prompt: instructions followed by the product context
    pub fn system_prompt(context: &serde_json::Value, count: usize) -> String {
        let context = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
        format!(
            "{}\n\nYour goal is to capture all relevant specifications and operational details from the datasheet \
in a clear and structured format for {} following products: \n\n```json\n{}\n```",
            INSTRUCTIONS, count, context
        )
    }
}

#[async_trait]
impl StructuredExtractor for ChatCompletionsExtractor {
    async fn extract(
        &self,
        text: &str,
        context: &serde_json::Value,
        count: usize,
    ) -> Result<String, ExternalError> {
        let system = Self::system_prompt(context, count);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        debug!(model = %self.model, chars = text.len(), products = count, "Requesting structured extraction");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExternalError::from_reqwest(SERVICE, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalError::from_status(SERVICE, status.as_u16(), &body));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExternalError::malformed(SERVICE, e.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExternalError::malformed(SERVICE, "response has no message content"))?;

        info!(model = %self.model, chars = content.len(), "Structured extraction received");
        Ok(content)
    }
}
