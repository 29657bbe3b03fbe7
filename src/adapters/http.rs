//! Plain HTTP downloader for datasheets and product images.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Downloader, ExternalError};
use crate::config::ConfigError;

const SERVICE: &str = "http";

/// Browser-like agent; some manufacturer CDNs refuse unknown clients
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ConfigError::Invalid {
                setting: "http client",
                reason: e.to_string(),
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str) -> Result<Vec<u8>, ExternalError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExternalError::from_reqwest(SERVICE, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalError::from_status(SERVICE, status.as_u16(), &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExternalError::from_reqwest(SERVICE, &e))?;

        debug!(url, bytes = bytes.len(), "Downloaded");
        Ok(bytes.to_vec())
    }
}
