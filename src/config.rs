//! Configuration for powerflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (POWERFLOW_HOME, OPENAI_API_KEY, OPENAI_BASE_URL,
//!    OPENAI_MODEL, DOCUMENT_INTELLIGENCE_ENDPOINT, DOCUMENT_INTELLIGENCE_KEY)
//! 2. Config file (.powerflow/config.yaml)
//! 3. Defaults (~/.powerflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .powerflow/config.yaml
//! - Paths in config file are relative to the .powerflow directory
//!
//! The resolved configuration is built once by the entry point and passed
//! down explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheKeyMode;
use crate::core::pipeline::RetryPolicy;
use crate::domain::{Manufacturer, StepKind};

/// Configuration problems. Fatal before any step runs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid setting '{setting}': {reason}")]
    Invalid {
        setting: &'static str,
        reason: String,
    },

    #[error("Missing {setting} (required by {needed_by})")]
    MissingCredential {
        setting: &'static str,
        needed_by: String,
    },

    #[error("No {collaborator} registered for {manufacturer} (required by step '{step}')")]
    MissingCollaborator {
        collaborator: &'static str,
        manufacturer: Manufacturer,
        step: StepKind,
    },

    #[error("Could not determine a home directory; set POWERFLOW_HOME")]
    NoHomeDirectory,
}

/// What a lane does after one of its steps fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the remaining steps of the lane as skipped
    HaltLane,

    /// Run the remaining steps anyway
    ContinueOnFailure,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::HaltLane
    }
}

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub openai: Option<OpenAiConfig>,
    #[serde(default)]
    pub document_intelligence: Option<DocumentIntelligenceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to the .powerflow directory)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    pub checkpoint_interval: Option<usize>,
    pub download_concurrency: Option<usize>,
    pub extraction_concurrency: Option<usize>,
    pub lane_concurrency: Option<usize>,
    pub timeout_seconds: Option<u64>,
    pub retry: Option<RetryPolicy>,
    pub cache_key: Option<CacheKeyMode>,
    pub failure_policy: Option<FailurePolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentIntelligenceConfig {
    pub endpoint: Option<String>,
    pub key: Option<String>,
    pub api_version: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub max_polls: Option<u32>,
}

/// Execution settings shared by every step
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Flush partial output every N completed units
    pub checkpoint_interval: usize,
    /// Concurrent downloads within one step
    pub download_concurrency: usize,
    /// Concurrent text / structured extractions within one step
    pub extraction_concurrency: usize,
    /// Lanes executed at the same time
    pub lane_concurrency: usize,
    /// Bound on any single external call
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub cache_key: CacheKeyMode,
    pub failure_policy: FailurePolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            download_concurrency: 4,
            extraction_concurrency: 1,
            lane_concurrency: 1,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            cache_key: CacheKeyMode::Full,
            failure_policy: FailurePolicy::HaltLane,
        }
    }
}

impl PipelineSettings {
    fn apply(&mut self, file: PipelineConfig) {
        if let Some(v) = file.checkpoint_interval {
            self.checkpoint_interval = v;
        }
        if let Some(v) = file.download_concurrency {
            self.download_concurrency = v;
        }
        if let Some(v) = file.extraction_concurrency {
            self.extraction_concurrency = v;
        }
        if let Some(v) = file.lane_concurrency {
            self.lane_concurrency = v;
        }
        if let Some(v) = file.timeout_seconds {
            self.call_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.retry {
            self.retry = v;
        }
        if let Some(v) = file.cache_key {
            self.cache_key = v;
        }
        if let Some(v) = file.failure_policy {
            self.failure_policy = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("checkpoint_interval", self.checkpoint_interval),
            ("download_concurrency", self.download_concurrency),
            ("extraction_concurrency", self.extraction_concurrency),
            ("lane_concurrency", self.lane_concurrency),
        ];
        for (setting, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    setting,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                setting: "retry.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if let CacheKeyMode::Prefix { chars: 0 } = self.cache_key {
            return Err(ConfigError::Invalid {
                setting: "cache_key.chars",
                reason: "prefix length must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Chat-completions endpoint used for structured extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-2024-08-06".to_string(),
        }
    }
}

/// Layout-analysis service used for text extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentIntelligenceSettings {
    pub endpoint: Option<String>,
    pub key: Option<String>,
    pub api_version: String,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

impl Default for DocumentIntelligenceSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            key: None,
            api_version: "2023-07-31".to_string(),
            poll_interval_ms: 1000,
            max_polls: 50,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to powerflow home (store, runs, locks, inbox)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub pipeline: PipelineSettings,
    pub openai: OpenAiSettings,
    pub document_intelligence: DocumentIntelligenceSettings,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`, ignoring files and environment
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            config_file: None,
            pipeline: PipelineSettings::default(),
            openai: OpenAiSettings::default(),
            document_intelligence: DocumentIntelligenceSettings::default(),
        }
    }

    /// Load from the process environment and the working directory
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        Self::load_from(&cwd, |name| std::env::var(name).ok())
    }

    /// Load starting the config file search at `start_dir`, reading
    /// environment variables through `env`
    pub fn load_from<F>(start_dir: &Path, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_file = find_config_file(start_dir);
        let file = match config_file {
            Some(ref path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };

        // Home: env, then file (relative to .powerflow/), then ~/.powerflow
        let home = if let Some(env_home) = env("POWERFLOW_HOME") {
            PathBuf::from(env_home)
        } else if let (Some(home_path), Some(config_path)) = (&file.paths.home, &config_file) {
            let base = config_path.parent().unwrap_or(Path::new("."));
            resolve_path(base, home_path)
        } else {
            dirs::home_dir()
                .ok_or(ConfigError::NoHomeDirectory)?
                .join(".powerflow")
        };

        let mut config = Self::with_home(home);
        config.config_file = config_file;
        config.pipeline.apply(file.pipeline);

        if let Some(openai) = file.openai {
            config.openai.api_key = openai.api_key;
            if let Some(url) = openai.base_url {
                config.openai.base_url = url;
            }
            if let Some(model) = openai.model {
                config.openai.model = model;
            }
        }
        if let Some(key) = env("OPENAI_API_KEY") {
            config.openai.api_key = Some(key);
        }
        if let Some(url) = env("OPENAI_BASE_URL") {
            config.openai.base_url = url;
        }
        if let Some(model) = env("OPENAI_MODEL") {
            config.openai.model = model;
        }

        if let Some(di) = file.document_intelligence {
            let settings = &mut config.document_intelligence;
            settings.endpoint = di.endpoint;
            settings.key = di.key;
            if let Some(v) = di.api_version {
                settings.api_version = v;
            }
            if let Some(v) = di.poll_interval_ms {
                settings.poll_interval_ms = v;
            }
            if let Some(v) = di.max_polls {
                settings.max_polls = v;
            }
        }
        if let Some(endpoint) = env("DOCUMENT_INTELLIGENCE_ENDPOINT") {
            config.document_intelligence.endpoint = Some(endpoint);
        }
        if let Some(key) = env("DOCUMENT_INTELLIGENCE_KEY") {
            config.document_intelligence.key = Some(key);
        }

        config.pipeline.validate()?;
        Ok(config)
    }

    /// Artifact store root ($POWERFLOW_HOME/store)
    pub fn store_dir(&self) -> PathBuf {
        self.home.join("store")
    }

    /// Run journals ($POWERFLOW_HOME/runs)
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    /// Lane lock files ($POWERFLOW_HOME/locks)
    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }

    /// Trigger payload drop folder ($POWERFLOW_HOME/inbox)
    pub fn inbox_dir(&self) -> PathBuf {
        self.home.join("inbox")
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".powerflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}
