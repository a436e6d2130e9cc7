use crate::error::ConfigError;
use crate::models::ExperimentKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Experiment tracker connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingConfig {
    /// Base URL of the MLflow tracking server
    #[serde(default = "default_tracking_uri")]
    pub uri: String,
    /// Only experiments whose name starts with this prefix are evaluation experiments
    #[serde(default = "default_experiment_prefix")]
    pub experiment_prefix: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            uri: default_tracking_uri(),
            experiment_prefix: default_experiment_prefix(),
        }
    }
}

/// RAG chain endpoint and the retrieval configuration it was built with
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantConfig {
    /// Base URL of the LangServe-style chain (`/invoke` is appended)
    pub endpoint: String,
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: i64,
}

/// LLM judge used by the batch evaluator
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraderConfig {
    /// OpenAI-compatible API endpoint
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    pub env_var_api_key: String,
    /// Judge model
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    /// Rate limit for judge requests per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit_rps: f64,
}

/// Bounds of every criterion score. No defaults: the judge scale must be stated.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ScoreScale {
    pub min: f64,
    pub max: f64,
}

impl ScoreScale {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // zero marks an unscored criterion, so it has to sit below the top of the scale
        let finite = self.min.is_finite() && self.max.is_finite();
        if !finite || self.min >= self.max || self.max <= 0.0 {
            return Err(ConfigError::InvalidScoreScale {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub fn clamp(&self, score: f64) -> f64 {
        score.clamp(self.min, self.max)
    }
}

/// Batch evaluation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,
    #[serde(default = "default_mode")]
    pub mode: ExperimentKind,
    /// Optional local path to store the batch summary as JSON
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            dataset_path: default_dataset_path(),
            mode: default_mode(),
            storage_path: None,
        }
    }
}

/// Reporting settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Images shown in the summary view, if present on disk
    #[serde(default = "default_evidence_images")]
    pub evidence_images: Vec<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            evidence_images: default_evidence_images(),
        }
    }
}

fn default_tracking_uri() -> String {
    "http://localhost:5000".to_string()
}

fn default_experiment_prefix() -> String {
    "eval_".to_string()
}

fn default_prompt_version() -> String {
    "v2_resumido_directo".to_string()
}

fn default_chunk_size() -> i64 {
    1024
}

fn default_chunk_overlap() -> i64 {
    100
}

fn default_rate_limit() -> f64 {
    10.0
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("tests/eval_dataset.json")
}

fn default_mode() -> ExperimentKind {
    ExperimentKind::Criteria
}

fn default_evidence_images() -> Vec<PathBuf> {
    vec![
        PathBuf::from("evidencias/comparativa_experimentos_chunk_size.png"),
        PathBuf::from("evidencias/comparativa_tipo_prompt.png"),
    ]
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub tracking: TrackingConfig,
    pub assistant: AssistantConfig,
    pub grader: GraderConfig,
    pub scores: ScoreScale,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to load config: {}", path.display()))
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.scores.validate()?;
        if self.grader.rate_limit_rps.is_nan() {
            return Err(ConfigError::InvalidRateLimit);
        }
        Ok(())
    }

    /// Apply `PROMPT_VERSION`, `CHUNK_SIZE`, `CHUNK_OVERLAP` and `MLFLOW_TRACKING_URI`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(version) = lookup("PROMPT_VERSION") {
            self.assistant.prompt_version = version;
        }
        if let Some(size) = env_integer(&lookup, "CHUNK_SIZE")? {
            self.assistant.chunk_size = size;
        }
        if let Some(overlap) = env_integer(&lookup, "CHUNK_OVERLAP")? {
            self.assistant.chunk_overlap = overlap;
        }
        if let Some(uri) = lookup("MLFLOW_TRACKING_URI") {
            self.tracking.uri = uri;
        }
        Ok(())
    }
}

fn env_integer<F>(lookup: &F, name: &str) -> Result<Option<i64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvInteger {
                name: name.to_string(),
                value,
            }),
        None => Ok(None),
    }
}
