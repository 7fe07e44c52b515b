//! Configuration management for LedgerForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Stage executor, retry and intake limits
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Scoring engine tuning
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// Canonical mapper tuning
    #[serde(default)]
    pub mapping: MappingConfig,

    /// Confidence gate weights and thresholds
    #[serde(default)]
    pub gate: GateConfig,

    /// External OCR engine
    #[serde(default)]
    pub ocr: OcrConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Create tables on startup when missing
    #[serde(default)]
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Worker tasks pulling items
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Queue capacity in front of the workers
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Attempts per stage before the item fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Retry delay cap in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Randomization factor applied to retry delays (0 disables jitter)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Per-attempt stage timeout in seconds
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,

    /// Largest accepted source file
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,

    /// MIME types accepted at preprocessing
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,

    /// Interval between reconciliation sweeps
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Age after which an in-progress item counts as stuck. Must exceed
    /// `stage_timeout_secs + max_delay_secs`.
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,

    /// Promote items as soon as they validate
    #[serde(default)]
    pub auto_promote: bool,

    /// Country used when a document carries none
    pub default_country: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassificationConfig {
    /// Below this top score a document stays GENERIC
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,

    /// Score added to the type implied by the batch source type
    #[serde(default = "default_source_hint_weight")]
    pub source_hint_weight: f64,

    /// Apply tenant misclassification history to scores
    #[serde(default = "default_enabled")]
    pub use_feedback: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MappingConfig {
    /// Learned mappings at or above this confidence override the dictionary
    #[serde(default = "default_learned_override_threshold")]
    pub learned_override_threshold: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateConfig {
    #[serde(default = "default_weight_parser")]
    pub parser_weight: f64,

    #[serde(default = "default_weight_classification")]
    pub classification_weight: f64,

    #[serde(default = "default_weight_mapping")]
    pub mapping_weight: f64,

    #[serde(default = "default_weight_validation")]
    pub validation_weight: f64,

    /// Overall score at or above which items auto-approve
    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: f64,

    /// Overall score at or above which items go to review; below blocks promotion
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OcrConfig {
    /// OCR engine endpoint; embedded PDF text only when unset
    pub endpoint: Option<String>,

    pub api_key: Option<String>,

    #[serde(default = "default_ocr_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_workers() -> usize { 4 }
fn default_queue_capacity() -> usize { 1024 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_secs() -> u64 { 600 }
fn default_jitter() -> f64 { 0.5 }
fn default_stage_timeout() -> u64 { 120 }
fn default_max_file_bytes() -> usize { 20 * 1024 * 1024 }
fn default_allowed_mime_types() -> Vec<String> {
    [
        "application/pdf",
        "image/png",
        "image/jpeg",
        "image/tiff",
        "text/csv",
        "application/json",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "application/vnd.ms-excel",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_reconcile_interval() -> u64 { 60 }
fn default_stuck_after() -> u64 { 900 }
fn default_confidence_floor() -> f64 { 0.4 }
fn default_source_hint_weight() -> f64 { 0.2 }
fn default_enabled() -> bool { true }
fn default_learned_override_threshold() -> f64 { 0.7 }
fn default_weight_parser() -> f64 { 0.2 }
fn default_weight_classification() -> f64 { 0.2 }
fn default_weight_mapping() -> f64 { 0.2 }
fn default_weight_validation() -> f64 { 0.4 }
fn default_auto_approve_threshold() -> f64 { 0.85 }
fn default_review_threshold() -> f64 { 0.6 }
fn default_ocr_timeout() -> u64 { 60 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "ledgerforge-ingestion".to_string() }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            jitter: default_jitter(),
            stage_timeout_secs: default_stage_timeout(),
            max_file_bytes: default_max_file_bytes(),
            allowed_mime_types: default_allowed_mime_types(),
            reconcile_interval_secs: default_reconcile_interval(),
            stuck_after_secs: default_stuck_after(),
            auto_promote: false,
            default_country: None,
        }
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            source_hint_weight: default_source_hint_weight(),
            use_feedback: default_enabled(),
        }
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            learned_override_threshold: default_learned_override_threshold(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            parser_weight: default_weight_parser(),
            classification_weight: default_weight_classification(),
            mapping_weight: default_weight_mapping(),
            validation_weight: default_weight_validation(),
            auto_approve_threshold: default_auto_approve_threshold(),
            review_threshold: default_review_threshold(),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_ocr_timeout(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // e.g., APP__PIPELINE__WORKERS=8
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gate = &self.gate;
        if gate.review_threshold > gate.auto_approve_threshold {
            return Err(ConfigError::Message(format!(
                "gate.review_threshold ({}) must not exceed gate.auto_approve_threshold ({})",
                gate.review_threshold, gate.auto_approve_threshold
            )));
        }
        let weights = [
            gate.parser_weight,
            gate.classification_weight,
            gate.mapping_weight,
            gate.validation_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::Message(
                "gate weights must be non-negative with a positive sum".into(),
            ));
        }
        if self.pipeline.max_attempts == 0 || self.pipeline.max_delay_secs == 0 {
            return Err(ConfigError::Message(
                "pipeline.max_attempts and pipeline.max_delay_secs must be positive".into(),
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::Message("pipeline.workers must be positive".into()));
        }
        // A live attempt refreshes its item at most this long apart
        let busiest_gap = self.pipeline.stage_timeout_secs + self.pipeline.max_delay_secs;
        if self.pipeline.stuck_after_secs <= busiest_gap {
            return Err(ConfigError::Message(format!(
                "pipeline.stuck_after_secs ({}) must exceed stage_timeout_secs + max_delay_secs ({})",
                self.pipeline.stuck_after_secs, busiest_gap
            )));
        }
        Ok(())
    }

    /// Per-attempt stage timeout as Duration
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.stage_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/ledgerforge".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                auto_migrate: false,
            },
            pipeline: PipelineConfig::default(),
            classification: ClassificationConfig::default(),
            mapping: MappingConfig::default(),
            gate: GateConfig::default(),
            ocr: OcrConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.pipeline.max_delay_secs, 600);
        assert_eq!(config.pipeline.max_file_bytes, 20 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/ledgerforge");
    }

    #[test]
    fn test_inverted_gate_thresholds_rejected() {
        let mut config = AppConfig::default();
        config.gate.review_threshold = 0.9;
        config.gate.auto_approve_threshold = 0.8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stuck_after_must_outlast_an_attempt() {
        let mut config = AppConfig::default();
        config.pipeline.stage_timeout_secs = 2;
        config.pipeline.max_delay_secs = 1;
        config.pipeline.stuck_after_secs = 1;
        assert!(config.validate().is_err());

        config.pipeline.stuck_after_secs = 3;
        assert!(config.validate().is_err());

        config.pipeline.stuck_after_secs = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
