//! Pipeline configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/ae_pipeline.toml`, optional)
//! 2. Environment variables (prefixed with `AE_PIPELINE_`, nested keys split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! AE_PIPELINE_APPLICATION__LOG_LEVEL=debug
//! AE_PIPELINE_BROKER__ADDRESS=broker:5577
//! AE_PIPELINE_TOPICS__FROM_CONTROL=xpd.from-control
//! ```
//!
//! Topic names only exist here, so experiments that run side by side pick
//! distinct namespaces through configuration.
//!
//! # Example
//!
//! ```no_run
//! use ae_pipeline::config::PipelineConfig;
//!
//! let config = PipelineConfig::load(None)?;
//! println!("Broker: {}", config.broker.address);
//! println!("Documents on: {}", config.topics.from_control);
//! # Ok::<(), ae_pipeline::config::ConfigError>(())
//! ```

use crate::control::{FallbackPolicy, SyntheticDetector};
use crate::document::Point;
use crate::recovery::RetryPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/ae_pipeline.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "AE_PIPELINE_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    /// Reconnect policy shared by every subscribing component
    #[serde(default)]
    pub reconnect: RetryPolicy,
    /// Reduction function used by the analysis relay
    #[serde(default = "default_analysis_function")]
    pub analysis: FunctionConfig,
    /// Recommendation function used by the adaptive relay
    #[serde(default = "default_adaptive_function")]
    pub adaptive: FunctionConfig,
    /// Control-side settings; required by the `scan` command only
    #[serde(default)]
    pub control: Option<ControlConfig>,
    /// Detector simulated by the `scan` command
    #[serde(default)]
    pub simulation: SyntheticDetector,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            broker: BrokerConfig::default(),
            topics: TopicConfig::default(),
            relay: RelayConfig::default(),
            reconnect: RetryPolicy::default(),
            analysis: default_analysis_function(),
            adaptive: default_adaptive_function(),
            control: None,
            simulation: SyntheticDetector::default(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Broker service settings (both the listener and its clients)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `host:port` the broker listens on and clients connect to
    #[serde(default = "default_broker_address")]
    pub address: String,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Largest accepted frame; bigger frames close the connection
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// In-flight buffer per subscriber before slow subscribers start dropping messages
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            connect_timeout: default_connect_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Topic names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Documents published by the control process
    #[serde(default = "default_from_control")]
    pub from_control: String,
    /// Stage messages published by the analysis relay
    #[serde(default = "default_from_analysis")]
    pub from_analysis: String,
    /// Optional status topic both relays report on
    #[serde(default)]
    pub status: Option<String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            from_control: default_from_control(),
            from_analysis: default_from_analysis(),
            status: None,
        }
    }
}

/// Relay worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Queued messages per run before the router waits on that run's lane
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            lane_capacity: default_lane_capacity(),
        }
    }
}

/// Name and parameters of a pluggable function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Registry name (e.g. "peak_area", "step")
    pub name: String,
    /// Function-specific parameters, passed to the registry factory
    #[serde(default = "empty_params")]
    pub params: toml::Value,
}

impl FunctionConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: empty_params(),
        }
    }
}

/// Control process adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// How long to wait for a recommendation per request
    #[serde(default = "default_feedback_timeout", with = "humantime_serde")]
    pub feedback_timeout: Duration,
    /// What the plan does when no recommendation arrives. Must be set explicitly.
    pub fallback: FallbackPolicy,
    /// Extra waits on a slow (not reported lost) recommendation
    #[serde(default)]
    pub retrieval_retries: u32,
    /// Where the plan starts
    #[serde(default = "default_first_point")]
    pub first_point: Point,
    /// Upper bound on batches per plan
    #[serde(default)]
    pub max_batches: Option<u32>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "ae-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_broker_address() -> String {
    "127.0.0.1:5577".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_from_control() -> String {
    "from-control".to_string()
}

fn default_from_analysis() -> String {
    "from-analysis".to_string()
}

fn default_lane_capacity() -> usize {
    256
}

fn default_analysis_function() -> FunctionConfig {
    FunctionConfig::new("passthrough")
}

fn default_adaptive_function() -> FunctionConfig {
    FunctionConfig::new("step")
}

fn empty_params() -> toml::Value {
    toml::Value::Table(toml::value::Table::new())
}

fn default_feedback_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_first_point() -> Point {
    Point::from([("x".to_string(), 0.0)])
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl PipelineConfig {
    /// Load configuration from a TOML file and environment variables
    ///
    /// Precedence (highest to lowest):
    /// 1. Environment variables (`AE_PIPELINE_` prefix)
    /// 2. the TOML file (`path`, or [`DEFAULT_CONFIG_PATH`] when `None`)
    /// 3. built-in defaults
    ///
    /// A missing file is not an error; the defaults apply. After loading,
    /// configuration is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Extract and validate configuration from an arbitrary figment
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Topic names are non-empty and pairwise distinct
    /// - Broker address has the `host:port` shape
    /// - Sizes and capacities are positive
    /// - The reconnect policy is well-formed
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut topics = vec![
            ("from_control", &self.topics.from_control),
            ("from_analysis", &self.topics.from_analysis),
        ];
        if let Some(status) = &self.topics.status {
            topics.push(("status", status));
        }
        for (i, (name, topic)) in topics.iter().enumerate() {
            if topic.is_empty() || topic.ends_with('*') {
                return Err(ConfigError::ValidationError(format!(
                    "Topic '{}' must be a non-empty concrete name, got '{}'",
                    name, topic
                )));
            }
            if let Some((other, _)) = topics[..i].iter().find(|(_, t)| t == topic) {
                return Err(ConfigError::ValidationError(format!(
                    "Topics '{}' and '{}' share the name '{}'",
                    other, name, topic
                )));
            }
        }

        match self.broker.address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid broker address '{}'. Expected host:port",
                    self.broker.address
                )))
            }
        }

        if self.broker.max_frame_bytes == 0 || self.broker.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "broker.max_frame_bytes and broker.channel_capacity must be positive".into(),
            ));
        }

        if self.relay.lane_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "relay.lane_capacity must be positive".into(),
            ));
        }

        if self.reconnect.initial_backoff > self.reconnect.max_backoff {
            return Err(ConfigError::ValidationError(format!(
                "reconnect.initial_backoff ({:?}) exceeds reconnect.max_backoff ({:?})",
                self.reconnect.initial_backoff, self.reconnect.max_backoff
            )));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                self.reconnect.multiplier
            )));
        }

        if self.simulation.width <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "simulation.width must be positive, got {}",
                self.simulation.width
            )));
        }

        if let Some(control) = &self.control {
            if control.first_point.is_empty() {
                return Err(ConfigError::ValidationError(
                    "control.first_point must name at least one axis".into(),
                ));
            }
        }

        Ok(())
    }

    /// Control settings, which must be given explicitly for a plan to run
    pub fn require_control(&self) -> Result<&ControlConfig, ConfigError> {
        self.control.as_ref().ok_or_else(|| {
            ConfigError::ValidationError(
                "[control] section with an explicit `fallback` policy is required".into(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        let config = PipelineConfig::load(Some(Path::new("/nonexistent/ae.toml"))).unwrap();
        assert_eq!(config.topics.from_control, "from-control");
        assert_eq!(config.topics.from_analysis, "from-analysis");
        assert!(config.topics.status.is_none());
        assert_eq!(config.analysis.name, "passthrough");
        assert_eq!(config.adaptive.name, "step");
        assert!(config.control.is_none());
        assert!(config.require_control().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"
            log_format = "json"

            [topics]
            from_control = "xpd.raw"
            from_analysis = "xpd.reduced"
            status = "xpd.status"

            [analysis]
            name = "peak_area"
            params = { q_start = 2.63, q_stop = 2.7 }

            [control]
            fallback = "reuse_previous"
            feedback_timeout = "1s"
            first_point = { ctrl_Ti = 40.0 }
            "#,
        );
        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.topics.status.as_deref(), Some("xpd.status"));
        assert_eq!(config.analysis.name, "peak_area");
        assert_eq!(
            config.analysis.params.get("q_start").and_then(|v| v.as_float()),
            Some(2.63)
        );
        let control = config.require_control().unwrap();
        assert_eq!(control.fallback, FallbackPolicy::ReusePrevious);
        assert_eq!(control.feedback_timeout, Duration::from_secs(1));
        assert_eq!(control.first_point.get("ctrl_Ti"), Some(&40.0));
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("AE_PIPELINE_TOPICS__FROM_CONTROL", "exp2.raw");
        let result = PipelineConfig::load(Some(Path::new("/nonexistent/ae.toml")));
        std::env::remove_var("AE_PIPELINE_TOPICS__FROM_CONTROL");
        assert_eq!(result.unwrap().topics.from_control, "exp2.raw");
    }

    #[test]
    #[serial]
    fn test_control_requires_explicit_fallback() {
        let file = write_config(
            r#"
            [control]
            feedback_timeout = "1s"
            "#,
        );
        let err = PipelineConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    #[serial]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.analysis.name, "peak_area");
        assert_eq!(config.topics.status.as_deref(), Some("pipeline-status"));
        assert_eq!(config.simulation.settle, Duration::from_millis(50));
        assert_eq!(config.require_control().unwrap().fallback, FallbackPolicy::Abort);
    }

    #[test]
    fn test_validation_rejects_shared_topic() {
        let mut config = PipelineConfig::default();
        config.topics.status = Some("from-control".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("share the name"));
    }

    #[test]
    fn test_validation_rejects_bad_address() {
        let mut config = PipelineConfig::default();
        config.broker.address = "localhost".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_log_level() {
        let mut config = PipelineConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }
}
