//! Runtime configuration.
//!
//! Loads [`EngineConfig`] from a TOML file (`ember.toml`) with environment
//! variable overrides via `EMBER_*` prefixed variables. Every field has a
//! default, so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What the tuner does when a problem key has no persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TuningPolicy {
    /// Benchmark every candidate on a miss and persist the winner.
    #[default]
    Auto,
    /// Re-tune on every call, even when a record exists.
    Always,
    /// Never benchmark; run the default configuration on a miss.
    Never,
}

impl std::fmt::Display for TuningPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Always => write!(f, "always"),
            Self::Never => write!(f, "never"),
        }
    }
}

impl std::str::FromStr for TuningPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "1" | "true" | "on" => Ok(Self::Auto),
            "always" | "force" => Ok(Self::Always),
            "never" | "0" | "false" | "off" => Ok(Self::Never),
            other => Err(format!("unknown tuning policy: {other}")),
        }
    }
}

/// Tuner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Override: `EMBER_TUNING`
    pub policy: TuningPolicy,
    /// JSON file holding tuned launch configurations across runs.
    /// Override: `EMBER_TUNING_CACHE`
    pub cache_path: Option<PathBuf>,
    /// Discarded runs before measuring a candidate.
    /// Override: `EMBER_TUNING_WARMUP`
    pub warmup_iterations: u32,
    /// Measured runs per candidate; the median is kept.
    /// Override: `EMBER_TUNING_ITERATIONS`
    pub bench_iterations: u32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self { policy: TuningPolicy::Auto, cache_path: None, warmup_iterations: 0, bench_iterations: 1 }
    }
}

/// Engine configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Zero-based OpenCL platform index.
    /// Override: `EMBER_OPENCL_PLATFORM`
    pub platform_index: u32,

    /// Zero-based device index within the platform.
    /// Override: `EMBER_OPENCL_DEVICE`
    pub device_index: u32,

    /// Create the command queue with profiling enabled so launches report
    /// device-side durations.
    /// Override: `EMBER_ENABLE_PROFILING`
    pub enable_profiling: bool,

    /// Directory whose `<program>.cl` files take precedence over the
    /// embedded kernel sources.
    /// Override: `EMBER_KERNEL_DIR`
    pub kernel_dir: Option<PathBuf>,

    /// Options appended to every program build.
    /// Override: `EMBER_BUILD_OPTIONS` (space separated)
    pub build_options: Vec<String>,

    pub tuning: TuningConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            platform_index: 0,
            device_index: 0,
            enable_profiling: true,
            kernel_dir: None,
            build_options: vec!["-cl-mad-enable".to_string(), "-cl-fast-relaxed-math".to_string()],
            tuning: TuningConfig::default(),
        }
    }
}

/// Errors that can occur when loading or validating an [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl EngineConfig {
    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: EngineConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tuning.bench_iterations == 0 {
            return Err(ConfigError::Validation("tuning.bench_iterations must be > 0".into()));
        }
        if self.tuning.warmup_iterations > 1000 || self.tuning.bench_iterations > 1000 {
            return Err(ConfigError::Validation(
                "tuning iteration counts must be <= 1000".into(),
            ));
        }
        if let Some(opt) = self.build_options.iter().find(|o| !o.starts_with('-')) {
            return Err(ConfigError::Validation(format!(
                "build option '{opt}' must start with '-'"
            )));
        }
        if matches!(&self.tuning.cache_path, Some(p) if p.as_os_str().is_empty()) {
            return Err(ConfigError::Validation("tuning.cache_path must not be empty".into()));
        }
        Ok(())
    }

    /// Apply `EMBER_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<u32>("EMBER_OPENCL_PLATFORM")? {
            self.platform_index = v;
        }
        if let Some(v) = env_parse::<u32>("EMBER_OPENCL_DEVICE")? {
            self.device_index = v;
        }
        if let Ok(val) = std::env::var("EMBER_ENABLE_PROFILING") {
            self.enable_profiling = matches!(val.as_str(), "1" | "true" | "yes");
        }
        if let Ok(val) = std::env::var("EMBER_KERNEL_DIR") {
            self.kernel_dir = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("EMBER_BUILD_OPTIONS") {
            self.build_options = val.split_whitespace().map(str::to_owned).collect();
        }
        if let Some(v) = env_parse::<TuningPolicy>("EMBER_TUNING")? {
            self.tuning.policy = v;
        }
        if let Ok(val) = std::env::var("EMBER_TUNING_CACHE") {
            self.tuning.cache_path = Some(PathBuf::from(val));
        }
        if let Some(v) = env_parse::<u32>("EMBER_TUNING_WARMUP")? {
            self.tuning.warmup_iterations = v;
        }
        if let Some(v) = env_parse::<u32>("EMBER_TUNING_ITERATIONS")? {
            self.tuning.bench_iterations = v;
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val.parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
            key: key.into(),
            value: val.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}
