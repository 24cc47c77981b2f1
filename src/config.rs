use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::NaiveTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

/// What the gateway does when the latest signal is older than the threshold.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StalenessPolicy {
    Ignore,
    /// Log a warning and keep trading on the stale state.
    #[default]
    Alert,
    /// Alert, and refuse to apply records older than the threshold.
    Block,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("failed to render config: {0}")]
    Render(String),
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub bus: BusSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub alpha: AlphaSection,
    #[serde(default)]
    pub staleness: StalenessSection,
    #[serde(default)]
    pub audit: AuditSection,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BusSection {
    pub path: PathBuf,
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GatewaySection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            state_path: None,
            min_delta: default_min_delta(),
        }
    }
}

impl GatewaySection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// When the alpha engine fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cadence {
    EverySecs(u64),
    /// Once per UTC day at `HH:MM`.
    DailyAt(String),
}

impl Cadence {
    pub fn daily_time(&self) -> Option<Result<NaiveTime, ConfigError>> {
        match self {
            Cadence::DailyAt(at) => Some(NaiveTime::parse_from_str(at, "%H:%M").map_err(|err| {
                ConfigError::Validation(format!("daily-at {at:?} is not HH:MM: {err}"))
            })),
            Cadence::EverySecs(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AlphaSection {
    #[serde(default)]
    pub run_on_start: bool,
    /// Universe for the built-in demo engine.
    #[serde(default = "default_universe")]
    pub universe: Vec<String>,
    #[serde(default = "default_picks")]
    pub picks: usize,
    #[serde(default = "default_cadence")]
    pub cadence: Cadence,
}

impl Default for AlphaSection {
    fn default() -> Self {
        Self {
            run_on_start: false,
            universe: default_universe(),
            picks: default_picks(),
            cadence: default_cadence(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StalenessSection {
    #[serde(default)]
    pub threshold_secs: Option<u64>,
    #[serde(default)]
    pub policy: StalenessPolicy,
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
}

impl Default for StalenessSection {
    fn default() -> Self {
        Self {
            threshold_secs: None,
            policy: StalenessPolicy::default(),
            health_check_secs: default_health_check_secs(),
        }
    }
}

impl StalenessSection {
    pub fn threshold(&self) -> Option<chrono::Duration> {
        self.threshold_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuditSection {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

const fn default_history_depth() -> usize {
    5
}

const fn default_poll_interval_ms() -> u64 {
    2_000
}

const fn default_min_delta() -> f64 {
    1e-9
}

fn default_cadence() -> Cadence {
    Cadence::DailyAt("15:38".into())
}

fn default_universe() -> Vec<String> {
    ["AAA", "BBB", "CCC", "DDD", "EEE"]
        .into_iter()
        .map(String::from)
        .collect()
}

const fn default_picks() -> usize {
    3
}

const fn default_health_check_secs() -> u64 {
    600
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation("bus path must not be empty".into()));
        }
        if self.gateway.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "poll interval must be greater than zero".into(),
            ));
        }
        if !(self.gateway.min_delta.is_finite() && self.gateway.min_delta >= 0.0) {
            return Err(ConfigError::Validation(
                "min delta must be a non-negative number".into(),
            ));
        }
        match &self.alpha.cadence {
            Cadence::EverySecs(0) => {
                return Err(ConfigError::Validation(
                    "alpha cadence must be greater than zero seconds".into(),
                ))
            }
            cadence => {
                if let Some(parsed) = cadence.daily_time() {
                    parsed?;
                }
            }
        }
        if self.staleness.health_check_secs == 0 {
            return Err(ConfigError::Validation(
                "health check interval must be greater than zero".into(),
            ));
        }
        if self.staleness.policy == StalenessPolicy::Block && self.staleness.threshold_secs.is_none() {
            return Err(ConfigError::Validation(
                "staleness policy `block` requires threshold-secs".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            bus: BusSection {
                path: PathBuf::from("data/bus"),
                history_depth: default_history_depth(),
            },
            gateway: GatewaySection {
                state_path: Some(PathBuf::from("data/execution_state.json")),
                ..GatewaySection::default()
            },
            alpha: AlphaSection::default(),
            staleness: StalenessSection {
                threshold_secs: Some(26 * 3_600),
                ..StalenessSection::default()
            },
            audit: AuditSection {
                path: Some(PathBuf::from("logs/audit.jsonl")),
            },
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|err| ConfigError::Render(err.to_string()))
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}
