use attend_core::matcher::{MatchPolicy, DEFAULT_MAX_DISTANCE, DEFAULT_MIN_GAP};
use attend_core::session::{SessionConfig, DEFAULT_DETECTION_THRESHOLD};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_EMBEDDING_DIM: usize = 128;
const DEFAULT_COMMAND_POLL_MS: u64 = 100;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Optional overrides read from the TOML file named by `ATTEND_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    identity_dir: Option<PathBuf>,
    embedding_dim: Option<usize>,
    detection_threshold: Option<u32>,
    max_distance: Option<f64>,
    min_gap: Option<f64>,
    command_file: Option<PathBuf>,
    command_poll_ms: Option<u64>,
}

/// Daemon configuration: defaults, then the TOML file, then `ATTEND_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of enrolled identity records.
    pub identity_dir: PathBuf,
    /// Required embedding dimension; `None` infers it from the first record.
    pub embedding_dim: Option<usize>,
    /// Consecutive face frames before a match is attempted.
    pub detection_threshold: u32,
    /// Largest accepted nearest-neighbor distance.
    pub max_distance: f64,
    /// Smallest accepted distance gap between the two best identities.
    pub min_gap: f64,
    /// Marker file polled for commands, if set.
    pub command_file: Option<PathBuf>,
    pub command_poll_ms: u64,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ATTEND_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                Some(text)
            }
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from TOML text and an environment lookup.
    pub fn from_sources(
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = match file {
            Some(text) => toml::from_str(text)?,
            None => FileConfig::default(),
        };

        let identity_dir = env("ATTEND_IDENTITY_DIR")
            .map(PathBuf::from)
            .or(file.identity_dir)
            .unwrap_or_else(|| default_identity_dir(&env));

        let embedding_dim = env_parse(&env, "ATTEND_EMBEDDING_DIM")
            .or(file.embedding_dim)
            .unwrap_or(DEFAULT_EMBEDDING_DIM);

        let command_file = env("ATTEND_COMMAND_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or(file.command_file);

        let config = Self {
            identity_dir,
            embedding_dim: (embedding_dim > 0).then_some(embedding_dim),
            detection_threshold: env_parse(&env, "ATTEND_DETECTION_THRESHOLD")
                .or(file.detection_threshold)
                .unwrap_or(DEFAULT_DETECTION_THRESHOLD),
            max_distance: env_parse(&env, "ATTEND_MAX_DISTANCE")
                .or(file.max_distance)
                .unwrap_or(DEFAULT_MAX_DISTANCE),
            min_gap: env_parse(&env, "ATTEND_MIN_GAP")
                .or(file.min_gap)
                .unwrap_or(DEFAULT_MIN_GAP),
            command_file,
            command_poll_ms: env_parse(&env, "ATTEND_COMMAND_POLL_MS")
                .or(file.command_poll_ms)
                .unwrap_or(DEFAULT_COMMAND_POLL_MS),
        };
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.detection_threshold == 0 {
            return Err(invalid("detection_threshold", "must be at least 1"));
        }
        if !self.max_distance.is_finite() || self.max_distance <= 0.0 {
            return Err(invalid("max_distance", "must be a positive number"));
        }
        if !self.min_gap.is_finite() || self.min_gap < 0.0 {
            return Err(invalid("min_gap", "must be zero or a positive number"));
        }
        if self.command_poll_ms == 0 {
            return Err(invalid("command_poll_ms", "must be at least 1"));
        }
        Ok(self)
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            max_distance: self.max_distance,
            min_gap: self.min_gap,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            detection_threshold: self.detection_threshold,
        }
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn default_identity_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attend")
        .join("identities")
}

/// Parse an environment value; unparseable values fall through to the next layer.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.trim().parse().ok())
}
