use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{ConfigError, DEFAULT_KEYWORDS, DEFAULT_MIN_RELEVANCE};

pub const DEFAULT_CONFIG_FILE: &str = "insightwatch.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub subreddit: String,
    pub min_relevance_score: f64,
    pub check_interval_hours: u64,
    pub post_limit: u32,
    pub api_port: u16,
    pub data_dir: PathBuf,
    pub notifications: bool,
    pub keywords: Vec<String>,
    pub reddit_client_id: Option<String>,
    pub reddit_client_secret: Option<String>,
    pub user_agent: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            subreddit: "claude".to_string(),
            min_relevance_score: DEFAULT_MIN_RELEVANCE,
            check_interval_hours: 24,
            post_limit: 50,
            api_port: 8080,
            data_dir: PathBuf::from("data"),
            notifications: true,
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            reddit_client_id: None,
            reddit_client_secret: None,
            user_agent: "InsightWatch/1.0".to_string(),
        }
    }
}

/// Files the daemon and the controller share.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPaths {
    pub root: PathBuf,
    pub database: PathBuf,
    pub health: PathBuf,
    pub service_record: PathBuf,
    pub log: PathBuf,
    pub digests: PathBuf,
}

impl AppConfig {
    /// Load from `path`, or from `insightwatch.toml` if present, then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => {
                debug!("No configuration file, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
                path: path.display().to_string(),
            },
            std::io::ErrorKind::PermissionDenied => ConfigError::PermissionDenied {
                path: path.display().to_string(),
            },
            _ => ConfigError::InvalidValue {
                field: "config file".to_string(),
                value: e.to_string(),
            },
        })?;

        info!("Loaded configuration from {}", path.display());
        Ok(toml::from_str(&raw)?)
    }

    /// Apply `SUBREDDIT`, `MIN_RELEVANCE_SCORE`, ... from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SUBREDDIT") {
            self.subreddit = v;
        }
        if let Some(v) = lookup("MIN_RELEVANCE_SCORE") {
            self.min_relevance_score = parse_value("MIN_RELEVANCE_SCORE", &v)?;
        }
        if let Some(v) = lookup("CHECK_INTERVAL_HOURS") {
            self.check_interval_hours = parse_value("CHECK_INTERVAL_HOURS", &v)?;
        }
        if let Some(v) = lookup("POST_LIMIT") {
            self.post_limit = parse_value("POST_LIMIT", &v)?;
        }
        if let Some(v) = lookup("API_PORT") {
            self.api_port = parse_value("API_PORT", &v)?;
        }
        if let Some(v) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("NOTIFICATIONS") {
            self.notifications = parse_value("NOTIFICATIONS", &v)?;
        }
        if let Some(v) = lookup("REDDIT_CLIENT_ID") {
            self.reddit_client_id = Some(v);
        }
        if let Some(v) = lookup("REDDIT_CLIENT_SECRET") {
            self.reddit_client_secret = Some(v);
        }
        if let Some(v) = lookup("REDDIT_USER_AGENT") {
            self.user_agent = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subreddit.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "subreddit".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_relevance_score) {
            return Err(invalid("min_relevance_score", self.min_relevance_score));
        }
        if self.check_interval_hours == 0 {
            return Err(invalid("check_interval_hours", self.check_interval_hours));
        }
        if !(1..=100).contains(&self.post_limit) {
            return Err(invalid("post_limit", self.post_limit));
        }
        if self.api_port == 0 {
            return Err(invalid("api_port", self.api_port));
        }
        Ok(())
    }

    /// Reddit client id and secret; both are required to run the feed client.
    pub fn credentials(&self) -> Result<(String, String), ConfigError> {
        let id = non_empty(&self.reddit_client_id).ok_or_else(|| {
            ConfigError::MissingEnvironmentVariable {
                var_name: "REDDIT_CLIENT_ID".to_string(),
            }
        })?;
        let secret = non_empty(&self.reddit_client_secret).ok_or_else(|| {
            ConfigError::MissingEnvironmentVariable {
                var_name: "REDDIT_CLIENT_SECRET".to_string(),
            }
        })?;
        Ok((id, secret))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_hours * 3600)
    }

    pub fn paths(&self) -> DataPaths {
        let root = self.data_dir.clone();
        DataPaths {
            database: root.join("insights.db"),
            health: root.join("health.json"),
            service_record: root.join("service.json"),
            log: root.join("insightwatch.log"),
            digests: root.join("digests"),
            root,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_value<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn invalid(field: &str, value: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}
