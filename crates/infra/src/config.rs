//! Process settings and the batch configuration file.
//!
//! ## Settings
//!
//! [`Settings::from_env`] reads the environment, falling back to defaults:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `POLICYBATCH_DATABASE` | `policybatch` | database jobs run against |
//! | `DATABASE_URL` | none | Postgres connection URL |
//! | `REDIS_URL` | none | Redis connection URL |
//! | `POLICYBATCH_DB_RETRY` | `5` | operational retries of async methods |
//! | `POLICYBATCH_JOB_TTL_SECS` | `86400` | lifetime of logged jobs |
//! | `POLICYBATCH_JOB_RESULT_TTL_SECS` | `604800` | lifetime of task states |
//! | `POLICYBATCH_BATCH_CONFIG` | none | path of the batch configuration file |
//! | `POLICYBATCH_LOG_DIR` | none | default root of generated file paths |
//!
//! ## Batch configuration file
//!
//! ```toml
//! [default]
//! job_size = 500
//! root_dir = "/srv/batch"
//!
//! [batch."contract.renew"]
//! job_size = 100
//! filepath_template = "%{BATCHNAME}/%{TIMESTAMP}_%{FILENAME}"
//! ```
//!
//! Batch sections override the `default` section. File layout keys are
//! consumed by [`FileBatchConfig::generate_filepath`] and never reach the
//! batch as parameters.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use chrono::format::{Item, StrftimeItems};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use policybatch_batch::ConfigSource;
use policybatch_core::ParamMap;

pub const ROOT_DIR: &str = "root_dir";
pub const FILEPATH_TEMPLATE: &str = "filepath_template";
pub const FILEPATH_TIMESTAMP_FORMAT: &str = "filepath_timestamp_format";

pub const DEFAULT_FILEPATH_TEMPLATE: &str = "%{BATCHNAME}/%{FILENAME}";
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%Hh%Mm%Ss";

const LAYOUT_KEYS: [&str; 3] = [ROOT_DIR, FILEPATH_TEMPLATE, FILEPATH_TIMESTAMP_FORMAT];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse batch configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub database_retry: u32,
    pub job_ttl: Duration,
    pub job_result_ttl: Duration,
    pub batch_config: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: "policybatch".to_string(),
            database_url: None,
            redis_url: None,
            database_retry: 5,
            job_ttl: Duration::from_secs(86_400),
            job_result_ttl: Duration::from_secs(604_800),
            batch_config: None,
            log_dir: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database: var("POLICYBATCH_DATABASE").unwrap_or(defaults.database),
            database_url: var("DATABASE_URL"),
            redis_url: var("REDIS_URL"),
            database_retry: match var("POLICYBATCH_DB_RETRY") {
                Some(raw) => parse_number("POLICYBATCH_DB_RETRY", &raw)?,
                None => defaults.database_retry,
            },
            job_ttl: match var("POLICYBATCH_JOB_TTL_SECS") {
                Some(raw) => Duration::from_secs(parse_number("POLICYBATCH_JOB_TTL_SECS", &raw)?),
                None => defaults.job_ttl,
            },
            job_result_ttl: match var("POLICYBATCH_JOB_RESULT_TTL_SECS") {
                Some(raw) => Duration::from_secs(parse_number(
                    "POLICYBATCH_JOB_RESULT_TTL_SECS",
                    &raw,
                )?),
                None => defaults.job_result_ttl,
            },
            batch_config: var("POLICYBATCH_BATCH_CONFIG").map(PathBuf::from),
            log_dir: var("POLICYBATCH_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct RawBatchConfig {
    #[serde(default)]
    default: toml::Table,
    #[serde(default)]
    batch: BTreeMap<String, toml::Table>,
}

/// Batch configuration file.
#[derive(Debug, Clone, Default)]
pub struct FileBatchConfig {
    default: toml::Table,
    batches: BTreeMap<String, toml::Table>,
    default_root: Option<PathBuf>,
}

impl FileBatchConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawBatchConfig = toml::from_str(content)?;
        let config = Self {
            default: raw.default,
            batches: raw.batch,
            default_root: None,
        };
        config.check_templates()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Load the file named by the settings.
    ///
    /// No file configured, or an unreadable one, gives an empty
    /// configuration. A malformed file is an error.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let config = match &settings.batch_config {
            None => Self::default(),
            Some(path) => match Self::load(path) {
                Err(ConfigError::Io { path, source }) => {
                    warn!(path = %path.display(), error = %source, "batch configuration not readable");
                    Self::default()
                }
                other => other?,
            },
        };
        Ok(config.with_default_root(settings.log_dir.clone()))
    }

    /// Root used when no `root_dir` is configured.
    pub fn with_default_root(mut self, root: Option<PathBuf>) -> Self {
        self.default_root = root;
        self
    }

    fn check_templates(&self) -> Result<(), ConfigError> {
        let sections = std::iter::once(("default", &self.default))
            .chain(self.batches.iter().map(|(name, table)| (name.as_str(), table)));
        for (section, table) in sections {
            if let Some(template) = table.get(FILEPATH_TEMPLATE) {
                let ok = template.as_str().is_some_and(|t| t.contains("%{FILENAME}"));
                if !ok {
                    return Err(ConfigError::invalid(
                        FILEPATH_TEMPLATE,
                        format!("section {section} must contain %{{FILENAME}}"),
                    ));
                }
            }
            if let Some(format) = table.get(FILEPATH_TIMESTAMP_FORMAT) {
                let ok = format.as_str().is_some_and(is_valid_timestamp_format);
                if !ok {
                    return Err(ConfigError::invalid(
                        FILEPATH_TIMESTAMP_FORMAT,
                        format!("section {section} has an invalid strftime format"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// One configuration item: batch section, then `default`.
    fn item(&self, batch: &str, key: &str) -> Option<&toml::Value> {
        self.batches
            .get(batch)
            .and_then(|table| table.get(key))
            .or_else(|| self.default.get(key))
    }

    fn item_str(&self, batch: &str, key: &str) -> Option<String> {
        self.item(batch, key).map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Path of an output file of `batch`, as of `now`.
    pub fn generate_filepath(
        &self,
        batch: &str,
        filename: &str,
        now: NaiveDateTime,
    ) -> Result<PathBuf, ConfigError> {
        let template = self
            .item_str(batch, FILEPATH_TEMPLATE)
            .unwrap_or_else(|| DEFAULT_FILEPATH_TEMPLATE.to_string());
        let mut relative = template
            .replace("%{FILENAME}", filename)
            .replace("%{BATCHNAME}", &slugify(batch));
        if relative.contains("%{TIMESTAMP}") {
            let format = self
                .item_str(batch, FILEPATH_TIMESTAMP_FORMAT)
                .unwrap_or_else(|| DEFAULT_TIMESTAMP_FORMAT.to_string());
            let mut stamp = String::new();
            write!(stamp, "{}", now.format(&format)).map_err(|_| {
                ConfigError::invalid(FILEPATH_TIMESTAMP_FORMAT, format!("cannot format {format:?}"))
            })?;
            relative = relative.replace("%{TIMESTAMP}", &stamp);
        }

        let root = self
            .item_str(batch, ROOT_DIR)
            .map(PathBuf::from)
            .or_else(|| self.default_root.clone())
            .unwrap_or_default();
        Ok(root.join(relative))
    }
}

fn is_valid_timestamp_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

impl ConfigSource for FileBatchConfig {
    fn batch_params(&self, batch: &str) -> ParamMap {
        let mut merged = ParamMap::new();
        let sections = std::iter::once(&self.default).chain(self.batches.get(batch));
        for table in sections {
            for (key, value) in table {
                if !LAYOUT_KEYS.contains(&key.as_str()) {
                    merged.insert(key.clone(), toml_to_json(value));
                }
            }
        }
        merged
    }
}

fn toml_to_json(value: &toml::Value) -> JsonValue {
    match value {
        toml::Value::String(s) => JsonValue::from(s.as_str()),
        toml::Value::Integer(i) => JsonValue::from(*i),
        toml::Value::Float(f) => JsonValue::from(*f),
        toml::Value::Boolean(b) => JsonValue::from(*b),
        toml::Value::Datetime(dt) => JsonValue::from(dt.to_string()),
        toml::Value::Array(items) => JsonValue::Array(items.iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => JsonValue::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Lowercase ASCII alphanumerics, every other run collapsed into `_`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut gap = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if gap && !slug.is_empty() {
                slug.push('_');
            }
            gap = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            gap = true;
        }
    }
    slug
}
