//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::api::Query;
use crate::cache::Backend;

mod cli;

pub use cli::{
    CacheArgs, CacheCommand, CliArgs, Command, GetArgs, GlobalOverrides, PostArgs,
    parse_key_value,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "hc";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api: ApiSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// `None` leaves the client unconfigured; every call then yields nothing.
    pub endpoint: Option<Url>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Home of the durable backends. Without it only memory is available.
    pub directory: Option<PathBuf>,
    pub quota_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Default)]
pub struct CacheSettings {
    /// Per-action policy changes keyed by action name.
    pub policies: BTreeMap<String, PolicyOverride>,
}

/// Partial cache policy for one action; unset fields keep their defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyOverride {
    pub ttl: Option<Duration>,
    pub backend: Option<Backend>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("HC").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    api: RawApiSettings,
    storage: RawStorageSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(endpoint) = overrides.endpoint.as_ref() {
            self.api.endpoint = Some(endpoint.clone());
        }
        if let Some(directory) = overrides.storage_dir.as_ref() {
            self.storage.directory = Some(directory.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            api,
            storage,
            logging,
            cache,
        } = raw;

        Ok(Self {
            api: build_api_settings(api)?,
            storage: build_storage_settings(storage)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
        })
    }
}

fn build_api_settings(api: RawApiSettings) -> Result<ApiSettings, LoadError> {
    let endpoint = match non_blank(api.endpoint) {
        Some(raw) => {
            let url = Url::parse(&raw)
                .map_err(|err| LoadError::invalid("api.endpoint", format!("failed to parse: {err}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "api.endpoint",
                    format!("unsupported scheme `{}`", url.scheme()),
                ));
            }
            Some(url)
        }
        None => None,
    };

    let timeout_secs = api.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "api.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ApiSettings {
        endpoint,
        timeout: Duration::from_secs(timeout_secs),
        user_agent: non_blank(api.user_agent),
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let directory = storage
        .directory
        .filter(|path| !path.as_os_str().is_empty());

    let quota_bytes = storage.quota_bytes.unwrap_or(DEFAULT_QUOTA_BYTES);
    if quota_bytes == 0 {
        return Err(LoadError::invalid(
            "storage.quota_bytes",
            "must be greater than zero",
        ));
    }

    Ok(StorageSettings {
        directory,
        quota_bytes,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::WARN,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let mut policies = BTreeMap::new();
    for (action, raw) in cache.policies {
        let backend = raw
            .backend
            .as_deref()
            .map(Backend::from_str)
            .transpose()
            .map_err(|err| {
                LoadError::invalid("cache.policies", format!("action `{action}`: {err}"))
            })?;
        let ttl = raw.ttl_seconds.map(Duration::from_secs);
        policies.insert(canonical_action(&action), PolicyOverride { ttl, backend });
    }
    Ok(CacheSettings { policies })
}

/// Environment sources lowercase their keys; map known actions back to their
/// canonical spelling. Custom actions keep the key as given and are matched
/// case-insensitively by `PolicyTable::policy_for`.
fn canonical_action(name: &str) -> String {
    Query::CACHED
        .iter()
        .map(Query::name)
        .find(|known| known.eq_ignore_ascii_case(name))
        .unwrap_or(name)
        .to_string()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawApiSettings {
    endpoint: Option<String>,
    timeout_seconds: Option<u64>,
    user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    directory: Option<PathBuf>,
    quota_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    policies: BTreeMap<String, RawPolicySettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    ttl_seconds: Option<u64>,
    backend: Option<String>,
}
