use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use crate::cache::Backend;

/// Command-line arguments for the `hc` binary.
#[derive(Debug, Parser)]
#[command(name = "hc", version, about = "Cached client for the order management API")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "HC_CONFIG_FILE", value_name = "PATH", global = true)]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the API endpoint URL.
    #[arg(long = "endpoint", value_name = "URL", global = true)]
    pub endpoint: Option<String>,

    /// Override the directory holding durable cache files.
    #[arg(long = "storage-dir", value_name = "PATH", value_hint = ValueHint::DirPath, global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a read action, using the cache where its policy allows.
    Get(GetArgs),
    /// Run a mutating action and invalidate the caches it affects.
    Post(PostArgs),
    /// Inspect or clear cached entries.
    Cache(CacheArgs),
    /// Print endpoint, backend and policy information.
    Status,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    /// Action name, e.g. `getProducts`.
    #[arg(value_name = "ACTION")]
    pub action: String,

    /// Query parameter as `key=value`; repeatable.
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Args, Clone)]
pub struct PostArgs {
    /// Action name, e.g. `openOrder`.
    #[arg(value_name = "ACTION")]
    pub action: String,

    /// Form field as `key=value`; repeatable.
    #[arg(short = 'f', long = "field", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Args, Clone)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CacheCommand {
    /// Remove every cached entry, optionally on a single backend.
    Clear {
        #[arg(long, value_name = "BACKEND")]
        backend: Option<Backend>,
    },
    /// Remove entries whose key starts with PREFIX.
    Invalidate {
        #[arg(value_name = "PREFIX")]
        prefix: String,

        #[arg(long, value_name = "BACKEND")]
        backend: Backend,
    },
}

/// Parse `key=value`. The value may be empty; the key may not.
pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}
