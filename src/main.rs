//! hc: command-line front end for the cached API client.

use std::process::ExitCode;

use hc_client::{
    api::{ApiClient, ApiResponse, ClientError, Mutation, Params, Query},
    cache::Backend,
    config::{self, CacheCommand, Command, LoadError, Settings},
    infra::{error::InfraError, telemetry},
};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error};
use tracing_subscriber::fmt as tracing_fmt;

const EXIT_SETUP_FAILURE: u8 = 1;
const EXIT_API_FAILURE: u8 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("API endpoint is not configured (set api.endpoint, HC__API__ENDPOINT or --endpoint)")]
    NotConfigured,
    #[error("failed to write output: {0}")]
    Output(#[from] serde_json::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}

fn report_error(err: &CliError) {
    if dispatcher::has_been_set() {
        error!(error = %err, "hc failed");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %err, "hc failed");
    });
}

async fn run() -> Result<ExitCode, CliError> {
    let (cli, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let client = ApiClient::from_settings(&settings)?;

    match cli.command {
        Command::Get(args) => {
            let query = Query::from(args.action.as_str());
            let response = client
                .fetch_resource(&query, &into_params(args.params))
                .await
                .ok_or(CliError::NotConfigured)?;
            respond(&response)
        }
        Command::Post(args) => {
            let mutation = Mutation::from(args.action.as_str());
            let response = client
                .mutate(&mutation, &into_params(args.fields))
                .await
                .ok_or(CliError::NotConfigured)?;
            respond(&response)
        }
        Command::Cache(args) => {
            let removed = match args.command {
                CacheCommand::Clear { backend: Some(backend) } => {
                    client.engine().clear_all(backend)
                }
                CacheCommand::Clear { backend: None } => client.clear_all_caches(),
                CacheCommand::Invalidate { prefix, backend } => {
                    client.engine().invalidate_prefix(&prefix, backend)
                }
            };
            print_json(&json!({ "removed": removed }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            print_json(&status(&client, &settings))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn respond(response: &ApiResponse) -> Result<ExitCode, CliError> {
    print_json(response)?;
    if response.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_API_FAILURE))
    }
}

fn status(client: &ApiClient, settings: &Settings) -> Value {
    let backends: Vec<&str> = client
        .engine()
        .storages()
        .available()
        .iter()
        .map(Backend::as_str)
        .collect();
    let policies: Vec<Value> = client
        .policies()
        .entries()
        .into_iter()
        .map(|(query, policy)| {
            json!({
                "action": query.name(),
                "ttl_seconds": policy.ttl.as_secs(),
                "backend": policy.backend.as_str(),
            })
        })
        .collect();

    json!({
        "configured": client.is_configured(),
        "endpoint": settings.api.endpoint.as_ref().map(|url| url.as_str()),
        "storage_directory": settings.storage.directory.as_ref().map(|dir| dir.display().to_string()),
        "backends": backends,
        "policies": policies,
    })
}

fn into_params(pairs: Vec<(String, String)>) -> Params {
    pairs
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}
