use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value as JsonValue};
use townfeed_core::TownRegistry;
use townfeed_jobs::schedule::maybe_build_scheduler;
use townfeed_jobs::{runner_from_env, EtlConfig, JobKind, StoreSettings};
use townfeed_storage::PostgrestClient;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "townfeed=info,townfeed_core=info,townfeed_storage=info,\
townfeed_sources=info,townfeed_jobs=info,townfeed_server=info";

#[derive(Debug, Parser)]
#[command(name = "townfeed")]
#[command(about = "NJ town data feed jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one job now and print its envelope.
    Run {
        job: JobKind,
        /// Inline JSON payload.
        #[arg(long, conflicts_with_all = ["payload_file", "year"])]
        payload: Option<String>,
        #[arg(long, conflicts_with = "year")]
        payload_file: Option<PathBuf>,
        /// Shorthand for `--payload '{"year": N}'`.
        #[arg(long)]
        year: Option<i32>,
    },
    /// Run the cron scheduler until ctrl-c.
    Schedule,
    /// Serve the HTTP invocation endpoint.
    Serve,
    /// Read rows back from the PostgREST store.
    Query {
        table: String,
        #[arg(long, default_value = "*")]
        select: String,
        /// PostgREST filter such as `town_id=eq.hoboken`; repeatable.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    /// Print the town registry.
    Towns,
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn payload_from_args(
    payload: Option<String>,
    payload_file: Option<PathBuf>,
    year: Option<i32>,
) -> Result<JsonValue> {
    if let Some(path) = payload_file {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()));
    }
    if let Some(text) = payload {
        return serde_json::from_str(&text).context("parsing --payload");
    }
    Ok(match year {
        Some(year) => json!({ "year": year }),
        None => json!({}),
    })
}

async fn run(job: JobKind, payload: JsonValue) -> Result<ExitCode> {
    let runner = runner_from_env().await?;
    let response = runner.invoke(job, payload).await;
    println!("{}", serde_json::to_string_pretty(&response.body)?);
    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn schedule() -> Result<()> {
    let runner = runner_from_env().await?;
    let Some(mut sched) = maybe_build_scheduler(&runner).await? else {
        bail!("scheduler is disabled; set TOWNFEED_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

async fn query(table: &str, select: &str, filters: &[(String, String)]) -> Result<()> {
    let config = EtlConfig::from_env().context("reading configuration")?;
    let StoreSettings::Postgrest {
        base_url,
        service_key,
    } = &config.store
    else {
        bail!("query reads through PostgREST; {} backend selected", config.store.backend());
    };
    let client = PostgrestClient::new(base_url, service_key, config.store_timeout)?;
    let rows = client.select(table, select, filters).await?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn towns() -> Result<()> {
    let registry = match std::env::var("TOWNFEED_TOWNS_PATH") {
        Ok(path) if !path.trim().is_empty() => TownRegistry::from_path(path.trim())?,
        _ => TownRegistry::bundled()?,
    };
    for town in registry.towns() {
        println!(
            "{}\t{}\t{}\t{}",
            town.id,
            town.name_en,
            town.county.name(),
            town.fips_key()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            job,
            payload,
            payload_file,
            year,
        } => {
            let payload = payload_from_args(payload, payload_file, year)?;
            return run(job, payload).await;
        }
        Commands::Schedule => schedule().await?,
        Commands::Serve => townfeed_server::serve_from_env().await?,
        Commands::Query {
            table,
            select,
            filters,
        } => query(&table, &select, &filters).await?,
        Commands::Towns => towns()?,
    }

    Ok(ExitCode::SUCCESS)
}
