//! Job orchestration: configuration, context wiring, per-job run guards, the
//! invocation envelope and the cron scheduler.

pub mod config;
pub mod envelope;
pub mod jobs;
pub mod schedule;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use townfeed_core::TownResolver;
use townfeed_storage::{HttpClientConfig, HttpFetcher, MemorySink, PgUpsertSink, PostgrestClient, UpsertSink};
use tracing::info;

pub use config::{ConfigError, EtlConfig, SourceSettings, StoreSettings};
pub use envelope::{invoke, InvocationBody, InvocationResponse};

pub const CRATE_NAME: &str = "townfeed-jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKind {
    Census,
    MortgageRates,
    TaxRates,
    Zhvi,
    MarketTracker,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Census,
        JobKind::MortgageRates,
        JobKind::TaxRates,
        JobKind::Zhvi,
        JobKind::MarketTracker,
    ];

    pub fn id(self) -> &'static str {
        match self {
            JobKind::Census => "census",
            JobKind::MortgageRates => "mortgage-rates",
            JobKind::TaxRates => "tax-rates",
            JobKind::Zhvi => "zhvi",
            JobKind::MarketTracker => "market-tracker",
        }
    }

    /// Upper snake case form used in per-job environment variable names.
    pub fn env_suffix(self) -> String {
        self.id().replace('-', "_").to_ascii_uppercase()
    }

    /// Six-field cron schedule with a leading seconds field (UTC); tax rates only run
    /// on demand.
    pub fn default_cron(self) -> Option<&'static str> {
        match self {
            JobKind::Census => Some("0 0 8 1 10 *"),
            JobKind::MortgageRates => Some("0 0 8 * * Fri"),
            JobKind::TaxRates => None,
            JobKind::Zhvi => Some("0 0 8 18 * *"),
            JobKind::MarketTracker => Some("0 0 8 5 * *"),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            JobKind::Census => "ACS 5-year demographics per town",
            JobKind::MortgageRates => "weekly 30 and 15 year fixed mortgage rates",
            JobKind::TaxRates => "municipal tax rates from a supplied payload",
            JobKind::Zhvi => "monthly Zillow home value index per town",
            JobKind::MarketTracker => "monthly Redfin market tracker per town",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('_', "-").to_ascii_lowercase();
        JobKind::ALL
            .into_iter()
            .find(|job| job.id() == wanted)
            .ok_or_else(|| JobError::UnknownJob(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown job {0:?}")]
    UnknownJob(String),
    #[error("job {0} is already running")]
    AlreadyRunning(JobKind),
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] townfeed_sources::PayloadError),
}

/// Everything a job needs, built once per process and shared by reference.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<EtlConfig>,
    pub registry: Arc<dyn TownResolver>,
    pub http: Arc<HttpFetcher>,
    pub sink: Arc<dyn UpsertSink>,
}

/// Wire the HTTP client, registry and store backend selected by `config`.
pub async fn build_context(config: EtlConfig) -> Result<JobContext> {
    let registry = config.load_registry().context("loading town registry")?;
    info!(towns = registry.len(), "town registry loaded");

    let http = HttpFetcher::new(HttpClientConfig {
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
    .context("building http client")?;

    let sink: Arc<dyn UpsertSink> = match &config.store {
        StoreSettings::Postgrest {
            base_url,
            service_key,
        } => Arc::new(
            PostgrestClient::new(base_url, service_key, config.store_timeout)
                .context("building postgrest client")?,
        ),
        StoreSettings::Postgres { database_url } => Arc::new(
            PgUpsertSink::connect(database_url)
                .await
                .context("connecting to postgres")?,
        ),
        StoreSettings::Memory => Arc::new(MemorySink::new()),
    };
    info!(backend = sink.backend(), "store backend ready");

    Ok(JobContext {
        config: Arc::new(config),
        registry: Arc::new(registry),
        http: Arc::new(http),
        sink,
    })
}

/// Run one job to completion without the envelope.
pub async fn run_job(ctx: &JobContext, job: JobKind, payload: JsonValue) -> Result<JsonValue> {
    match job {
        JobKind::Census => jobs::census::run(ctx, &payload).await,
        JobKind::MortgageRates => jobs::mortgage_rates::run(ctx).await,
        JobKind::TaxRates => jobs::tax_rates::run(ctx, payload).await,
        JobKind::Zhvi => jobs::zhvi::run(ctx).await,
        JobKind::MarketTracker => jobs::market_tracker::run(ctx).await,
    }
}

/// Shared entry point for the CLI, scheduler and HTTP surface. A job that is already
/// running rejects a second trigger instead of queueing it.
#[derive(Clone)]
pub struct JobRunner {
    ctx: JobContext,
    guards: Arc<HashMap<JobKind, Arc<Mutex<()>>>>,
}

impl JobRunner {
    pub fn new(ctx: JobContext) -> Self {
        let guards = JobKind::ALL
            .into_iter()
            .map(|job| (job, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            ctx,
            guards: Arc::new(guards),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Run `job` inside the envelope.
    pub async fn invoke(&self, job: JobKind, payload: JsonValue) -> InvocationResponse {
        invoke(job.id(), self.run_guarded(job, payload)).await
    }

    async fn run_guarded(&self, job: JobKind, payload: JsonValue) -> Result<JsonValue> {
        let guard = self
            .guards
            .get(&job)
            .cloned()
            .ok_or(JobError::UnknownJob(job.id().to_string()))?;
        let _running = guard
            .try_lock_owned()
            .map_err(|_| JobError::AlreadyRunning(job))?;
        run_job(&self.ctx, job, payload).await
    }
}

pub async fn runner_from_env() -> Result<JobRunner> {
    let config = EtlConfig::from_env().context("reading configuration")?;
    let ctx = build_context(config).await?;
    Ok(JobRunner::new(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use townfeed_core::TownRegistry;

    pub(crate) fn memory_context(pairs: &[(&str, &str)]) -> (JobContext, Arc<MemorySink>) {
        let mut vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.insert("TOWNFEED_STORE".to_string(), "memory".to_string());
        let config = EtlConfig::from_lookup(move |name| vars.get(name).cloned()).unwrap();
        let sink = Arc::new(MemorySink::new());
        let ctx = JobContext {
            config: Arc::new(config),
            registry: Arc::new(TownRegistry::bundled().unwrap()),
            http: Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap()),
            sink: sink.clone(),
        };
        (ctx, sink)
    }

    #[test]
    fn job_ids_round_trip() {
        for job in JobKind::ALL {
            assert_eq!(job.id().parse::<JobKind>().unwrap(), job);
        }
        assert_eq!("MARKET_TRACKER".parse::<JobKind>().unwrap(), JobKind::MarketTracker);
        assert_eq!(JobKind::MortgageRates.env_suffix(), "MORTGAGE_RATES");
        assert!(matches!("weather".parse::<JobKind>(), Err(JobError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn concurrent_trigger_of_same_job_is_rejected() {
        let (ctx, _sink) = memory_context(&[]);
        let runner = JobRunner::new(ctx);
        let guard = runner.guards[&JobKind::TaxRates].clone();
        let _held = guard.lock().await;

        let response = runner
            .invoke(JobKind::TaxRates, json!({"year": 2024, "rates": []}))
            .await;
        assert_eq!(response.status_code, 500);
        assert_eq!(response.body.error.as_deref(), Some("job tax-rates is already running"));
    }

    #[tokio::test]
    async fn other_jobs_are_not_blocked() {
        let (ctx, sink) = memory_context(&[]);
        let runner = JobRunner::new(ctx);
        let guard = runner.guards[&JobKind::Census].clone();
        let _held = guard.lock().await;

        let response = runner
            .invoke(
                JobKind::TaxRates,
                json!({"year": 2024, "rates": [{"town_id": "hoboken", "general_tax_rate": 1.6}]}),
            )
            .await;
        assert!(response.is_success(), "{:?}", response.body.error);
        assert_eq!(sink.row_count("tax_rates"), 1);
    }
}
