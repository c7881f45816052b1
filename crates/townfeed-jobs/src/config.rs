//! Process configuration read once from the environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use townfeed_core::{RegistryError, TownRegistry};
use townfeed_sources::{census, fred, market, zhvi, ColumnStyle};
use townfeed_storage::DEFAULT_BATCH_SIZE;

use crate::JobKind;

pub const DEFAULT_USER_AGENT: &str = "MiniAppETL/1.0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: String, value: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Where upserts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
    Postgrest { base_url: String, service_key: String },
    Postgres { database_url: String },
    /// In-process store; nothing is persisted.
    Memory,
}

impl StoreSettings {
    pub fn backend(&self) -> &'static str {
        match self {
            StoreSettings::Postgrest { .. } => "postgrest",
            StoreSettings::Postgres { .. } => "postgres",
            StoreSettings::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub store: StoreSettings,
    pub store_timeout: Duration,
    pub towns_path: Option<PathBuf>,
    pub user_agent: String,
    pub batch_size: usize,
    pub market_columns: ColumnStyle,
    pub scheduler_enabled: bool,
    pub census: SourceSettings,
    pub mortgage_rates: SourceSettings,
    pub zhvi: SourceSettings,
    pub market_tracker: SourceSettings,
    crons: HashMap<JobKind, Option<String>>,
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank are the same.
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::MissingEnv(name))
    }

    fn parse<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: name.to_string(),
                value,
            }),
        }
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
            .unwrap_or(false)
    }

    fn source(
        &self,
        job: JobKind,
        default_url: &str,
        default_timeout_secs: u64,
    ) -> Result<SourceSettings, ConfigError> {
        let suffix = job.env_suffix();
        let url = self
            .get(&format!("TOWNFEED_URL_{suffix}"))
            .unwrap_or_else(|| default_url.to_string());
        let secs: u64 = self.parse(&format!("TOWNFEED_TIMEOUT_{suffix}_SECS"), default_timeout_secs)?;
        Ok(SourceSettings {
            url,
            timeout: Duration::from_secs(secs.max(1)),
        })
    }
}

impl EtlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let store = match env.get("TOWNFEED_STORE").as_deref().unwrap_or("postgrest") {
            "postgrest" | "supabase" => StoreSettings::Postgrest {
                base_url: env.require("SUPABASE_URL")?,
                service_key: env.require("SUPABASE_SERVICE_KEY")?,
            },
            "postgres" => StoreSettings::Postgres {
                database_url: env.require("DATABASE_URL")?,
            },
            "memory" => StoreSettings::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    name: "TOWNFEED_STORE".to_string(),
                    value: other.to_string(),
                })
            }
        };

        let market_columns = match env.get("TOWNFEED_MARKET_COLUMNS") {
            None => ColumnStyle::default(),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "TOWNFEED_MARKET_COLUMNS".to_string(),
                value,
            })?,
        };

        let mut crons = HashMap::new();
        for job in JobKind::ALL {
            let cron = match env.get(&format!("TOWNFEED_CRON_{}", job.env_suffix())) {
                Some(value) if value.eq_ignore_ascii_case("off") => None,
                Some(value) => Some(value),
                None => job.default_cron().map(str::to_string),
            };
            crons.insert(job, cron);
        }

        Ok(Self {
            store,
            store_timeout: Duration::from_secs(env.parse("TOWNFEED_STORE_TIMEOUT_SECS", 60u64)?.max(1)),
            towns_path: env.get("TOWNFEED_TOWNS_PATH").map(PathBuf::from),
            user_agent: env
                .get("TOWNFEED_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            batch_size: env.parse("TOWNFEED_BATCH_SIZE", DEFAULT_BATCH_SIZE)?.max(1),
            market_columns,
            scheduler_enabled: env.flag("TOWNFEED_SCHEDULER_ENABLED"),
            census: env.source(JobKind::Census, census::DEFAULT_BASE_URL, 60)?,
            mortgage_rates: env.source(JobKind::MortgageRates, fred::DEFAULT_BASE_URL, 30)?,
            zhvi: env.source(JobKind::Zhvi, zhvi::DEFAULT_URL, 120)?,
            market_tracker: env.source(JobKind::MarketTracker, market::DEFAULT_URL, 600)?,
            crons,
        })
    }

    /// Cron expression for `job`, or `None` when it only runs on demand.
    pub fn cron_for(&self, job: JobKind) -> Option<&str> {
        self.crons.get(&job).and_then(|cron| cron.as_deref())
    }

    /// The bundled town table unless `TOWNFEED_TOWNS_PATH` points elsewhere.
    pub fn load_registry(&self) -> Result<TownRegistry, ConfigError> {
        let registry = match &self.towns_path {
            Some(path) => TownRegistry::from_path(path)?,
            None => TownRegistry::bundled()?,
        };
        Ok(registry)
    }
}
