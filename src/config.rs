use std::path::PathBuf;

use crate::error::{MintlabResult, ValidationError};

/// Connection settings for one backing store, read from
/// `{PREFIX}_HOST/PORT/USER/PASSWORD/DATABASE`.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Settings for the external market-data client.
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    /// Key rotation pool. Single `API_KEY` becomes a pool of one.
    pub api_keys: Vec<String>,
    /// Requests per second granted to the shared token bucket.
    pub requests_per_second: f64,
    /// Per-HTTP-call timeout.
    pub call_timeout_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            requests_per_second: 10.0,
            call_timeout_secs: 30,
        }
    }
}

/// Root configuration assembled at the composition root.
///
/// Handlers never read the environment; they receive ports built from this.
#[derive(Debug, Clone)]
pub struct MintlabConfig {
    pub data_dir: PathBuf,
    pub market_data: MarketDataConfig,
    pub timeseries_store: Option<StoreConfig>,
    pub relational_store: Option<StoreConfig>,
    pub log_level: String,
}

impl MintlabConfig {
    /// Reads the recognised environment variables. No other configuration
    /// source is consulted by the core.
    pub fn from_env() -> MintlabResult<Self> {
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .map_err(|_| ValidationError::InvalidField {
                field: "DATA_DIR".to_string(),
                msg: "must be set to the artifact root directory".to_string(),
            })?;

        let api_keys = match std::env::var("API_KEYS") {
            Ok(keys) => keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            Err(_) => std::env::var("API_KEY").map(|k| vec![k]).unwrap_or_default(),
        };

        Ok(Self {
            data_dir,
            market_data: MarketDataConfig {
                api_keys,
                ..Default::default()
            },
            timeseries_store: store_from_env("OLAP"),
            relational_store: store_from_env("OLTP"),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn store_from_env(prefix: &str) -> Option<StoreConfig> {
    let var = |suffix: &str| std::env::var(format!("{prefix}_{suffix}")).ok();

    Some(StoreConfig {
        host: var("HOST")?,
        port: var("PORT")?.parse().ok()?,
        user: var("USER").unwrap_or_default(),
        password: var("PASSWORD").unwrap_or_default(),
        database: var("DATABASE").unwrap_or_default(),
    })
}
