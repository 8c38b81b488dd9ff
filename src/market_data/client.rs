use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::MarketDataConfig,
    data::{
        candle::Candle,
        domain::{Chain, Interval, Mcap, MintAddress, Price, TimeRange, Volume},
    },
    error::{MarketDataError, MintlabResult},
    market_data::budget::ApiBudget,
};

/// Token metadata as reported by the vendor.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TokenMetadata {
    pub symbol: Option<String>,
    pub total_supply: Option<f64>,
    pub price: Option<f64>,
    pub mcap: Option<f64>,
}

/// The seam between the core and the external market-data vendor.
///
/// The hybrid provider and ingestion talk to this trait only; unit tests
/// substitute an in-memory implementation, so no simulation or kernel test
/// ever opens a socket.
#[async_trait]
pub trait MarketDataPort: Send + Sync {
    /// OHLCV rows for one mint over `range` at `interval`. The mint string
    /// is passed through byte-exact.
    async fn fetch_candles(
        &self,
        mint: &MintAddress,
        chain: Chain,
        interval: Interval,
        range: TimeRange,
    ) -> MintlabResult<Vec<Candle>>;

    async fn fetch_metadata(
        &self,
        mint: &MintAddress,
        chain: Chain,
    ) -> MintlabResult<TokenMetadata>;
}

// ================================================================================================
// Retry Policy
// ================================================================================================

/// Exponential backoff with jitter for 429/5xx/transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter applied symmetrically (`0.2` = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based), pre-jitter:
    /// `base * 2^(attempt-1)` capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        exp.min(self.max_delay)
    }

    /// Applies ±jitter with the provided unit sample in `[0, 1)`.
    pub fn jittered(&self, delay: Duration, unit_sample: f64) -> Duration {
        let factor = 1.0 + self.jitter * (2.0 * unit_sample - 1.0);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }
}

// ================================================================================================
// Key Rotation
// ================================================================================================

/// Round-robin API key pool; rotated transparently on auth failures.
#[derive(Debug)]
pub struct KeyRotation {
    keys: Vec<String>,
    current: AtomicUsize,
}

impl KeyRotation {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            current: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> MintlabResult<&str> {
        if self.keys.is_empty() {
            return Err(MarketDataError::MissingApiKey.into());
        }
        let idx = self.current.load(Ordering::Relaxed) % self.keys.len();
        Ok(&self.keys[idx])
    }

    /// Advances to the next key; returns false once every key has been
    /// burned within one request cycle.
    pub fn rotate(&self, tried: &mut usize) -> bool {
        self.current.fetch_add(1, Ordering::Relaxed);
        *tried += 1;
        *tried < self.keys.len()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ================================================================================================
// HTTP Client
// ================================================================================================

/// Rate-limited, retrying HTTP fetcher for OHLCV and token metadata.
///
/// Every request consumes one token from the shared [`ApiBudget`]; an empty
/// bucket parks the caller. 429 and 5xx retry with exponential backoff and
/// ±20% jitter; 4xx auth failures rotate the key pool once through before
/// surfacing; other 4xx surface immediately as non-retryable.
pub struct HttpMarketDataClient {
    http: reqwest::Client,
    base_url: String,
    keys: KeyRotation,
    budget: Arc<ApiBudget>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl HttpMarketDataClient {
    pub fn new(
        base_url: impl Into<String>,
        cfg: &MarketDataConfig,
        budget: Arc<ApiBudget>,
        cancel: CancellationToken,
    ) -> MintlabResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.call_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| MarketDataError::Transient(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            keys: KeyRotation::new(cfg.api_keys.clone()),
            budget,
            retry: RetryPolicy::default(),
            cancel,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
        expected_rows: usize,
    ) -> MintlabResult<T> {
        let mut keys_tried = 0usize;
        let mut attempt = 0u32;

        loop {
            self.budget.acquire(&self.cancel).await?;
            let key = self.keys.current()?;
            let url = format!("{}{}", self.base_url, path);

            let result = self
                .http
                .get(&url)
                .query(query)
                .header("X-API-KEY", key)
                .send()
                .await;

            let outcome = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|e| MarketDataError::Transient(e.to_string()).into());
                    }
                    match status.as_u16() {
                        401 | 403 => {
                            warn!(status = status.as_u16(), "auth failure, rotating key");
                            if self.keys.rotate(&mut keys_tried) {
                                continue;
                            }
                            return Err(MarketDataError::NonRetryable {
                                status: status.as_u16(),
                                msg: "all API keys rejected".to_string(),
                            }
                            .into());
                        }
                        429 => Retryable::RateLimited,
                        s if s >= 500 => Retryable::Server(s),
                        s => {
                            return Err(MarketDataError::NonRetryable {
                                status: s,
                                msg: resp.text().await.unwrap_or_default(),
                            }
                            .into());
                        }
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    Retryable::Transport(e.to_string())
                }
                Err(e) => {
                    return Err(MarketDataError::Transient(e.to_string()).into());
                }
            };

            attempt += 1;
            if attempt > self.retry.max_retries {
                return Err(MarketDataError::FetchFailed {
                    attempts: attempt,
                    msg: outcome.to_string(),
                    outstanding: expected_rows,
                }
                .into());
            }

            let delay = self
                .retry
                .jittered(self.retry.delay_for(attempt), rand::rng().random::<f64>());
            debug!(attempt, ?delay, cause = %outcome, "retrying market-data call");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    return Err(crate::error::MintlabError::Cancelled {
                        reason: crate::error::CancelReason::UserRequested,
                    });
                }
            }
        }
    }
}

#[derive(Debug)]
enum Retryable {
    RateLimited,
    Server(u16),
    Transport(String),
}

impl std::fmt::Display for Retryable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Retryable::RateLimited => f.write_str("rate limited (429)"),
            Retryable::Server(s) => write!(f, "server error ({s})"),
            Retryable::Transport(msg) => write!(f, "transport: {msg}"),
        }
    }
}

// ================================================================================================
// Wire Format
// ================================================================================================

#[derive(Debug, Deserialize)]
struct OhlcvResponse {
    data: OhlcvData,
}

#[derive(Debug, Deserialize)]
struct OhlcvData {
    items: Vec<OhlcvItem>,
}

#[derive(Debug, Deserialize)]
struct OhlcvItem {
    #[serde(rename = "unixTime")]
    unix_time: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    data: TokenMetadata,
}

/// Converts vendor rows, flooring timestamps to the interval boundary and
/// dropping rows outside the requested range after flooring.
fn items_to_candles(
    items: Vec<OhlcvItem>,
    mint: &MintAddress,
    chain: Chain,
    interval: Interval,
    range: TimeRange,
) -> Vec<Candle> {
    items
        .into_iter()
        .filter_map(|item| {
            let ts = interval.floor_ts(item.unix_time);
            if !range.contains(ts) {
                return None;
            }
            Some(Candle {
                token_address: mint.clone(),
                chain,
                ts,
                interval,
                open: Price(item.o),
                high: Price(item.h),
                low: Price(item.l),
                close: Price(item.c),
                volume: Volume(item.v),
            })
        })
        .collect()
}

#[async_trait]
impl MarketDataPort for HttpMarketDataClient {
    async fn fetch_candles(
        &self,
        mint: &MintAddress,
        chain: Chain,
        interval: Interval,
        range: TimeRange,
    ) -> MintlabResult<Vec<Candle>> {
        let expected = range.aligned_timestamps(interval).count();
        let query = [
            // The mint goes out byte-exact; no case folding at the wire.
            ("address", mint.as_str().to_string()),
            ("chain", chain.to_string()),
            ("type", format!("{}s", interval.seconds())),
            ("time_from", range.from_ts.to_string()),
            ("time_to", range.to_ts.to_string()),
        ];
        let query: Vec<(&str, String)> = query.iter().map(|(k, v)| (*k, v.clone())).collect();

        let resp: OhlcvResponse = self.get_json("/defi/ohlcv", &query, expected).await?;
        Ok(items_to_candles(resp.data.items, mint, chain, interval, range))
    }

    async fn fetch_metadata(
        &self,
        mint: &MintAddress,
        chain: Chain,
    ) -> MintlabResult<TokenMetadata> {
        let query = vec![
            ("address", mint.as_str().to_string()),
            ("chain", chain.to_string()),
        ];
        let resp: MetadataResponse = self.get_json("/defi/token_overview", &query, 0).await?;
        Ok(resp.data)
    }
}

/// Market cap straight from metadata when the vendor reports it, else
/// `price * supply`.
pub fn metadata_mcap(meta: &TokenMetadata) -> Option<Mcap> {
    if let Some(mcap) = meta.mcap {
        return Some(Mcap(mcap));
    }
    match (meta.price, meta.total_supply) {
        (Some(price), Some(supply)) => Some(Mcap(price * supply)),
        _ => None,
    }
}
