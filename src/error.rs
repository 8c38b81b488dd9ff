use thiserror::Error;

pub type MintlabResult<T> = Result<T, MintlabError>;

#[derive(Debug, Error)]
pub enum MintlabError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    MarketData(#[from] MarketDataError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Sim(#[from] SimError),

    #[error(transparent)]
    System(#[from] SystemError),

    #[error("Cancelled: {reason}")]
    Cancelled { reason: CancelReason },
}

/// Errors raised by schema and invariant checks on caller input.
///
/// Never retried; surfaces to the caller with the offending field path.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {msg}")]
    InvalidField { field: String, msg: String },

    #[error("Invalid mint address '{0}': must be 32-44 characters")]
    InvalidMintAddress(String),

    #[error("Invalid chain tag: '{0}'")]
    InvalidChain(String),

    #[error("Invalid interval: {0} seconds")]
    InvalidInterval(i64),

    #[error("Invalid time range: from {from} to {to}")]
    InvalidTimeRange { from: i64, to: i64 },

    #[error("Strategy config rejected: {0}")]
    Strategy(String),

    #[error("Snapshot is not sealed: {0}")]
    UnsealedSnapshot(String),

    #[error("Failed to parse enum: {0}")]
    ParseEnum(#[from] strum::ParseError),
}

/// Errors from the backing stores (time-series and relational).
///
/// Storage failures are fatal to the request that triggered them.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("DataFrame error: {0}")]
    DataFrame(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid run status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),
}

/// Errors from the external market-data path.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("Transient remote failure: {0}")]
    Transient(String),

    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Fetch failed after {attempts} attempts: {msg} ({outstanding} candles outstanding)")]
    FetchFailed {
        attempts: u32,
        msg: String,
        outstanding: usize,
    },

    #[error("Non-retryable remote error (status {status}): {msg}")]
    NonRetryable { status: u16, msg: String },

    #[error("No API key configured")]
    MissingApiKey,

    #[error("Requested range has gaps at interval {interval}s: {} missing timestamps", missing.len())]
    Gaps { interval: i64, missing: Vec<i64> },
}

/// Errors from the content-addressed artifact store.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact {id} is {status}, expected active")]
    NotActive { id: String, status: String },

    #[error("Duplicate artifact id {id} with differing content")]
    ContentMismatch { id: String },

    #[error("Replay hash mismatch for '{kind}': expected {expected}, got {actual}")]
    ReplayMismatch {
        kind: String,
        expected: String,
        actual: String,
    },

    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Canonical serialization failed: {0}")]
    Canonical(String),
}

/// Errors from the simulation engine and indicator kernel.
///
/// Pure components: these carry no I/O causes.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Empty candle window for alert {0}")]
    EmptyWindow(String),

    #[error("Candle window not aligned to {interval}s at ts {ts}")]
    Misaligned { interval: i64, ts: i64 },

    #[error("Window interval mismatch: expected {expected}s, found {found}s")]
    IntervalMismatch { expected: i64, found: i64 },

    #[error("Non-finite price encountered at ts {0}")]
    NonFinitePrice(i64),
}

/// Internal invariant violations and bugs. Aborts the run.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Missing internal field: {0}")]
    MissingField(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

/// Why a cancellation fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserRequested,
    AlertTimeout,
    ExperimentTimeout,
    HttpTimeout,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CancelReason::UserRequested => "user requested",
            CancelReason::AlertTimeout => "per-alert timeout",
            CancelReason::ExperimentTimeout => "experiment wall clock exceeded",
            CancelReason::HttpTimeout => "http call timeout",
        };
        f.write_str(s)
    }
}

impl MintlabError {
    /// Process exit code for the command surface.
    ///
    /// 0 success, 2 validation error, 3 not found, 4 remote failure after
    /// retries, 5 cancelled. Everything else maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            MintlabError::Validation(_) => 2,
            MintlabError::Storage(StorageError::KeyNotFound(_))
            | MintlabError::Storage(StorageError::RunNotFound(_))
            | MintlabError::Artifact(ArtifactError::NotFound(_)) => 3,
            MintlabError::MarketData(MarketDataError::FetchFailed { .. })
            | MintlabError::MarketData(MarketDataError::NonRetryable { .. }) => 4,
            MintlabError::Cancelled { .. } => 5,
            _ => 1,
        }
    }

    /// True for failures the market-data client may retry locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MintlabError::MarketData(MarketDataError::Transient(_))
                | MintlabError::MarketData(MarketDataError::RateLimited { .. })
        )
    }
}
