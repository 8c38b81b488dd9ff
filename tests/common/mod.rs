#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::json;
use smallvec::smallvec;
use tempfile::TempDir;

use mintlab::{
    artifact::{manifest::ArtifactKind, store::ArtifactStore},
    data::{
        alert::Alert,
        candle::Candle,
        domain::{AlertId, CallerId, Chain, Interval, MintAddress, Price, TimeRange, Volume},
        snapshot::{DataSnapshot, SnapshotFilters},
        strategy::{
            CostModel, EntryConfig, ExecutionModel, PriorityFeeRange, ProfitTarget, RiskModel,
            StopLossConfig, StrategyConfig,
        },
    },
    error::MintlabResult,
    market_data::{client::MarketDataPort, client::TokenMetadata, provider::HybridCandleProvider},
    store::{candles::CandleStore, relational::RelationalStore},
    Clock, FixedClock, Ports,
};

pub const BASE_TS: i64 = 1_709_251_200; // 2024-03-01T00:00:00Z

pub fn pump_mint() -> MintAddress {
    MintAddress::new("7sKqqFEiB84nXkPJhmKrAHHDjrr2XPcWcfmBGqNapump").unwrap()
}

pub fn mixed_case_mint(i: u64) -> MintAddress {
    // Distinct mints with deliberate mixed case.
    MintAddress::new(format!("MiXeDcAsE{i:02}Qq3nDhMM3NlWPXLSYWXJp5zKwkt7D")).unwrap()
}

// ================================================================================================
// Deterministic synthetic market data
// ================================================================================================

/// In-memory market-data port producing a deterministic price path per
/// `(mint, ts)` via hashing. Never opens a socket; records every mint
/// string it was queried with, byte-exact.
pub struct SyntheticMarketData {
    pub queried_mints: Mutex<Vec<String>>,
    pub calls: Mutex<usize>,
}

impl SyntheticMarketData {
    pub fn new() -> Self {
        Self {
            queried_mints: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
        }
    }

    pub fn candle_at(mint: &MintAddress, chain: Chain, interval: Interval, ts: i64) -> Candle {
        let unit = |salt: u8| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(mint.as_str().as_bytes());
            hasher.update(&ts.to_le_bytes());
            hasher.update(&[salt]);
            let digest = hasher.finalize();
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest.as_bytes()[..8]);
            (u64::from_le_bytes(bytes) % 10_000) as f64 / 10_000.0
        };
        let mid = 0.001 * (1.0 + 0.3 * unit(0));
        let spread = mid * 0.02 * unit(1);
        Candle {
            token_address: mint.clone(),
            chain,
            ts,
            interval,
            open: Price(mid),
            high: Price(mid + spread),
            low: Price(mid - spread),
            close: Price(mid + spread * (unit(2) - 0.5)),
            volume: Volume(500.0 + 9_500.0 * unit(3)),
        }
    }
}

#[async_trait]
impl MarketDataPort for SyntheticMarketData {
    async fn fetch_candles(
        &self,
        mint: &MintAddress,
        chain: Chain,
        interval: Interval,
        range: TimeRange,
    ) -> MintlabResult<Vec<Candle>> {
        self.queried_mints
            .lock()
            .unwrap()
            .push(mint.as_str().to_string());
        *self.calls.lock().unwrap() += 1;
        Ok(range
            .aligned_timestamps(interval)
            .map(|ts| Self::candle_at(mint, chain, interval, ts))
            .collect())
    }

    async fn fetch_metadata(
        &self,
        _mint: &MintAddress,
        _chain: Chain,
    ) -> MintlabResult<TokenMetadata> {
        Ok(TokenMetadata::default())
    }
}

// ================================================================================================
// Lab fixture
// ================================================================================================

/// A full in-process lab: temp-backed stores, synthetic market data, fixed
/// clock.
pub struct Lab {
    pub ports: Ports,
    pub market_data: Arc<SyntheticMarketData>,
    _data_dir: TempDir,
}

impl Lab {
    pub fn new() -> Self {
        let data_dir = TempDir::new().unwrap();
        let candles = Arc::new(CandleStore::open(data_dir.path().join("olap")).unwrap());
        let relational = Arc::new(RelationalStore::open(data_dir.path().join("oltp")).unwrap());
        let artifacts = Arc::new(ArtifactStore::open(data_dir.path().join("artifacts")).unwrap());
        let market_data = Arc::new(SyntheticMarketData::new());
        let provider = Arc::new(HybridCandleProvider::new(
            candles.clone(),
            market_data.clone(),
            64,
        ));

        let ports = Ports {
            clock: Arc::new(FixedClock(
                DateTime::from_timestamp(BASE_TS + 86_400, 0).unwrap(),
            )),
            artifacts,
            provider,
            candles,
            relational,
        };

        Self {
            ports,
            market_data,
            _data_dir: data_dir,
        }
    }

    /// Inserts `count` alerts across `mints`, spaced a minute apart, and
    /// returns the sealed snapshot's artifact id.
    pub fn seed_snapshot(&self, mints: &[MintAddress], count: u64) -> String {
        let mut alert_ids = Vec::new();
        for i in 0..count {
            let mint = &mints[(i % mints.len() as u64) as usize];
            let alert = Alert {
                alert_id: AlertId(0),
                token_address: mint.clone(),
                chain: Chain::Solana,
                caller_id: CallerId(1),
                alert_ts: DateTime::from_timestamp(BASE_TS + 3_600 + i as i64 * 60, 0).unwrap(),
                alert_price: None,
                alert_mcap: None,
                mcap_source: None,
                raw_payload: json!({"chat_id": -42, "message_id": i}),
            };
            let (id, inserted) = self.ports.relational.insert_alert(alert).unwrap();
            assert!(inserted);
            alert_ids.push(id);
        }

        let snapshot = DataSnapshot::new(
            "fixture",
            TimeRange::new(BASE_TS, BASE_TS + 86_400).unwrap(),
            vec!["telegram:fixture".to_string()],
            SnapshotFilters::default(),
            alert_ids,
        )
        .seal()
        .unwrap();

        self.ports
            .artifacts
            .put_canonical(
                ArtifactKind::Snapshot,
                &snapshot,
                vec![],
                self.ports.clock.now(),
            )
            .unwrap()
    }

    /// Publishes the four model artifacts and returns their ids as
    /// `(strategy, exec, cost, risk)`.
    pub fn seed_models(&self, strategy: &StrategyConfig) -> (String, String, String, String) {
        let now = self.ports.clock.now();
        let artifacts = &self.ports.artifacts;
        let strategy_id = artifacts
            .put_canonical(ArtifactKind::Strategy, strategy, vec![], now)
            .unwrap();
        let exec_id = artifacts
            .put_canonical(
                ArtifactKind::ExecModel,
                &ExecutionModel::frictionless(),
                vec![],
                now,
            )
            .unwrap();
        let cost_id = artifacts
            .put_canonical(ArtifactKind::CostModel, &fixture_costs(), vec![], now)
            .unwrap();
        let risk_id = artifacts
            .put_canonical(ArtifactKind::RiskModel, &RiskModel::default(), vec![], now)
            .unwrap();
        (strategy_id, exec_id, cost_id, risk_id)
    }
}

pub fn fixture_costs() -> CostModel {
    CostModel {
        base_fee: 0.0,
        priority_fee_range: PriorityFeeRange { min: 0.0, max: 0.0 },
        trading_fee_pct: 0.01,
    }
}

pub fn fixture_strategy() -> StrategyConfig {
    StrategyConfig {
        entry: EntryConfig::Immediate,
        targets: smallvec![ProfitTarget {
            multiple: 1.8,
            size_fraction: mintlab::data::domain::SizeFraction(1.0),
        }],
        stop_loss: StopLossConfig::Trailing { pct: 0.10 },
        reentry: None,
        costs: None,
    }
}
