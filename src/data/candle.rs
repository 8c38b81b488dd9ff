use itertools::Itertools;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    data::domain::{Chain, GapPolicy, Interval, MintAddress, Price, TimeRange, Volume},
    error::{MarketDataError, MintlabError, MintlabResult, SimError},
};

/// Primary key of a candle row: `(chain, token_address, interval, ts)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandleKey {
    pub chain: Chain,
    pub token_address: MintAddress,
    pub interval: Interval,
    pub ts: i64,
}

/// One immutable OHLCV record at a fixed interval.
///
/// `ts` is floored to the interval boundary. Rows are never mutated after
/// creation; the store collapses repeated keys with last-arrival-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub token_address: MintAddress,
    pub chain: Chain,
    /// Open time, unix seconds, aligned to `interval`.
    pub ts: i64,
    pub interval: Interval,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Volume,
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            chain: self.chain,
            token_address: self.token_address.clone(),
            interval: self.interval,
            ts: self.ts,
        }
    }

    pub fn is_aligned(&self) -> bool {
        self.interval.is_aligned(self.ts)
    }

    /// True when the candle's price range touches `price`.
    pub fn reaches(&self, price: Price) -> bool {
        self.low.0 <= price.0 && price.0 <= self.high.0
    }
}

/// Decimal string form used when persisting mint-scale prices that would
/// lose precision as shortest-round-trip floats (sub-1e-9 quotes).
pub fn persisted_price_repr(price: Price) -> String {
    match Decimal::from_f64_retain(price.0) {
        Some(d) => d.normalize().to_string(),
        None => price.0.to_string(),
    }
}

// ================================================================================================
// Candle Slice
// ================================================================================================

/// An ordered, deduplicated, gap-checked candle sequence over one
/// `(mint, chain, interval)` within a requested range.
///
/// Construction enforces invariants the simulation engine relies on:
/// same interval throughout, `ts % interval == 0` for every row, strictly
/// increasing timestamps. Gaps are recorded; under [`GapPolicy::Strict`]
/// they are an error carrying the exact missing-timestamp list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleSlice {
    interval: Interval,
    range: TimeRange,
    candles: Vec<Candle>,
    gaps: Vec<i64>,
}

impl CandleSlice {
    /// Assembles a slice from raw rows (any order, duplicates allowed).
    ///
    /// Rows outside `range` are dropped. Duplicate timestamps keep the first
    /// occurrence in input order, so a caller that places compacted store
    /// rows before freshly fetched rows gets store-representative reads.
    pub fn assemble(
        mut rows: Vec<Candle>,
        range: TimeRange,
        interval: Interval,
        policy: GapPolicy,
    ) -> MintlabResult<Self> {
        rows.retain(|c| range.contains(c.ts));

        for row in &rows {
            if row.interval != interval {
                return Err(SimError::IntervalMismatch {
                    expected: interval.seconds(),
                    found: row.interval.seconds(),
                }
                .into());
            }
            if !row.is_aligned() {
                return Err(SimError::Misaligned {
                    interval: interval.seconds(),
                    ts: row.ts,
                }
                .into());
            }
        }

        // Stable sort + keep-first dedup preserves arrival preference.
        rows.sort_by_key(|c| c.ts);
        let candles: Vec<Candle> = rows.into_iter().unique_by(|c| c.ts).collect();

        let gaps = missing_timestamps(&candles, range, interval);
        if policy == GapPolicy::Strict && !gaps.is_empty() {
            return Err(MintlabError::MarketData(MarketDataError::Gaps {
                interval: interval.seconds(),
                missing: gaps,
            }));
        }

        Ok(Self {
            interval,
            range,
            candles,
            gaps,
        })
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Missing aligned timestamps inside the requested range.
    pub fn gaps(&self) -> &[i64] {
        &self.gaps
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candle> {
        self.candles.iter()
    }

    /// True when every aligned timestamp in the range is present.
    pub fn is_dense(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Timestamps actually present, in order.
    pub fn timestamps(&self) -> impl Iterator<Item = i64> + '_ {
        self.candles.iter().map(|c| c.ts)
    }
}

fn missing_timestamps(candles: &[Candle], range: TimeRange, interval: Interval) -> Vec<i64> {
    let mut present = candles.iter().map(|c| c.ts).peekable();
    let mut gaps = Vec::new();

    for expected in range.aligned_timestamps(interval) {
        while present.peek().is_some_and(|ts| *ts < expected) {
            present.next();
        }
        if present.peek() == Some(&expected) {
            present.next();
        } else {
            gaps.push(expected);
        }
    }
    gaps
}
