use std::sync::Arc;

use tracing::{debug, instrument};

use crate::{
    data::{
        candle::{Candle, CandleSlice},
        domain::{Chain, GapPolicy, Interval, MintAddress, TimeRange},
    },
    error::MintlabResult,
    market_data::{
        cache::{CacheKey, CandleCache},
        client::MarketDataPort,
    },
    store::candles::CandleStore,
};

/// Cache-tiered OHLCV acquisition: in-memory LRU, then the time-series
/// store, then the external API for whatever is still missing.
///
/// Each tier short-circuits when it satisfies the full requested range.
/// API results are written back to the store before being merged into the
/// response, so the next request over the same range is served locally.
/// On merge, store rows shadow freshly fetched rows for overlapping
/// timestamps (store order is the compacted, deterministic representative).
pub struct HybridCandleProvider {
    cache: CandleCache,
    store: Arc<CandleStore>,
    api: Arc<dyn MarketDataPort>,
}

impl HybridCandleProvider {
    pub fn new(store: Arc<CandleStore>, api: Arc<dyn MarketDataPort>, cache_capacity: usize) -> Self {
        Self {
            cache: CandleCache::new(cache_capacity),
            store,
            api,
        }
    }

    /// The C4 contract: an ordered, deduplicated, gap-checked slice within
    /// `[from, to]` at the requested interval. Under [`GapPolicy::Strict`]
    /// any residual gap is an error carrying the missing timestamps.
    #[instrument(skip_all, fields(mint = %mint, chain = %chain))]
    pub async fn get_candles(
        &self,
        mint: &MintAddress,
        chain: Chain,
        range: TimeRange,
        interval: Interval,
        policy: GapPolicy,
    ) -> MintlabResult<CandleSlice> {
        let key = CacheKey {
            mint: mint.clone(),
            chain,
            interval,
            range,
        };

        // 1. Exact-tuple LRU.
        if let Some(rows) = self.cache.get(&key) {
            debug!("cache hit");
            return CandleSlice::assemble(rows, range, interval, policy);
        }

        // 2. Time-series store.
        let stored = self.store.read_range(mint, chain, interval, range)?;
        let slice = CandleSlice::assemble(stored.clone(), range, interval, GapPolicy::BestEffort)?;
        if slice.is_dense() {
            self.cache.put(key, stored);
            return CandleSlice::assemble(slice.candles().to_vec(), range, interval, policy);
        }

        // 3. External API for the missing sub-ranges; write back, merge.
        let mut merged = stored;
        for gap_range in contiguous_ranges(slice.gaps(), interval) {
            let fetched = self
                .api
                .fetch_candles(mint, chain, interval, gap_range)
                .await?;
            if !fetched.is_empty() {
                self.store.upsert_batch(&fetched)?;
                merged.extend(fetched);
            }
        }

        let slice = CandleSlice::assemble(merged, range, interval, policy)?;
        self.cache.put(key, slice.candles().to_vec());
        Ok(slice)
    }
}

/// Groups missing aligned timestamps into contiguous fetch ranges.
fn contiguous_ranges(gaps: &[i64], interval: Interval) -> Vec<TimeRange> {
    let step = interval.seconds();
    let mut out: Vec<TimeRange> = Vec::new();
    for &ts in gaps {
        match out.last_mut() {
            Some(last) if last.to_ts + step == ts => last.to_ts = ts,
            _ => out.push(TimeRange {
                from_ts: ts,
                to_ts: ts,
            }),
        }
    }
    out
}
