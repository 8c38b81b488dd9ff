use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use crate::data::{
    candle::Candle,
    domain::{Chain, Interval, MintAddress, TimeRange},
};

/// Exact-tuple cache key. No fuzzy matching: a request for a different
/// range, even a sub-range of a cached one, is a miss. The mint participates
/// byte-exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub mint: MintAddress,
    pub chain: Chain,
    pub interval: Interval,
    pub range: TimeRange,
}

/// Mutex-guarded LRU of recent provider results.
#[derive(Debug)]
pub struct CandleCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<CacheKey, Vec<Candle>>,
    order: VecDeque<CacheKey>,
}

impl CandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<Candle>> {
        let mut inner = self.inner.lock().expect("candle cache lock");
        let hit = inner.map.get(key).cloned();
        if hit.is_some() {
            // Touch: move to the back of the eviction queue.
            inner.order.retain(|k| k != key);
            inner.order.push_back(key.clone());
        }
        hit
    }

    pub fn put(&self, key: CacheKey, candles: Vec<Candle>) {
        let mut inner = self.inner.lock().expect("candle cache lock");
        if inner.map.insert(key.clone(), candles).is_none() {
            inner.order.push_back(key);
        } else {
            inner.order.retain(|k| k != &key);
            inner.order.push_back(key);
        }
        while inner.map.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("candle cache lock").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::domain::{Price, Volume};

    fn key(from: i64) -> CacheKey {
        CacheKey {
            mint: MintAddress::new("7sKqqFEiB84nXkPJhmKrAHHDjrr2XPcWcfmBGqNapump").unwrap(),
            chain: Chain::Solana,
            interval: Interval::M1,
            range: TimeRange::new(from, from + 600).unwrap(),
        }
    }

    fn candles() -> Vec<Candle> {
        vec![Candle {
            token_address: MintAddress::new("7sKqqFEiB84nXkPJhmKrAHHDjrr2XPcWcfmBGqNapump")
                .unwrap(),
            chain: Chain::Solana,
            ts: 60,
            interval: Interval::M1,
            open: Price(1.0),
            high: Price(1.0),
            low: Price(1.0),
            close: Price(1.0),
            volume: Volume(1.0),
        }]
    }

    #[test]
    fn exact_key_hits_sub_range_misses() {
        let cache = CandleCache::new(4);
        cache.put(key(0), candles());

        assert!(cache.get(&key(0)).is_some());
        // Same mint/interval, different range: miss.
        assert!(cache.get(&key(60)).is_none());
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = CandleCache::new(2);
        cache.put(key(0), candles());
        cache.put(key(1_000), candles());

        // Touch key(0) so key(1000) becomes the eviction candidate.
        cache.get(&key(0));
        cache.put(key(2_000), candles());

        assert!(cache.get(&key(0)).is_some());
        assert!(cache.get(&key(1_000)).is_none());
        assert!(cache.get(&key(2_000)).is_some());
        assert_eq!(cache.len(), 2);
    }
}
