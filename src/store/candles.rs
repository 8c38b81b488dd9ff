use std::{
    fs,
    fs::File,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Datelike, Utc};
use itertools::Itertools;
use polars::{df, frame::DataFrame, prelude::*};
use tracing::debug;

use crate::{
    data::{
        candle::{persisted_price_repr, Candle},
        domain::{Chain, Interval, MintAddress, Price, TimeRange, Volume},
    },
    error::{MintlabResult, StorageError},
};

/// Append-only OHLCV store over parquet partitions.
///
/// Layout: `<root>/ohlcv/<chain>/<YYYY-MM>.parquet`, rows ordered by
/// `(token_address, interval_seconds, ts)` inside each partition. Repeated
/// primary keys collapse with last-arrival-wins: every appended batch gets a
/// monotonically increasing `arrival` stamp, reads keep the max-arrival row
/// per key, and [`CandleStore::compact`] rewrites partitions so key groups
/// become singletons (after which read-side dedup picks from groups of one).
///
/// Mint addresses are persisted byte-exact; no case folding happens at this
/// layer. Mint-scale closes are additionally persisted as decimal strings so
/// sub-1e-9 quotes survive a float round-trip.
pub struct CandleStore {
    root: PathBuf,
    /// Serialises writers; readers work on immutable snapshots (rename-only
    /// mutation).
    write_lock: Mutex<()>,
}

impl CandleStore {
    pub fn open(root: impl Into<PathBuf>) -> MintlabResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("ohlcv")).map_err(StorageError::Io)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Appends a candle batch. Duplicate keys inside the batch and against
    /// existing rows are tolerated; later arrivals shadow earlier ones at
    /// read time. Returns the number of rows appended.
    pub fn upsert_batch(&self, candles: &[Candle]) -> MintlabResult<usize> {
        if candles.is_empty() {
            return Ok(0);
        }
        for candle in candles {
            if !candle.is_aligned() {
                return Err(StorageError::DataIntegrity(format!(
                    "candle ts {} not aligned to {}s",
                    candle.ts,
                    candle.interval.seconds()
                ))
                .into());
            }
        }

        let _guard = self.write_lock.lock().expect("candle store write lock");

        let mut appended = 0;
        let by_partition = candles
            .iter()
            .into_group_map_by(|c| self.partition_path(c.chain, c.ts));

        for (path, rows) in by_partition {
            let existing = if path.exists() {
                Some(read_partition(&path)?)
            } else {
                None
            };
            let next_arrival = match &existing {
                Some(df) => max_arrival(df)?.map_or(0, |a| a + 1),
                None => 0,
            };

            let fresh = rows_to_frame(&rows, next_arrival)?;
            let merged = match existing {
                Some(mut df) => {
                    df.vstack_mut(&fresh)
                        .map_err(|e| StorageError::DataFrame(e.to_string()))?;
                    df
                }
                None => fresh,
            };

            write_partition(&path, merged)?;
            appended += rows.len();
        }

        debug!(rows = appended, "candle batch appended");
        Ok(appended)
    }

    /// All rows for `(mint, chain, interval)` with `ts ∈ range`, deduplicated
    /// last-arrival-wins and ordered by `ts`.
    pub fn read_range(
        &self,
        mint: &MintAddress,
        chain: Chain,
        interval: Interval,
        range: TimeRange,
    ) -> MintlabResult<Vec<Candle>> {
        let mut rows = Vec::new();
        for path in self.partitions_for(chain, range) {
            if !path.exists() {
                continue;
            }
            let df = read_partition(&path)?;
            let filtered = df
                .lazy()
                .filter(
                    col("token_address")
                        .eq(lit(mint.as_str()))
                        .and(col("interval_seconds").eq(lit(interval.seconds())))
                        .and(col("ts").gt_eq(lit(range.from_ts)))
                        .and(col("ts").lt_eq(lit(range.to_ts))),
                )
                .collect()
                .map_err(|e| StorageError::DataFrame(e.to_string()))?;
            rows.extend(frame_to_rows(&filtered)?);
        }

        // Last arrival wins per timestamp, then candle order.
        rows.sort_by_key(|(arrival, candle)| (candle.ts, *arrival));
        let deduped = rows
            .into_iter()
            .rev()
            .unique_by(|(_, candle)| candle.ts)
            .map(|(_, candle)| candle)
            .sorted_by_key(|c| c.ts)
            .collect();
        Ok(deduped)
    }

    /// Offline compaction: rewrites every partition keeping only the
    /// max-arrival row per `(token_address, interval, ts)` key. Returns the
    /// number of superseded rows removed.
    pub fn compact(&self) -> MintlabResult<usize> {
        let _guard = self.write_lock.lock().expect("candle store write lock");

        let key_cols = [
            "token_address".to_string(),
            "interval_seconds".to_string(),
            "ts".to_string(),
        ];
        let mut removed = 0;
        for path in self.all_partitions()? {
            let df = read_partition(&path)?;
            let before = df.height();
            let compacted = df
                .sort(["arrival"], SortMultipleOptions::default())
                .map_err(|e| StorageError::DataFrame(e.to_string()))?
                .unique_stable(Some(&key_cols), UniqueKeepStrategy::Last, None)
                .map_err(|e| StorageError::DataFrame(e.to_string()))?
                .sort(
                    ["token_address", "interval_seconds", "ts"],
                    SortMultipleOptions::default(),
                )
                .map_err(|e| StorageError::DataFrame(e.to_string()))?;
            removed += before - compacted.height();
            write_partition(&path, compacted)?;
        }
        debug!(removed, "candle store compacted");
        Ok(removed)
    }

    /// Total physical rows across partitions (duplicates included).
    pub fn physical_row_count(&self) -> MintlabResult<usize> {
        let mut total = 0;
        for path in self.all_partitions()? {
            total += read_partition(&path)?.height();
        }
        Ok(total)
    }

    fn partition_path(&self, chain: Chain, ts: i64) -> PathBuf {
        let month = DateTime::<Utc>::from_timestamp(ts, 0)
            .map(|dt| format!("{:04}-{:02}", dt.year(), dt.month()))
            .unwrap_or_else(|| "out-of-range".to_string());
        self.root
            .join("ohlcv")
            .join(chain_dir(chain))
            .join(format!("{month}.parquet"))
    }

    fn partitions_for(&self, chain: Chain, range: TimeRange) -> Vec<PathBuf> {
        // 27-day hops cannot skip a month (the shortest is 28 days), so
        // every partition touched by the range appears; duplicates collapse.
        let mut paths = Vec::new();
        let mut ts = range.from_ts;
        loop {
            let path = self.partition_path(chain, ts);
            if paths.last() != Some(&path) {
                paths.push(path);
            }
            if ts >= range.to_ts {
                break;
            }
            ts = (ts + 27 * 86_400).min(range.to_ts);
        }
        paths
    }

    fn all_partitions(&self) -> MintlabResult<Vec<PathBuf>> {
        let mut out = Vec::new();
        let ohlcv = self.root.join("ohlcv");
        for chain_entry in fs::read_dir(&ohlcv).map_err(StorageError::Io)? {
            let chain_dir = chain_entry.map_err(StorageError::Io)?.path();
            if !chain_dir.is_dir() {
                continue;
            }
            for file in fs::read_dir(&chain_dir).map_err(StorageError::Io)? {
                let path = file.map_err(StorageError::Io)?.path();
                if path.extension().is_some_and(|e| e == "parquet") {
                    out.push(path);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn chain_dir(chain: Chain) -> String {
    chain.to_string().replace(':', "-")
}

// ================================================================================================
// Frame <-> Row Conversion
// ================================================================================================

fn rows_to_frame(rows: &[&Candle], first_arrival: i64) -> MintlabResult<DataFrame> {
    let token_address: Vec<&str> = rows.iter().map(|c| c.token_address.as_str()).collect();
    let chain: Vec<String> = rows.iter().map(|c| c.chain.to_string()).collect();
    let ts: Vec<i64> = rows.iter().map(|c| c.ts).collect();
    let interval_seconds: Vec<i64> = rows.iter().map(|c| c.interval.seconds()).collect();
    let open: Vec<f64> = rows.iter().map(|c| c.open.0).collect();
    let high: Vec<f64> = rows.iter().map(|c| c.high.0).collect();
    let low: Vec<f64> = rows.iter().map(|c| c.low.0).collect();
    let close: Vec<f64> = rows.iter().map(|c| c.close.0).collect();
    let close_decimal: Vec<String> = rows.iter().map(|c| persisted_price_repr(c.close)).collect();
    let volume: Vec<f64> = rows.iter().map(|c| c.volume.0).collect();
    let arrival: Vec<i64> = (0..rows.len() as i64).map(|i| first_arrival + i).collect();

    df!(
        "token_address" => token_address,
        "chain" => chain,
        "ts" => ts,
        "interval_seconds" => interval_seconds,
        "open" => open,
        "high" => high,
        "low" => low,
        "close" => close,
        "close_decimal" => close_decimal,
        "volume" => volume,
        "arrival" => arrival,
    )
    .map_err(|e| StorageError::DataFrame(e.to_string()).into())
}

fn frame_to_rows(df: &DataFrame) -> MintlabResult<Vec<(i64, Candle)>> {
    let col_err = |e: PolarsError| StorageError::DataFrame(e.to_string());

    let token_address = df.column("token_address").map_err(col_err)?.str().map_err(col_err)?;
    let chain = df.column("chain").map_err(col_err)?.str().map_err(col_err)?;
    let ts = df.column("ts").map_err(col_err)?.i64().map_err(col_err)?;
    let interval = df
        .column("interval_seconds")
        .map_err(col_err)?
        .i64()
        .map_err(col_err)?;
    let open = df.column("open").map_err(col_err)?.f64().map_err(col_err)?;
    let high = df.column("high").map_err(col_err)?.f64().map_err(col_err)?;
    let low = df.column("low").map_err(col_err)?.f64().map_err(col_err)?;
    let close = df.column("close").map_err(col_err)?.f64().map_err(col_err)?;
    let volume = df.column("volume").map_err(col_err)?.f64().map_err(col_err)?;
    let arrival = df.column("arrival").map_err(col_err)?.i64().map_err(col_err)?;

    let missing = || StorageError::DataIntegrity("null cell in candle partition".to_string());

    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let candle = Candle {
            token_address: MintAddress::new(token_address.get(i).ok_or_else(missing)?)?,
            chain: chain.get(i).ok_or_else(missing)?.parse()?,
            ts: ts.get(i).ok_or_else(missing)?,
            interval: Interval::new(interval.get(i).ok_or_else(missing)?)?,
            open: Price(open.get(i).ok_or_else(missing)?),
            high: Price(high.get(i).ok_or_else(missing)?),
            low: Price(low.get(i).ok_or_else(missing)?),
            close: Price(close.get(i).ok_or_else(missing)?),
            volume: Volume(volume.get(i).ok_or_else(missing)?),
        };
        rows.push((arrival.get(i).ok_or_else(missing)?, candle));
    }
    Ok(rows)
}

fn max_arrival(df: &DataFrame) -> MintlabResult<Option<i64>> {
    let arrival = df
        .column("arrival")
        .and_then(|c| c.i64().cloned())
        .map_err(|e| StorageError::DataFrame(e.to_string()))?;
    Ok(arrival.max())
}

fn read_partition(path: &Path) -> MintlabResult<DataFrame> {
    let file = File::open(path).map_err(StorageError::Io)?;
    ParquetReader::new(file)
        .finish()
        .map_err(|e| StorageError::DataFrame(e.to_string()).into())
}

/// Atomic partition replacement: write to a sibling temp file, rename over.
fn write_partition(path: &Path, mut df: DataFrame) -> MintlabResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(StorageError::Io)?;
    }
    let tmp = path.with_extension("parquet.tmp");
    let file = File::create(&tmp).map_err(StorageError::Io)?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(|e| StorageError::DataFrame(e.to_string()))?;
    fs::rename(&tmp, path).map_err(StorageError::Io)?;
    Ok(())
}
