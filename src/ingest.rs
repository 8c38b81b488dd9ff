use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::{
    data::{
        alert::Alert,
        domain::{AlertId, Chain, GapPolicy, Interval, MintAddress, Price, TimeRange},
    },
    error::{MintlabResult, StorageError, ValidationError},
    market_data::{
        metadata::{McapInputs, McapResolver},
        provider::HybridCandleProvider,
    },
    store::relational::RelationalStore,
};

/// One line of the alert export produced by the external chat pipeline.
///
/// Chat parsing and address extraction happen upstream; this is already a
/// structured record. Ingestion here is purely idempotent insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub chat_id: i64,
    pub message_id: i64,
    pub token_address: String,
    pub chain: Chain,
    pub caller: String,
    pub ts: i64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub mcap: Option<f64>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Counts from one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub parsed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

/// Appends alerts from an NDJSON export idempotently.
///
/// Running the same export twice leaves the alert table unchanged after the
/// first pass: duplicates are counted, not re-inserted. Malformed lines are
/// skipped with a warning rather than aborting the file.
#[instrument(skip_all, fields(source = %source))]
pub fn ingest_alerts(
    path: impl AsRef<Path>,
    source: &str,
    relational: &RelationalStore,
) -> MintlabResult<IngestReport> {
    let file = File::open(path.as_ref()).map_err(StorageError::Io)?;
    let reader = BufReader::new(file);
    let resolver = McapResolver::new();

    let mut report = IngestReport::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(StorageError::Io)?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AlertRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping malformed alert line");
                report.skipped += 1;
                continue;
            }
        };
        report.parsed += 1;

        match insert_record(record, source, relational, &resolver) {
            Ok(true) => report.inserted += 1,
            Ok(false) => report.duplicates += 1,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping unstorable alert");
                report.skipped += 1;
            }
        }
    }

    relational.save()?;
    info!(
        inserted = report.inserted,
        duplicates = report.duplicates,
        skipped = report.skipped,
        "alert ingestion finished"
    );
    Ok(report)
}

fn insert_record(
    record: AlertRecord,
    source: &str,
    relational: &RelationalStore,
    resolver: &McapResolver,
) -> MintlabResult<bool> {
    let mint = MintAddress::new(record.token_address)?;
    let caller_id = relational.upsert_caller(source, &record.caller);
    relational.upsert_token(record.chain, mint.clone(), None);

    let alert_ts = chrono::DateTime::from_timestamp(record.ts, 0).ok_or_else(|| {
        ValidationError::InvalidField {
            field: "ts".to_string(),
            msg: format!("{} is not a valid unix timestamp", record.ts),
        }
    })?;

    let raw_payload = json!({
        "chat_id": record.chat_id,
        "message_id": record.message_id,
        "text": record.text,
    });

    let alert_price = record.price.map(Price);
    let (alert_mcap, mcap_source) = match record.mcap {
        // Caller-reported mcap is taken as payload-derived.
        Some(mcap) => (
            Some(crate::data::domain::Mcap(mcap)),
            Some(crate::data::alert::McapSource::PayloadRegex),
        ),
        None => {
            let derived = resolver.resolve(
                &mint,
                &McapInputs {
                    alert_price,
                    payload: Some(&raw_payload),
                    ..Default::default()
                },
            );
            match derived {
                Some((mcap, src)) => (Some(mcap), Some(src)),
                None => (None, None),
            }
        }
    };

    let (_, inserted) = relational.insert_alert(Alert {
        alert_id: AlertId(0),
        token_address: mint,
        chain: record.chain,
        caller_id,
        alert_ts,
        alert_price,
        alert_mcap,
        mcap_source,
        raw_payload,
    })?;
    Ok(inserted)
}

/// Backfill result for one mint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillReport {
    pub mint: MintAddress,
    pub candles: usize,
    pub gaps: usize,
}

/// Backfills candles for a set of mints through the hybrid provider.
///
/// The provider writes API results into the time-series store, so a later
/// experiment over the same windows is served locally. Best-effort: gaps
/// are reported, not fatal.
pub async fn ingest_ohlcv(
    provider: Arc<HybridCandleProvider>,
    mints: &[MintAddress],
    chain: Chain,
    range: TimeRange,
    interval: Interval,
) -> MintlabResult<Vec<BackfillReport>> {
    let fetches = mints.iter().map(|mint| {
        let provider = provider.clone();
        let mint = mint.clone();
        async move {
            let slice = provider
                .get_candles(&mint, chain, range, interval, GapPolicy::BestEffort)
                .await?;
            Ok(BackfillReport {
                mint,
                candles: slice.len(),
                gaps: slice.gaps().len(),
            })
        }
    });
    futures::future::try_join_all(fetches).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn export_line(chat_id: i64, message_id: i64) -> String {
        serde_json::to_string(&AlertRecord {
            chat_id,
            message_id,
            token_address: "7sKqqFEiB84nXkPJhmKrAHHDjrr2XPcWcfmBGqNapump".to_string(),
            chain: Chain::Solana,
            caller: "alpha".to_string(),
            ts: 1_700_000_000,
            price: Some(0.000002),
            mcap: None,
            text: Some("send it".to_string()),
        })
        .unwrap()
    }

    fn write_export(lines: &[String]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn reingest_changes_nothing() {
        let store = RelationalStore::in_memory();
        let file = write_export(&[export_line(-1, 1), export_line(-1, 2)]);

        let first = ingest_alerts(file.path(), "telegram", &store).unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.duplicates, 0);

        let second = ingest_alerts(file.path(), "telegram", &store).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.alert_count(), 2);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let store = RelationalStore::in_memory();
        let file = write_export(&[
            export_line(-1, 1),
            "not json at all".to_string(),
            export_line(-1, 2),
        ]);

        let report = ingest_alerts(file.path(), "telegram", &store).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn pump_suffix_gets_assumed_supply_mcap() {
        let store = RelationalStore::in_memory();
        let file = write_export(&[export_line(-1, 1)]);
        ingest_alerts(file.path(), "telegram", &store).unwrap();

        let alert = store.alert(AlertId(1)).unwrap();
        assert_eq!(
            alert.mcap_source,
            Some(crate::data::alert::McapSource::AssumedSupply)
        );
        assert!((alert.alert_mcap.unwrap().0 - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn mint_case_is_preserved_through_ingestion() {
        let store = RelationalStore::in_memory();
        let file = write_export(&[export_line(-5, 9)]);
        ingest_alerts(file.path(), "telegram", &store).unwrap();

        let alert = store.alert(AlertId(1)).unwrap();
        assert_eq!(
            alert.token_address.as_str(),
            "7sKqqFEiB84nXkPJhmKrAHHDjrr2XPcWcfmBGqNapump"
        );
    }
}
