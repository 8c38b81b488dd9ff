use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use tracing::info;

use crate::{
    data::{
        alert::{Alert, AlertKey},
        domain::{AlertId, CallerId, Chain, MintAddress, RunId, TokenId},
    },
    error::{MintlabResult, StorageError},
};

// ================================================================================================
// Rows
// ================================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRow {
    pub token_id: TokenId,
    pub chain: Chain,
    /// Byte-exact mint address. The uniqueness index uses a normalised key;
    /// this field never does.
    pub address: MintAddress,
    pub symbol: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerRow {
    pub caller_id: CallerId,
    pub source: String,
    pub handle: String,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

/// Artifact ids recorded on a completed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutputs {
    pub trades_id: Option<String>,
    pub metrics_id: Option<String>,
    pub events_id: Option<String>,
    pub diagnostics_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRow {
    pub run_id: RunId,
    pub strategy_hash: String,
    pub snapshot_hash: String,
    pub exec_model_hash: String,
    pub cost_model_hash: String,
    pub risk_model_hash: String,
    pub seed: u64,
    pub engine_version: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub outputs: RunOutputs,
}

/// Run-level metrics summary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummaryRow {
    pub run_id: RunId,
    pub final_pnl: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub trade_count: u32,
    pub avg_return: f64,
    pub profit_factor: f64,
    pub sharpe: Option<f64>,
    pub sortino: Option<f64>,
}

// ================================================================================================
// Store
// ================================================================================================

/// Arena-plus-index relational store.
///
/// Entities live in typed collections keyed by id; cross-references are id
/// values, never pointers. Inserts are idempotent on the natural keys
/// (tokens on `(chain, address)`, callers on `(source, handle)`, alerts on
/// `(chat_id, message_id)`). Runs move through the
/// `pending -> running -> completed | failed` machine and are never deleted.
///
/// Persistence is a single JSON snapshot replaced atomically (temp +
/// rename) on [`RelationalStore::save`].
pub struct RelationalStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inner {
    tokens: Vec<TokenRow>,
    callers: Vec<CallerRow>,
    alerts: Vec<Alert>,
    runs: Vec<RunRow>,
    summaries: Vec<RunSummaryRow>,

    #[serde(skip)]
    token_index: HashMap<(Chain, String), TokenId>,
    #[serde(skip)]
    caller_index: HashMap<(String, String), CallerId>,
    #[serde(skip)]
    alert_index: HashMap<AlertKey, AlertId>,
    #[serde(skip)]
    run_index: HashMap<RunId, usize>,
}

impl Inner {
    fn rebuild_indices(&mut self) {
        self.token_index = self
            .tokens
            .iter()
            .map(|t| ((t.chain, t.address.index_key()), t.token_id))
            .collect();
        self.caller_index = self
            .callers
            .iter()
            .map(|c| ((c.source.clone(), c.handle.clone()), c.caller_id))
            .collect();
        self.alert_index = self
            .alerts
            .iter()
            .filter_map(|a| a.key().map(|k| (k, a.alert_id)))
            .collect();
        self.run_index = self
            .runs
            .iter()
            .enumerate()
            .map(|(i, r)| (r.run_id, i))
            .collect();
    }
}

impl RelationalStore {
    /// In-memory store (tests, projections).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Opens (or creates) the JSON-backed store at `<dir>/relational.json`.
    pub fn open(dir: impl Into<PathBuf>) -> MintlabResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(StorageError::Io)?;
        let path = dir.join("relational.json");

        let mut inner = if path.exists() {
            let bytes = fs::read(&path).map_err(StorageError::Io)?;
            serde_json::from_slice(&bytes).map_err(StorageError::Json)?
        } else {
            Inner::default()
        };
        inner.rebuild_indices();

        Ok(Self {
            path: Some(path),
            inner: Mutex::new(inner),
        })
    }

    /// Writes the snapshot atomically. A crash mid-save leaves the previous
    /// snapshot intact.
    pub fn save(&self) -> MintlabResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let inner = self.lock();
        let bytes = serde_json::to_vec_pretty(&*inner).map_err(StorageError::Json)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(StorageError::Io)?;
        fs::rename(&tmp, path).map_err(StorageError::Io)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("relational store lock")
    }

    // ============================================================================
    // Tokens & Callers
    // ============================================================================

    /// Idempotent token upsert on `(chain, address)`.
    pub fn upsert_token(
        &self,
        chain: Chain,
        address: MintAddress,
        symbol: Option<String>,
    ) -> TokenId {
        let mut inner = self.lock();
        let key = (chain, address.index_key());
        if let Some(id) = inner.token_index.get(&key) {
            return *id;
        }
        let token_id = TokenId(inner.tokens.len() as u64 + 1);
        inner.tokens.push(TokenRow {
            token_id,
            chain,
            address,
            symbol,
            metadata: serde_json::Value::Null,
        });
        inner.token_index.insert(key, token_id);
        token_id
    }

    /// Idempotent caller upsert on `(source, handle)`.
    pub fn upsert_caller(&self, source: &str, handle: &str) -> CallerId {
        let mut inner = self.lock();
        let key = (source.to_string(), handle.to_string());
        if let Some(id) = inner.caller_index.get(&key) {
            return *id;
        }
        let caller_id = CallerId(inner.callers.len() as u64 + 1);
        inner.callers.push(CallerRow {
            caller_id,
            source: source.to_string(),
            handle: handle.to_string(),
        });
        inner.caller_index.insert(key, caller_id);
        caller_id
    }

    pub fn token(&self, token_id: TokenId) -> Option<TokenRow> {
        self.lock()
            .tokens
            .iter()
            .find(|t| t.token_id == token_id)
            .cloned()
    }

    // ============================================================================
    // Alerts
    // ============================================================================

    /// Idempotent alert insert on `(chat_id, message_id)`.
    ///
    /// Returns the stored alert id plus whether this call inserted it. A
    /// second ingestion of the same export hits the index and changes
    /// nothing (re-ingest leaves the table unchanged).
    pub fn insert_alert(&self, mut alert: Alert) -> MintlabResult<(AlertId, bool)> {
        let key = alert.key().ok_or_else(|| {
            StorageError::DataIntegrity(
                "alert payload missing chat_id/message_id".to_string(),
            )
        })?;

        let mut inner = self.lock();
        if let Some(existing) = inner.alert_index.get(&key) {
            return Ok((*existing, false));
        }
        let alert_id = AlertId(inner.alerts.len() as u64 + 1);
        alert.alert_id = alert_id;
        inner.alerts.push(alert);
        inner.alert_index.insert(key, alert_id);
        Ok((alert_id, true))
    }

    pub fn alert(&self, alert_id: AlertId) -> MintlabResult<Alert> {
        self.lock()
            .alerts
            .iter()
            .find(|a| a.alert_id == alert_id)
            .cloned()
            .ok_or_else(|| StorageError::KeyNotFound(format!("alert {}", alert_id.0)).into())
    }

    pub fn alert_count(&self) -> usize {
        self.lock().alerts.len()
    }

    /// Alerts in `[from, to]`, optionally restricted to callers/mints.
    pub fn alerts_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        callers: Option<&[CallerId]>,
        mints: Option<&[MintAddress]>,
    ) -> Vec<Alert> {
        self.lock()
            .alerts
            .iter()
            .filter(|a| a.alert_ts >= from && a.alert_ts <= to)
            .filter(|a| callers.is_none_or(|cs| cs.contains(&a.caller_id)))
            .filter(|a| {
                mints.is_none_or(|ms| ms.iter().any(|m| m.as_str() == a.token_address.as_str()))
            })
            .cloned()
            .collect()
    }

    // ============================================================================
    // Runs
    // ============================================================================

    /// Inserts a pending run row and returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_run(
        &self,
        strategy_hash: String,
        snapshot_hash: String,
        exec_model_hash: String,
        cost_model_hash: String,
        risk_model_hash: String,
        seed: u64,
        engine_version: String,
        created_at: DateTime<Utc>,
    ) -> RunId {
        let mut inner = self.lock();
        let run_id = RunId(inner.runs.len() as u64 + 1);
        inner.runs.push(RunRow {
            run_id,
            strategy_hash,
            snapshot_hash,
            exec_model_hash,
            cost_model_hash,
            risk_model_hash,
            seed,
            engine_version,
            status: RunStatus::Pending,
            created_at,
            completed_at: None,
            error_message: None,
            outputs: RunOutputs::default(),
        });
        let idx = inner.runs.len() - 1;
        inner.run_index.insert(run_id, idx);
        info!(run_id = run_id.0, "run row inserted");
        run_id
    }

    /// Moves a run through the status machine; invalid transitions error.
    pub fn transition_run(
        &self,
        run_id: RunId,
        next: RunStatus,
        completed_at: Option<DateTime<Utc>>,
        error_message: Option<String>,
    ) -> MintlabResult<()> {
        let mut inner = self.lock();
        let idx = *inner
            .run_index
            .get(&run_id)
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;
        let run = &mut inner.runs[idx];
        if !run.status.can_transition_to(next) {
            return Err(StorageError::InvalidStatusTransition {
                from: run.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        run.status = next;
        run.completed_at = completed_at;
        run.error_message = error_message;
        Ok(())
    }

    pub fn record_outputs(&self, run_id: RunId, outputs: RunOutputs) -> MintlabResult<()> {
        let mut inner = self.lock();
        let idx = *inner
            .run_index
            .get(&run_id)
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;
        inner.runs[idx].outputs = outputs;
        Ok(())
    }

    pub fn run(&self, run_id: RunId) -> MintlabResult<RunRow> {
        let inner = self.lock();
        let idx = *inner
            .run_index
            .get(&run_id)
            .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;
        Ok(inner.runs[idx].clone())
    }

    /// Completed-run listing with offset/limit paging, newest first.
    pub fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<RunRow> {
        let inner = self.lock();
        inner
            .runs
            .iter()
            .rev()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    // ============================================================================
    // Summaries
    // ============================================================================

    pub fn upsert_summary(&self, summary: RunSummaryRow) {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .summaries
            .iter_mut()
            .find(|s| s.run_id == summary.run_id)
        {
            *existing = summary;
        } else {
            inner.summaries.push(summary);
        }
    }

    pub fn summary(&self, run_id: RunId) -> Option<RunSummaryRow> {
        self.lock()
            .summaries
            .iter()
            .find(|s| s.run_id == run_id)
            .cloned()
    }

    pub fn summaries(&self) -> Vec<RunSummaryRow> {
        self.lock().summaries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::domain::Price;
    use serde_json::json;
    use tempfile::TempDir;

    fn mint() -> MintAddress {
        MintAddress::new("7sKqqFEiB84nXkPJhmKrAHHDjrr2XPcWcfmBGqNapump").unwrap()
    }

    fn alert(chat_id: i64, message_id: i64) -> Alert {
        Alert {
            alert_id: AlertId(0),
            token_address: mint(),
            chain: Chain::Solana,
            caller_id: CallerId(1),
            alert_ts: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            alert_price: Some(Price(0.002)),
            alert_mcap: None,
            mcap_source: None,
            raw_payload: json!({"chat_id": chat_id, "message_id": message_id}),
        }
    }

    #[test]
    fn alert_insert_is_idempotent() {
        let store = RelationalStore::in_memory();
        let (id1, inserted1) = store.insert_alert(alert(-100, 1)).unwrap();
        let (id2, inserted2) = store.insert_alert(alert(-100, 1)).unwrap();
        let (id3, inserted3) = store.insert_alert(alert(-100, 2)).unwrap();

        assert!(inserted1);
        assert!(!inserted2);
        assert!(inserted3);
        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
        assert_eq!(store.alert_count(), 2);
    }

    #[test]
    fn token_index_is_case_insensitive_but_storage_is_exact() {
        let store = RelationalStore::in_memory();
        let id1 = store.upsert_token(Chain::Solana, mint(), None);

        let lower = MintAddress::new(mint().index_key()).unwrap();
        let id2 = store.upsert_token(Chain::Solana, lower, None);
        assert_eq!(id1, id2);

        // The stored address keeps the original exact case.
        let row = store.token(id1).unwrap();
        assert_eq!(row.address.as_str(), mint().as_str());
    }

    #[test]
    fn run_status_machine_rejects_bad_transitions() {
        let store = RelationalStore::in_memory();
        let now = Utc::now();
        let run_id = store.insert_run(
            "s".into(),
            "snap".into(),
            "e".into(),
            "c".into(),
            "r".into(),
            42,
            "0.3.0".into(),
            now,
        );

        // pending -> completed is illegal.
        assert!(store
            .transition_run(run_id, RunStatus::Completed, None, None)
            .is_err());

        store
            .transition_run(run_id, RunStatus::Running, None, None)
            .unwrap();
        store
            .transition_run(run_id, RunStatus::Completed, Some(now), None)
            .unwrap();

        // completed is terminal.
        assert!(store
            .transition_run(run_id, RunStatus::Failed, None, None)
            .is_err());
    }

    #[test]
    fn snapshot_survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let store = RelationalStore::open(dir.path()).unwrap();
            store.upsert_caller("telegram", "alpha");
            store.insert_alert(alert(-1, 7)).unwrap();
            store.save().unwrap();
        }
        let store = RelationalStore::open(dir.path()).unwrap();
        assert_eq!(store.alert_count(), 1);
        // Index rebuilt: re-insert is still a duplicate.
        let (_, inserted) = store.insert_alert(alert(-1, 7)).unwrap();
        assert!(!inserted);
        // Caller index rebuilt too.
        let id = store.upsert_caller("telegram", "alpha");
        assert_eq!(id, CallerId(1));
    }

    #[test]
    fn list_runs_pages_newest_first() {
        let store = RelationalStore::in_memory();
        let now = Utc::now();
        for i in 0..5 {
            store.insert_run(
                format!("s{i}"),
                "snap".into(),
                "e".into(),
                "c".into(),
                "r".into(),
                i,
                "0.3.0".into(),
                now,
            );
        }
        let page = store.list_runs(None, 2, 1);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].seed, 3);
        assert_eq!(page[1].seed, 2);
    }
}
