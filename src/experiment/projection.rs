use std::{fs, path::PathBuf};

use tracing::debug;

use crate::{
    data::{alert::Alert, domain::RunId, snapshot::DataSnapshot},
    error::{MintlabResult, StorageError},
    store::relational::RelationalStore,
};

/// Read-only per-run working view binding a sealed snapshot to resolved
/// alert rows plus a scratch directory.
///
/// Built at step 4 of the run flow and disposed at step 10 (and on every
/// failure path). Disposal removes the scratch space; the projection holds
/// no live handles into the backing stores afterwards.
pub struct RunProjection {
    run_id: RunId,
    alerts: Vec<Alert>,
    scratch_dir: Option<PathBuf>,
}

impl RunProjection {
    /// Resolves the snapshot's alert ids against the relational store. The
    /// snapshot must verify as sealed first; a missing alert is a data
    /// integrity failure, not a skip.
    pub fn build(
        run_id: RunId,
        snapshot: &DataSnapshot,
        relational: &RelationalStore,
        scratch_root: Option<PathBuf>,
    ) -> MintlabResult<Self> {
        snapshot.verify_sealed()?;

        let mut alerts = Vec::with_capacity(snapshot.alert_ids.len());
        for alert_id in &snapshot.alert_ids {
            alerts.push(relational.alert(*alert_id)?);
        }
        // Fixed processing order regardless of snapshot construction.
        alerts.sort_by_key(|a| a.alert_id);

        let scratch_dir = match scratch_root {
            Some(root) => {
                let dir = root.join(format!("{run_id}"));
                fs::create_dir_all(&dir).map_err(StorageError::Io)?;
                Some(dir)
            }
            None => None,
        };

        debug!(run_id = run_id.0, alerts = alerts.len(), "projection built");
        Ok(Self {
            run_id,
            alerts,
            scratch_dir,
        })
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn scratch_dir(&self) -> Option<&PathBuf> {
        self.scratch_dir.as_ref()
    }

    /// Releases temp space. Idempotent; also runs on drop as a backstop.
    pub fn dispose(&mut self) {
        if let Some(dir) = self.scratch_dir.take() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!(run_id = self.run_id.0, error = %e, "scratch cleanup failed");
            }
        }
    }
}

impl Drop for RunProjection {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        domain::{AlertId, CallerId, Chain, MintAddress, TimeRange},
        snapshot::SnapshotFilters,
    };
    use chrono::DateTime;
    use serde_json::json;
    use tempfile::TempDir;

    fn seed_store() -> (RelationalStore, Vec<AlertId>) {
        let store = RelationalStore::in_memory();
        let mut ids = Vec::new();
        for i in 0..3 {
            let alert = Alert {
                alert_id: AlertId(0),
                token_address: MintAddress::new(
                    "7sKqqFEiB84nXkPJhmKrAHHDjrr2XPcWcfmBGqNapump",
                )
                .unwrap(),
                chain: Chain::Solana,
                caller_id: CallerId(1),
                alert_ts: DateTime::from_timestamp(1_700_000_000 + i * 60, 0).unwrap(),
                alert_price: None,
                alert_mcap: None,
                mcap_source: None,
                raw_payload: json!({"chat_id": -5, "message_id": i}),
            };
            let (id, _) = store.insert_alert(alert).unwrap();
            ids.push(id);
        }
        (store, ids)
    }

    fn sealed_snapshot(ids: Vec<AlertId>) -> DataSnapshot {
        DataSnapshot::new(
            "test",
            TimeRange::new(1_700_000_000, 1_700_003_600).unwrap(),
            vec![],
            SnapshotFilters::default(),
            ids,
        )
        .seal()
        .unwrap()
    }

    #[test]
    fn resolves_alerts_in_id_order() {
        let (store, mut ids) = seed_store();
        ids.reverse();
        let snapshot = sealed_snapshot(ids);
        let projection =
            RunProjection::build(RunId(1), &snapshot, &store, None).unwrap();

        let resolved: Vec<u64> = projection.alerts().iter().map(|a| a.alert_id.0).collect();
        assert_eq!(resolved, vec![1, 2, 3]);
    }

    #[test]
    fn unsealed_snapshot_is_rejected() {
        let (store, ids) = seed_store();
        let snapshot = DataSnapshot::new(
            "unsealed",
            TimeRange::new(0, 1).unwrap(),
            vec![],
            SnapshotFilters::default(),
            ids,
        );
        assert!(RunProjection::build(RunId(1), &snapshot, &store, None).is_err());
    }

    #[test]
    fn missing_alert_is_an_error() {
        let (store, mut ids) = seed_store();
        ids.push(AlertId(999));
        let snapshot = sealed_snapshot(ids);
        assert!(RunProjection::build(RunId(1), &snapshot, &store, None).is_err());
    }

    #[test]
    fn dispose_removes_scratch_space() {
        let (store, ids) = seed_store();
        let snapshot = sealed_snapshot(ids);
        let root = TempDir::new().unwrap();

        let mut projection = RunProjection::build(
            RunId(9),
            &snapshot,
            &store,
            Some(root.path().to_path_buf()),
        )
        .unwrap();
        let dir = projection.scratch_dir().unwrap().clone();
        assert!(dir.exists());

        projection.dispose();
        assert!(!dir.exists());
        // Idempotent.
        projection.dispose();
    }
}
