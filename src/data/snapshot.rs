use serde::{Deserialize, Serialize};

use crate::{
    artifact::canonical,
    data::domain::{AlertId, CallerId, MintAddress, TimeRange, Volume},
    error::{MintlabResult, ValidationError},
};

/// Filters applied when a snapshot was materialised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFilters {
    #[serde(default)]
    pub callers: Option<Vec<CallerId>>,
    #[serde(default)]
    pub mints: Option<Vec<MintAddress>>,
    #[serde(default)]
    pub min_volume: Option<Volume>,
}

/// A frozen pointer to the input data of an experiment: a time range, the
/// sources it was drawn from, the filters applied, and the materialised
/// alert list. Immutable once sealed; referenced by content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    pub snapshot_id: String,
    pub time_range: TimeRange,
    pub sources: Vec<String>,
    pub filters: SnapshotFilters,
    /// Alerts captured by the filters, fixed at seal time.
    pub alert_ids: Vec<AlertId>,
    /// Blake3 over the canonical form of everything above. Empty until
    /// sealed.
    pub content_hash: String,
}

impl DataSnapshot {
    pub fn new(
        snapshot_id: impl Into<String>,
        time_range: TimeRange,
        sources: Vec<String>,
        filters: SnapshotFilters,
        mut alert_ids: Vec<AlertId>,
    ) -> Self {
        alert_ids.sort_unstable();
        alert_ids.dedup();
        Self {
            snapshot_id: snapshot_id.into(),
            time_range,
            sources,
            filters,
            alert_ids,
            content_hash: String::new(),
        }
    }

    /// Seals the snapshot: computes the content hash over everything except
    /// the hash field itself. After this the snapshot must not change.
    pub fn seal(mut self) -> MintlabResult<Self> {
        self.content_hash = canonical::content_hash(&SealedView::from(&self))?;
        Ok(self)
    }

    pub fn is_sealed(&self) -> bool {
        !self.content_hash.is_empty()
    }

    /// Verifies the stored hash still matches the content. Guards against
    /// post-seal mutation before a run consumes the snapshot.
    pub fn verify_sealed(&self) -> MintlabResult<()> {
        if !self.is_sealed() {
            return Err(ValidationError::UnsealedSnapshot(self.snapshot_id.clone()).into());
        }
        let expected = canonical::content_hash(&SealedView::from(self))?;
        if expected != self.content_hash {
            return Err(ValidationError::UnsealedSnapshot(format!(
                "{}: content drifted after seal",
                self.snapshot_id
            ))
            .into());
        }
        Ok(())
    }
}

/// The hash input: the snapshot minus its own hash field.
#[derive(Serialize)]
struct SealedView<'a> {
    snapshot_id: &'a str,
    time_range: &'a TimeRange,
    sources: &'a [String],
    filters: &'a SnapshotFilters,
    alert_ids: &'a [AlertId],
}

impl<'a> From<&'a DataSnapshot> for SealedView<'a> {
    fn from(s: &'a DataSnapshot) -> Self {
        Self {
            snapshot_id: &s.snapshot_id,
            time_range: &s.time_range,
            sources: &s.sources,
            filters: &s.filters,
            alert_ids: &s.alert_ids,
        }
    }
}
