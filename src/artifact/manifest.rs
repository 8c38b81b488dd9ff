use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::data::domain::RunId;

/// What an artifact contains.
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
pub enum ArtifactKind {
    Manifest,
    Metrics,
    Events,
    Trades,
    Diagnostics,
    Strategy,
    Snapshot,
    ExecModel,
    CostModel,
    RiskModel,
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
pub enum ArtifactStatus {
    Active,
    Superseded,
    Deleted,
}

/// Index entry for one stored artifact.
///
/// `artifact_id` *is* the content hash: identical content deduplicates to a
/// single object. `lineage` holds the ids of the inputs it was derived
/// from, enabling ancestor traversal for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub artifact_id: String,
    pub kind: ArtifactKind,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub status: ArtifactStatus,
    pub lineage: Vec<String>,
}

/// References to the five input artifacts of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestInputs {
    pub snapshot: String,
    pub strategy: String,
    pub exec: String,
    pub cost: String,
    pub risk: String,
}

impl ManifestInputs {
    pub fn all(&self) -> Vec<String> {
        vec![
            self.snapshot.clone(),
            self.strategy.clone(),
            self.exec.clone(),
            self.cost.clone(),
            self.risk.clone(),
        ]
    }
}

/// References to a run's published outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestOutputs {
    pub trades_id: String,
    pub metrics_id: String,
    pub events_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics_id: Option<String>,
}

/// The replay contract: everything needed to re-run an experiment and check
/// the outputs hash-identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub engine_version: String,
    pub inputs: ManifestInputs,
    pub seed: u64,
    pub created_at: DateTime<Utc>,
    pub outputs: ManifestOutputs,
}
