use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::{
    artifact::manifest::RunManifest,
    error::{ArtifactError, MintlabResult},
    experiment::{
        handler::{execute, Experiment, ExperimentDefinition, ManifestWithConfig},
        ports::Ports,
    },
};

/// Outcome of a replay-with-verification.
#[derive(Debug)]
pub struct Replay {
    pub experiment: Experiment,
    /// The manifest the replay was driven from.
    pub source: RunManifest,
}

/// Re-runs an experiment from a stored manifest and verifies the
/// re-produced `trades` and `metrics` artifacts hash-match the recorded
/// ones. This is the primary end-to-end determinism check: content
/// addressing means equal ids if and only if equal bytes.
///
/// Deleted output objects are fine — the re-run re-publishes them under
/// the same ids.
#[instrument(skip(ports, cancel))]
pub async fn replay(
    manifest_id: &str,
    ports: &Ports,
    cancel: CancellationToken,
) -> MintlabResult<Replay> {
    let stored: ManifestWithConfig = ports.artifacts.get_json(manifest_id)?;
    let source = stored.manifest.clone();

    let definition = ExperimentDefinition {
        snapshot: source.inputs.snapshot.clone(),
        strategy: source.inputs.strategy.clone(),
        exec: source.inputs.exec.clone(),
        cost: source.inputs.cost.clone(),
        risk: source.inputs.risk.clone(),
        seed: source.seed,
        run_config: stored.run_config,
    };

    let experiment = execute(&definition, ports, cancel).await?;

    verify_hash(
        "trades",
        &source.outputs.trades_id,
        &experiment.manifest.outputs.trades_id,
    )?;
    verify_hash(
        "metrics",
        &source.outputs.metrics_id,
        &experiment.manifest.outputs.metrics_id,
    )?;

    info!(
        run_id = experiment.run_id.0,
        source_run_id = source.run_id.0,
        "replay verified"
    );
    Ok(Replay { experiment, source })
}

fn verify_hash(kind: &str, expected: &str, actual: &str) -> MintlabResult<()> {
    if expected != actual {
        return Err(ArtifactError::ReplayMismatch {
            kind: kind.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
        .into());
    }
    Ok(())
}
