use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    artifact::manifest::ArtifactKind,
    data::domain::{Chain, Interval, MintAddress, RunId, TimeRange},
    error::{MintlabResult, StorageError},
    experiment::{
        handler::{execute, ExperimentDefinition, ManifestWithConfig},
        leaderboard::{leaderboard, LeaderboardQuery},
        ports::Ports,
        replay::replay,
    },
    ingest::{ingest_alerts, ingest_ohlcv},
    store::relational::RunStatus,
};

// ================================================================================================
// Typed Command Structs
// ================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAlertsCmd {
    pub file: PathBuf,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOhlcvCmd {
    pub from_ts: i64,
    pub to_ts: i64,
    pub mints: Vec<MintAddress>,
    pub chain: Chain,
    pub interval_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRunCmd {
    /// Inline definition, or a path to a definition JSON file.
    pub definition: Option<ExperimentDefinition>,
    pub definition_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReplayCmd {
    /// Manifest artifact id, or a path to an exported manifest file.
    pub manifest_id: Option<String>,
    pub manifest_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentListCmd {
    pub status: Option<RunStatus>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentShowCmd {
    pub run_id: RunId,
}

/// The full command surface. Presentation (CLI parsing, argument
/// validation UX) lives outside the core; these structs arrive already
/// validated in shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    IngestAlerts(IngestAlertsCmd),
    IngestOhlcv(IngestOhlcvCmd),
    ExperimentRun(ExperimentRunCmd),
    ExperimentReplay(ExperimentReplayCmd),
    ExperimentList(ExperimentListCmd),
    ExperimentShow(ExperimentShowCmd),
    ExperimentLeaderboard(LeaderboardQuery),
}

/// Compile-time command table: names to handlers, no runtime registry.
pub const COMMAND_NAMES: &[&str] = &[
    "ingest.telegram",
    "ingest.ohlcv",
    "experiment.run",
    "experiment.replay",
    "experiment.list",
    "experiment.show",
    "experiment.leaderboard",
];

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::IngestAlerts(_) => COMMAND_NAMES[0],
            Command::IngestOhlcv(_) => COMMAND_NAMES[1],
            Command::ExperimentRun(_) => COMMAND_NAMES[2],
            Command::ExperimentReplay(_) => COMMAND_NAMES[3],
            Command::ExperimentList(_) => COMMAND_NAMES[4],
            Command::ExperimentShow(_) => COMMAND_NAMES[5],
            Command::ExperimentLeaderboard(_) => COMMAND_NAMES[6],
        }
    }
}

/// Result handed back to the presentation layer: exit code plus a JSON
/// payload (either the command output or an error report).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub payload: Value,
}

/// Dispatches one command against the ports.
///
/// Exit codes: 0 success, 2 validation error, 3 not found, 4 remote
/// failure after retries, 5 cancelled.
#[instrument(skip(ports, cancel), fields(command = command.name()))]
pub async fn dispatch(
    command: Command,
    ports: &Ports,
    cancel: CancellationToken,
) -> CommandOutcome {
    match run_command(command, ports, cancel).await {
        Ok(payload) => CommandOutcome {
            exit_code: 0,
            payload,
        },
        Err(e) => CommandOutcome {
            exit_code: e.exit_code(),
            payload: json!({"error": e.to_string()}),
        },
    }
}

async fn run_command(
    command: Command,
    ports: &Ports,
    cancel: CancellationToken,
) -> MintlabResult<Value> {
    match command {
        Command::IngestAlerts(cmd) => {
            let report = ingest_alerts(&cmd.file, &cmd.source, &ports.relational)?;
            Ok(serde_json::to_value(report).map_err(StorageError::Json)?)
        }

        Command::IngestOhlcv(cmd) => {
            let range = TimeRange::new(cmd.from_ts, cmd.to_ts)?;
            let interval = Interval::new(cmd.interval_seconds)?;
            let reports = ingest_ohlcv(
                ports.provider.clone(),
                &cmd.mints,
                cmd.chain,
                range,
                interval,
            )
            .await?;
            Ok(serde_json::to_value(reports).map_err(StorageError::Json)?)
        }

        Command::ExperimentRun(cmd) => {
            let definition = resolve_definition(cmd)?;
            let experiment = execute(&definition, ports, cancel).await?;
            Ok(json!({
                "run_id": experiment.run_id.0,
                "manifest_id": experiment.manifest_id,
                "metrics": experiment.metrics,
            }))
        }

        Command::ExperimentReplay(cmd) => {
            let manifest_id = resolve_manifest_id(cmd, ports)?;
            let verified = replay(&manifest_id, ports, cancel).await?;
            Ok(json!({
                "run_id": verified.experiment.run_id.0,
                "source_run_id": verified.source.run_id.0,
                "manifest_id": verified.experiment.manifest_id,
                "verified": true,
            }))
        }

        Command::ExperimentList(cmd) => {
            let runs = ports.relational.list_runs(cmd.status, cmd.limit, cmd.offset);
            Ok(serde_json::to_value(runs).map_err(StorageError::Json)?)
        }

        Command::ExperimentShow(cmd) => {
            let run = ports.relational.run(cmd.run_id)?;
            let summary = ports.relational.summary(cmd.run_id);
            Ok(json!({"run": run, "summary": summary}))
        }

        Command::ExperimentLeaderboard(query) => {
            let rows = leaderboard(&ports.relational, &query);
            Ok(serde_json::to_value(rows).map_err(StorageError::Json)?)
        }
    }
}

fn resolve_definition(cmd: ExperimentRunCmd) -> MintlabResult<ExperimentDefinition> {
    if let Some(definition) = cmd.definition {
        return Ok(definition);
    }
    let path = cmd.definition_path.ok_or_else(|| {
        crate::error::ValidationError::InvalidField {
            field: "definition".to_string(),
            msg: "either an inline definition or a definition_path is required".to_string(),
        }
    })?;
    let bytes = std::fs::read(&path).map_err(StorageError::Io)?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::Json(e).into())
}

fn resolve_manifest_id(cmd: ExperimentReplayCmd, ports: &Ports) -> MintlabResult<String> {
    if let Some(id) = cmd.manifest_id {
        return Ok(id);
    }
    let path = cmd.manifest_path.ok_or_else(|| {
        crate::error::ValidationError::InvalidField {
            field: "manifest".to_string(),
            msg: "either a manifest_id or a manifest_path is required".to_string(),
        }
    })?;
    // An exported manifest file re-enters the store content-addressed, so
    // the id is stable however the file travelled.
    let bytes = std::fs::read(&path).map_err(StorageError::Io)?;
    let manifest: ManifestWithConfig =
        serde_json::from_slice(&bytes).map_err(StorageError::Json)?;
    ports.artifacts.put_canonical(
        ArtifactKind::Manifest,
        &manifest,
        Vec::new(),
        manifest.manifest.created_at,
    )
}
