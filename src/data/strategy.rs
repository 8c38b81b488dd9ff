use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    data::domain::SizeFraction,
    error::{MintlabResult, ValidationError},
};

const FRACTION_TOLERANCE: f64 = 1e-9;

// ================================================================================================
// Strategy Config (tagged-union tree, content-hashed)
// ================================================================================================

/// Declarative entry rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EntryConfig {
    /// Enter on the first candle of the window at its open.
    Immediate,
    /// Arm after an initial drawdown from the alert price, then fill on a
    /// rebound from the running low. Both thresholds are fractions
    /// (`0.05` = 5%).
    TrailingRebound {
        initial_drawdown_pct: f64,
        trailing_rebound_pct: f64,
        max_wait_minutes: u32,
        required_history_candles: u32,
    },
}

/// One rung of the profit ladder: sell `size_fraction` of the original
/// position when price reaches `multiple` times the entry fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitTarget {
    pub multiple: f64,
    pub size_fraction: SizeFraction,
}

/// Stop percentage switch applied once price has reached `at_multiple`
/// times the entry fill.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseBoundary {
    pub at_multiple: f64,
    pub pct: f64,
}

/// Declarative stop-loss rule. All percentages are fractions in `(0, 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StopLossConfig {
    /// Fixed at `entry * (1 - pct)`.
    Static { pct: f64 },
    /// Pinned to the running peak since entry, offset by `pct`.
    Trailing { pct: f64 },
    /// Trailing stop whose percentage tightens across price-multiple
    /// boundaries (ordered ascending by `at_multiple`).
    Phased {
        pct: f64,
        phase_boundaries: Vec<PhaseBoundary>,
    },
}

impl StopLossConfig {
    pub fn base_pct(&self) -> f64 {
        match self {
            StopLossConfig::Static { pct }
            | StopLossConfig::Trailing { pct }
            | StopLossConfig::Phased { pct, .. } => *pct,
        }
    }
}

/// Re-entry condition after a stop-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReentryCondition {
    /// Default: a rebound of `rebound_pct` from a new local low formed
    /// after the stop-out.
    ReboundFromLocalLow { rebound_pct: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReentryConfig {
    pub max_reentries: u32,
    pub size_fraction: SizeFraction,
    pub condition: ReentryCondition,
}

/// The full declarative strategy tree.
///
/// Immutable once hashed; referenced everywhere by its content hash over the
/// canonical JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub entry: EntryConfig,
    /// Ordered ladder; fractions of the *original* position, summing to ≤ 1.
    pub targets: SmallVec<[ProfitTarget; 4]>,
    pub stop_loss: StopLossConfig,
    #[serde(default)]
    pub reentry: Option<ReentryConfig>,
    /// Optional embedded fee schedule. The experiment definition always
    /// references an explicit cost model, which takes precedence; this
    /// field lets a strategy travel with sensible defaults.
    #[serde(default)]
    pub costs: Option<CostModel>,
}

impl StrategyConfig {
    /// Checks every invariant the simulation engine assumes. Runs before
    /// any simulation starts; a failure here never reaches the engine.
    pub fn validate(&self) -> MintlabResult<()> {
        match &self.entry {
            EntryConfig::Immediate => {}
            EntryConfig::TrailingRebound {
                initial_drawdown_pct,
                trailing_rebound_pct,
                max_wait_minutes,
                ..
            } => {
                require_fraction("entry.initial_drawdown_pct", *initial_drawdown_pct)?;
                require_fraction("entry.trailing_rebound_pct", *trailing_rebound_pct)?;
                if *max_wait_minutes == 0 {
                    return Err(invalid("entry.max_wait_minutes", "must be > 0"));
                }
            }
        }

        let mut fraction_sum = 0.0;
        let mut prev_multiple = 0.0;
        for (i, target) in self.targets.iter().enumerate() {
            if target.multiple <= 1.0 {
                return Err(invalid(&format!("targets[{i}].multiple"), "must be > 1.0"));
            }
            if target.multiple <= prev_multiple {
                return Err(invalid(
                    &format!("targets[{i}].multiple"),
                    "ladder must be strictly ascending",
                ));
            }
            prev_multiple = target.multiple;

            if target.size_fraction.0 <= 0.0 || target.size_fraction.0 > 1.0 {
                return Err(invalid(
                    &format!("targets[{i}].size_fraction"),
                    "must be in (0, 1]",
                ));
            }
            fraction_sum += target.size_fraction.0;
        }
        if fraction_sum > 1.0 + FRACTION_TOLERANCE {
            return Err(invalid("targets", "size fractions must sum to <= 1.0"));
        }

        require_fraction("stop_loss.pct", self.stop_loss.base_pct())?;
        if let StopLossConfig::Phased {
            phase_boundaries, ..
        } = &self.stop_loss
        {
            let mut prev = 1.0;
            for (i, boundary) in phase_boundaries.iter().enumerate() {
                if boundary.at_multiple <= prev {
                    return Err(invalid(
                        &format!("stop_loss.phase_boundaries[{i}].at_multiple"),
                        "must be strictly ascending and > 1.0",
                    ));
                }
                prev = boundary.at_multiple;
                require_fraction(
                    &format!("stop_loss.phase_boundaries[{i}].pct"),
                    boundary.pct,
                )?;
            }
        }

        if let Some(reentry) = &self.reentry {
            if reentry.max_reentries == 0 {
                return Err(invalid("reentry.max_reentries", "must be > 0 when enabled"));
            }
            if reentry.size_fraction.0 <= 0.0 || reentry.size_fraction.0 > 1.0 {
                return Err(invalid("reentry.size_fraction", "must be in (0, 1]"));
            }
            let ReentryCondition::ReboundFromLocalLow { rebound_pct } = &reentry.condition;
            require_fraction("reentry.condition.rebound_pct", *rebound_pct)?;
        }

        if let Some(costs) = &self.costs {
            costs.validate()?;
        }

        Ok(())
    }
}

fn require_fraction(field: &str, value: f64) -> MintlabResult<()> {
    if value <= 0.0 || value >= 1.0 || !value.is_finite() {
        return Err(invalid(field, "must be a fraction in (0, 1)"));
    }
    Ok(())
}

fn invalid(field: &str, msg: &str) -> crate::error::MintlabError {
    ValidationError::InvalidField {
        field: field.to_string(),
        msg: msg.to_string(),
    }
    .into()
}

// ================================================================================================
// Execution / Cost / Risk Models
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyDistribution {
    Fixed,
    Normal,
}

/// Fill latency drawn per order from the configured distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyModel {
    pub mean_ms: f64,
    pub stddev_ms: f64,
    pub distribution: LatencyDistribution,
}

/// Slippage applied in the adverse direction:
/// `base + volume_factor * volume_z_score`, floored at `base`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlippageModel {
    pub base: f64,
    pub volume_factor: f64,
}

/// Simulation-only execution model. No live order submission exists
/// anywhere in this crate; these parameters only shape simulated fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionModel {
    pub latency: LatencyModel,
    pub slippage: SlippageModel,
    pub failure_rate: f64,
    pub partial_fill_rate: f64,
    /// Mixed into the per-alert sub-seed so two exec models with identical
    /// shapes can still be decorrelated.
    pub seed_nonce: u64,
}

impl ExecutionModel {
    pub fn validate(&self) -> MintlabResult<()> {
        for (field, value) in [
            ("failure_rate", self.failure_rate),
            ("partial_fill_rate", self.partial_fill_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(&format!("execution.{field}"), "must be in [0, 1]"));
            }
        }
        if self.latency.mean_ms < 0.0 || self.latency.stddev_ms < 0.0 {
            return Err(invalid("execution.latency", "must be non-negative"));
        }
        if self.slippage.base < 0.0 {
            return Err(invalid("execution.slippage.base", "must be non-negative"));
        }
        Ok(())
    }

    /// Frictionless model for golden tests and dry runs.
    pub fn frictionless() -> Self {
        Self {
            latency: LatencyModel {
                mean_ms: 0.0,
                stddev_ms: 0.0,
                distribution: LatencyDistribution::Fixed,
            },
            slippage: SlippageModel {
                base: 0.0,
                volume_factor: 0.0,
            },
            failure_rate: 0.0,
            partial_fill_rate: 0.0,
            seed_nonce: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityFeeRange {
    pub min: f64,
    pub max: f64,
}

/// Flat and proportional trading costs per fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub base_fee: f64,
    pub priority_fee_range: PriorityFeeRange,
    /// Fraction of notional charged on entry and on each exit.
    pub trading_fee_pct: f64,
}

impl CostModel {
    pub fn validate(&self) -> MintlabResult<()> {
        if self.base_fee < 0.0 {
            return Err(invalid("costs.base_fee", "must be non-negative"));
        }
        if self.priority_fee_range.min < 0.0
            || self.priority_fee_range.max < self.priority_fee_range.min
        {
            return Err(invalid(
                "costs.priority_fee_range",
                "requires 0 <= min <= max",
            ));
        }
        if !(0.0..1.0).contains(&self.trading_fee_pct) {
            return Err(invalid("costs.trading_fee_pct", "must be in [0, 1)"));
        }
        Ok(())
    }

    pub fn free() -> Self {
        Self {
            base_fee: 0.0,
            priority_fee_range: PriorityFeeRange { min: 0.0, max: 0.0 },
            trading_fee_pct: 0.0,
        }
    }
}

/// Parameters for risk-adjusted metrics (Sharpe, Sortino).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskModel {
    pub risk_free_rate: f64,
    /// Return periods per year used for annualisation.
    pub periods_per_year: f64,
}

impl Default for RiskModel {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            periods_per_year: 365.0,
        }
    }
}
