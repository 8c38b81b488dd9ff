use serde::{Deserialize, Serialize};

use crate::{
    data::strategy::RiskModel,
    sim::{state::Termination, summary::AlertSummary},
};

/// Run-level aggregate over all per-alert summaries.
///
/// Aggregation iterates alerts in `alert_id` order with single running
/// accumulators, so the result is byte-stable across worker counts.
/// Ratio metrics (`sharpe`, `sortino`) need at least two entered alerts
/// with return dispersion; otherwise they stay `None` rather than faking a
/// number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub alert_count: u32,
    /// Alerts that actually entered a position.
    pub entered_count: u32,
    pub no_entry_count: u32,
    pub final_pnl: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub trade_count: u32,
    pub avg_return: f64,
    pub reentry_count: u32,
    pub avg_holding_minutes: f64,
    pub total_fees: f64,
    pub profit_factor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharpe: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sortino: Option<f64>,
}

impl RunMetrics {
    pub fn aggregate(summaries: &[AlertSummary], risk: &RiskModel) -> Self {
        let alert_count = summaries.len() as u32;
        let entered: Vec<&AlertSummary> = summaries
            .iter()
            .filter(|s| s.termination != Termination::NoEntry)
            .collect();

        let entered_count = entered.len() as u32;
        let no_entry_count = alert_count - entered_count;

        let mut final_pnl = 0.0;
        let mut max_drawdown = 0.0f64;
        let mut wins = 0u32;
        let mut trade_count = 0u32;
        let mut reentry_count = 0u32;
        let mut holding_sum = 0.0;
        let mut total_fees = 0.0;
        let mut gross_wins = 0.0;
        let mut gross_losses = 0.0;

        for summary in &entered {
            final_pnl += summary.final_pnl;
            max_drawdown = max_drawdown.max(summary.max_drawdown);
            if summary.final_pnl > 0.0 {
                wins += 1;
                gross_wins += summary.final_pnl;
            } else {
                gross_losses += summary.final_pnl.abs();
            }
            trade_count += summary.trade_count;
            reentry_count += summary.reentry_count;
            holding_sum += summary.holding_minutes;
            total_fees += summary.fees_paid;
        }

        let win_rate = if entered_count > 0 {
            wins as f64 / entered_count as f64
        } else {
            0.0
        };
        let avg_return = if entered_count > 0 {
            final_pnl / entered_count as f64
        } else {
            0.0
        };
        let avg_holding_minutes = if entered_count > 0 {
            holding_sum / entered_count as f64
        } else {
            0.0
        };
        let profit_factor = if gross_losses > 0.0 {
            gross_wins / gross_losses
        } else if gross_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let returns: Vec<f64> = entered.iter().map(|s| s.final_pnl).collect();
        let sharpe = sharpe_ratio(&returns, risk);
        let sortino = sortino_ratio(&returns, risk);

        Self {
            alert_count,
            entered_count,
            no_entry_count,
            final_pnl,
            max_drawdown,
            win_rate,
            trade_count,
            avg_return,
            reentry_count,
            avg_holding_minutes,
            total_fees,
            // Canonical JSON rejects non-finite floats; cap here.
            profit_factor: if profit_factor.is_finite() {
                profit_factor
            } else {
                f64::MAX
            },
            sharpe,
            sortino,
        }
    }
}

/// Annualised Sharpe over per-alert returns; `None` below two samples or
/// with zero dispersion.
fn sharpe_ratio(returns: &[f64], risk: &RiskModel) -> Option<f64> {
    let n = returns.len();
    if n < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / n as f64;
    let var = returns
        .iter()
        .map(|r| {
            let d = r - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1) as f64;
    let sd = var.sqrt();
    if sd == 0.0 {
        return None;
    }
    let per_period_rf = risk.risk_free_rate / risk.periods_per_year;
    Some((mean - per_period_rf) / sd * risk.periods_per_year.sqrt())
}

/// Like Sharpe but deviation is computed over negative returns only.
fn sortino_ratio(returns: &[f64], risk: &RiskModel) -> Option<f64> {
    let n = returns.len();
    if n < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / n as f64;
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return None;
    }
    let dd = (downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64).sqrt();
    if dd == 0.0 {
        return None;
    }
    let per_period_rf = risk.risk_free_rate / risk.periods_per_year;
    Some((mean - per_period_rf) / dd * risk.periods_per_year.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::domain::Price;

    fn entered(final_pnl: f64, drawdown: f64) -> AlertSummary {
        AlertSummary {
            termination: Termination::FinalClose,
            final_pnl,
            gross_pnl: final_pnl,
            fees_paid: 0.01,
            max_drawdown: drawdown,
            win_rate: if final_pnl > 0.0 { 1.0 } else { 0.0 },
            trade_count: 1,
            avg_return: final_pnl,
            reentry_count: 0,
            holding_minutes: 30.0,
            entry_price: Some(Price(1.0)),
            final_price: Some(Price(1.0 + final_pnl)),
            executed_size: 1.0,
        }
    }

    #[test]
    fn aggregates_across_entered_alerts_only() {
        let summaries = vec![
            entered(0.5, 0.1),
            entered(-0.2, 0.3),
            AlertSummary::no_entry(),
        ];
        let metrics = RunMetrics::aggregate(&summaries, &RiskModel::default());

        assert_eq!(metrics.alert_count, 3);
        assert_eq!(metrics.entered_count, 2);
        assert_eq!(metrics.no_entry_count, 1);
        assert!((metrics.final_pnl - 0.3).abs() < 1e-12);
        assert!((metrics.win_rate - 0.5).abs() < 1e-12);
        assert!((metrics.max_drawdown - 0.3).abs() < 1e-12);
        assert!((metrics.profit_factor - 2.5).abs() < 1e-12);
        assert!((metrics.total_fees - 0.02).abs() < 1e-12);
    }

    #[test]
    fn empty_run_produces_zeroes() {
        let metrics = RunMetrics::aggregate(&[], &RiskModel::default());
        assert_eq!(metrics.alert_count, 0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.sharpe, None);
    }

    #[test]
    fn ratios_are_none_without_dispersion_or_losses() {
        let same = vec![entered(0.1, 0.0), entered(0.1, 0.0)];
        let metrics = RunMetrics::aggregate(&same, &RiskModel::default());
        assert_eq!(metrics.sharpe, None);
        // No losing returns: sortino undefined.
        assert_eq!(metrics.sortino, None);
    }

    #[test]
    fn sharpe_and_sortino_are_finite_with_mixed_returns() {
        let mixed = vec![entered(0.4, 0.1), entered(-0.1, 0.2), entered(0.2, 0.05)];
        let metrics = RunMetrics::aggregate(&mixed, &RiskModel::default());
        assert!(metrics.sharpe.unwrap().is_finite());
        assert!(metrics.sortino.unwrap().is_finite());
    }

    #[test]
    fn aggregation_is_order_stable() {
        // The caller sorts by alert id; with the same order the result is
        // bit-identical.
        let summaries = vec![entered(0.5, 0.1), entered(-0.2, 0.3), entered(0.1, 0.2)];
        let a = RunMetrics::aggregate(&summaries, &RiskModel::default());
        let b = RunMetrics::aggregate(&summaries, &RiskModel::default());
        assert_eq!(a, b);
    }
}
