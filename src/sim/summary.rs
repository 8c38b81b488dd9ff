use serde::{Deserialize, Serialize};

use crate::{
    data::domain::Price,
    sim::state::Termination,
};

/// Aggregate outcome of one alert's simulation.
///
/// `final_price` is the actual exit price of the *last exit event* — a
/// stop-out reports the stop price, a ladder completion reports the last
/// target fill. It only equals the last candle's close when the position was
/// genuinely held to the end of the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub termination: Termination,
    /// Realised P&L net of all fees, per unit of original position.
    pub final_pnl: f64,
    /// Realised P&L before fees.
    pub gross_pnl: f64,
    pub fees_paid: f64,
    /// Worst fractional close-to-close drawdown from the running peak while
    /// in position.
    pub max_drawdown: f64,
    /// 1.0 when `final_pnl > 0`, else 0.0; averages into run-level win rate.
    pub win_rate: f64,
    /// Number of entries taken (initial entry plus re-entry fills).
    pub trade_count: u32,
    /// Net P&L per trade taken; 0 when no trades.
    pub avg_return: f64,
    pub reentry_count: u32,
    /// Minutes between first entry and last exit.
    pub holding_minutes: f64,
    pub entry_price: Option<Price>,
    pub final_price: Option<Price>,
    /// Sum of exit sizes executed, as a fraction of the original position.
    pub executed_size: f64,
}

impl AlertSummary {
    /// Summary for an alert that never entered.
    pub fn no_entry() -> Self {
        Self {
            termination: Termination::NoEntry,
            final_pnl: 0.0,
            gross_pnl: 0.0,
            fees_paid: 0.0,
            max_drawdown: 0.0,
            win_rate: 0.0,
            trade_count: 0,
            avg_return: 0.0,
            reentry_count: 0,
            holding_minutes: 0.0,
            entry_price: None,
            final_price: None,
            executed_size: 0.0,
        }
    }
}
