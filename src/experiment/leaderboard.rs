use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use ordered_float::OrderedFloat;
use polars::{df, frame::DataFrame, prelude::*};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    data::domain::RunId,
    error::{MintlabResult, StorageError},
    store::relational::{RelationalStore, RunSummaryRow},
};

/// Ranking criterion for the run leaderboard.
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
pub enum LeaderboardCriteria {
    Return,
    WinRate,
    ProfitFactor,
    Sharpe,
    MaxDrawdown,
}

impl LeaderboardCriteria {
    /// Criterion value for a summary row; `None` excludes the run (e.g.
    /// Sharpe undefined for a single-alert run).
    fn value(&self, row: &RunSummaryRow) -> Option<f64> {
        match self {
            LeaderboardCriteria::Return => Some(row.final_pnl),
            LeaderboardCriteria::WinRate => Some(row.win_rate),
            LeaderboardCriteria::ProfitFactor => Some(row.profit_factor),
            LeaderboardCriteria::Sharpe => row.sharpe,
            LeaderboardCriteria::MaxDrawdown => Some(row.max_drawdown),
        }
    }

    /// Natural "best" direction: drawdown ranks ascending, the rest
    /// descending.
    pub fn default_order(&self) -> SortOrder {
        match self {
            LeaderboardCriteria::MaxDrawdown => SortOrder::Ascending,
            _ => SortOrder::Descending,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Leaderboard request: criterion, order, size, minimum filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardQuery {
    pub criteria: LeaderboardCriteria,
    pub order: Option<SortOrder>,
    pub limit: usize,
    #[serde(default)]
    pub min_trades: Option<u32>,
    #[serde(default)]
    pub min_win_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub rank: u32,
    pub run_id: RunId,
    pub value: f64,
    pub final_pnl: f64,
    pub win_rate: f64,
    pub trade_count: u32,
    pub max_drawdown: f64,
}

/// Heap entry ordered by score alone; ties break on run id for a stable
/// total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    score: OrderedFloat<f64>,
    run_id: RunId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.run_id.cmp(&self.run_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Top-k runs by the requested criterion over the summary table.
///
/// A min-heap of size `limit` keeps memory constant over arbitrarily many
/// runs, the same shape the agent-evaluation leaderboard uses.
pub fn leaderboard(store: &RelationalStore, query: &LeaderboardQuery) -> Vec<LeaderboardRow> {
    let order = query.order.unwrap_or_else(|| query.criteria.default_order());
    let direction = match order {
        SortOrder::Descending => 1.0,
        SortOrder::Ascending => -1.0,
    };

    let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::with_capacity(query.limit + 1);
    let mut values: std::collections::HashMap<RunId, RunSummaryRow> =
        std::collections::HashMap::new();

    for row in store.summaries() {
        if query.min_trades.is_some_and(|min| row.trade_count < min) {
            continue;
        }
        if query.min_win_rate.is_some_and(|min| row.win_rate < min) {
            continue;
        }
        let Some(value) = query.criteria.value(&row) else {
            continue;
        };

        let entry = HeapEntry {
            score: OrderedFloat(value * direction),
            run_id: row.run_id,
        };
        values.insert(row.run_id, row);

        if heap.len() < query.limit {
            heap.push(Reverse(entry));
        } else if heap.peek().is_some_and(|Reverse(worst)| entry > *worst) {
            heap.pop();
            heap.push(Reverse(entry));
        }
    }

    let ranked = heap.into_sorted_vec().into_iter().map(|rev| rev.0);
    ranked
        .enumerate()
        .filter_map(|(i, entry)| {
            let row = values.get(&entry.run_id)?;
            Some(LeaderboardRow {
                rank: i as u32 + 1,
                run_id: entry.run_id,
                value: entry.score.0 * direction,
                final_pnl: row.final_pnl,
                win_rate: row.win_rate,
                trade_count: row.trade_count,
                max_drawdown: row.max_drawdown,
            })
        })
        .collect()
}

/// Columnar leaderboard for export.
pub fn leaderboard_dataframe(rows: &[LeaderboardRow]) -> MintlabResult<DataFrame> {
    let rank: Vec<u32> = rows.iter().map(|r| r.rank).collect();
    let run_id: Vec<u64> = rows.iter().map(|r| r.run_id.0).collect();
    let value: Vec<f64> = rows.iter().map(|r| r.value).collect();
    let final_pnl: Vec<f64> = rows.iter().map(|r| r.final_pnl).collect();
    let win_rate: Vec<f64> = rows.iter().map(|r| r.win_rate).collect();
    let trade_count: Vec<u32> = rows.iter().map(|r| r.trade_count).collect();
    let max_drawdown: Vec<f64> = rows.iter().map(|r| r.max_drawdown).collect();

    df!(
        "rank" => rank,
        "run_id" => run_id,
        "value" => value,
        "final_pnl" => final_pnl,
        "win_rate" => win_rate,
        "trade_count" => trade_count,
        "max_drawdown" => max_drawdown,
    )
    .map_err(|e| StorageError::DataFrame(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(run_id: u64, pnl: f64, win_rate: f64, trades: u32, drawdown: f64) -> RunSummaryRow {
        RunSummaryRow {
            run_id: RunId(run_id),
            final_pnl: pnl,
            max_drawdown: drawdown,
            win_rate,
            trade_count: trades,
            avg_return: pnl,
            profit_factor: 1.0,
            sharpe: if trades > 1 { Some(pnl * 2.0) } else { None },
            sortino: None,
        }
    }

    fn seeded_store() -> RelationalStore {
        let store = RelationalStore::in_memory();
        store.upsert_summary(summary(1, 0.5, 0.8, 10, 0.2));
        store.upsert_summary(summary(2, 1.5, 0.4, 3, 0.6));
        store.upsert_summary(summary(3, -0.3, 0.2, 1, 0.9));
        store.upsert_summary(summary(4, 0.9, 0.9, 7, 0.1));
        store
    }

    #[test]
    fn ranks_by_return_descending() {
        let store = seeded_store();
        let rows = leaderboard(
            &store,
            &LeaderboardQuery {
                criteria: LeaderboardCriteria::Return,
                order: None,
                limit: 3,
                min_trades: None,
                min_win_rate: None,
            },
        );
        let ids: Vec<u64> = rows.iter().map(|r| r.run_id.0).collect();
        assert_eq!(ids, vec![2, 4, 1]);
        assert_eq!(rows[0].rank, 1);
        assert!((rows[0].value - 1.5).abs() < 1e-12);
    }

    #[test]
    fn drawdown_ranks_ascending_by_default() {
        let store = seeded_store();
        let rows = leaderboard(
            &store,
            &LeaderboardQuery {
                criteria: LeaderboardCriteria::MaxDrawdown,
                order: None,
                limit: 2,
                min_trades: None,
                min_win_rate: None,
            },
        );
        let ids: Vec<u64> = rows.iter().map(|r| r.run_id.0).collect();
        assert_eq!(ids, vec![4, 1]);
    }

    #[test]
    fn min_filters_prune_candidates() {
        let store = seeded_store();
        let rows = leaderboard(
            &store,
            &LeaderboardQuery {
                criteria: LeaderboardCriteria::Return,
                order: None,
                limit: 10,
                min_trades: Some(5),
                min_win_rate: Some(0.5),
            },
        );
        let ids: Vec<u64> = rows.iter().map(|r| r.run_id.0).collect();
        assert_eq!(ids, vec![4, 1]);
    }

    #[test]
    fn sharpe_skips_runs_without_a_value() {
        let store = seeded_store();
        let rows = leaderboard(
            &store,
            &LeaderboardQuery {
                criteria: LeaderboardCriteria::Sharpe,
                order: None,
                limit: 10,
                min_trades: None,
                min_win_rate: None,
            },
        );
        // Run 3 has a single trade and no Sharpe; it must be absent.
        assert!(rows.iter().all(|r| r.run_id != RunId(3)));
    }

    #[test]
    fn dataframe_mirrors_rows() {
        let store = seeded_store();
        let rows = leaderboard(
            &store,
            &LeaderboardQuery {
                criteria: LeaderboardCriteria::WinRate,
                order: None,
                limit: 2,
                min_trades: None,
                min_win_rate: None,
            },
        );
        let df = leaderboard_dataframe(&rows).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.column("rank").unwrap().u32().unwrap().get(0), Some(1));
    }
}
