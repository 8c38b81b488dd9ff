use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::data::domain::{Price, SizeFraction};

/// Why an alert's simulation ended.
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
pub enum Termination {
    /// Entry conditions never met within the wait window.
    NoEntry,
    /// Stop-loss closed the whole position (no re-entry budget left).
    StoppedOut,
    /// The full ladder filled; nothing left to hold.
    TargetsExhausted,
    /// Window ended with a position still open; closed at the last close.
    FinalClose,
}

/// Waiting for the entry conditions of the strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitingEntry {
    /// Lowest low observed since the window opened.
    pub running_low: Price,
    /// True once the initial drawdown threshold has printed.
    pub drawdown_armed: bool,
    /// Candles consumed so far (indicator warm-up gate).
    pub candles_seen: u32,
}

impl AwaitingEntry {
    pub fn new(reference: Price) -> Self {
        Self {
            running_low: reference,
            drawdown_armed: false,
            candles_seen: 0,
        }
    }
}

/// Holding a (possibly partially exited) position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InPosition {
    pub entry_ts: i64,
    /// Actual entry fill price (post-slippage).
    pub entry_price: Price,
    /// Fraction of the original position this entry filled.
    pub entered_size: SizeFraction,
    /// Fraction still held.
    pub remaining: SizeFraction,
    /// Running high since entry; anchors trailing stops.
    pub peak: Price,
    /// Current stop price. Only ever ratchets upward.
    pub stop_price: Price,
    /// Index of the next unfilled rung of the ladder.
    pub next_target: usize,
    /// Re-entries consumed before this position opened.
    pub reentries_used: u32,
}

/// Stopped out with re-entry budget remaining; waiting for the re-entry
/// condition (a rebound from a new local low).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmedForReentry {
    /// Lowest low since the stop-out.
    pub local_low: Price,
    /// Stop-out fill price; a low strictly below it arms the re-entry.
    pub stop_fill: Price,
    /// Size the stop closed; caps the re-entry size.
    pub stopped_size: SizeFraction,
    /// True once a new local low below the stop-out fill has printed.
    pub armed: bool,
    pub reentries_used: u32,
    /// Ladder progress carries across the stop-out.
    pub next_target: usize,
}

/// The per-alert state machine.
///
/// `awaiting_entry -> in_position -> (armed_for_reentry -> in_position)* ->
/// finished`. Transitions are driven one candle at a time by the engine;
/// each transition emits exactly one trace event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlertState {
    AwaitingEntry(AwaitingEntry),
    InPosition(InPosition),
    ArmedForReentry(ArmedForReentry),
    Finished(Termination),
}

impl AlertState {
    pub fn tag(&self) -> &'static str {
        match self {
            AlertState::AwaitingEntry(_) => "awaiting_entry",
            AlertState::InPosition(_) => "in_position",
            AlertState::ArmedForReentry(_) => "armed_for_reentry",
            AlertState::Finished(_) => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertState::Finished(_))
    }

    pub fn position(&self) -> Option<&InPosition> {
        match self {
            AlertState::InPosition(p) => Some(p),
            _ => None,
        }
    }

    pub fn termination(&self) -> Option<Termination> {
        match self {
            AlertState::Finished(t) => Some(*t),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_tags_are_stable() {
        let awaiting = AlertState::AwaitingEntry(AwaitingEntry::new(Price(1.0)));
        assert_eq!(awaiting.tag(), "awaiting_entry");
        assert!(!awaiting.is_terminal());

        let finished = AlertState::Finished(Termination::NoEntry);
        assert!(finished.is_terminal());
        assert_eq!(finished.termination(), Some(Termination::NoEntry));
    }

    #[test]
    fn termination_serialises_snake_case() {
        assert_eq!(Termination::StoppedOut.to_string(), "stopped_out");
        assert_eq!(
            serde_json::to_string(&Termination::FinalClose).unwrap(),
            r#""final_close""#
        );
    }
}
