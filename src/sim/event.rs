use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::data::domain::{Price, Seq, SizeFraction};

/// Kind of a simulation trace event.
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
pub enum SimEventType {
    Entry,
    PartialExitTarget,
    StopOut,
    ReentryArm,
    ReentryFill,
    FinalClose,
}

/// One entry in a per-alert simulation trace.
///
/// `seq` is strictly increasing within the alert and follows candle order.
/// `pnl_so_far` is the realised P&L of all completed exits minus all costs
/// to date; the open position's unrealised value is never included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    pub seq: Seq,
    /// Unix seconds of the candle that produced the event.
    pub event_ts: i64,
    pub event_type: SimEventType,
    /// Actual fill price after slippage (for fills), or the reference price
    /// for non-fill events.
    pub price: Price,
    /// Fraction of the original position transacted by this event.
    pub size: SizeFraction,
    /// Fraction of the original position still held after this event.
    pub remaining: SizeFraction,
    pub pnl_so_far: f64,
    /// Indicator snapshot at the transition (entry events only): values
    /// computed from candles strictly before the event's candle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indicators: Option<serde_json::Value>,
    /// State tag after the transition, for trace readers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Accumulates events with the monotonic-`seq` invariant enforced at the
/// single point where events are created.
#[derive(Debug, Default)]
pub struct EventTrace {
    events: Vec<SimEvent>,
    next_seq: Seq,
}

impl EventTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        event_ts: i64,
        event_type: SimEventType,
        price: Price,
        size: SizeFraction,
        remaining: SizeFraction,
        pnl_so_far: f64,
        state: Option<String>,
    ) {
        self.push_with_indicators(
            event_ts, event_type, price, size, remaining, pnl_so_far, None, state,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push_with_indicators(
        &mut self,
        event_ts: i64,
        event_type: SimEventType,
        price: Price,
        size: SizeFraction,
        remaining: SizeFraction,
        pnl_so_far: f64,
        indicators: Option<serde_json::Value>,
        state: Option<String>,
    ) {
        let seq = self.next_seq;
        self.next_seq = seq.next();
        self.events.push(SimEvent {
            seq,
            event_ts,
            event_type,
            price,
            size,
            remaining,
            pnl_so_far,
            indicators,
            state,
        });
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<SimEvent> {
        self.events
    }

    pub fn last(&self) -> Option<&SimEvent> {
        self.events.last()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
