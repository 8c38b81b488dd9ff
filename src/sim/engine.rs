use tracing::debug;

use crate::{
    data::{
        candle::{Candle, CandleSlice},
        domain::{Price, SizeFraction},
        strategy::{
            CostModel, EntryConfig, ExecutionModel, ReentryCondition, StopLossConfig,
            StrategyConfig,
        },
    },
    error::{MintlabResult, SimError, SystemError},
    math::indicator::{
        StreamingDrawdown, StreamingEma, StreamingIndicator, StreamingSma, StreamingStdDev,
    },
    sim::{
        event::{EventTrace, SimEvent, SimEventType},
        fill::{FillEngine, FillSide, SubSeed},
        state::{AlertState, ArmedForReentry, AwaitingEntry, InPosition, Termination},
        summary::AlertSummary,
    },
};

/// Remaining-size tolerance when deciding a position is fully exited.
const SIZE_EPSILON: f64 = 1e-9;

/// Volume window feeding the slippage z-score.
const VOLUME_WINDOW: u16 = 20;

/// Close-trend windows snapshotted onto entry events.
const CLOSE_SMA_WINDOW: u16 = 20;
const CLOSE_EMA_SPAN: u16 = 9;

/// Everything one alert's simulation needs. Pure input: the engine performs
/// no I/O and reads no process state.
#[derive(Debug)]
pub struct SimRequest<'a> {
    /// Single-alert candle window at a fixed interval.
    pub slice: &'a CandleSlice,
    pub strategy: &'a StrategyConfig,
    pub exec: &'a ExecutionModel,
    pub costs: &'a CostModel,
    /// Per-alert sub-seed; see [`SubSeed::derive`].
    pub sub_seed: SubSeed,
    /// Caller-reported alert price; falls back to the first candle's open.
    pub alert_price: Option<Price>,
}

/// Result of one alert's simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimOutcome {
    pub events: Vec<SimEvent>,
    pub summary: AlertSummary,
    /// Human-readable notes (skipped gaps, failed entry attempts).
    pub diagnostics: Vec<String>,
}

/// Walks the candle window and evaluates the strategy for one alert.
///
/// # Fill model
/// Stops and targets use optimistic limit-fill semantics: when a candle's
/// range touches a trigger price the fill happens *at the trigger price*
/// (then slippage moves it adversely), never at the candle extreme.
///
/// # Tie-break order (fixed)
/// Within one candle: stop-loss first, then unfilled targets in ladder
/// order, then close-evaluated signal exits, then the trailing-stop ratchet.
/// The stop check uses the stop price as of the end of the previous candle.
///
/// # Determinism
/// All randomness comes from the ChaCha8 stream seeded by `sub_seed`; draws
/// occur in a fixed per-fill order. Float accumulation follows candle order
/// with a single running sum per accumulator, so identical inputs produce
/// bit-identical outputs regardless of worker count.
pub fn simulate(req: SimRequest<'_>) -> MintlabResult<SimOutcome> {
    req.strategy.validate()?;
    req.exec.validate()?;
    req.costs.validate()?;

    let candles = req.slice.candles();
    let first = candles
        .first()
        .ok_or(SimError::EmptyWindow("window has no candles".to_string()))?;
    for c in candles {
        if !(c.open.is_finite() && c.high.is_finite() && c.low.is_finite() && c.close.is_finite())
        {
            return Err(SimError::NonFinitePrice(c.ts).into());
        }
    }

    let mut runner = Runner::new(req.strategy, req.exec, req.costs, req.sub_seed);
    let reference = req.alert_price.unwrap_or(first.open);
    let window_start = first.ts;

    if !req.slice.is_dense() {
        runner
            .diagnostics
            .push(format!("window has {} gap(s); skipping ahead", req.slice.gaps().len()));
    }

    let mut state = AlertState::AwaitingEntry(AwaitingEntry::new(reference));

    for candle in candles {
        if state.is_terminal() {
            break;
        }
        let volume_z = runner.volume.z_score(candle.volume.0);

        state = match state {
            AlertState::AwaitingEntry(w) => {
                runner.step_awaiting(w, candle, reference, window_start, volume_z)?
            }
            AlertState::InPosition(p) => runner.step_position(p, candle, volume_z)?,
            AlertState::ArmedForReentry(a) => runner.step_armed(a, candle, volume_z),
            terminal @ AlertState::Finished(_) => terminal,
        };

        runner.volume.update(candle.volume.0);
        runner.close_sma_value = runner.close_sma.update(candle.close.0);
        runner.close_ema_value = runner.close_ema.update(candle.close.0);
        if let AlertState::InPosition(_) = state {
            runner.drawdown.update(candle.close.0);
        }
    }

    // End of window: close whatever is still open at the last close.
    let last = candles.last().expect("non-empty window");
    let termination = match state {
        AlertState::Finished(t) => t,
        AlertState::AwaitingEntry(_) => Termination::NoEntry,
        AlertState::ArmedForReentry(_) => Termination::StoppedOut,
        AlertState::InPosition(p) => {
            runner.close_remaining(p, last)?;
            Termination::FinalClose
        }
    };

    Ok(runner.finish(termination))
}

// ================================================================================================
// Runner
// ================================================================================================

struct Runner<'a> {
    strategy: &'a StrategyConfig,
    fills: FillEngine,
    volume: StreamingStdDev,
    drawdown: StreamingDrawdown,
    close_sma: StreamingSma,
    close_ema: StreamingEma,
    /// Latest warm close-trend values; lag the current candle by one so
    /// entry snapshots never look into the candle that fills them.
    close_sma_value: Option<f64>,
    close_ema_value: Option<f64>,
    trace: EventTrace,
    diagnostics: Vec<String>,

    realised_gross: f64,
    fees_paid: f64,
    trade_count: u32,
    reentry_count: u32,
    executed_size: f64,
    first_entry_ts: Option<i64>,
    last_exit_ts: Option<i64>,
    first_entry_price: Option<Price>,
    final_price: Option<Price>,
}

impl<'a> Runner<'a> {
    fn new(
        strategy: &'a StrategyConfig,
        exec: &ExecutionModel,
        costs: &CostModel,
        sub_seed: SubSeed,
    ) -> Self {
        Self {
            strategy,
            fills: FillEngine::new(exec.clone(), costs.clone(), sub_seed),
            volume: StreamingStdDev::new(VOLUME_WINDOW),
            drawdown: StreamingDrawdown::new(),
            close_sma: StreamingSma::new(CLOSE_SMA_WINDOW),
            close_ema: StreamingEma::new(CLOSE_EMA_SPAN),
            close_sma_value: None,
            close_ema_value: None,
            trace: EventTrace::new(),
            diagnostics: Vec::new(),
            realised_gross: 0.0,
            fees_paid: 0.0,
            trade_count: 0,
            reentry_count: 0,
            executed_size: 0.0,
            first_entry_ts: None,
            last_exit_ts: None,
            first_entry_price: None,
            final_price: None,
        }
    }

    fn pnl_so_far(&self) -> f64 {
        self.realised_gross - self.fees_paid
    }

    // ============================================================================
    // awaiting_entry
    // ============================================================================

    fn step_awaiting(
        &mut self,
        mut w: AwaitingEntry,
        candle: &Candle,
        reference: Price,
        window_start: i64,
        volume_z: Option<f64>,
    ) -> MintlabResult<AlertState> {
        w.candles_seen += 1;

        match &self.strategy.entry {
            EntryConfig::Immediate => {
                // Fill at the candle open; a failed attempt retries at the
                // next candle's open.
                if self.fills.entry_fails() {
                    self.diagnostics
                        .push(format!("entry attempt failed at ts {}", candle.ts));
                    return Ok(AlertState::AwaitingEntry(w));
                }
                match self.open_position(candle.open, candle, volume_z, 0, 0, SizeFraction(1.0)) {
                    // The fill is at the open, so the rest of this candle
                    // still trades against the fresh position.
                    Some(p) => self.step_position(p, candle, volume_z),
                    None => Ok(AlertState::AwaitingEntry(w)),
                }
            }
            EntryConfig::TrailingRebound {
                initial_drawdown_pct,
                trailing_rebound_pct,
                max_wait_minutes,
                required_history_candles,
            } => {
                if candle.ts > window_start + (*max_wait_minutes as i64) * 60 {
                    return Ok(AlertState::Finished(Termination::NoEntry));
                }

                let mut low_updated = false;
                if candle.low.0 < w.running_low.0 {
                    w.running_low = candle.low;
                    low_updated = true;
                }
                if !w.drawdown_armed
                    && candle.low.0 <= reference.0 * (1.0 - initial_drawdown_pct)
                {
                    w.drawdown_armed = true;
                }

                // A rebound cannot be observed on the candle that printed
                // the low: OHLC rows carry no intra-candle ordering.
                let warm = w.candles_seen >= *required_history_candles;
                if w.drawdown_armed && warm && !low_updated {
                    let trigger = Price(w.running_low.0 * (1.0 + trailing_rebound_pct));
                    if candle.high.0 >= trigger.0 {
                        if self.fills.entry_fails() {
                            self.diagnostics
                                .push(format!("entry attempt failed at ts {}", candle.ts));
                            return Ok(AlertState::AwaitingEntry(w));
                        }
                        if let Some(p) =
                            self.open_position(trigger, candle, volume_z, 0, 0, SizeFraction(1.0))
                        {
                            // Rebound fills happen mid-candle; exit checks
                            // begin on the next candle.
                            return Ok(AlertState::InPosition(p));
                        }
                    }
                }
                Ok(AlertState::AwaitingEntry(w))
            }
        }
    }

    /// Opens a position at `trigger` and emits the entry event. Returns
    /// `None` only if the fill size collapses to zero.
    fn open_position(
        &mut self,
        trigger: Price,
        candle: &Candle,
        volume_z: Option<f64>,
        next_target: usize,
        reentries_used: u32,
        intended: SizeFraction,
    ) -> Option<InPosition> {
        let size = self.fills.entry_fill_size(intended);
        if size.0 <= SIZE_EPSILON {
            return None;
        }
        let fill = self.fills.fill(trigger, size, FillSide::Buy, volume_z);
        self.fees_paid += fill.fees;
        self.trade_count += 1;
        self.first_entry_ts.get_or_insert(candle.ts);
        self.first_entry_price.get_or_insert(fill.price);

        let position = InPosition {
            entry_ts: candle.ts,
            entry_price: fill.price,
            entered_size: size,
            remaining: size,
            peak: fill.price,
            stop_price: self.initial_stop(fill.price),
            next_target,
            reentries_used,
        };

        let event_type = if reentries_used > 0 {
            SimEventType::ReentryFill
        } else {
            SimEventType::Entry
        };
        self.trace.push_with_indicators(
            candle.ts,
            event_type,
            fill.price,
            size,
            size,
            self.pnl_so_far(),
            self.entry_indicators(),
            Some("in_position".to_string()),
        );
        debug!(ts = candle.ts, price = fill.price.0, size = size.0, "position opened");
        Some(position)
    }

    /// Close-trend snapshot attached to entry fills. Absent until at least
    /// one of the averages has warmed up on pre-entry candles.
    fn entry_indicators(&self) -> Option<serde_json::Value> {
        if self.close_sma_value.is_none() && self.close_ema_value.is_none() {
            return None;
        }
        let mut snapshot = serde_json::Map::new();
        snapshot.insert(
            format!("close_sma_{CLOSE_SMA_WINDOW}"),
            serde_json::json!(self.close_sma_value),
        );
        snapshot.insert(
            format!("close_ema_{CLOSE_EMA_SPAN}"),
            serde_json::json!(self.close_ema_value),
        );
        Some(serde_json::Value::Object(snapshot))
    }

    fn initial_stop(&self, entry: Price) -> Price {
        Price(entry.0 * (1.0 - self.strategy.stop_loss.base_pct()))
    }

    // ============================================================================
    // in_position
    // ============================================================================

    fn step_position(
        &mut self,
        mut p: InPosition,
        candle: &Candle,
        volume_z: Option<f64>,
    ) -> MintlabResult<AlertState> {
        // 1. Stop-loss first. Fills at the stop price, not the candle low.
        if candle.low.0 <= p.stop_price.0 {
            return self.stop_out(p, candle, volume_z);
        }

        // 2. Targets next, in ladder order. Several rungs can fill inside
        //    one candle.
        while p.next_target < self.strategy.targets.len() {
            let target = self.strategy.targets[p.next_target];
            let target_price = Price(p.entry_price.0 * target.multiple);
            if candle.high.0 < target_price.0 {
                break;
            }

            let size = SizeFraction(target.size_fraction.0.min(p.remaining.0));
            let fill = self.fills.fill(target_price, size, FillSide::Sell, volume_z);
            self.record_exit(&mut p, fill.price, size, fill.fees, candle.ts)?;
            p.next_target += 1;

            self.trace.push(
                candle.ts,
                SimEventType::PartialExitTarget,
                fill.price,
                size,
                p.remaining,
                self.pnl_so_far(),
                Some("in_position".to_string()),
            );

            if p.remaining.0 <= SIZE_EPSILON {
                return Ok(AlertState::Finished(Termination::TargetsExhausted));
            }
        }

        // 3. Signal exits would evaluate on the close here; the declarative
        //    strategy tree defines none.

        // 4. Ratchet the stop from the running peak.
        if candle.high.0 > p.peak.0 {
            p.peak = candle.high;
        }
        let candidate = self.stop_candidate(&p);
        if candidate.0 > p.stop_price.0 {
            p.stop_price = candidate;
        }

        Ok(AlertState::InPosition(p))
    }

    fn stop_candidate(&self, p: &InPosition) -> Price {
        match &self.strategy.stop_loss {
            StopLossConfig::Static { .. } => p.stop_price,
            StopLossConfig::Trailing { pct } => Price(p.peak.0 * (1.0 - pct)),
            StopLossConfig::Phased {
                pct,
                phase_boundaries,
            } => {
                let progress = p.peak.0 / p.entry_price.0;
                let mut active = *pct;
                for boundary in phase_boundaries {
                    if progress >= boundary.at_multiple {
                        active = boundary.pct;
                    }
                }
                Price(p.peak.0 * (1.0 - active))
            }
        }
    }

    fn stop_out(
        &mut self,
        mut p: InPosition,
        candle: &Candle,
        volume_z: Option<f64>,
    ) -> MintlabResult<AlertState> {
        let size = p.remaining;
        let fill = self.fills.fill(p.stop_price, size, FillSide::Sell, volume_z);
        self.record_exit(&mut p, fill.price, size, fill.fees, candle.ts)?;

        let can_reenter = self
            .strategy
            .reentry
            .as_ref()
            .is_some_and(|r| p.reentries_used < r.max_reentries);
        let next_state = if can_reenter {
            "armed_for_reentry"
        } else {
            "finished"
        };

        self.trace.push(
            candle.ts,
            SimEventType::StopOut,
            fill.price,
            size,
            SizeFraction(0.0),
            self.pnl_so_far(),
            Some(next_state.to_string()),
        );

        if can_reenter {
            let local_low = if candle.low.0 < fill.price.0 {
                candle.low
            } else {
                fill.price
            };
            Ok(AlertState::ArmedForReentry(ArmedForReentry {
                local_low,
                stop_fill: fill.price,
                stopped_size: size,
                armed: false,
                reentries_used: p.reentries_used,
                next_target: p.next_target,
            }))
        } else {
            Ok(AlertState::Finished(Termination::StoppedOut))
        }
    }

    // ============================================================================
    // armed_for_reentry
    // ============================================================================

    fn step_armed(
        &mut self,
        mut a: ArmedForReentry,
        candle: &Candle,
        volume_z: Option<f64>,
    ) -> AlertState {
        let Some(reentry) = self.strategy.reentry.clone() else {
            return AlertState::Finished(Termination::StoppedOut);
        };

        let mut low_updated = false;
        if candle.low.0 < a.local_low.0 {
            a.local_low = candle.low;
            low_updated = true;
        }

        // Arm on the first new local low strictly below the stop-out fill.
        if !a.armed && candle.low.0 < a.stop_fill.0 {
            a.armed = true;
            self.trace.push(
                candle.ts,
                SimEventType::ReentryArm,
                candle.low,
                SizeFraction(0.0),
                SizeFraction(0.0),
                self.pnl_so_far(),
                Some("armed_for_reentry".to_string()),
            );
        }

        // As with entries, the rebound is only observable on a candle that
        // did not itself print the low.
        if a.armed && !low_updated {
            let ReentryCondition::ReboundFromLocalLow { rebound_pct } = reentry.condition;
            let trigger = Price(a.local_low.0 * (1.0 + rebound_pct));
            if candle.high.0 >= trigger.0 {
                if self.fills.entry_fails() {
                    self.diagnostics
                        .push(format!("re-entry attempt failed at ts {}", candle.ts));
                    return AlertState::ArmedForReentry(a);
                }
                let intended = SizeFraction(reentry.size_fraction.0.min(a.stopped_size.0));
                if let Some(p) = self.open_position(
                    trigger,
                    candle,
                    volume_z,
                    a.next_target,
                    a.reentries_used + 1,
                    intended,
                ) {
                    self.reentry_count += 1;
                    return AlertState::InPosition(p);
                }
            }
        }

        AlertState::ArmedForReentry(a)
    }

    // ============================================================================
    // exits & finish
    // ============================================================================

    fn record_exit(
        &mut self,
        p: &mut InPosition,
        price: Price,
        size: SizeFraction,
        fees: f64,
        ts: i64,
    ) -> MintlabResult<()> {
        if size.0 > p.remaining.0 + SIZE_EPSILON {
            return Err(SystemError::InvariantViolation(format!(
                "exit size {} exceeds remaining {}",
                size.0, p.remaining.0
            ))
            .into());
        }
        self.realised_gross += (price.0 - p.entry_price.0) * size.0;
        self.fees_paid += fees;
        self.executed_size += size.0;
        p.remaining = SizeFraction((p.remaining.0 - size.0).max(0.0));
        self.last_exit_ts = Some(ts);
        self.final_price = Some(price);
        Ok(())
    }

    fn close_remaining(&mut self, mut p: InPosition, last: &Candle) -> MintlabResult<()> {
        let size = p.remaining;
        if size.0 <= SIZE_EPSILON {
            return Ok(());
        }
        let fill = self.fills.fill(last.close, size, FillSide::Sell, None);
        self.record_exit(&mut p, fill.price, size, fill.fees, last.ts)?;
        self.trace.push(
            last.ts,
            SimEventType::FinalClose,
            fill.price,
            size,
            SizeFraction(0.0),
            self.pnl_so_far(),
            Some("finished".to_string()),
        );
        Ok(())
    }

    fn finish(self, termination: Termination) -> SimOutcome {
        let final_pnl = self.realised_gross - self.fees_paid;
        let summary = if self.trade_count == 0 {
            AlertSummary {
                termination,
                ..AlertSummary::no_entry()
            }
        } else {
            AlertSummary {
                termination,
                final_pnl,
                gross_pnl: self.realised_gross,
                fees_paid: self.fees_paid,
                max_drawdown: self.drawdown.max_drawdown(),
                win_rate: if final_pnl > 0.0 { 1.0 } else { 0.0 },
                trade_count: self.trade_count,
                avg_return: final_pnl / self.trade_count as f64,
                reentry_count: self.reentry_count,
                holding_minutes: match (self.first_entry_ts, self.last_exit_ts) {
                    (Some(start), Some(end)) => (end - start) as f64 / 60.0,
                    _ => 0.0,
                },
                entry_price: self.first_entry_price,
                final_price: self.final_price,
                executed_size: self.executed_size,
            }
        };

        SimOutcome {
            events: self.trace.into_events(),
            summary,
            diagnostics: self.diagnostics,
        }
    }
}
