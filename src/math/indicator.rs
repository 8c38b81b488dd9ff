use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A trait for incremental indicators.
///
/// Pure and windowed: `update` at step `i` depends only on the last `W`
/// inputs, never on process state, and performs no I/O. Returns
/// `Some(value)` once the indicator is warm (enough data seen), `None`
/// while still inside the warm-up window.
pub trait StreamingIndicator: std::fmt::Debug + Send + Sync {
    /// Update the indicator with the latest scalar value (e.g., close price).
    fn update(&mut self, value: f64) -> Option<f64>;

    /// Reset the internal state (e.g., for a new alert window).
    fn reset(&mut self);
}

// ================================================================================================
// SMA: Simple Moving Average
// ================================================================================================

/// Mean over the last `capacity` inputs, kept in a ring buffer.
///
/// The mean is re-summed from slot 0 upward on every warm update instead of
/// maintained as a running total. The window is small, and a fixed-order
/// full pass has no drift to accumulate, matching how [`StreamingStdDev`]
/// handles the same concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSma {
    slots: Vec<f64>,
    cursor: usize,
    seen: usize,
}

impl StreamingSma {
    pub fn new(capacity: u16) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            slots: vec![0.0; capacity],
            cursor: 0,
            seen: 0,
        }
    }

    fn is_warm(&self) -> bool {
        self.seen >= self.slots.len()
    }
}

impl StreamingIndicator for StreamingSma {
    fn update(&mut self, value: f64) -> Option<f64> {
        self.slots[self.cursor] = value;
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.seen += 1;

        if !self.is_warm() {
            return None;
        }
        // Slot order, not arrival order: irrelevant for a sum, and stable.
        let total: f64 = self.slots.iter().sum();
        Some(total / self.slots.len() as f64)
    }

    fn reset(&mut self) {
        self.slots.fill(0.0);
        self.cursor = 0;
        self.seen = 0;
    }
}

// ================================================================================================
// EMA: Exponential Moving Average
// ================================================================================================

/// Exponential moving average over a span, seeded with the first input.
///
/// Written in error-correction form, `y += alpha * (x - y)`, with the
/// smoothed value living in an `Option` that doubles as the seeded/unseeded
/// flag. Warm once `span` inputs have been absorbed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingEma {
    span: usize,
    seen: usize,
    smoothed: Option<f64>,
}

impl StreamingEma {
    pub fn new(span: u16) -> Self {
        Self {
            span: span.max(1) as usize,
            seen: 0,
            smoothed: None,
        }
    }

    fn alpha(&self) -> f64 {
        2.0 / (self.span as f64 + 1.0)
    }
}

impl StreamingIndicator for StreamingEma {
    fn update(&mut self, value: f64) -> Option<f64> {
        self.seen += 1;
        let next = match self.smoothed {
            None => value,
            Some(prev) => prev + self.alpha() * (value - prev),
        };
        self.smoothed = Some(next);

        if self.seen >= self.span {
            Some(next)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.seen = 0;
        self.smoothed = None;
    }
}

// ================================================================================================
// Rolling Standard Deviation
// ================================================================================================

/// Sample standard deviation over a fixed window.
///
/// Recomputed from the buffered window each step (two fixed-order passes)
/// rather than via Welford deltas: the window is small and the full
/// recomputation keeps the float-op ordering identical on every step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingStdDev {
    window_size: usize,
    buffer: VecDeque<f64>,
}

impl StreamingStdDev {
    pub fn new(window_size: u16) -> Self {
        let size = window_size.max(2) as usize;
        Self {
            window_size: size,
            buffer: VecDeque::with_capacity(size),
        }
    }

    /// Z-score of the latest value against the current window, if warm.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.buffer.len() < self.window_size {
            return None;
        }
        let mean = self.buffer.iter().sum::<f64>() / self.buffer.len() as f64;
        let sd = self.std_dev()?;
        if sd == 0.0 {
            return Some(0.0);
        }
        Some((value - mean) / sd)
    }

    fn std_dev(&self) -> Option<f64> {
        let n = self.buffer.len();
        if n < 2 {
            return None;
        }
        let mean = self.buffer.iter().sum::<f64>() / n as f64;
        let var = self
            .buffer
            .iter()
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum::<f64>()
            / (n - 1) as f64;
        Some(var.sqrt())
    }
}

impl StreamingIndicator for StreamingStdDev {
    fn update(&mut self, value: f64) -> Option<f64> {
        self.buffer.push_back(value);
        if self.buffer.len() > self.window_size {
            self.buffer.pop_front();
        }
        if self.buffer.len() >= self.window_size {
            self.std_dev()
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

// ================================================================================================
// Windowed Min / Max
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extreme {
    Min,
    Max,
}

/// Minimum or maximum over the last `window_size` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingExtreme {
    window_size: usize,
    extreme: Extreme,
    buffer: VecDeque<f64>,
}

impl StreamingExtreme {
    pub fn new(window_size: u16, extreme: Extreme) -> Self {
        let size = window_size.max(1) as usize;
        Self {
            window_size: size,
            extreme,
            buffer: VecDeque::with_capacity(size),
        }
    }
}

impl StreamingIndicator for StreamingExtreme {
    fn update(&mut self, value: f64) -> Option<f64> {
        self.buffer.push_back(value);
        if self.buffer.len() > self.window_size {
            self.buffer.pop_front();
        }
        if self.buffer.len() < self.window_size {
            return None;
        }
        let folded = match self.extreme {
            Extreme::Min => self.buffer.iter().copied().fold(f64::INFINITY, f64::min),
            Extreme::Max => self
                .buffer
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max),
        };
        Some(folded)
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

// ================================================================================================
// Drawdown From Running Peak
// ================================================================================================

/// Fractional drawdown from the running peak since the last reset.
///
/// Warm from the first value: `update` returns `Some` immediately, `0.0`
/// while making new highs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingDrawdown {
    peak: Option<f64>,
    max_drawdown: f64,
}

impl StreamingDrawdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worst drawdown seen so far.
    pub fn max_drawdown(&self) -> f64 {
        self.max_drawdown
    }

    pub fn peak(&self) -> Option<f64> {
        self.peak
    }
}

impl StreamingIndicator for StreamingDrawdown {
    fn update(&mut self, value: f64) -> Option<f64> {
        let peak = match self.peak {
            Some(p) if p >= value => p,
            _ => {
                self.peak = Some(value);
                value
            }
        };
        if peak <= 0.0 {
            return Some(0.0);
        }
        let dd = (peak - value) / peak;
        if dd > self.max_drawdown {
            self.max_drawdown = dd;
        }
        Some(dd)
    }

    fn reset(&mut self) {
        self.peak = None;
        self.max_drawdown = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_warms_up_after_window() {
        let mut sma = StreamingSma::new(3);
        assert_eq!(sma.update(1.0), None);
        assert_eq!(sma.update(2.0), None);
        assert_eq!(sma.update(3.0), Some(2.0));
        assert_eq!(sma.update(4.0), Some(3.0));
    }

    #[test]
    fn sma_reset_clears_history() {
        let mut sma = StreamingSma::new(2);
        sma.update(10.0);
        sma.update(20.0);
        sma.reset();
        assert_eq!(sma.update(1.0), None);
        assert_eq!(sma.update(3.0), Some(2.0));
    }

    #[test]
    fn sma_drops_values_outside_the_window() {
        let mut sma = StreamingSma::new(2);
        assert_eq!(sma.update(10.0), None);
        assert_eq!(sma.update(20.0), Some(15.0));
        // The 10.0 has rotated out of the ring.
        assert_eq!(sma.update(40.0), Some(30.0));
    }

    #[test]
    fn ema_seeds_with_first_value() {
        let mut ema = StreamingEma::new(1);
        assert_eq!(ema.update(5.0), Some(5.0));
        // alpha = 1.0 for window 1, so it tracks the input exactly.
        assert_eq!(ema.update(7.0), Some(7.0));
    }

    #[test]
    fn ema_error_correction_matches_hand_computation() {
        // span 3 -> alpha 0.5; seeded at 2.0, warm on the third input.
        let mut ema = StreamingEma::new(3);
        assert_eq!(ema.update(2.0), None);
        assert_eq!(ema.update(4.0), None); // 2 + 0.5 * (4 - 2) = 3
        assert_eq!(ema.update(6.0), Some(4.5)); // 3 + 0.5 * (6 - 3)
    }

    #[test]
    fn ema_converges_towards_constant_input() {
        let mut ema = StreamingEma::new(5);
        let mut last = None;
        for _ in 0..50 {
            last = ema.update(10.0);
        }
        assert!((last.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn std_dev_matches_hand_computation() {
        let mut sd = StreamingStdDev::new(4);
        for v in [2.0, 4.0, 4.0, 4.0] {
            sd.update(v);
        }
        // mean 3.5, sample variance (2.25 + 0.25 * 3) / 3 = 1.0
        let out = sd.update(5.0).unwrap();
        // Window is now [4, 4, 4, 5]: mean 4.25, var = (3*0.0625 + 0.5625)/3
        assert!((out - 0.5).abs() < 1e-9);
    }

    #[test]
    fn extremes_track_window() {
        let mut max = StreamingExtreme::new(3, Extreme::Max);
        assert_eq!(max.update(1.0), None);
        assert_eq!(max.update(5.0), None);
        assert_eq!(max.update(2.0), Some(5.0));
        assert_eq!(max.update(2.0), Some(5.0));
        assert_eq!(max.update(2.0), Some(2.0));

        let mut min = StreamingExtreme::new(2, Extreme::Min);
        min.update(4.0);
        assert_eq!(min.update(3.0), Some(3.0));
        assert_eq!(min.update(9.0), Some(3.0));
        assert_eq!(min.update(8.0), Some(8.0));
    }

    #[test]
    fn drawdown_measures_from_running_peak() {
        let mut dd = StreamingDrawdown::new();
        assert_eq!(dd.update(100.0), Some(0.0));
        assert_eq!(dd.update(110.0), Some(0.0));
        let d = dd.update(99.0).unwrap();
        assert!((d - 0.1).abs() < 1e-9);
        // New high resets the current drawdown but not the max.
        assert_eq!(dd.update(120.0), Some(0.0));
        assert!((dd.max_drawdown() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn identical_inputs_give_identical_outputs() {
        let run = |values: &[f64]| -> Vec<Option<f64>> {
            let mut sd = StreamingStdDev::new(3);
            values.iter().map(|v| sd.update(*v)).collect()
        };
        let values = [1.0, 2.5, 3.1, 2.2, 9.9, 0.4];
        assert_eq!(run(&values), run(&values));
    }
}
