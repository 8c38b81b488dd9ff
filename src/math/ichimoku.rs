use serde::{Deserialize, Serialize};

use crate::data::candle::Candle;

/// Ichimoku window lengths. Defaults are the conventional 9/26/52.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IchimokuConfig {
    pub tenkan: usize,
    pub kijun: usize,
    pub span_b: usize,
}

impl Default for IchimokuConfig {
    fn default() -> Self {
        Self {
            tenkan: 9,
            kijun: 26,
            span_b: 52,
        }
    }
}

/// Ichimoku lines over one candle slice.
///
/// Values at index `i` are computed from candles `[i - W + 1, i]` only;
/// indices inside the warm-up window are `None`. Span A/B are reported at
/// the candle they were computed from (no forward displacement); the
/// consumer applies any plotting shift itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IchimokuLines {
    pub tenkan: Vec<Option<f64>>,
    pub kijun: Vec<Option<f64>>,
    pub span_a: Vec<Option<f64>>,
    pub span_b: Vec<Option<f64>>,
}

/// Computes all four lines in one pass over the slice.
pub fn ichimoku(candles: &[Candle], cfg: IchimokuConfig) -> IchimokuLines {
    let tenkan = midpoint_line(candles, cfg.tenkan);
    let kijun = midpoint_line(candles, cfg.kijun);

    let span_a = tenkan
        .iter()
        .zip(&kijun)
        .map(|(t, k)| match (t, k) {
            (Some(t), Some(k)) => Some((t + k) / 2.0),
            _ => None,
        })
        .collect();

    let span_b = midpoint_line(candles, cfg.span_b);

    IchimokuLines {
        tenkan,
        kijun,
        span_a,
        span_b,
    }
}

/// `(highest high + lowest low) / 2` over the trailing `window`.
fn midpoint_line(candles: &[Candle], window: usize) -> Vec<Option<f64>> {
    let window = window.max(1);
    candles
        .iter()
        .enumerate()
        .map(|(i, _)| {
            if i + 1 < window {
                return None;
            }
            let slice = &candles[i + 1 - window..=i];
            let high = slice.iter().map(|c| c.high.0).fold(f64::NEG_INFINITY, f64::max);
            let low = slice.iter().map(|c| c.low.0).fold(f64::INFINITY, f64::min);
            Some((high + low) / 2.0)
        })
        .collect()
}
