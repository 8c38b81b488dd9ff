use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::data::{
    domain::{AlertId, Price, SizeFraction},
    strategy::{CostModel, ExecutionModel, LatencyDistribution},
};

/// Which way slippage hurts for a given fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSide {
    /// Buying: slippage raises the fill price.
    Buy,
    /// Selling: slippage lowers the fill price.
    Sell,
}

/// A simulated fill: the post-slippage price plus the costs charged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub price: Price,
    pub size: SizeFraction,
    /// `trading_fee_pct * notional + base_fee + uniform(priority_fee_range)`.
    pub fees: f64,
    /// Simulated submission-to-fill latency for diagnostics.
    pub latency_ms: f64,
}

/// Deterministic sub-seed for one alert's RNG stream.
///
/// Derived as `blake3(seed || alert_id || nonce)` so per-alert randomness is
/// independent of worker scheduling: the same `(seed, alert_id)` always
/// yields the same stream no matter which worker runs the alert, or how many
/// workers there are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubSeed(pub u64);

impl SubSeed {
    pub fn derive(seed: u64, alert_id: AlertId, nonce: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seed.to_le_bytes());
        hasher.update(&alert_id.0.to_le_bytes());
        hasher.update(&nonce.to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(bytes))
    }
}

/// Applies the execution and cost models to trigger prices.
///
/// All randomness flows through the single ChaCha8 stream seeded from the
/// per-alert [`SubSeed`]; draws happen in a fixed order per fill (latency,
/// priority fee, then any failure/partial draws) so the stream is stable.
#[derive(Debug)]
pub struct FillEngine {
    exec: ExecutionModel,
    costs: CostModel,
    rng: ChaCha8Rng,
}

impl FillEngine {
    pub fn new(exec: ExecutionModel, costs: CostModel, sub_seed: SubSeed) -> Self {
        Self {
            exec,
            costs,
            rng: ChaCha8Rng::seed_from_u64(sub_seed.0),
        }
    }

    /// Produces a fill at `trigger_price`, slipped in the adverse direction
    /// for `side`, with fees charged on the resulting notional.
    ///
    /// `volume_z` is the current volume z-score feeding the slippage model;
    /// thin volume (negative z) widens slippage, never tightens it below
    /// the configured base.
    pub fn fill(
        &mut self,
        trigger_price: Price,
        size: SizeFraction,
        side: FillSide,
        volume_z: Option<f64>,
    ) -> Fill {
        let latency_ms = self.draw_latency();
        let priority_fee = self.draw_priority_fee();

        let slip = self.slippage_fraction(volume_z);
        let price = match side {
            FillSide::Buy => Price(trigger_price.0 * (1.0 + slip)),
            FillSide::Sell => Price(trigger_price.0 * (1.0 - slip)),
        };

        let notional = price.0 * size.0;
        let fees = self.costs.trading_fee_pct * notional + self.costs.base_fee + priority_fee;

        Fill {
            price,
            size,
            fees,
            latency_ms,
        }
    }

    /// Whether a simulated entry attempt fails outright this candle.
    pub fn entry_fails(&mut self) -> bool {
        self.exec.failure_rate > 0.0 && self.rng.random::<f64>() < self.exec.failure_rate
    }

    /// Size actually filled for an intended entry of `intended`, modelling
    /// partial fills. Draws in `[0.5, 1.0)` of the intended size when the
    /// partial branch triggers.
    pub fn entry_fill_size(&mut self, intended: SizeFraction) -> SizeFraction {
        if self.exec.partial_fill_rate > 0.0
            && self.rng.random::<f64>() < self.exec.partial_fill_rate
        {
            let fraction = self.rng.random_range(0.5..1.0);
            SizeFraction(intended.0 * fraction)
        } else {
            intended
        }
    }

    fn draw_latency(&mut self) -> f64 {
        match self.exec.latency.distribution {
            LatencyDistribution::Fixed => self.exec.latency.mean_ms,
            LatencyDistribution::Normal => {
                // Box-Muller with a fixed pair of draws; clamped at zero.
                let u1: f64 = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
                let u2: f64 = self.rng.random();
                let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
                (self.exec.latency.mean_ms + z * self.exec.latency.stddev_ms).max(0.0)
            }
        }
    }

    fn draw_priority_fee(&mut self) -> f64 {
        let range = self.costs.priority_fee_range;
        if range.max > range.min {
            self.rng.random_range(range.min..range.max)
        } else {
            range.min
        }
    }

    fn slippage_fraction(&self, volume_z: Option<f64>) -> f64 {
        let z = volume_z.unwrap_or(0.0);
        // Thin volume is adverse; deep volume never pays negative slippage.
        let scaled = self.exec.slippage.base + self.exec.slippage.volume_factor * (-z).max(0.0);
        scaled.max(self.exec.slippage.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::strategy::{LatencyModel, PriorityFeeRange, SlippageModel};

    fn exec_with_slippage(base: f64, volume_factor: f64) -> ExecutionModel {
        ExecutionModel {
            latency: LatencyModel {
                mean_ms: 50.0,
                stddev_ms: 10.0,
                distribution: LatencyDistribution::Normal,
            },
            slippage: SlippageModel {
                base,
                volume_factor,
            },
            failure_rate: 0.0,
            partial_fill_rate: 0.0,
            seed_nonce: 0,
        }
    }

    #[test]
    fn sub_seed_is_stable_and_alert_dependent() {
        let a = SubSeed::derive(42, AlertId(1), 0);
        let b = SubSeed::derive(42, AlertId(1), 0);
        let c = SubSeed::derive(42, AlertId(2), 0);
        let d = SubSeed::derive(43, AlertId(1), 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn identical_seeds_give_identical_fill_streams() {
        let seed = SubSeed::derive(7, AlertId(11), 3);
        let costs = CostModel {
            base_fee: 0.001,
            priority_fee_range: PriorityFeeRange {
                min: 0.0001,
                max: 0.002,
            },
            trading_fee_pct: 0.01,
        };
        let mut a = FillEngine::new(exec_with_slippage(0.001, 0.002), costs.clone(), seed);
        let mut b = FillEngine::new(exec_with_slippage(0.001, 0.002), costs, seed);

        for i in 0..20 {
            let price = Price(1.0 + i as f64 * 0.01);
            let fa = a.fill(price, SizeFraction(0.5), FillSide::Sell, Some(-0.5));
            let fb = b.fill(price, SizeFraction(0.5), FillSide::Sell, Some(-0.5));
            assert_eq!(fa, fb);
        }
    }

    #[test]
    fn buy_slips_up_and_sell_slips_down() {
        let seed = SubSeed::derive(1, AlertId(1), 0);
        let mut engine = FillEngine::new(
            exec_with_slippage(0.01, 0.0),
            CostModel::free(),
            seed,
        );
        let buy = engine.fill(Price(1.0), SizeFraction(1.0), FillSide::Buy, None);
        let sell = engine.fill(Price(1.0), SizeFraction(1.0), FillSide::Sell, None);
        assert!(buy.price.0 > 1.0);
        assert!(sell.price.0 < 1.0);
    }

    #[test]
    fn thin_volume_widens_slippage() {
        let seed = SubSeed::derive(1, AlertId(1), 0);
        let mut engine = FillEngine::new(
            exec_with_slippage(0.001, 0.01),
            CostModel::free(),
            seed,
        );
        let deep = engine.fill(Price(1.0), SizeFraction(1.0), FillSide::Buy, Some(2.0));
        let thin = engine.fill(Price(1.0), SizeFraction(1.0), FillSide::Buy, Some(-2.0));
        assert!(thin.price.0 > deep.price.0);
        // Deep volume still pays at least base slippage.
        assert!(deep.price.0 >= 1.0 + 0.001 - 1e-12);
    }

    #[test]
    fn frictionless_model_fills_at_trigger() {
        let seed = SubSeed::derive(9, AlertId(4), 0);
        let mut engine = FillEngine::new(ExecutionModel::frictionless(), CostModel::free(), seed);
        let fill = engine.fill(Price(0.9), SizeFraction(1.0), FillSide::Sell, Some(-3.0));
        assert_eq!(fill.price, Price(0.9));
        assert_eq!(fill.fees, 0.0);
    }

    #[test]
    fn fee_math_matches_schedule() {
        let seed = SubSeed::derive(1, AlertId(1), 0);
        let costs = CostModel {
            base_fee: 0.005,
            priority_fee_range: PriorityFeeRange { min: 0.0, max: 0.0 },
            trading_fee_pct: 0.01,
        };
        let mut engine = FillEngine::new(ExecutionModel::frictionless(), costs, seed);
        let fill = engine.fill(Price(2.0), SizeFraction(0.5), FillSide::Sell, None);
        // 1% of notional (2.0 * 0.5) + base fee.
        assert!((fill.fees - (0.01 + 0.005)).abs() < 1e-12);
    }
}
