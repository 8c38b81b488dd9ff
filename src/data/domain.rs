use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoStaticStr};

use crate::{
    error::{MintlabError, ValidationError},
    impl_abs_primitive, impl_add_sub_mul_div_primitive, impl_from_primitive, impl_neg_primitive,
};

// ================================================================================================
// Domain Strong Types (NewTypes)
// ================================================================================================

/// Represents a price level in the quote currency.
///
/// Used for: Open, High, Low, Close, entry/exit fills, stops, and targets.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Price(pub f64);
impl_from_primitive!(Price, f64);
impl_add_sub_mul_div_primitive!(Price, f64);
impl_neg_primitive!(Price, f64);
impl_abs_primitive!(Price, f64);

impl Price {
    pub fn is_finite(&self) -> bool {
        self.0.is_finite()
    }
}

/// Represents traded base-asset volume over one candle interval.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Volume(pub f64);
impl_from_primitive!(Volume, f64);
impl_add_sub_mul_div_primitive!(Volume, f64);

/// A fraction of the original position, in `[0, 1]`.
///
/// Target ladder sizes and re-entry sizes are expressed in this unit so that
/// "sum of executed exit sizes ≤ 1.0" is checkable without knowing notional.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct SizeFraction(pub f64);
impl_from_primitive!(SizeFraction, f64);
impl_add_sub_mul_div_primitive!(SizeFraction, f64);

/// Market capitalisation in quote currency.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Mcap(pub f64);
impl_from_primitive!(Mcap, f64);
impl_add_sub_mul_div_primitive!(Mcap, f64);

/// Monotonic per-`(run, alert)` event sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Seq(pub u32);
impl_from_primitive!(Seq, u32);

impl Seq {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Identifier of an alert row in the relational store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct AlertId(pub u64);
impl_from_primitive!(AlertId, u64);

/// Identifier of a caller row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CallerId(pub u64);
impl_from_primitive!(CallerId, u64);

/// Identifier of a token row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TokenId(pub u64);
impl_from_primitive!(TokenId, u64);

/// Identifier of one simulation run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct RunId(pub u64);
impl_from_primitive!(RunId, u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{:08}", self.0)
    }
}

// ================================================================================================
// Chain
// ================================================================================================

/// The chain a token lives on.
///
/// Serialises as `solana` or `evm:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Solana,
    Evm(u32),
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Solana => f.write_str("solana"),
            Chain::Evm(id) => write!(f, "evm:{id}"),
        }
    }
}

impl FromStr for Chain {
    type Err = MintlabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "solana" {
            return Ok(Chain::Solana);
        }
        if let Some(id) = s.strip_prefix("evm:") {
            let id = id
                .parse::<u32>()
                .map_err(|_| ValidationError::InvalidChain(s.to_string()))?;
            return Ok(Chain::Evm(id));
        }
        Err(ValidationError::InvalidChain(s.to_string()).into())
    }
}

impl Serialize for Chain {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Chain {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ================================================================================================
// Mint Address
// ================================================================================================

/// A case-sensitive token mint address (32-44 characters).
///
/// The stored string is byte-exact for the lifetime of the value: it is never
/// truncated and never case-folded at any layer (cache key, storage row, API
/// call, artifact). Where a lookup needs a case-insensitive index, use
/// [`MintAddress::index_key`]; the stored address itself stays untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MintAddress(String);

impl MintAddress {
    pub fn new(address: impl Into<String>) -> Result<Self, MintlabError> {
        let address = address.into();
        let len = address.len();
        if !(32..=44).contains(&len) || !address.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ValidationError::InvalidMintAddress(address).into());
        }
        Ok(Self(address))
    }

    /// The exact-case address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Normalised key for canonical-index lookups only. The address itself
    /// is never stored in this form.
    pub fn index_key(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// True when the address carries a known launchpad suffix with a fixed
    /// 10^9 token supply (`pump`, `bonk`).
    pub fn has_fixed_supply_suffix(&self) -> bool {
        self.0.ends_with("pump") || self.0.ends_with("bonk")
    }
}

impl fmt::Display for MintAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ================================================================================================
// Interval & Time Range
// ================================================================================================

/// Candle interval in seconds. Always strictly positive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Interval(i64);

impl Interval {
    pub const M1: Interval = Interval(60);
    pub const M5: Interval = Interval(300);
    pub const M15: Interval = Interval(900);
    pub const H1: Interval = Interval(3_600);

    pub fn new(seconds: i64) -> Result<Self, MintlabError> {
        if seconds <= 0 {
            return Err(ValidationError::InvalidInterval(seconds).into());
        }
        Ok(Self(seconds))
    }

    pub fn seconds(&self) -> i64 {
        self.0
    }

    /// Floors a unix timestamp to this interval's boundary.
    pub fn floor_ts(&self, ts: i64) -> i64 {
        ts.div_euclid(self.0) * self.0
    }

    pub fn is_aligned(&self, ts: i64) -> bool {
        ts.rem_euclid(self.0) == 0
    }
}

/// A half-open-free inclusive unix-second range `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from_ts: i64,
    pub to_ts: i64,
}

impl TimeRange {
    pub fn new(from_ts: i64, to_ts: i64) -> Result<Self, MintlabError> {
        if from_ts > to_ts {
            return Err(ValidationError::InvalidTimeRange {
                from: from_ts,
                to: to_ts,
            }
            .into());
        }
        Ok(Self { from_ts, to_ts })
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.from_ts <= ts && ts <= self.to_ts
    }

    /// Expected candle timestamps at `interval` within this range.
    pub fn aligned_timestamps(&self, interval: Interval) -> impl Iterator<Item = i64> {
        let first = interval.floor_ts(self.from_ts + interval.seconds() - 1);
        let step = interval.seconds();
        let to = self.to_ts;
        (0i64..)
            .map(move |i| first + i * step)
            .take_while(move |ts| *ts <= to)
    }
}

/// How the hybrid provider reports missing candles inside a requested range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum GapPolicy {
    /// Error with the gap list when the range is not dense.
    Strict,
    /// Return the dense sequence unchanged; the consumer skips gaps.
    BestEffort,
}
