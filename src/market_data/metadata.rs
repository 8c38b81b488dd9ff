use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::{
    data::{
        alert::McapSource,
        domain::{Mcap, MintAddress, Price},
    },
    market_data::client::{metadata_mcap, TokenMetadata},
};

/// Assumed launchpad supply for `pump`/`bonk`-suffixed mints.
///
/// When a token's supply schema changes upstream this constant silently
/// misprices; every mcap derived from it is tagged
/// [`McapSource::AssumedSupply`] so downstream analyses can filter.
pub const LAUNCHPAD_SUPPLY: f64 = 1e9;

/// Inputs available when deriving an alert's market cap.
#[derive(Debug, Default)]
pub struct McapInputs<'a> {
    pub alert_price: Option<Price>,
    pub payload: Option<&'a Value>,
    pub metadata: Option<&'a TokenMetadata>,
    /// Live reference pair for last-resort inference.
    pub current_price: Option<Price>,
    pub current_mcap: Option<Mcap>,
}

/// Derives market cap via the fixed fallback chain:
/// pump/bonk supply math, API metadata, chat-payload regex, inference from
/// the current price/mcap pair, then `None`. The chain never guesses: each
/// rung either produces a tagged value or defers to the next.
pub struct McapResolver {
    payload_mcap: Regex,
}

impl Default for McapResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl McapResolver {
    pub fn new() -> Self {
        Self {
            // "MC: $45.3K", "mcap 1.2m", "market cap: 950k"
            payload_mcap: Regex::new(
                r"(?i)(?:market\s*cap|mcap|mc)[:\s$]*([0-9][0-9.,]*)\s*([kmb])?",
            )
            .expect("static regex"),
        }
    }

    pub fn resolve(&self, mint: &MintAddress, inputs: &McapInputs<'_>) -> Option<(Mcap, McapSource)> {
        // 1. Known launchpad supply: no API call needed.
        if mint.has_fixed_supply_suffix()
            && let Some(price) = inputs.alert_price
        {
            return Some((Mcap(price.0 * LAUNCHPAD_SUPPLY), McapSource::AssumedSupply));
        }

        // 2. Vendor metadata.
        if let Some(meta) = inputs.metadata
            && let Some(mcap) = metadata_mcap(meta)
        {
            return Some((mcap, McapSource::ApiMetadata));
        }

        // 3. Regex over the chat payload text.
        if let Some(payload) = inputs.payload
            && let Some(mcap) = self.extract_from_payload(payload)
        {
            return Some((mcap, McapSource::PayloadRegex));
        }

        // 4. Back-inference from the current pair.
        if let (Some(alert_price), Some(current_price), Some(current_mcap)) =
            (inputs.alert_price, inputs.current_price, inputs.current_mcap)
            && current_price.0 > 0.0
        {
            let inferred = alert_price.0 * (current_mcap.0 / current_price.0);
            return Some((Mcap(inferred), McapSource::Inferred));
        }

        // 5. Never a guess.
        debug!(mint = %mint, "no mcap derivable");
        None
    }

    fn extract_from_payload(&self, payload: &Value) -> Option<Mcap> {
        let text = payload.get("text")?.as_str()?;
        let caps = self.payload_mcap.captures(text)?;
        let number: f64 = caps
            .get(1)?
            .as_str()
            .replace(',', "")
            .parse()
            .ok()?;
        let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(s) if s == "k" => 1e3,
            Some(s) if s == "m" => 1e6,
            Some(s) if s == "b" => 1e9,
            _ => 1.0,
        };
        Some(Mcap(number * multiplier))
    }
}
