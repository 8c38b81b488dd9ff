use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSeconds};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::data::domain::{AlertId, CallerId, Chain, Mcap, MintAddress, Price};

/// Idempotency key of an alert, drawn from the raw chat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertKey {
    pub chat_id: i64,
    pub message_id: i64,
}

/// A timestamped caller signal naming a token.
///
/// Produced by the external chat-ingestion pipeline; the core only consumes
/// and stores these. Unique on `(chat_id, message_id)`. The timestamp
/// serialises as unix seconds so stored alert rows have one fixed form.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: AlertId,
    pub token_address: MintAddress,
    pub chain: Chain,
    pub caller_id: CallerId,
    #[serde_as(as = "TimestampSeconds<i64>")]
    pub alert_ts: DateTime<Utc>,
    pub alert_price: Option<Price>,
    pub alert_mcap: Option<Mcap>,
    /// Which derivation produced `alert_mcap`, for downstream filtering.
    pub mcap_source: Option<McapSource>,
    pub raw_payload: serde_json::Value,
}

impl Alert {
    pub fn key(&self) -> Option<AlertKey> {
        let chat_id = self.raw_payload.get("chat_id")?.as_i64()?;
        let message_id = self.raw_payload.get("message_id")?.as_i64()?;
        Some(AlertKey {
            chat_id,
            message_id,
        })
    }

    pub fn alert_ts_unix(&self) -> i64 {
        self.alert_ts.timestamp()
    }
}

/// Where a market-cap figure came from, in fallback-chain order.
///
/// `AssumedSupply` entries rely on the constant 10^9 launchpad supply and
/// should be filterable downstream when supply schemas drift.
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
pub enum McapSource {
    /// `price * 10^9` for pump/bonk-suffixed mints.
    AssumedSupply,
    /// Supply from the market-data API's token metadata.
    ApiMetadata,
    /// Regex extraction from the chat payload.
    PayloadRegex,
    /// Back-inference from current price and current mcap.
    Inferred,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mint() -> MintAddress {
        MintAddress::new("7sKqqFEiB84nXkPJhmKrAHHDjrr2XPcWcfmBGqNapump").unwrap()
    }

    #[test]
    fn alert_key_comes_from_raw_payload() {
        let alert = Alert {
            alert_id: AlertId(1),
            token_address: mint(),
            chain: Chain::Solana,
            caller_id: CallerId(7),
            alert_ts: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            alert_price: Some(Price(0.0021)),
            alert_mcap: None,
            mcap_source: None,
            raw_payload: json!({"chat_id": -100123, "message_id": 42, "text": "ape this"}),
        };

        assert_eq!(
            alert.key(),
            Some(AlertKey {
                chat_id: -100123,
                message_id: 42
            })
        );
    }

    #[test]
    fn alert_without_payload_ids_has_no_key() {
        let alert = Alert {
            alert_id: AlertId(1),
            token_address: mint(),
            chain: Chain::Solana,
            caller_id: CallerId(7),
            alert_ts: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            alert_price: None,
            alert_mcap: None,
            mcap_source: None,
            raw_payload: json!({"text": "no ids"}),
        };
        assert_eq!(alert.key(), None);
    }

    #[test]
    fn mcap_source_serialises_snake_case() {
        assert_eq!(McapSource::AssumedSupply.to_string(), "assumed_supply");
        assert_eq!(
            "payload_regex".parse::<McapSource>().unwrap(),
            McapSource::PayloadRegex
        );
    }
}
