use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    artifact::store::ArtifactStore,
    market_data::provider::HybridCandleProvider,
    store::{candles::CandleStore, relational::RelationalStore},
};

/// Time source. Handlers never call `Utc::now()` directly; replay tests pin
/// a [`FixedClock`] so run rows and manifests are reproducible.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at a fixed instant.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// The explicit dependency bundle threaded through handlers.
///
/// There are no global singletons: everything a handler touches — clock,
/// artifact store, candle provider, backing stores — arrives here.
/// RNG seeds travel in the experiment definition, not in the ports.
#[derive(Clone)]
pub struct Ports {
    pub clock: Arc<dyn Clock>,
    pub artifacts: Arc<ArtifactStore>,
    pub provider: Arc<HybridCandleProvider>,
    pub candles: Arc<CandleStore>,
    pub relational: Arc<RelationalStore>,
}
