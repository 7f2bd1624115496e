// Symbol -> instrument resolution for consumers.

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::types::Instrument;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("instrument source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait InstrumentResolver: Send + Sync {
    /// `Ok(None)` when the symbol is unknown.
    async fn resolve(&self, symbol: &str) -> Result<Option<Instrument>, ResolveError>;
}

/// Resolve `symbol`, falling back to a placeholder that never opens a feed.
pub async fn resolve_or_placeholder(resolver: &dyn InstrumentResolver, symbol: &str) -> Instrument {
    match resolver.resolve(symbol).await {
        Ok(Some(instrument)) => instrument,
        Ok(None) => {
            debug!(symbol, "Unknown symbol, using placeholder");
            Instrument::placeholder(symbol)
        }
        Err(err) => {
            warn!(symbol, error = %err, "Instrument lookup failed, using placeholder");
            Instrument::placeholder(symbol)
        }
    }
}

/// In-memory instrument store keyed by symbol, scoped to one broker and its
/// venues.
///
/// Symbols listed on several venues are stored once per venue as
/// `SYMBOL~VENUE`; the bare symbol holds whichever listing came first.
pub struct InstrumentCache {
    broker: String,
    venues: Vec<String>,
    by_symbol: RwLock<HashMap<String, Instrument>>,
}

impl InstrumentCache {
    pub fn new(broker: impl Into<String>, venues: Vec<String>) -> Self {
        Self { broker: broker.into(), venues, by_symbol: RwLock::new(HashMap::new()) }
    }

    pub fn insert(&self, instrument: Instrument) {
        self.by_symbol.write().insert(instrument.symbol.clone(), instrument);
    }

    pub fn extend(&self, instruments: impl IntoIterator<Item = Instrument>) {
        let mut map = self.by_symbol.write();
        for instrument in instruments {
            map.insert(instrument.symbol.clone(), instrument);
        }
    }

    pub fn len(&self) -> usize {
        self.by_symbol.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.read().is_empty()
    }

    fn compatible(&self, instrument: &Instrument) -> bool {
        instrument.brokers.iter().any(|b| b == &self.broker) && instrument.trades_on_any(&self.venues)
    }

    /// Find the listing usable through this broker.
    ///
    /// Anything after `@` is ignored. An incompatible listing is retried as
    /// `SYMBOL~VENUE`; when that is missing too a placeholder carrying the
    /// suffixed symbol is returned. Unknown symbols yield `None`.
    pub fn lookup(&self, symbol: &str) -> Option<Instrument> {
        let symbol = symbol.split('@').next().unwrap_or(symbol);
        let map = self.by_symbol.read();
        let found = map.get(symbol)?;
        if self.compatible(found) {
            return Some(found.clone());
        }

        let venue = self.venues.first().or_else(|| found.venues.first()).map(String::as_str).unwrap_or_default();
        let suffixed = format!("{symbol}~{venue}");
        match map.get(&suffixed) {
            Some(listing) => Some(listing.clone()),
            None => {
                debug!(symbol = %suffixed, "No listing for this venue");
                Some(Instrument::placeholder(&suffixed))
            }
        }
    }
}

#[async_trait]
impl InstrumentResolver for InstrumentCache {
    async fn resolve(&self, symbol: &str) -> Result<Option<Instrument>, ResolveError> {
        Ok(self.lookup(symbol))
    }
}
