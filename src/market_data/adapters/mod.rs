// Shared trait + event for upstream venue connectors

use crate::mux::error::ConnectError;
use crate::mux::types::{DataKind, Datum, ReferenceKey, UpstreamHandle};

#[derive(Debug, Clone)]
pub enum MarketEvent {
    // New value for every field bound to `key` under `kind`
    Push {
        kind: DataKind,
        key: ReferenceKey,
        datum: Datum,
    },
}

/// Opens and closes upstream feeds on behalf of a multiplexer.
///
/// The multiplexer calls `activate` exactly once when a key gains its first
/// holder and `deactivate` exactly once when it loses its last. Data flows
/// back as [`MarketEvent`]s on whatever channel the connector was built with.
#[async_trait::async_trait]
pub trait VenueAdapter: Send + Sync {
    async fn activate(&self, kind: DataKind, key: &ReferenceKey) -> Result<UpstreamHandle, ConnectError>;

    async fn deactivate(&self, kind: DataKind, key: &ReferenceKey, handle: UpstreamHandle) -> Result<(), ConnectError>;
}

pub mod simulated;
