// Router pumps upstream events into the multiplexer that owns the feeds
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::market_data::adapters::MarketEvent;
use crate::mux::Multiplexer;

/// Deliver every event from `rx` until the channel closes. Returns the
/// number of events pumped.
pub async fn run(mux: Arc<Multiplexer>, mut rx: mpsc::Receiver<MarketEvent>) -> u64 {
    info!(mux = mux.name(), "Router started");
    let mut pumped = 0u64;

    while let Some(event) = rx.recv().await {
        match event {
            MarketEvent::Push { kind, key, datum } => {
                let delivered = mux.publish(kind, &key, datum);
                if delivered == 0 {
                    // Feed torn down while the event was in flight
                    debug!(%kind, %key, "Push with no bound fields");
                } else {
                    trace!(%kind, %key, delivered, "Push delivered");
                }
            }
        }
        pumped += 1;
        metrics::counter!("ladderx_pushes_total").increment(1);
    }

    info!(mux = mux.name(), pumped, "Router stopped");
    pumped
}
