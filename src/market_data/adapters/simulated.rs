// Simulated venue: every activation spawns a task producing random-walk data
// for its key until deactivated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::{MarketEvent, VenueAdapter};
use crate::engine::types::{Order, OrderStatus, OrderType, Position, PriceLevel, Side};
use crate::market_data::external_book::ExternalBook;
use crate::market_data::normaliser::round_to;
use crate::mux::error::ConnectError;
use crate::mux::types::{DataKind, Datum, ReferenceKey, UpstreamHandle};

const LEVELS_PER_SIDE: usize = 10;
const POOLS: [&str; 4] = ["PA", "Q", "SPBX", "V"];

#[derive(Debug, Clone)]
struct Listing {
    symbol: String,
    mid: f64,
}

pub struct SimulatedVenue {
    tx: mpsc::Sender<MarketEvent>,
    tick: Duration,
    listings: HashMap<String, Listing>,
    feeds: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_handle: AtomicU64,
    failing: AtomicBool,
}

impl SimulatedVenue {
    pub fn new(tx: mpsc::Sender<MarketEvent>, tick: Duration) -> Self {
        Self {
            tx,
            tick,
            listings: HashMap::new(),
            feeds: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            failing: AtomicBool::new(false),
        }
    }

    /// Quote `instrument_id` (traded as `symbol`) around `mid`.
    pub fn with_listing(mut self, instrument_id: &str, symbol: &str, mid: f64) -> Self {
        self.listings.insert(instrument_id.to_string(), Listing { symbol: symbol.to_string(), mid });
        self
    }

    /// Make every following activation fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn live_feeds(&self) -> usize {
        self.feeds.lock().len()
    }

    fn walk_for(&self, kind: DataKind, key: &ReferenceKey) -> Result<Walk, ConnectError> {
        let listings = || self.listings.values().cloned().collect::<Vec<_>>();
        match key {
            ReferenceKey::Instrument(id) => {
                let listing = self
                    .listings
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ConnectError::new(format!("instrument {id} is not listed")))?;
                Ok(Walk::new(kind, key.clone(), vec![listing]))
            }
            ReferenceKey::Global(_) => Ok(Walk::new(kind, key.clone(), listings())),
        }
    }
}

#[async_trait::async_trait]
impl VenueAdapter for SimulatedVenue {
    async fn activate(&self, kind: DataKind, key: &ReferenceKey) -> Result<UpstreamHandle, ConnectError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectError::new("simulated venue rejected the subscription"));
        }
        let mut walk = self.walk_for(kind, key)?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let tick = self.tick;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let Some(datum) = walk.step() else { continue };
                let event = MarketEvent::Push { kind: walk.kind, key: walk.key.clone(), datum };
                if tx.send(event).await.is_err() {
                    debug!(key = %walk.key, "Event channel closed, feed stopping");
                    break;
                }
            }
        });
        self.feeds.lock().insert(handle, task);

        info!(%kind, %key, handle, "Simulated feed started");
        Ok(UpstreamHandle(handle))
    }

    async fn deactivate(&self, kind: DataKind, key: &ReferenceKey, handle: UpstreamHandle) -> Result<(), ConnectError> {
        let task = self
            .feeds
            .lock()
            .remove(&handle.0)
            .ok_or_else(|| ConnectError::new(format!("no feed with handle {}", handle.0)))?;
        task.abort();
        info!(%kind, %key, handle = handle.0, "Simulated feed stopped");
        Ok(())
    }
}

/// State of one running feed.
struct Walk {
    kind: DataKind,
    key: ReferenceKey,
    listings: Vec<Listing>,
    rng: StdRng,
    sequence: u64,
}

impl Walk {
    fn new(kind: DataKind, key: ReferenceKey, listings: Vec<Listing>) -> Self {
        Self { kind, key, listings, rng: StdRng::from_entropy(), sequence: 0 }
    }

    fn step(&mut self) -> Option<Datum> {
        self.sequence += 1;
        if self.listings.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.listings.len());
        let drift = self.rng.gen_range(-0.05..=0.05);
        let listing = &mut self.listings[index];
        listing.mid = round_to((listing.mid + drift).max(0.01), 2);
        let listing = listing.clone();
        trace!(key = %self.key, mid = listing.mid, "Walk step");

        let datum = match self.kind {
            DataKind::OrderBook => Datum::OrderBook(self.book(listing.mid)),
            DataKind::LastPrice => Datum::Number(listing.mid),
            DataKind::CurrentOrder => Datum::Order(self.order(&listing)),
            DataKind::Position => Datum::Position(self.position(&listing)),
            DataKind::PositionSize => Datum::Number(self.position(&listing).size),
            DataKind::PositionAverage => Datum::Number(self.position(&listing).average),
            DataKind::TimelineItem => Datum::Timeline(serde_json::json!({
                "sequence": self.sequence,
                "symbol": listing.symbol,
                "price": listing.mid,
            })),
        };
        Some(datum)
    }

    fn book(&mut self, mid: f64) -> ExternalBook {
        let level = |price: f64, rng: &mut StdRng| {
            let pool = POOLS[rng.gen_range(0..POOLS.len())];
            PriceLevel::new(round_to(price, 2), rng.gen_range(1..=50) as f64).with_venue(pool)
        };
        let bids = (1..=LEVELS_PER_SIDE).map(|i| level(mid - 0.01 * i as f64, &mut self.rng)).collect();
        let asks = (1..=LEVELS_PER_SIDE).map(|i| level(mid + 0.01 * i as f64, &mut self.rng)).collect();
        ExternalBook::from_levels(bids, asks)
    }

    fn order(&mut self, listing: &Listing) -> Order {
        let side = if self.rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        let offset = 0.01 * self.rng.gen_range(1..=5) as f64;
        let price = match side {
            Side::Buy => listing.mid - offset,
            Side::Sell => listing.mid + offset,
        };
        let status = match self.rng.gen_range(0..10) {
            0 => OrderStatus::Canceled,
            1 => OrderStatus::Filled,
            _ => OrderStatus::Working,
        };
        Order {
            order_id: Some(format!("sim-{}", self.rng.gen_range(1..=6))),
            symbol: Some(listing.symbol.clone()),
            side,
            order_type: OrderType::Limit,
            price: round_to(price, 2),
            quantity: self.rng.gen_range(1..=20) as f64,
            filled: 0.0,
            status,
        }
    }

    fn position(&mut self, listing: &Listing) -> Position {
        Position {
            symbol: listing.symbol.clone(),
            size: self.rng.gen_range(-100..=100) as f64,
            average: listing.mid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue(tx: mpsc::Sender<MarketEvent>) -> SimulatedVenue {
        SimulatedVenue::new(tx, Duration::from_millis(5)).with_listing("sber-id", "SBER", 250.0)
    }

    #[tokio::test]
    async fn test_book_feed_pushes_sorted_ladders() {
        let (tx, mut rx) = mpsc::channel(16);
        let venue = venue(tx);
        let key = ReferenceKey::Instrument("sber-id".into());

        let handle = venue.activate(DataKind::OrderBook, &key).await.unwrap();
        let MarketEvent::Push { kind, key: pushed, datum } = rx.recv().await.unwrap();
        assert_eq!(kind, DataKind::OrderBook);
        assert_eq!(pushed, key);
        let Datum::OrderBook(book) = datum else { panic!("expected a ladder") };
        assert_eq!(book.bids.len(), LEVELS_PER_SIDE);
        assert!(book.bids.windows(2).all(|w| w[0].price >= w[1].price));
        assert!(book.asks.windows(2).all(|w| w[0].price <= w[1].price));

        venue.deactivate(DataKind::OrderBook, &key, handle).await.unwrap();
        assert_eq!(venue.live_feeds(), 0);
        assert!(venue.deactivate(DataKind::OrderBook, &key, handle).await.is_err());
    }

    #[tokio::test]
    async fn test_orders_feed_reports_listed_symbols() {
        let (tx, mut rx) = mpsc::channel(16);
        let venue = venue(tx);
        let key = ReferenceKey::Global("ORDERS");

        venue.activate(DataKind::CurrentOrder, &key).await.unwrap();
        let MarketEvent::Push { datum, .. } = rx.recv().await.unwrap();
        let Datum::Order(order) = datum else { panic!("expected an order") };
        assert_eq!(order.symbol.as_deref(), Some("SBER"));
        assert_eq!(order.order_type, OrderType::Limit);
    }

    #[tokio::test]
    async fn test_unlisted_and_failing_activations() {
        let (tx, _rx) = mpsc::channel(16);
        let venue = venue(tx);
        let unknown = ReferenceKey::Instrument("nope".into());
        assert!(venue.activate(DataKind::OrderBook, &unknown).await.is_err());

        venue.set_failing(true);
        let key = ReferenceKey::Instrument("sber-id".into());
        assert!(venue.activate(DataKind::OrderBook, &key).await.is_err());
        assert_eq!(venue.live_feeds(), 0);
    }
}
