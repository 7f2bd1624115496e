//! Per-consumer order-book aggregation.
//!
//! [`OrderAggregator`] is the pure state machine: it keeps the consumer's own
//! working orders and the last venue ladder and recomputes the merged,
//! depth-limited view on every change. [`AggregatorHandle`] wires one to the
//! multiplexers and runs it as a task fed by an unbounded queue.

use std::sync::Arc;

use itertools::{EitherOrBoth, Itertools};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::AggregatorConfig;
use crate::engine::book::OwnBook;
use crate::engine::types::{Instrument, Order, PriceLevel, QuoteRow};
use crate::market_data::external_book::ExternalBook;
use crate::market_data::normaliser::{format_percentage, normalise_venue, round_to, Normaliser, UNAVAILABLE};
use crate::market_data::unified_book::{merge, MergeOptions};
use crate::mux::error::{BindError, MuxResult};
use crate::mux::types::{Capability, Consumer, ConsumerId, DataKind, Datum};
use crate::mux::Multiplexer;

/// Field the book multiplexer writes ladders into.
pub const BOOK_FIELD: &str = "orderbook";
/// Field the orders multiplexer writes own-order updates into.
pub const ORDER_FIELD: &str = "currentOrder";

/// What the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LadderView {
    pub rows: Vec<QuoteRow>,
    pub spread: String,
    /// Largest volume among the rendered levels
    pub max_volume: f64,
}

impl Default for LadderView {
    fn default() -> Self {
        Self { rows: Vec::new(), spread: UNAVAILABLE.to_string(), max_volume: 0.0 }
    }
}

impl LadderView {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Width of a level's volume bar in percent of the largest one.
    pub fn volume_percentage(&self, volume: f64) -> f64 {
        volume_percentage(volume, self.max_volume)
    }
}

pub fn volume_percentage(volume: f64, max_volume: f64) -> f64 {
    if volume > 0.0 && max_volume > 0.0 {
        round_to(volume * 100.0 / max_volume, 2)
    } else {
        0.0
    }
}

/// Receives every recomputed ladder.
pub trait LadderSink: Send + Sync {
    fn publish(&self, view: &LadderView);
}

#[derive(Debug, Clone)]
pub struct OrderAggregator {
    config: AggregatorConfig,
    instrument: Option<Instrument>,
    own: OwnBook,
    last_book: Option<ExternalBook>,
    multi_venue: bool,
    venue_marker: String,
}

impl OrderAggregator {
    pub fn new(config: AggregatorConfig, instrument: Option<Instrument>, multi_venue: bool, venue_marker: impl Into<String>) -> Self {
        Self {
            config,
            instrument,
            own: OwnBook::new(),
            last_book: None,
            multi_venue,
            venue_marker: venue_marker.into(),
        }
    }

    pub fn instrument(&self) -> Option<&Instrument> {
        self.instrument.as_ref()
    }

    pub fn own_orders(&self) -> &OwnBook {
        &self.own
    }

    fn is_current(&self, order: &Order) -> bool {
        match (&self.instrument, order.symbol.as_deref()) {
            (Some(ins), Some(symbol)) => ins.symbol == symbol,
            _ => false,
        }
    }

    /// Track an own-order update. Returns a fresh view when the update
    /// changed an order on the current instrument.
    pub fn order_changed(&mut self, order: &Order) -> Option<LadderView> {
        let changed = self.own.apply(order);
        (changed && self.is_current(order)).then(|| self.recompute())
    }

    /// Accept a value from the book field. `Empty` clears the ladder; any
    /// other non-book value is discarded. Levels may arrive in any order.
    pub fn book_changed(&mut self, datum: Datum) -> Option<LadderView> {
        match datum {
            Datum::OrderBook(mut book) => {
                book.sort();
                self.last_book = Some(book);
            }
            Datum::Empty => self.last_book = None,
            other => {
                warn!(?other, "Discarding malformed book update");
                return None;
            }
        }
        Some(self.recompute())
    }

    /// Switch to `new`. The ladder and own orders of the instrument left are
    /// dropped and an empty view is returned.
    pub fn instrument_changed(&mut self, new: Option<Instrument>) -> LadderView {
        if let Some(old) = self.instrument.take() {
            let dropped = self.own.clear_symbol(&old.symbol);
            debug!(old = %old.symbol, dropped, "Cleared own orders of previous instrument");
        }
        self.last_book = None;
        self.instrument = new;
        LadderView::empty()
    }

    #[instrument(level = "trace", skip(self), fields(symbol = self.instrument.as_ref().map(|i| i.symbol.as_str())))]
    pub fn recompute(&self) -> LadderView {
        let (own_bids, own_asks) = match &self.instrument {
            Some(ins) => self.own.levels(&ins.symbol),
            None => Default::default(),
        };
        let empty = ExternalBook::new();
        let raw = self.last_book.as_ref().unwrap_or(&empty);
        let merged = merge(raw, &own_bids, &own_asks, MergeOptions { multi_venue: self.multi_venue, venue_marker: &self.venue_marker });

        let normaliser = Normaliser::for_instrument(self.instrument.as_ref());
        let spread = self.spread(&merged, &normaliser);

        let depth = merged.bids.len().max(merged.asks.len()).min(self.config.depth);
        let mut rows = Vec::with_capacity(depth);
        let mut max_volume = 0.0_f64;
        for pair in merged.bids.iter().zip_longest(merged.asks.iter()).take(depth) {
            let (bid, ask) = match pair {
                EitherOrBoth::Both(bid, ask) => (Some(self.render(bid)), Some(self.render(ask))),
                EitherOrBoth::Left(bid) => (Some(self.render(bid)), None),
                EitherOrBoth::Right(ask) => (None, Some(self.render(ask))),
            };
            for level in bid.iter().chain(ask.iter()) {
                max_volume = max_volume.max(level.volume);
            }
            rows.push(QuoteRow { bid, ask });
        }

        trace!(depth, max_volume, %spread, "Ladder recomputed");
        LadderView { rows, spread, max_volume }
    }

    fn spread(&self, book: &ExternalBook, normaliser: &Normaliser) -> String {
        match book.bbo() {
            (Some(bid), Some(ask)) => {
                let spread = ask.price - bid.price;
                let percent = if bid.price == 0.0 {
                    UNAVAILABLE.to_string()
                } else {
                    format_percentage(spread / bid.price, self.config.percentage_precision)
                };
                format!("{} ({})", normaliser.format_price(spread), percent)
            }
            _ => UNAVAILABLE.to_string(),
        }
    }

    fn render(&self, level: &PriceLevel) -> PriceLevel {
        let mut level = level.clone();
        if self.config.venue_normalization {
            level.venue = level.venue.map(|v| normalise_venue(&v).to_string());
        }
        level
    }
}

#[derive(Debug)]
enum AggregatorEvent {
    Book(Datum),
    Order(Datum),
    InstrumentChanged(Option<Instrument>),
    Close,
}

/// The multiplexer-facing side of an aggregator: it only enqueues.
///
/// An instrument switch is queued at the point where the book multiplexer
/// resets the book field, so ladders pushed for the old key before the
/// rebind are never shown under the new instrument.
struct Inbox {
    id: ConsumerId,
    instrument: RwLock<Option<Instrument>>,
    switching: Mutex<Option<Option<Instrument>>>,
    tx: mpsc::UnboundedSender<AggregatorEvent>,
}

impl Inbox {
    fn new(instrument: Option<Instrument>, tx: mpsc::UnboundedSender<AggregatorEvent>) -> Self {
        Self { id: ConsumerId::next(), instrument: RwLock::new(instrument), switching: Mutex::new(None), tx }
    }

    fn enqueue(&self, event: AggregatorEvent) {
        if self.tx.send(event).is_err() {
            trace!(consumer = %self.id, "Aggregator already stopped");
        }
    }

    /// Point key resolution at `new` and hold its queue event until the
    /// reset. Returns the instrument left.
    fn begin_switch(&self, new: Option<Instrument>) -> Option<Instrument> {
        let mut current = self.instrument.write();
        *self.switching.lock() = Some(new.clone());
        std::mem::replace(&mut *current, new)
    }

    fn flush_switch(&self) {
        if let Some(instrument) = self.switching.lock().take() {
            self.enqueue(AggregatorEvent::InstrumentChanged(instrument));
        }
    }
}

impl Consumer for Inbox {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn instrument(&self) -> Option<Instrument> {
        self.instrument.read().clone()
    }

    fn set(&self, field: &str, value: Datum) {
        let event = match field {
            BOOK_FIELD => {
                // Empty is the multiplexer's reset marker
                if matches!(value, Datum::Empty) {
                    self.flush_switch();
                }
                AggregatorEvent::Book(value)
            }
            ORDER_FIELD => AggregatorEvent::Order(value),
            other => {
                warn!(consumer = %self.id, field = other, "Value for unknown field dropped");
                return;
            }
        };
        self.enqueue(event);
    }
}

/// A running aggregator bound to a book multiplexer and, optionally, an
/// orders multiplexer.
pub struct AggregatorHandle {
    inbox: Arc<Inbox>,
    book_mux: Arc<Multiplexer>,
    orders_mux: Option<Arc<Multiplexer>>,
    task: JoinHandle<()>,
}

impl AggregatorHandle {
    /// Check capabilities, start the aggregator task and subscribe its
    /// fields. Multi-venue display silently falls back to annotated levels
    /// when the book source does not report venues.
    #[instrument(skip_all, fields(book = book_mux.name(), symbol = instrument.as_ref().map(|i| i.symbol.as_str())))]
    pub async fn bind(
        book_mux: Arc<Multiplexer>,
        orders_mux: Option<Arc<Multiplexer>>,
        config: AggregatorConfig,
        instrument: Option<Instrument>,
        sink: Arc<dyn LadderSink>,
    ) -> Result<Self, BindError> {
        config.validate()?;
        if !book_mux.has_cap(Capability::OrderBook) {
            return Err(BindError::MissingCapability(Capability::OrderBook));
        }
        if let Some(orders) = &orders_mux {
            if !orders.has_cap(Capability::ActiveOrders) {
                return Err(BindError::MissingCapability(Capability::ActiveOrders));
            }
        }

        let multi_venue = config.multi_venue_display && book_mux.has_cap(Capability::MultiVenue);
        if config.multi_venue_display && !multi_venue {
            warn!("Book source has no venue pools, showing own size on venue levels");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Arc::new(Inbox::new(instrument.clone(), tx));
        let aggregator = OrderAggregator::new(config, instrument, multi_venue, book_mux.venue_marker());
        let task = tokio::spawn(run(aggregator, rx, sink));

        let handle = Self { inbox, book_mux, orders_mux, task };
        if let Err(err) = handle.subscribe().await {
            handle.close().await;
            return Err(err.into());
        }
        info!(consumer = %handle.id(), "Aggregator bound");
        Ok(handle)
    }

    fn consumer(&self) -> Arc<dyn Consumer> {
        self.inbox.clone()
    }

    async fn subscribe(&self) -> MuxResult<()> {
        let consumer = self.consumer();
        self.book_mux.subscribe_field(&consumer, BOOK_FIELD, DataKind::OrderBook).await?;
        if let Some(orders) = &self.orders_mux {
            orders.subscribe_field(&consumer, ORDER_FIELD, DataKind::CurrentOrder).await?;
        }
        Ok(())
    }

    pub fn id(&self) -> ConsumerId {
        self.inbox.id
    }

    pub fn instrument(&self) -> Option<Instrument> {
        self.inbox.instrument()
    }

    /// Show `new` instead of the current instrument.
    pub async fn change_instrument(&self, new: Option<Instrument>) -> MuxResult<()> {
        let old = self.inbox.begin_switch(new.clone());
        let rebound = self.book_mux.instrument_changed(&self.consumer(), old.as_ref(), new.as_ref()).await;
        // No book field was reset
        self.inbox.flush_switch();
        rebound
    }

    /// Unsubscribe everything and wait for the task to drain.
    pub async fn close(self) {
        let id = self.id();
        self.book_mux.unsubscribe_field(id, BOOK_FIELD, DataKind::OrderBook).await;
        if let Some(orders) = &self.orders_mux {
            orders.unsubscribe_field(id, ORDER_FIELD, DataKind::CurrentOrder).await;
        }
        self.inbox.enqueue(AggregatorEvent::Close);
        if let Err(err) = self.task.await {
            warn!(consumer = %id, error = %err, "Aggregator task ended abnormally");
        }
    }
}

async fn run(mut aggregator: OrderAggregator, mut rx: mpsc::UnboundedReceiver<AggregatorEvent>, sink: Arc<dyn LadderSink>) {
    sink.publish(&aggregator.recompute());

    while let Some(event) = rx.recv().await {
        let view = match event {
            AggregatorEvent::Book(datum) => aggregator.book_changed(datum),
            AggregatorEvent::Order(Datum::Order(order)) => aggregator.order_changed(&order),
            // Reset placeholder after an instrument change
            AggregatorEvent::Order(Datum::Empty) => None,
            AggregatorEvent::Order(other) => {
                warn!(?other, "Discarding malformed order update");
                None
            }
            AggregatorEvent::InstrumentChanged(instrument) => Some(aggregator.instrument_changed(instrument)),
            AggregatorEvent::Close => break,
        };
        if let Some(view) = view {
            sink.publish(&view);
        }
    }
    debug!("Aggregator stopped");
}
