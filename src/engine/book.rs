use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;
use ordered_float::OrderedFloat;
use tracing::{debug, instrument, trace};

use crate::engine::types::{Order, OrderType, Side};

/// Remaining own size per price for one side. Keys iterate ascending, so the
/// bid side is walked in reverse.
pub type OwnLevels = BTreeMap<OrderedFloat<f64>, f64>;

/// The trader's own working limit orders, keyed by order id.
#[derive(Debug, Default, Clone)]
pub struct OwnBook {
    orders: HashMap<String, Order>,
}

impl OwnBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an order-state update. Returns `true` when the map changed.
    ///
    /// Updates without an id and non-limit orders are ignored. An order that
    /// is no longer active is dropped; an active one is inserted or replaced.
    #[instrument(level = "trace", skip(self, order), fields(order_id = ?order.order_id))]
    pub fn apply(&mut self, order: &Order) -> bool {
        let Some(id) = order.order_id.as_deref().filter(|id| !id.is_empty()) else {
            trace!("Ignoring order update without id");
            return false;
        };

        if order.order_type != OrderType::Limit {
            trace!(id, order_type = ?order.order_type, "Ignoring non-limit order");
            return false;
        }

        if order.is_active() {
            debug!(id, price = order.price, remaining = order.remaining(), "Tracking own order");
            self.orders.insert(id.to_string(), order.clone());
            true
        } else {
            let removed = self.orders.remove(id).is_some();
            if removed {
                debug!(id, status = ?order.status, "Dropped own order");
            }
            removed
        }
    }

    /// Forget every order placed on `symbol`.
    pub fn clear_symbol(&mut self, symbol: &str) -> usize {
        let before = self.orders.len();
        self.orders.retain(|_, o| o.symbol.as_deref() != Some(symbol));
        before - self.orders.len()
    }

    pub fn get(&self, id: &str) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Aggregate remaining quantity per price for the active orders on
    /// `symbol`, rebuilt from scratch on every call.
    pub fn levels(&self, symbol: &str) -> (OwnLevels, OwnLevels) {
        let mut bids = OwnLevels::new();
        let mut asks = OwnLevels::new();

        for order in self.orders.values() {
            if !order.is_active() || order.symbol.as_deref() != Some(symbol) {
                continue;
            }
            let side = match order.side {
                Side::Buy => &mut bids,
                Side::Sell => &mut asks,
            };
            *side.entry(OrderedFloat(order.price)).or_default() += order.remaining();
        }

        (bids, asks)
    }
}
