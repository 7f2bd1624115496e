use serde::{Deserialize, Serialize};

use crate::engine::types::{PriceLevel, Side};

// Raw venue ladder as pushed by the upstream feed.
// bids: best (highest) first, asks: best (lowest) first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExternalBook {
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
}

impl ExternalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a book from levels in arbitrary order. Sorting is stable so
    /// several venues quoting one price keep their feed order.
    pub fn from_levels(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        let mut book = Self::new();
        book.apply_snapshot(bids, asks);
        book
    }

    // Replace the whole book with a fresh snapshot
    pub fn apply_snapshot(&mut self, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) {
        self.bids = bids;
        self.asks = asks;
        self.sort();
    }

    /// Restore best-first order on both sides, e.g. after deserializing.
    pub fn sort(&mut self) {
        sort_side(&mut self.bids, Side::Buy);
        sort_side(&mut self.asks, Side::Sell);
    }

    pub fn bbo(&self) -> (Option<&PriceLevel>, Option<&PriceLevel>) {
        (self.bids.first(), self.asks.first())
    }
}

fn sort_side(levels: &mut [PriceLevel], side: Side) {
    levels.sort_by(|a, b| {
        let ord = a.price.total_cmp(&b.price);
        match side {
            Side::Buy => ord.reverse(),
            Side::Sell => ord,
        }
    });
}
