use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// True when `a` sits ahead of `b` in this side's natural order
    /// (bids: higher first, asks: lower first).
    pub fn is_better(&self, a: f64, b: f64) -> bool {
        match self {
            Side::Buy => a > b,
            Side::Sell => a < b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Working,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

// Own order as reported by the orders feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    pub side: Side,
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub filled: f64,
    pub status: OrderStatus,
}

impl Order {
    pub fn is_active(&self) -> bool {
        self.status == OrderStatus::Working && self.filled < self.quantity
    }

    pub fn remaining(&self) -> f64 {
        self.quantity - self.filled
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
}

impl PriceLevel {
    pub fn new(price: f64, volume: f64) -> Self {
        Self { price, volume, own_volume: None, venue: None }
    }

    pub fn with_venue(mut self, venue: impl Into<String>) -> Self {
        self.venue = Some(venue.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuoteRow {
    pub bid: Option<PriceLevel>,
    pub ask: Option<PriceLevel>,
}

/// Open position snapshot pushed by the positions feed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub size: f64,
    #[serde(default)]
    pub average: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    #[default]
    Stock,
    Bond,
    Future,
    OptionContract,
    Currency,
    Cryptocurrency,
}

/// Tradable instrument as resolved from the instrument cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub symbol: String,
    #[serde(default)]
    pub venues: Vec<String>,
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub kind: InstrumentKind,
    #[serde(default)]
    pub min_price_increment: Option<f64>,
    #[serde(default)]
    pub min_quantity_increment: Option<f64>,
    #[serde(default)]
    pub nominal: Option<f64>,
}

impl Instrument {
    /// Stand-in used when resolution fails. It carries no venues or brokers,
    /// so no instrument-scoped feed is ever opened for it.
    pub fn placeholder(symbol: &str) -> Self {
        Self {
            id: String::new(),
            symbol: symbol.to_string(),
            venues: Vec::new(),
            brokers: Vec::new(),
            currency: None,
            kind: InstrumentKind::default(),
            min_price_increment: None,
            min_quantity_increment: None,
            nominal: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.id.is_empty()
    }

    /// Symbol without the `~VENUE` disambiguation suffix.
    pub fn base_symbol(&self) -> &str {
        self.symbol.split('~').next().unwrap_or(&self.symbol)
    }

    pub fn trades_on_any(&self, venues: &[String]) -> bool {
        self.venues.iter().any(|v| venues.contains(v))
    }
}
