use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::engine::types::{Instrument, Order, Position};
use crate::market_data::external_book::ExternalBook;

/// Subscribable signal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    OrderBook,
    LastPrice,
    CurrentOrder,
    Position,
    PositionSize,
    PositionAverage,
    TimelineItem,
}

impl DataKind {
    /// Fixed reference name for instrument-agnostic kinds.
    pub fn global_reference(&self) -> Option<&'static str> {
        match self {
            DataKind::Position | DataKind::PositionSize | DataKind::PositionAverage => Some("POSITIONS"),
            DataKind::CurrentOrder => Some("ORDERS"),
            DataKind::TimelineItem => Some("TIMELINE"),
            DataKind::OrderBook | DataKind::LastPrice => None,
        }
    }

    pub fn is_global(&self) -> bool {
        self.global_reference().is_some()
    }

    /// Value a bound field shows while no data has arrived.
    pub fn empty_value(&self) -> Datum {
        match self {
            DataKind::PositionSize | DataKind::PositionAverage => Datum::Number(0.0),
            _ => Datum::Empty,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::OrderBook => "order_book",
            DataKind::LastPrice => "last_price",
            DataKind::CurrentOrder => "current_order",
            DataKind::Position => "position",
            DataKind::PositionSize => "position_size",
            DataKind::PositionAverage => "position_average",
            DataKind::TimelineItem => "timeline_item",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity an upstream feed is opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceKey {
    Global(&'static str),
    Instrument(String),
}

impl ReferenceKey {
    pub fn instrument(instrument: &Instrument) -> Self {
        ReferenceKey::Instrument(instrument.id.clone())
    }
}

impl fmt::Display for ReferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKey::Global(name) => f.write_str(name),
            ReferenceKey::Instrument(id) => write!(f, "instrument:{}", id),
        }
    }
}

/// Opaque token returned by the connector on activation and handed back on
/// deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpstreamHandle(pub u64);

/// Value written into a consumer field.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// Placeholder shown until data arrives
    Empty,
    Number(f64),
    OrderBook(ExternalBook),
    Order(Order),
    Position(Position),
    Timeline(serde_json::Value),
}

impl Datum {
    pub fn is_empty(&self) -> bool {
        matches!(self, Datum::Empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub u64);

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

impl ConsumerId {
    pub fn next() -> Self {
        ConsumerId(NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

/// A display consumer the multiplexer writes field values into.
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    /// Instrument currently shown; instrument-scoped kinds key on it.
    fn instrument(&self) -> Option<Instrument>;

    /// Called with the multiplexer's registry locked: keep it short and
    /// never call back into the multiplexer from here.
    fn set(&self, field: &str, value: Datum);
}

/// Optional features a multiplexer's upstream supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    OrderBook,
    ActiveOrders,
    Positions,
    Timeline,
    /// Ladder levels carry the reporting venue (MIC pools)
    MultiVenue,
}
