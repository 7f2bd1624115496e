// Layered configuration: built-in defaults, then an optional TOML file, then
// LADDERX__* environment variables (a .env file is honoured).

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::mux::types::Capability;

pub const MAX_DEPTH: usize = 50;
pub const DEFAULT_VENUE_MARKER: &str = "SPBX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("depth must be between 1 and {MAX_DEPTH}, got {0}")]
    InvalidDepth(usize),
    #[error("multiplexer `{0}` serves no venues")]
    NoVenues(String),
}

/// Display settings of one order-book ladder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Rows rendered per side, 1..=50
    pub depth: usize,
    /// Show venue codes as market identifier codes
    pub venue_normalization: bool,
    /// Show own size as separate rows instead of annotating venue levels
    pub multi_venue_display: bool,
    /// Fraction digits of the spread percentage
    pub percentage_precision: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { depth: 20, venue_normalization: false, multi_venue_display: false, percentage_precision: 2 }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_DEPTH).contains(&self.depth) {
            return Err(ConfigError::InvalidDepth(self.depth));
        }
        Ok(())
    }
}

/// One upstream connection: which broker it trades through, the venues it
/// serves and the optional features it offers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub name: String,
    pub broker: String,
    pub venues: Vec<String>,
    pub caps: Vec<Capability>,
    /// Venue shown on own-order rows in multi-venue mode
    pub venue_marker: Option<String>,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            name: "book".to_string(),
            broker: "simulated".to_string(),
            venues: vec!["MOEX".to_string()],
            caps: vec![Capability::OrderBook],
            venue_marker: None,
        }
    }
}

impl MultiplexerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.venues.is_empty() {
            return Err(ConfigError::NoVenues(self.name.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_filter: String,
    pub symbol: String,
    pub book: MultiplexerConfig,
    pub orders: Option<MultiplexerConfig>,
    pub aggregator: AggregatorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,ladderx_rs=debug".to_string(),
            symbol: "SBER".to_string(),
            book: MultiplexerConfig::default(),
            orders: Some(MultiplexerConfig {
                name: "orders".to_string(),
                caps: vec![Capability::ActiveOrders, Capability::Positions],
                ..MultiplexerConfig::default()
            }),
            aggregator: AggregatorConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg: AppConfig = builder
            .add_source(config::Environment::with_prefix("LADDERX").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.aggregator.validate()?;
        self.book.validate()?;
        if let Some(orders) = &self.orders {
            orders.validate()?;
        }
        Ok(())
    }
}
