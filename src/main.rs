use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use ladderx_rs::config::{AppConfig, MultiplexerConfig};
use ladderx_rs::engine::types::{Instrument, InstrumentKind, PriceLevel};
use ladderx_rs::market_data::adapters::simulated::SimulatedVenue;
use ladderx_rs::market_data::adapters::MarketEvent;
use ladderx_rs::market_data::aggregator::{AggregatorHandle, LadderSink, LadderView};
use ladderx_rs::market_data::instruments::{resolve_or_placeholder, InstrumentCache};
use ladderx_rs::market_data::normaliser::{Normaliser, UNAVAILABLE};
use ladderx_rs::market_data::router;
use ladderx_rs::mux::Multiplexer;
use ladderx_rs::telemetry;

/// Demo: a simulated venue feeding one order-book ladder.
#[derive(Debug, Parser)]
#[command(name = "ladderx", version)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Symbol to show (overrides the configured one)
    #[arg(long)]
    symbol: Option<String>,
    /// Switch to this symbol halfway through the run
    #[arg(long)]
    switch_to: Option<String>,
    #[arg(long)]
    depth: Option<usize>,
    /// How long to run before tearing everything down
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    #[arg(long, default_value = "0.0.0.0:9000")]
    metrics_addr: SocketAddr,
}

// (instrument id, symbol, mid price)
const DEMO_LISTINGS: [(&str, &str, f64); 4] = [
    ("BBG004730N88", "SBER", 250.0),
    ("BBG004730RP0", "GAZP", 160.0),
    ("BBG000B9XRY4", "AAPL", 190.0),
    ("RU000A0JX0J2", "SU26219", 95.0),
];

fn demo_instruments(book: &MultiplexerConfig) -> Vec<Instrument> {
    DEMO_LISTINGS
        .iter()
        .map(|(id, symbol, _)| Instrument {
            id: id.to_string(),
            venues: book.venues.clone(),
            brokers: vec![book.broker.clone()],
            currency: Some("RUB".to_string()),
            kind: if symbol.starts_with("SU") { InstrumentKind::Bond } else { InstrumentKind::Stock },
            min_price_increment: Some(0.01),
            min_quantity_increment: Some(1.0),
            nominal: symbol.starts_with("SU").then_some(1000.0),
            ..Instrument::placeholder(symbol)
        })
        .collect()
}

fn simulated_venue(tx: mpsc::Sender<MarketEvent>, instruments: &[Instrument]) -> SimulatedVenue {
    let mut venue = SimulatedVenue::new(tx, Duration::from_millis(250));
    for (instrument, (_, _, mid)) in instruments.iter().zip(DEMO_LISTINGS.iter()) {
        venue = venue.with_listing(&instrument.id, &instrument.symbol, *mid);
    }
    venue
}

/// Prints the top of every ladder it receives.
struct StdoutSink {
    symbol: parking_lot::RwLock<String>,
    normaliser: Normaliser,
}

impl StdoutSink {
    fn describe(&self, level: Option<&PriceLevel>) -> String {
        let Some(level) = level else { return UNAVAILABLE.to_string() };
        let venue = level.venue.as_ref().map(|v| format!(" {v}")).unwrap_or_default();
        let own = level.own_volume.map(|o| format!(" (own {})", self.normaliser.format_quantity(o))).unwrap_or_default();
        format!(
            "{} @ {}{}{}",
            self.normaliser.format_quantity(level.volume),
            self.normaliser.format_price(level.price),
            venue,
            own
        )
    }
}

impl LadderSink for StdoutSink {
    fn publish(&self, view: &LadderView) {
        let top = view.rows.first();
        println!(
            "[{}] rows={} spread={} | BID {} | ASK {} | max vol {}",
            self.symbol.read(),
            view.rows.len(),
            view.spread,
            self.describe(top.and_then(|r| r.bid.as_ref())),
            self.describe(top.and_then(|r| r.ask.as_ref())),
            self.normaliser.format_quantity(view.max_volume),
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = AppConfig::load(args.config.as_deref())?;
    if let Some(symbol) = args.symbol {
        cfg.symbol = symbol;
    }
    if let Some(depth) = args.depth {
        cfg.aggregator.depth = depth;
    }
    cfg.validate()?;

    telemetry::init_tracing(&cfg.log_filter);
    telemetry::init_metrics(args.metrics_addr)?;

    let instruments = demo_instruments(&cfg.book);
    let cache = InstrumentCache::new(cfg.book.broker.clone(), cfg.book.venues.clone());
    cache.extend(instruments.iter().cloned());

    let (book_tx, book_rx) = mpsc::channel(1024);
    let book_mux = Arc::new(Multiplexer::new(cfg.book.clone(), Arc::new(simulated_venue(book_tx, &instruments))));
    let mut routers = vec![tokio::spawn(router::run(book_mux.clone(), book_rx))];

    let orders_mux = match &cfg.orders {
        Some(orders_cfg) => {
            let (orders_tx, orders_rx) = mpsc::channel(1024);
            let mux = Arc::new(Multiplexer::new(orders_cfg.clone(), Arc::new(simulated_venue(orders_tx, &instruments))));
            routers.push(tokio::spawn(router::run(mux.clone(), orders_rx)));
            Some(mux)
        }
        None => None,
    };

    let instrument = resolve_or_placeholder(&cache, &cfg.symbol).await;
    info!(symbol = %instrument.symbol, placeholder = instrument.is_placeholder(), "Instrument resolved");

    let sink = Arc::new(StdoutSink {
        symbol: parking_lot::RwLock::new(instrument.symbol.clone()),
        normaliser: Normaliser::for_instrument(Some(&instrument)),
    });
    let handle = AggregatorHandle::bind(
        book_mux.clone(),
        orders_mux.clone(),
        cfg.aggregator.clone(),
        Some(instrument),
        sink.clone(),
    )
    .await?;

    let total = Duration::from_secs(args.seconds);
    let first_leg = if args.switch_to.is_some() { total / 2 } else { total };
    let interrupted = tokio::select! {
        _ = tokio::time::sleep(first_leg) => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    if let (false, Some(next)) = (interrupted, args.switch_to.as_deref()) {
        let instrument = resolve_or_placeholder(&cache, next).await;
        info!(symbol = %instrument.symbol, "Switching instrument");
        *sink.symbol.write() = instrument.symbol.clone();
        if let Err(err) = handle.change_instrument(Some(instrument)).await {
            warn!(error = %err, "Instrument switch left the ladder without a feed");
        }
        tokio::select! {
            _ = tokio::time::sleep(total - first_leg) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    handle.close().await;
    for router in routers {
        router.abort();
    }
    info!("Shut down");
    Ok(())
}
