//! Subscription multiplexer: fans upstream data out to consumer fields and
//! keeps exactly one upstream feed open per referenced key.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{MultiplexerConfig, DEFAULT_VENUE_MARKER};
use crate::engine::types::Instrument;
use crate::market_data::adapters::VenueAdapter;
use crate::mux::error::{ConnectError, MuxError, MuxResult};
use crate::mux::reference::{ReferenceTable, Turn, UpstreamState};
use crate::mux::subscription::{Binding, Subscription, SubscriptionTable, Ticket};
use crate::mux::types::{Capability, Consumer, ConsumerId, DataKind, Datum, ReferenceKey};

#[derive(Default)]
struct KindTables {
    subs: SubscriptionTable,
    refs: ReferenceTable,
}

#[derive(Default)]
struct Registry {
    kinds: BTreeMap<DataKind, KindTables>,
}

impl Registry {
    fn tables(&mut self, kind: DataKind) -> &mut KindTables {
        self.kinds.entry(kind).or_default()
    }
}

/// What to undo when the activation a subscription waited on fails.
#[derive(Debug, Clone, Copy)]
enum Rollback {
    /// Drop the subscription entirely (fresh subscribe)
    Forget(Ticket),
    /// Keep the field but unbind it (instrument change)
    Detach(Ticket),
}

/// Outcome of registering a field.
enum Admission {
    /// Registered earlier; carries the key that call bound it to
    Duplicate(Option<ReferenceKey>),
    /// Nothing to bring up: unbound, or the feed is already active
    Ready,
    Settle(Turn, Ticket),
}

/// One upstream connection shared by any number of consumers.
///
/// Both tables of every kind live behind a single registry lock that is
/// never held across an `.await`. Upstream hooks run outside it, serialized
/// per key by the reference entry's gate.
///
/// Field values are written with [`Consumer::set`] while the registry lock is
/// held, so implementations must not call back into the multiplexer.
pub struct Multiplexer {
    config: MultiplexerConfig,
    adapter: Arc<dyn VenueAdapter>,
    registry: Mutex<Registry>,
    next_ticket: AtomicU64,
}

impl Multiplexer {
    pub fn new(config: MultiplexerConfig, adapter: Arc<dyn VenueAdapter>) -> Self {
        Self { config, adapter, registry: Mutex::new(Registry::default()), next_ticket: AtomicU64::new(1) }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn has_cap(&self, cap: Capability) -> bool {
        self.config.caps.contains(&cap)
    }

    /// Venue shown on own-order rows in multi-venue ladders.
    pub fn venue_marker(&self) -> &str {
        self.config.venue_marker.as_deref().unwrap_or(DEFAULT_VENUE_MARKER)
    }

    /// True when the instrument trades through this connection's broker on
    /// one of its venues.
    pub fn admits(&self, instrument: &Instrument) -> bool {
        !instrument.is_placeholder()
            && instrument.brokers.iter().any(|b| b == &self.config.broker)
            && instrument.trades_on_any(&self.config.venues)
    }

    fn instrument_key(&self, instrument: &Instrument) -> Option<ReferenceKey> {
        self.admits(instrument).then(|| ReferenceKey::instrument(instrument))
    }

    /// Key a subscription of `kind` by `consumer` would hold right now.
    pub fn resolve_key(&self, kind: DataKind, consumer: &dyn Consumer) -> Option<ReferenceKey> {
        match kind.global_reference() {
            Some(name) => Some(ReferenceKey::Global(name)),
            None => consumer.instrument().and_then(|i| self.instrument_key(&i)),
        }
    }

    fn ticket(&self) -> Ticket {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    #[instrument(level = "debug", skip(self, consumer), fields(mux = %self.config.name, consumer = %consumer.id()))]
    pub async fn subscribe_field(&self, consumer: &Arc<dyn Consumer>, field: &str, kind: DataKind) -> MuxResult<()> {
        let key = self.resolve_key(kind, consumer.as_ref());

        let admission = {
            let mut registry = self.registry.lock();
            let tables = registry.tables(kind);
            if let Some(existing) = tables.subs.get(consumer.id(), field) {
                Admission::Duplicate(existing.binding.as_ref().map(|b| b.key.clone()))
            } else {
                let binding = key.map(|key| Binding { key, ticket: self.ticket() });
                let turn = binding.as_ref().and_then(|b| tables.refs.acquire(&b.key).map(|turn| (turn, b.ticket)));
                if binding.is_none() {
                    debug!("No compatible reference, field registered unbound");
                }
                tables.subs.insert(consumer, Subscription { field: field.to_string(), kind, binding });
                match turn {
                    Some((turn, ticket)) => Admission::Settle(turn, ticket),
                    None => Admission::Ready,
                }
            }
        };

        match admission {
            Admission::Settle(turn, ticket) => self.settle_acquire(kind, turn, Rollback::Forget(ticket)).await,
            Admission::Ready | Admission::Duplicate(None) => Ok(()),
            Admission::Duplicate(Some(key)) => {
                debug!(%key, "Already subscribed, waiting for the feed to settle");
                self.await_settled(kind, consumer.id(), field, key).await
            }
        }
    }

    /// Wait until the feed an earlier subscribe of the same field bound it to
    /// is up. Fails if that subscription was dropped on the way.
    async fn await_settled(&self, kind: DataKind, consumer: ConsumerId, field: &str, key: ReferenceKey) -> MuxResult<()> {
        loop {
            let mut settled = {
                let registry = self.registry.lock();
                let sub = registry.kinds.get(&kind).and_then(|t| t.subs.get(consumer, field).map(|s| (t, s)));
                let Some((tables, sub)) = sub else {
                    return Err(MuxError::Activation {
                        kind,
                        key,
                        source: ConnectError::new("activation for an earlier subscribe of this field failed"),
                    });
                };
                // Detached by a failed instrument change: still registered
                let Some(binding) = &sub.binding else { return Ok(()) };
                match tables.refs.get(&binding.key) {
                    Some(entry) if !matches!(entry.state(), UpstreamState::Active(_)) => entry.watch(),
                    _ => return Ok(()),
                }
            };
            if settled.changed().await.is_err() {
                debug!(%key, "Reference removed while waiting, checking again");
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(mux = %self.config.name))]
    pub async fn unsubscribe_field(&self, consumer: ConsumerId, field: &str, kind: DataKind) {
        let turn = {
            let mut registry = self.registry.lock();
            let tables = registry.tables(kind);
            let Some(sub) = tables.subs.remove(consumer, field) else {
                debug!("Unknown subscription ignored");
                return;
            };
            sub.binding.and_then(|b| tables.refs.release(&b.key))
        };

        if let Some(turn) = turn {
            self.settle_release(kind, turn).await;
        }
    }

    /// Subscribe several fields in order, stopping at the first failure.
    pub async fn subscribe_fields(&self, consumer: &Arc<dyn Consumer>, fields: &[(&str, DataKind)]) -> MuxResult<()> {
        for (field, kind) in fields {
            self.subscribe_field(consumer, field, *kind).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe_fields(&self, consumer: ConsumerId, fields: &[(&str, DataKind)]) {
        for (field, kind) in fields {
            self.unsubscribe_field(consumer, field, *kind).await;
        }
    }

    /// Re-point every instrument-scoped field of `consumer` at `new`.
    ///
    /// All fields are reset to their kind's empty value first. The reference
    /// each field actually held is released, whatever `old` says. Every
    /// rebinding is attempted even if one activation fails; the first
    /// failure is returned and the failed field is left unbound.
    #[instrument(
        skip(self, consumer, old, new),
        fields(
            mux = %self.config.name,
            consumer = %consumer.id(),
            old = old.map(|i| i.symbol.as_str()).unwrap_or("-"),
            new = new.map(|i| i.symbol.as_str()).unwrap_or("-"),
        )
    )]
    pub async fn instrument_changed(
        &self,
        consumer: &Arc<dyn Consumer>,
        old: Option<&Instrument>,
        new: Option<&Instrument>,
    ) -> MuxResult<()> {
        let id = consumer.id();
        let new_key = new.and_then(|i| self.instrument_key(i));
        let mut releases = Vec::new();
        let mut acquires = Vec::new();

        {
            let mut registry = self.registry.lock();
            for (&kind, tables) in registry.kinds.iter_mut() {
                let KindTables { subs, refs } = tables;
                let Some(list) = subs.subscriptions_mut(id) else { continue };
                for sub in list.iter_mut() {
                    consumer.set(&sub.field, kind.empty_value());
                    if kind.is_global() {
                        continue;
                    }
                    if let Some(held) = sub.binding.take() {
                        if let Some(turn) = refs.release(&held.key) {
                            releases.push((kind, turn));
                        }
                    }
                    if let Some(key) = &new_key {
                        let ticket = self.ticket();
                        if let Some(turn) = refs.acquire(key) {
                            acquires.push((kind, turn, ticket));
                        }
                        sub.binding = Some(Binding { key: key.clone(), ticket });
                    }
                }
            }
        }

        join_all(releases.into_iter().map(|(kind, turn)| self.settle_release(kind, turn))).await;

        let settled = join_all(
            acquires
                .into_iter()
                .map(|(kind, turn, ticket)| self.settle_acquire(kind, turn, Rollback::Detach(ticket))),
        )
        .await;
        settled.into_iter().collect()
    }

    /// Deliver an upstream value to every field bound to `key`. Returns the
    /// number of fields written.
    pub fn publish(&self, kind: DataKind, key: &ReferenceKey, datum: Datum) -> usize {
        let registry = self.registry.lock();
        let Some(tables) = registry.kinds.get(&kind) else { return 0 };
        let targets = tables.subs.bound_to(key);
        for (sink, field) in &targets {
            sink.set(field, datum.clone());
        }
        targets.len()
    }

    /// Drop every subscription of `consumer`, releasing each held reference
    /// exactly once.
    #[instrument(level = "debug", skip(self), fields(mux = %self.config.name))]
    pub async fn unsubscribe_all(&self, consumer: ConsumerId) {
        let mut releases = Vec::new();
        {
            let mut registry = self.registry.lock();
            for (&kind, tables) in registry.kinds.iter_mut() {
                let fields: Vec<String> = tables.subs.subscriptions(consumer).iter().map(|s| s.field.clone()).collect();
                for field in fields {
                    let Some(sub) = tables.subs.remove(consumer, &field) else { continue };
                    if let Some(turn) = sub.binding.and_then(|b| tables.refs.release(&b.key)) {
                        releases.push((kind, turn));
                    }
                }
            }
        }

        join_all(releases.into_iter().map(|(kind, turn)| self.settle_release(kind, turn))).await;
    }

    pub fn ref_count(&self, kind: DataKind, key: &ReferenceKey) -> usize {
        self.registry.lock().kinds.get(&kind).map_or(0, |t| t.refs.ref_count(key))
    }

    pub fn is_active(&self, kind: DataKind, key: &ReferenceKey) -> bool {
        self.registry.lock().kinds.get(&kind).is_some_and(|t| t.refs.is_active(key))
    }

    pub fn has_reference(&self, kind: DataKind, key: &ReferenceKey) -> bool {
        self.registry.lock().kinds.get(&kind).is_some_and(|t| t.refs.get(key).is_some())
    }

    pub fn subscriptions_of(&self, consumer: ConsumerId) -> Vec<Subscription> {
        let registry = self.registry.lock();
        registry.kinds.values().flat_map(|t| t.subs.subscriptions(consumer).iter().cloned()).collect()
    }

    async fn settle_acquire(&self, kind: DataKind, turn: Turn, rollback: Rollback) -> MuxResult<()> {
        let gate = turn.gate();
        let _guard = gate.lock().await;

        let claimed = self.registry.lock().tables(kind).refs.begin_activation(&turn);
        if !claimed {
            return Ok(());
        }

        match self.adapter.activate(kind, &turn.key).await {
            Ok(handle) => {
                self.registry.lock().tables(kind).refs.complete_activation(&turn, handle);
                metrics::counter!("ladderx_activations_total", "kind" => kind.as_str()).increment(1);
                metrics::gauge!("ladderx_active_feeds", "kind" => kind.as_str()).increment(1.0);
                info!(mux = %self.config.name, %kind, key = %turn.key, ?handle, "Upstream activated");
                Ok(())
            }
            Err(source) => {
                {
                    let mut registry = self.registry.lock();
                    let tables = registry.tables(kind);
                    let held = match rollback {
                        Rollback::Forget(ticket) => tables.subs.forget(ticket).is_some(),
                        Rollback::Detach(ticket) => tables.subs.detach(ticket).is_some(),
                    };
                    tables.refs.abort_activation(&turn, held);
                }
                metrics::counter!("ladderx_activation_failures_total", "kind" => kind.as_str()).increment(1);
                warn!(mux = %self.config.name, %kind, key = %turn.key, error = %source, "Upstream activation failed");
                Err(MuxError::Activation { kind, key: turn.key, source })
            }
        }
    }

    async fn settle_release(&self, kind: DataKind, turn: Turn) {
        let gate = turn.gate();
        let _guard = gate.lock().await;

        let handle = self.registry.lock().tables(kind).refs.begin_deactivation(&turn);
        let Some(handle) = handle else {
            debug!(%kind, key = %turn.key, "Teardown not needed");
            return;
        };

        if let Err(err) = self.adapter.deactivate(kind, &turn.key, handle).await {
            warn!(mux = %self.config.name, %kind, key = %turn.key, error = %err, "Upstream deactivation failed");
        }
        self.registry.lock().tables(kind).refs.complete_deactivation(&turn);
        metrics::counter!("ladderx_deactivations_total", "kind" => kind.as_str()).increment(1);
        metrics::gauge!("ladderx_active_feeds", "kind" => kind.as_str()).decrement(1.0);
        info!(mux = %self.config.name, %kind, key = %turn.key, "Upstream deactivated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::mux::types::UpstreamHandle;

    #[derive(Default)]
    struct RecordingVenue {
        activations: AtomicUsize,
        deactivations: AtomicUsize,
        fail: AtomicBool,
        fail_teardown: AtomicBool,
        // When set, every activation waits for one permit
        hold: Option<Semaphore>,
    }

    impl RecordingVenue {
        fn holding() -> Self {
            Self { hold: Some(Semaphore::new(0)), ..Self::default() }
        }

        fn activations(&self) -> usize {
            self.activations.load(Ordering::SeqCst)
        }

        fn deactivations(&self) -> usize {
            self.deactivations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VenueAdapter for RecordingVenue {
        async fn activate(&self, _kind: DataKind, _key: &ReferenceKey) -> Result<UpstreamHandle, ConnectError> {
            if let Some(hold) = &self.hold {
                hold.acquire().await.map_err(|e| ConnectError::new(e.to_string()))?.forget();
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ConnectError::new("venue down"));
            }
            let n = self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(UpstreamHandle(n as u64))
        }

        async fn deactivate(&self, _kind: DataKind, _key: &ReferenceKey, _handle: UpstreamHandle) -> Result<(), ConnectError> {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            if self.fail_teardown.load(Ordering::SeqCst) {
                return Err(ConnectError::new("close rejected"));
            }
            Ok(())
        }
    }

    struct Panel {
        id: ConsumerId,
        instrument: Mutex<Option<Instrument>>,
        values: Mutex<Vec<(String, Datum)>>,
    }

    impl Panel {
        fn showing(instrument: Option<Instrument>) -> Arc<Panel> {
            Arc::new(Panel { id: ConsumerId::next(), instrument: Mutex::new(instrument), values: Mutex::new(Vec::new()) })
        }

        fn last(&self, field: &str) -> Option<Datum> {
            self.values.lock().iter().rev().find(|(f, _)| f == field).map(|(_, v)| v.clone())
        }
    }

    impl Consumer for Panel {
        fn id(&self) -> ConsumerId {
            self.id
        }
        fn instrument(&self) -> Option<Instrument> {
            self.instrument.lock().clone()
        }
        fn set(&self, field: &str, value: Datum) {
            self.values.lock().push((field.to_string(), value));
        }
    }

    fn instrument(id: &str) -> Instrument {
        Instrument {
            id: id.to_string(),
            venues: vec!["MOEX".into()],
            brokers: vec!["simulated".into()],
            ..Instrument::placeholder(id)
        }
    }

    fn key(id: &str) -> ReferenceKey {
        ReferenceKey::Instrument(id.to_string())
    }

    fn mux(venue: &Arc<RecordingVenue>) -> Arc<Multiplexer> {
        let adapter: Arc<dyn VenueAdapter> = venue.clone();
        Arc::new(Multiplexer::new(MultiplexerConfig::default(), adapter))
    }

    fn as_consumer(panel: &Arc<Panel>) -> Arc<dyn Consumer> {
        panel.clone()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn test_single_subscriber_lifecycle() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let panel = as_consumer(&Panel::showing(Some(instrument("SBER"))));

        mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await.unwrap();
        assert_eq!(venue.activations(), 1);
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("SBER")), 1);
        assert!(mux.is_active(DataKind::OrderBook, &key("SBER")));

        mux.unsubscribe_field(panel.id(), "orderbook", DataKind::OrderBook).await;
        assert_eq!(venue.deactivations(), 1);
        assert!(!mux.has_reference(DataKind::OrderBook, &key("SBER")));
        assert!(mux.subscriptions_of(panel.id()).is_empty());
    }

    #[tokio::test]
    async fn test_shared_feed_opens_once() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let a = as_consumer(&Panel::showing(Some(instrument("SBER"))));
        let b = as_consumer(&Panel::showing(Some(instrument("SBER"))));

        mux.subscribe_field(&a, "orderbook", DataKind::OrderBook).await.unwrap();
        mux.subscribe_field(&b, "orderbook", DataKind::OrderBook).await.unwrap();
        assert_eq!(venue.activations(), 1);
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("SBER")), 2);

        mux.unsubscribe_field(a.id(), "orderbook", DataKind::OrderBook).await;
        assert_eq!(venue.deactivations(), 0);
        assert!(mux.is_active(DataKind::OrderBook, &key("SBER")));

        mux.unsubscribe_field(b.id(), "orderbook", DataKind::OrderBook).await;
        assert_eq!(venue.deactivations(), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_and_unknown_unsubscribe_are_noops() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let panel = as_consumer(&Panel::showing(Some(instrument("SBER"))));

        mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await.unwrap();
        mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await.unwrap();
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("SBER")), 1);
        assert_eq!(mux.subscriptions_of(panel.id()).len(), 1);

        mux.unsubscribe_field(panel.id(), "lastPrice", DataKind::LastPrice).await;
        mux.unsubscribe_field(ConsumerId(u64::MAX), "orderbook", DataKind::OrderBook).await;
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("SBER")), 1);
        assert_eq!(venue.deactivations(), 0);
    }

    #[tokio::test]
    async fn test_failed_activation_rolls_back() {
        let venue = Arc::new(RecordingVenue::default());
        venue.fail.store(true, Ordering::SeqCst);
        let mux = mux(&venue);
        let panel = as_consumer(&Panel::showing(Some(instrument("SBER"))));

        let err = mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await.unwrap_err();
        assert!(matches!(err, MuxError::Activation { kind: DataKind::OrderBook, .. }));
        assert!(!mux.has_reference(DataKind::OrderBook, &key("SBER")));
        assert!(mux.subscriptions_of(panel.id()).is_empty());

        venue.fail.store(false, Ordering::SeqCst);
        mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await.unwrap();
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("SBER")), 1);
    }

    #[tokio::test]
    async fn test_batch_subscribe_stops_at_first_error() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let panel = as_consumer(&Panel::showing(Some(instrument("SBER"))));

        mux.subscribe_field(&panel, "orders", DataKind::CurrentOrder).await.unwrap();
        venue.fail.store(true, Ordering::SeqCst);
        let fields = [("orderbook", DataKind::OrderBook), ("lastPrice", DataKind::LastPrice)];
        assert!(mux.subscribe_fields(&panel, &fields).await.is_err());

        let subs = mux.subscriptions_of(panel.id());
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].kind, DataKind::CurrentOrder);
    }

    #[tokio::test]
    async fn test_incompatible_instrument_takes_no_reference() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let mut foreign = instrument("AAPL");
        foreign.venues = vec!["XNAS".into()];
        let panel = as_consumer(&Panel::showing(Some(foreign)));

        mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await.unwrap();
        assert_eq!(venue.activations(), 0);
        let subs = mux.subscriptions_of(panel.id());
        assert_eq!(subs.len(), 1);
        assert!(subs[0].binding.is_none());

        mux.unsubscribe_field(panel.id(), "orderbook", DataKind::OrderBook).await;
        assert_eq!(venue.deactivations(), 0);
        assert!(mux.subscriptions_of(panel.id()).is_empty());
    }

    #[tokio::test]
    async fn test_instrument_change_moves_reference() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let panel = Panel::showing(Some(instrument("SBER")));
        let consumer = as_consumer(&panel);

        let fields = [("orderbook", DataKind::OrderBook), ("size", DataKind::PositionSize)];
        mux.subscribe_fields(&consumer, &fields).await.unwrap();
        assert_eq!(venue.activations(), 2);

        let (old, new) = (instrument("SBER"), instrument("GAZP"));
        *panel.instrument.lock() = Some(new.clone());
        mux.instrument_changed(&consumer, Some(&old), Some(&new)).await.unwrap();

        assert!(!mux.has_reference(DataKind::OrderBook, &key("SBER")));
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("GAZP")), 1);
        assert_eq!(mux.ref_count(DataKind::PositionSize, &ReferenceKey::Global("POSITIONS")), 1);
        assert_eq!(venue.activations(), 3);
        assert_eq!(venue.deactivations(), 1);

        assert_eq!(panel.last("orderbook"), Some(Datum::Empty));
        assert_eq!(panel.last("size"), Some(Datum::Number(0.0)));
        assert_eq!(mux.subscriptions_of(consumer.id()).len(), 2);
    }

    #[tokio::test]
    async fn test_instrument_change_to_same_key_keeps_feed() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let panel = as_consumer(&Panel::showing(Some(instrument("SBER"))));

        mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await.unwrap();
        let same = instrument("SBER");
        mux.instrument_changed(&panel, Some(&same), Some(&same)).await.unwrap();

        assert_eq!(venue.activations(), 1);
        assert_eq!(venue.deactivations(), 0);
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("SBER")), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_bound_fields_only() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let sber = Panel::showing(Some(instrument("SBER")));
        let gazp = Panel::showing(Some(instrument("GAZP")));

        mux.subscribe_field(&as_consumer(&sber), "last", DataKind::LastPrice).await.unwrap();
        mux.subscribe_field(&as_consumer(&gazp), "last", DataKind::LastPrice).await.unwrap();

        assert_eq!(mux.publish(DataKind::LastPrice, &key("SBER"), Datum::Number(250.5)), 1);
        assert_eq!(sber.last("last"), Some(Datum::Number(250.5)));
        assert_eq!(gazp.last("last"), None);
        assert_eq!(mux.publish(DataKind::OrderBook, &key("SBER"), Datum::Empty), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_releases_everything() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let panel = as_consumer(&Panel::showing(Some(instrument("SBER"))));

        let fields = [
            ("orderbook", DataKind::OrderBook),
            ("orders", DataKind::CurrentOrder),
            ("avg", DataKind::PositionAverage),
        ];
        mux.subscribe_fields(&panel, &fields).await.unwrap();
        mux.unsubscribe_all(panel.id()).await;

        assert_eq!(venue.deactivations(), 3);
        assert!(mux.subscriptions_of(panel.id()).is_empty());
        assert_eq!(mux.ref_count(DataKind::CurrentOrder, &ReferenceKey::Global("ORDERS")), 0);
    }

    #[tokio::test]
    async fn test_pending_teardown_is_superseded() {
        let venue = Arc::new(RecordingVenue::holding());
        let mux = mux(&venue);
        let sber = || as_consumer(&Panel::showing(Some(instrument("SBER"))));
        let (a, b, c) = (sber(), sber(), sber());
        let count = || mux.ref_count(DataKind::OrderBook, &key("SBER"));

        let spawn_subscribe = |consumer: Arc<dyn Consumer>| {
            let mux = mux.clone();
            tokio::spawn(async move { mux.subscribe_field(&consumer, "orderbook", DataKind::OrderBook).await })
        };

        // A's activation blocks while holding the key's gate
        let first = spawn_subscribe(a.clone());
        wait_for(|| count() == 1).await;
        let second = spawn_subscribe(b.clone());
        wait_for(|| count() == 2).await;

        mux.unsubscribe_field(a.id(), "orderbook", DataKind::OrderBook).await;
        let teardown = tokio::spawn({
            let mux = mux.clone();
            let id = b.id();
            async move { mux.unsubscribe_field(id, "orderbook", DataKind::OrderBook).await }
        });
        wait_for(|| count() == 0).await;

        // C arrives while B's teardown is still queued behind the activation
        let third = spawn_subscribe(c.clone());
        wait_for(|| count() == 1).await;

        venue.hold.as_ref().unwrap().add_permits(1);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        teardown.await.unwrap();
        third.await.unwrap().unwrap();

        assert_eq!(venue.activations(), 1);
        assert_eq!(venue.deactivations(), 0);
        assert!(mux.is_active(DataKind::OrderBook, &key("SBER")));
        assert_eq!(count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_waits_for_activation() {
        let venue = Arc::new(RecordingVenue::holding());
        let mux = mux(&venue);
        let panel = as_consumer(&Panel::showing(Some(instrument("SBER"))));
        let count = || mux.ref_count(DataKind::OrderBook, &key("SBER"));
        let subscribe = || {
            let (mux, panel) = (mux.clone(), panel.clone());
            tokio::spawn(async move { mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await })
        };

        let first = subscribe();
        wait_for(|| count() == 1).await;
        let second = subscribe();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(!second.is_finished());

        venue.hold.as_ref().unwrap().add_permits(1);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(venue.activations(), 1);
        assert_eq!(count(), 1);
        assert!(mux.is_active(DataKind::OrderBook, &key("SBER")));
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_reports_failed_activation() {
        let venue = Arc::new(RecordingVenue::holding());
        venue.fail.store(true, Ordering::SeqCst);
        let mux = mux(&venue);
        let panel = as_consumer(&Panel::showing(Some(instrument("SBER"))));
        let count = || mux.ref_count(DataKind::OrderBook, &key("SBER"));
        let subscribe = || {
            let (mux, panel) = (mux.clone(), panel.clone());
            tokio::spawn(async move { mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await })
        };

        // The first activation is held inside the venue, then fails
        let first = subscribe();
        wait_for(|| count() == 1).await;
        let second = subscribe();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        venue.hold.as_ref().unwrap().add_permits(2);
        assert!(first.await.unwrap().is_err());
        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, MuxError::Activation { kind: DataKind::OrderBook, .. }));

        assert!(mux.subscriptions_of(panel.id()).is_empty());
        assert!(!mux.has_reference(DataKind::OrderBook, &key("SBER")));
        assert_eq!(venue.activations(), 0);
    }

    #[tokio::test]
    async fn test_failed_teardown_still_drops_reference() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let panel = as_consumer(&Panel::showing(Some(instrument("SBER"))));

        mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await.unwrap();
        venue.fail_teardown.store(true, Ordering::SeqCst);
        mux.unsubscribe_field(panel.id(), "orderbook", DataKind::OrderBook).await;

        assert_eq!(venue.deactivations(), 1);
        assert!(!mux.has_reference(DataKind::OrderBook, &key("SBER")));

        // The key starts over from scratch
        mux.subscribe_field(&panel, "orderbook", DataKind::OrderBook).await.unwrap();
        assert_eq!(venue.activations(), 2);
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("SBER")), 1);
        assert!(mux.is_active(DataKind::OrderBook, &key("SBER")));
    }

    #[tokio::test]
    async fn test_failed_rebind_leaves_field_unbound() {
        let venue = Arc::new(RecordingVenue::default());
        let mux = mux(&venue);
        let panel = Panel::showing(Some(instrument("SBER")));
        let consumer = as_consumer(&panel);

        mux.subscribe_field(&consumer, "orderbook", DataKind::OrderBook).await.unwrap();
        venue.fail.store(true, Ordering::SeqCst);
        let (old, new) = (instrument("SBER"), instrument("GAZP"));
        *panel.instrument.lock() = Some(new.clone());

        let err = mux.instrument_changed(&consumer, Some(&old), Some(&new)).await.unwrap_err();
        assert!(matches!(err, MuxError::Activation { key: ReferenceKey::Instrument(ref id), .. } if id == "GAZP"));

        assert_eq!(venue.deactivations(), 1);
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("SBER")), 0);
        assert_eq!(mux.ref_count(DataKind::OrderBook, &key("GAZP")), 0);
        assert!(!mux.has_reference(DataKind::OrderBook, &key("GAZP")));

        let subs = mux.subscriptions_of(consumer.id());
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].binding, None);
        assert_eq!(panel.last("orderbook"), Some(Datum::Empty));
        assert_eq!(mux.publish(DataKind::OrderBook, &key("GAZP"), Datum::Empty), 0);
    }
}
