//! Integration tests for the TP/SL monitoring engine
//!
//! Drives the engine through full position lifecycles against a scriptable
//! in-memory exchange: entries fill, the ladder rebalances, TP1 moves the
//! stop to breakeven, and closure tears everything down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

use tpsl_engine::bybit::{
    AmendParams, ExchangeApi, Order, OrderParams, OrderRef, OrderStatus, OrderType, PlacedOrder,
    Position,
};
use tpsl_engine::engine::{Engine, EntryLeg, PassOutcome, TradeSpec};
use tpsl_engine::error::ExchangeError;
use tpsl_engine::events::{EngineEvent, EngineEventKind, EventSender};
use tpsl_engine::linkid::{classify_link_id, OrderKind};
use tpsl_engine::monitor::{MonitorRecord, SlOrder};
use tpsl_engine::persistence::{EngineSnapshot, PersistenceStore};
use tpsl_engine::types::{Account, InstrumentInfo, Money, Phase, Side, Symbol};
use tpsl_engine::Config;

// =============================================================================
// Test Utilities
// =============================================================================

fn money(s: &str) -> Money {
    s.parse().unwrap()
}

fn btc() -> Symbol {
    Symbol::new("BTCUSDT")
}

#[derive(Default)]
struct MockState {
    position: Option<Position>,
    open_orders: Vec<Order>,
    history: Vec<Order>,
    placed: Vec<OrderParams>,
}

/// Scriptable exchange double. Placing an order puts it on the book;
/// cancelling one that is not there reports `AlreadyGone`, like the real
/// exchange.
struct MockExchange {
    account: Account,
    state: Mutex<MockState>,
    next_id: AtomicU64,
    fail_position_reads: AtomicU32,
    duplicate_rejections: AtomicU32,
}

impl MockExchange {
    fn new(account: Account) -> Arc<Self> {
        Arc::new(Self {
            account,
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
            fail_position_reads: AtomicU32::new(0),
            duplicate_rejections: AtomicU32::new(0),
        })
    }

    fn set_position(&self, size: &str, avg: &str, mark: &str) {
        self.state.lock().unwrap().position = Some(Position {
            symbol: btc(),
            side: Side::Buy,
            size: money(size),
            avg_price: money(avg),
            mark_price: money(mark),
            position_idx: 0,
        });
    }

    fn clear_position(&self) {
        self.state.lock().unwrap().position = None;
    }

    fn add_open_order(&self, order: Order) {
        self.state.lock().unwrap().open_orders.push(order);
    }

    /// Record a fill of one entry leg in order history.
    fn fill_entry(&self, link_id: &str, order_id: &str, qty: &str, price: &str) {
        self.state.lock().unwrap().history.push(Order {
            order_id: order_id.to_string(),
            order_link_id: link_id.to_string(),
            symbol: btc(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            status: OrderStatus::Filled,
            qty: money(qty),
            price: Some(money(price)),
            trigger_price: None,
            stop_order_type: None,
            reduce_only: false,
            close_on_trigger: false,
            cum_exec_qty: money(qty),
            avg_fill_price: Some(money(price)),
            updated_at: Utc::now(),
        });
    }

    /// Simulate a TP rung filling: the resting order leaves the book and
    /// shows up in history as filled.
    fn fill_tp(&self, index: u8) {
        let mut state = self.state.lock().unwrap();
        let position = state
            .open_orders
            .iter()
            .position(|o| {
                classify_link_id(&o.order_link_id)
                    .map(|id| id.kind == OrderKind::TakeProfit && id.index == Some(index))
                    .unwrap_or(false)
            })
            .unwrap_or_else(|| panic!("no TP{} resting on the mock book", index));
        let mut order = state.open_orders.remove(position);
        order.status = OrderStatus::Filled;
        order.cum_exec_qty = order.qty;
        order.avg_fill_price = order.price;
        state.history.push(order);
    }

    /// Simulate the stop-loss triggering and filling.
    fn fill_sl(&self) {
        let mut state = self.state.lock().unwrap();
        let position = state
            .open_orders
            .iter()
            .position(|o| {
                classify_link_id(&o.order_link_id)
                    .map(|id| id.kind == OrderKind::StopLoss)
                    .unwrap_or(false)
            })
            .expect("no SL resting on the mock book");
        let mut order = state.open_orders.remove(position);
        order.status = OrderStatus::Filled;
        order.cum_exec_qty = order.qty;
        state.history.push(order);
    }

    fn open_tp_qtys(&self) -> Vec<(u8, Money)> {
        let state = self.state.lock().unwrap();
        let mut tps: Vec<(u8, Money)> = state
            .open_orders
            .iter()
            .filter_map(|o| {
                classify_link_id(&o.order_link_id).and_then(|id| {
                    (id.kind == OrderKind::TakeProfit).then_some((id.index.unwrap_or(0), o.qty))
                })
            })
            .collect();
        tps.sort();
        tps
    }

    fn open_sl(&self) -> Option<(Money, Money)> {
        let state = self.state.lock().unwrap();
        state
            .open_orders
            .iter()
            .find(|o| {
                classify_link_id(&o.order_link_id)
                    .map(|id| id.kind == OrderKind::StopLoss)
                    .unwrap_or(false)
            })
            .map(|o| (o.qty, o.trigger_price.expect("SL has trigger")))
    }

    fn open_order_count(&self) -> usize {
        self.state.lock().unwrap().open_orders.len()
    }

    fn placed_link_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .placed
            .iter()
            .map(|p| p.order_link_id.clone())
            .collect()
    }

    fn exchange_writes(&self) -> usize {
        self.state.lock().unwrap().placed.len()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    fn account(&self) -> Account {
        self.account
    }

    async fn get_all_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        if self.fail_position_reads.load(Ordering::SeqCst) > 0 {
            self.fail_position_reads.fetch_sub(1, Ordering::SeqCst);
            return Err(ExchangeError::Transient("simulated 503".into()));
        }
        Ok(self.state.lock().unwrap().position.clone().into_iter().collect())
    }

    async fn get_all_open_orders(&self) -> Result<Vec<Order>, ExchangeError> {
        Ok(self.state.lock().unwrap().open_orders.clone())
    }

    async fn get_order_history(
        &self,
        symbol: &Symbol,
        _since: DateTime<Utc>,
    ) -> Result<Vec<Order>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|o| &o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn place_order(&self, params: &OrderParams) -> Result<PlacedOrder, ExchangeError> {
        if self.duplicate_rejections.load(Ordering::SeqCst) > 0 {
            self.duplicate_rejections.fetch_sub(1, Ordering::SeqCst);
            return Err(ExchangeError::DuplicateLinkId(
                "OrderLinkedID is duplicate".into(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let order_id = format!("mock-{}", id);
        let mut state = self.state.lock().unwrap();
        state.placed.push(params.clone());
        state.open_orders.push(Order {
            order_id: order_id.clone(),
            order_link_id: params.order_link_id.clone(),
            symbol: params.symbol.clone(),
            side: params.side,
            order_type: params.order_type,
            status: if params.trigger_price.is_some() {
                OrderStatus::Untriggered
            } else {
                OrderStatus::New
            },
            qty: params.qty,
            price: params.price,
            trigger_price: params.trigger_price,
            stop_order_type: params.stop_order_type,
            reduce_only: params.reduce_only,
            close_on_trigger: params.close_on_trigger,
            cum_exec_qty: Money::ZERO,
            avg_fill_price: None,
            updated_at: Utc::now(),
        });
        Ok(PlacedOrder {
            order_id,
            order_link_id: params.order_link_id.clone(),
        })
    }

    async fn amend_order(&self, _params: &AmendParams) -> Result<PlacedOrder, ExchangeError> {
        Err(ExchangeError::Fatal {
            code: 0,
            message: "amend not scripted".into(),
        })
    }

    async fn cancel_order(
        &self,
        _symbol: &Symbol,
        reference: &OrderRef,
    ) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        let before = state.open_orders.len();
        state.open_orders.retain(|o| match reference {
            OrderRef::ById(id) => &o.order_id != id,
            OrderRef::ByLinkId(id) => &o.order_link_id != id,
        });
        if state.open_orders.len() == before {
            return Err(ExchangeError::AlreadyGone("order not exists".into()));
        }
        Ok(())
    }

    async fn get_instrument_info(&self, symbol: &Symbol) -> Result<InstrumentInfo, ExchangeError> {
        Ok(InstrumentInfo {
            symbol: symbol.clone(),
            qty_step: money("0.001"),
            min_qty: money("0.001"),
            tick_size: money("0.5"),
            price_scale: 2,
        })
    }
}

struct Harness {
    engine: Arc<Engine>,
    main: Arc<MockExchange>,
    mirror: Option<Arc<MockExchange>>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    _dir: TempDir,
}

impl Harness {
    fn new(mirror_enabled: bool, adopt_orphans: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let config = Config {
            enhanced_tp_sl_enabled: true,
            mirror_enabled,
            adopt_orphan_positions: adopt_orphans,
            // Tests script the exchange between passes; never reuse a view.
            cache_default_ttl: std::time::Duration::ZERO,
            persistence_path: dir.path().join("monitors.json"),
            ..Config::default()
        };

        let main = MockExchange::new(Account::Main);
        let mirror = mirror_enabled.then(|| MockExchange::new(Account::Mirror));

        let (tx, events) = mpsc::unbounded_channel();
        let engine = Arc::new(Engine::new(
            Arc::new(config),
            Arc::clone(&main) as Arc<dyn ExchangeApi>,
            mirror
                .as_ref()
                .map(|m| Arc::clone(m) as Arc<dyn ExchangeApi>),
            EventSender::new(tx, Some(777)),
            Vec::new(),
        ));

        Harness {
            engine,
            main,
            mirror,
            events,
            _dir: dir,
        }
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn event_names(&mut self) -> Vec<&'static str> {
        self.drain_events().iter().map(|e| e.kind.name()).collect()
    }

    async fn pass(&self, key: &str) -> PassOutcome {
        self.engine.run_monitor_pass(key).await.expect("pass failed")
    }

    async fn phase_of(&self, key: &str) -> Option<Phase> {
        self.engine
            .list_monitors()
            .await
            .into_iter()
            .find(|s| s.key == key)
            .map(|s| s.phase)
    }
}

fn conservative_spec(mirror: bool, mirror_entries: Vec<EntryLeg>) -> TradeSpec {
    TradeSpec {
        symbol: btc(),
        side: Side::Buy,
        leverage: 10,
        margin: money("1800"),
        entries: vec![
            EntryLeg {
                order_type: OrderType::Market,
                qty: money("0.100"),
                price: None,
                order_id: "entry-mkt".into(),
                order_link_id: "BOT_ENTRY1_BTCUSDT_1700000000000_mkt1".into(),
            },
            EntryLeg {
                order_type: OrderType::Limit,
                qty: money("0.100"),
                price: Some(money("60000")),
                order_id: "entry-lim1".into(),
                order_link_id: "BOT_ENTRY2_BTCUSDT_1700000000000_lim1".into(),
            },
            EntryLeg {
                order_type: OrderType::Limit,
                qty: money("0.100"),
                price: Some(money("60000")),
                order_id: "entry-lim2".into(),
                order_link_id: "BOT_ENTRY3_BTCUSDT_1700000000000_lim2".into(),
            },
        ],
        take_profits: [
            money("61200"),
            money("61500"),
            money("61800"),
            money("62400"),
        ],
        stop_loss: money("58800"),
        chat_id: Some(42),
        mirror,
        mirror_entries,
    }
}

// =============================================================================
// Scenario A: full conservative lifecycle on the primary account
// =============================================================================

#[tokio::test]
async fn full_conservative_lifecycle() {
    let mut h = Harness::new(false, false);
    let key = h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();
    assert_eq!(key, "BTCUSDT_Buy_main");

    // 1. Market leg fills: 0.100 at 60000.
    h.main.set_position("0.100", "60000", "60000");
    assert_eq!(h.pass(&key).await, PassOutcome::Activity);

    assert_eq!(h.phase_of(&key).await, Some(Phase::Monitoring));
    assert_eq!(
        h.main.open_tp_qtys(),
        vec![
            (1, money("0.085")),
            (2, money("0.005")),
            (3, money("0.005")),
            (4, money("0.005")),
        ]
    );
    assert_eq!(h.main.open_sl(), Some((money("0.300"), money("58800"))));
    let names = h.event_names();
    assert!(names.contains(&"EntryFilled"));
    assert!(names.contains(&"RebalanceDone"));

    // 2. First limit fills: size 0.200, TPs scale, SL stays at target.
    h.main
        .fill_entry("BOT_ENTRY2_BTCUSDT_1700000000000_lim1", "entry-lim1", "0.100", "60000");
    h.main.set_position("0.200", "60000", "60200");
    h.pass(&key).await;
    assert_eq!(
        h.main.open_tp_qtys(),
        vec![
            (1, money("0.170")),
            (2, money("0.010")),
            (3, money("0.010")),
            (4, money("0.010")),
        ]
    );
    assert_eq!(h.main.open_sl(), Some((money("0.300"), money("58800"))));

    // 3. Second limit fills: full target size.
    h.main
        .fill_entry("BOT_ENTRY3_BTCUSDT_1700000000000_lim2", "entry-lim2", "0.100", "60000");
    h.main.set_position("0.300", "60000", "60400");
    h.pass(&key).await;
    assert_eq!(
        h.main.open_tp_qtys(),
        vec![
            (1, money("0.255")),
            (2, money("0.015")),
            (3, money("0.015")),
            (4, money("0.015")),
        ]
    );
    assert_eq!(h.main.open_sl(), Some((money("0.300"), money("58800"))));
    let snapshot = h.engine.list_monitors().await;
    assert_eq!(snapshot[0].limit_fills_count, 2);
    assert_eq!(snapshot[0].avg_entry_price, money("60000"));
    h.drain_events();

    // 4. TP1 fills 0.255: breakeven stop, phase change.
    h.main.fill_tp(1);
    h.main.set_position("0.045", "60000", "61250");
    h.pass(&key).await;

    assert_eq!(h.phase_of(&key).await, Some(Phase::ProfitTaking));
    // 60000 * (1 + 0.0006*2 + 0.0002) = 60084.0
    assert_eq!(h.main.open_sl(), Some((money("0.045"), money("60084.0"))));
    let names = h.event_names();
    assert!(names.contains(&"TPHit"));
    assert!(names.contains(&"SLMovedToBreakeven"));
    assert!(names.contains(&"LimitsCancelledOnTP1"));

    // 5-6. TP2 and TP3 fill; SL tracks the remaining size.
    h.main.fill_tp(2);
    h.main.set_position("0.030", "60000", "61550");
    h.pass(&key).await;
    assert_eq!(h.main.open_sl(), Some((money("0.030"), money("60084.0"))));

    h.main.fill_tp(3);
    h.main.set_position("0.015", "60000", "61850");
    h.pass(&key).await;
    assert_eq!(h.main.open_sl(), Some((money("0.015"), money("60084.0"))));

    // 7. TP4 fills: position gone; closure confirms over two passes.
    h.main.fill_tp(4);
    h.main.clear_position();
    assert_eq!(h.pass(&key).await, PassOutcome::Activity);
    assert!(h.phase_of(&key).await.is_some(), "one confirmation is not closure");

    assert_eq!(h.pass(&key).await, PassOutcome::Removed);
    assert!(h.engine.list_monitors().await.is_empty());
    assert_eq!(h.main.open_order_count(), 0, "tear-down left orders behind");

    let events = h.drain_events();
    let closed = events
        .iter()
        .find(|e| e.kind.name() == "PositionClosed")
        .expect("closure event");
    match &closed.kind {
        EngineEventKind::PositionClosed { pnl } => {
            // 1200*0.255 + 1500*0.015 + 1800*0.015 + 2400*0.015
            assert_eq!(pnl.gross, money("391.5"));
            assert!(pnl.net < pnl.gross);
        }
        other => panic!("unexpected kind {:?}", other),
    }

    // Counters persisted as a win.
    let stored = h.engine.store().load().unwrap();
    assert_eq!(stored.counters.stats_total_trades, 1);
    assert_eq!(stored.counters.stats_total_wins, 1);
}

// =============================================================================
// Scenario C: external partial close is never a TP1 fill
// =============================================================================

#[tokio::test]
async fn external_partial_close_guard() {
    let mut h = Harness::new(false, false);
    let key = h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();

    h.main.set_position("0.100", "60000", "60000");
    h.pass(&key).await;
    h.drain_events();

    // User manually halves the position; no TP order filled.
    h.main.set_position("0.050", "60000", "60000");
    h.pass(&key).await;

    let events = h.drain_events();
    assert!(
        !events.iter().any(|e| matches!(
            e.kind.name(),
            "TPHit" | "SLMovedToBreakeven" | "LimitsCancelledOnTP1"
        )),
        "external close must not look like TP1"
    );

    let snapshot = &h.engine.list_monitors().await[0];
    assert!(!snapshot.tp1_hit);
    assert_eq!(snapshot.phase, Phase::Monitoring);

    // Ladder and stop rebalanced against what actually remains.
    assert_eq!(
        h.main.open_tp_qtys(),
        vec![
            (1, money("0.042")),
            (2, money("0.002")),
            (3, money("0.002")),
            (4, money("0.004")),
        ]
    );
    // Target shrank by the externally closed 0.050.
    assert_eq!(h.main.open_sl(), Some((money("0.250"), money("58800"))));
}

// =============================================================================
// Scenario D: API flakiness never advances closure
// =============================================================================

#[tokio::test]
async fn closure_requires_consecutive_confirmations() {
    let mut h = Harness::new(false, false);
    let key = h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();

    h.main.set_position("0.100", "60000", "60000");
    h.pass(&key).await;
    h.drain_events();

    // Two transient failures: passes abort, nothing advances.
    h.main.fail_position_reads.store(2, Ordering::SeqCst);
    assert!(h.engine.run_monitor_pass(&key).await.is_err());
    assert!(h.engine.run_monitor_pass(&key).await.is_err());
    assert!(h.phase_of(&key).await.is_some());

    // Valid zero-size reads: first confirms, second closes.
    h.main.clear_position();
    h.pass(&key).await;
    assert!(h.phase_of(&key).await.is_some());
    assert_eq!(h.pass(&key).await, PassOutcome::Removed);
    assert!(h.engine.list_monitors().await.is_empty());
}

// =============================================================================
// Scenario E / P8: duplicate link IDs are regenerated, never reused
// =============================================================================

#[tokio::test]
async fn duplicate_link_id_is_regenerated() {
    let mut h = Harness::new(false, false);
    let key = h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();

    h.main.duplicate_rejections.store(1, Ordering::SeqCst);
    h.main.set_position("0.100", "60000", "60000");
    h.pass(&key).await;

    // All rungs and the stop landed despite the rejection.
    assert_eq!(h.main.open_tp_qtys().len(), 4);
    assert!(h.main.open_sl().is_some());

    let mut links = h.main.placed_link_ids();
    let total = links.len();
    links.sort();
    links.dedup();
    assert_eq!(links.len(), total, "a link ID was reused");
    h.drain_events();
}

// =============================================================================
// Scenario B: mirror TP recovery from open orders
// =============================================================================

#[tokio::test]
async fn mirror_tp_recovery_from_open_orders() {
    let mut h = Harness::new(true, false);

    // A mirror monitor persisted mid-lifecycle with a lost ladder.
    let mut record = MonitorRecord::new(btc(), Side::Buy, Account::Mirror, money("0.100"), None);
    record.phase = Phase::ProfitTaking;
    record.tp1_hit = true;
    record.filled_tp_count = 1;
    record.avg_entry_price = money("60000");
    record.current_size = money("0.015");
    record.last_known_size = money("0.015");
    record.remaining_size = money("0.015");
    record.sl_order = Some(SlOrder {
        trigger_price: money("60084"),
        qty: money("0.015"),
        order_id: "mir-sl".into(),
        order_link_id: "MIR_SL1_BTCUSDT_1700000000000_slsl".into(),
        breakeven_applied: true,
    });

    let store = PersistenceStore::new(
        h.engine.config().persistence_path.clone(),
        3,
        std::time::Duration::from_secs(900),
    );
    let mut snapshot = EngineSnapshot::default();
    snapshot.monitors.insert(record.key_string(), record);
    store.commit(snapshot, true);
    assert_eq!(h.engine.load_state().await.unwrap(), 1);

    // The mirror book still carries the three remaining reduce-only limits
    // plus the stop.
    let mirror = h.mirror.as_ref().unwrap();
    mirror.set_position("0.015", "60000", "61000");
    for (order_id, price) in [("mr-b", "61800"), ("mr-a", "61500"), ("mr-c", "62400")] {
        mirror.add_open_order(Order {
            order_id: order_id.into(),
            order_link_id: String::new(),
            symbol: btc(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            status: OrderStatus::New,
            qty: money("0.005"),
            price: Some(money(price)),
            trigger_price: None,
            stop_order_type: None,
            reduce_only: true,
            close_on_trigger: false,
            cum_exec_qty: Money::ZERO,
            avg_fill_price: None,
            updated_at: Utc::now(),
        });
    }
    mirror.add_open_order(Order {
        order_id: "mir-sl".into(),
        order_link_id: "MIR_SL1_BTCUSDT_1700000000000_slsl".into(),
        symbol: btc(),
        side: Side::Sell,
        order_type: OrderType::Market,
        status: OrderStatus::Untriggered,
        qty: money("0.015"),
        price: None,
        trigger_price: Some(money("60084")),
        stop_order_type: Some(tpsl_engine::bybit::StopOrderType::StopLoss),
        reduce_only: true,
        close_on_trigger: true,
        cum_exec_qty: Money::ZERO,
        avg_fill_price: None,
        updated_at: Utc::now(),
    });

    let key = "BTCUSDT_Buy_mirror";
    assert_eq!(h.pass(key).await, PassOutcome::Activity);

    // Recovered descriptors persisted: TP2..TP4 in ascending price order.
    let stored = h.engine.store().load().unwrap();
    let stored_record = stored.monitors.get(key).expect("mirror record persisted");
    let indices: Vec<u8> = stored_record.tp_orders.keys().copied().collect();
    assert_eq!(indices, vec![2, 3, 4]);
    assert_eq!(
        stored_record.tp_orders.get(&2).unwrap().trigger_price,
        money("61500")
    );
    assert_eq!(
        stored_record.tp_orders.get(&4).unwrap().trigger_price,
        money("62400")
    );
    assert!(stored_record.tp_orders.values().all(|tp| tp.is_armed()));
    h.drain_events();
}

// =============================================================================
// Scenario F: limit-fill count synchronization is display-only
// =============================================================================

#[tokio::test]
async fn limit_fill_count_sync_is_display_only() {
    let mirror_entries = vec![
        EntryLeg {
            order_type: OrderType::Market,
            qty: money("0.050"),
            price: None,
            order_id: "mir-mkt".into(),
            order_link_id: "MIR_ENTRY1_BTCUSDT_1700000000000_mkt1".into(),
        },
        EntryLeg {
            order_type: OrderType::Limit,
            qty: money("0.050"),
            price: Some(money("60000")),
            order_id: "mir-lim1".into(),
            order_link_id: "MIR_ENTRY2_BTCUSDT_1700000000000_lim1".into(),
        },
    ];
    let mut h = Harness::new(true, false);
    h.engine
        .place_trade(conservative_spec(true, mirror_entries))
        .await
        .unwrap();

    let main_key = "BTCUSDT_Buy_main";
    let mirror_key = "BTCUSDT_Buy_mirror";
    let mirror = Arc::clone(h.mirror.as_ref().unwrap());

    // Main account: market plus both limits fill -> limit_fills_count = 2.
    h.main.set_position("0.100", "60000", "60000");
    h.pass(main_key).await;
    h.main
        .fill_entry("BOT_ENTRY2_BTCUSDT_1700000000000_lim1", "entry-lim1", "0.100", "60000");
    h.main.set_position("0.200", "60000", "60000");
    h.pass(main_key).await;
    h.main
        .fill_entry("BOT_ENTRY3_BTCUSDT_1700000000000_lim2", "entry-lim2", "0.100", "60000");
    h.main.set_position("0.300", "60000", "60000");
    h.pass(main_key).await;

    // Mirror account: market plus one limit -> limit_fills_count = 1.
    mirror.set_position("0.050", "60000", "60000");
    h.pass(mirror_key).await;
    h.drain_events();

    mirror.fill_entry("MIR_ENTRY2_BTCUSDT_1700000000000_lim1", "mir-lim1", "0.050", "60000");
    mirror.set_position("0.100", "60000", "60000");
    h.pass(mirror_key).await;

    let events = h.drain_events();
    let mirror_fill = events
        .iter()
        .find(|e| e.monitor_key == mirror_key && e.kind.name() == "EntryFilled")
        .expect("mirror entry fill event");
    match &mirror_fill.kind {
        EngineEventKind::EntryFilled {
            limit_fills_count, ..
        } => assert_eq!(*limit_fills_count, 2, "event reports max across accounts"),
        other => panic!("unexpected kind {:?}", other),
    }

    // Records keep per-account truth.
    let snapshots = h.engine.list_monitors().await;
    let main_record = snapshots.iter().find(|s| s.key == main_key).unwrap();
    let mirror_record = snapshots.iter().find(|s| s.key == mirror_key).unwrap();
    assert_eq!(main_record.limit_fills_count, 2);
    assert_eq!(mirror_record.limit_fills_count, 1);
}

// =============================================================================
// Stop-loss fill closes in one confirmed pass
// =============================================================================

#[tokio::test]
async fn stop_loss_fill_emits_sl_hit_and_closes() {
    let mut h = Harness::new(false, false);
    let key = h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();

    h.main.set_position("0.100", "60000", "60000");
    h.pass(&key).await;
    h.main.fill_tp(1);
    h.main.set_position("0.015", "60000", "61250");
    h.pass(&key).await;
    assert_eq!(h.phase_of(&key).await, Some(Phase::ProfitTaking));
    h.drain_events();

    // The breakeven stop triggers and takes the rest.
    h.main.fill_sl();
    h.main.clear_position();
    assert_eq!(h.pass(&key).await, PassOutcome::Removed);

    let events = h.drain_events();
    let names: Vec<&str> = events.iter().map(|e| e.kind.name()).collect();
    assert!(names.contains(&"SLHit"));
    assert!(names.contains(&"PositionClosed"));
    assert_eq!(h.main.open_order_count(), 0);
}

// =============================================================================
// P10: a pass over an unchanged snapshot writes nothing
// =============================================================================

#[tokio::test]
async fn idle_pass_is_idempotent() {
    let mut h = Harness::new(false, false);
    let key = h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();

    h.main.set_position("0.100", "60000", "60000");
    h.pass(&key).await;
    h.drain_events();

    let writes_before = h.main.exchange_writes();
    let tps_before = h.main.open_tp_qtys();

    assert_eq!(h.pass(&key).await, PassOutcome::Idle);
    assert_eq!(h.pass(&key).await, PassOutcome::Idle);

    assert_eq!(h.main.exchange_writes(), writes_before);
    assert_eq!(h.main.open_tp_qtys(), tps_before);
    assert!(h.drain_events().is_empty());
}

// =============================================================================
// P9: persisted records reload semantically identical
// =============================================================================

#[tokio::test]
async fn snapshot_round_trip_preserves_records() {
    let h = Harness::new(false, false);
    let key = h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();

    h.main.set_position("0.100", "60000", "60000");
    h.pass(&key).await;
    h.engine.persist(true).await;

    let first = h.engine.store().load().unwrap();
    let second = h.engine.store().load().unwrap();
    assert_eq!(first.monitors, second.monitors);

    let record = first.monitors.get(&key).unwrap();
    assert_eq!(record.current_size, money("0.100"));
    assert_eq!(record.last_known_size, money("0.100"));
    assert_eq!(record.phase, Phase::Monitoring);
    assert_eq!(record.fills.len(), 1);
    assert!(record.tp_orders.values().all(|tp| tp.is_armed()));
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn reconciliation_adopts_orphans_when_enabled() {
    let h = Harness::new(false, true);
    h.main.set_position("0.200", "59000", "59500");

    h.engine.reconcile().await;

    let snapshots = h.engine.list_monitors().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].key, "BTCUSDT_Buy_main");
    assert_eq!(snapshots[0].current_size, money("0.200"));
    assert_eq!(snapshots[0].phase, Phase::Monitoring);
}

#[tokio::test]
async fn reconciliation_ignores_orphans_by_default() {
    let h = Harness::new(false, false);
    h.main.set_position("0.200", "59000", "59500");
    h.engine.reconcile().await;
    assert!(h.engine.list_monitors().await.is_empty());
}

#[tokio::test]
async fn reconciliation_schedules_ghost_teardown() {
    let mut h = Harness::new(false, false);
    let key = h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();
    h.main.set_position("0.100", "60000", "60000");
    h.pass(&key).await;
    h.drain_events();

    // Position vanishes; one round is not enough, two schedule tear-down.
    h.main.clear_position();
    h.engine.reconcile().await;
    assert!(h.phase_of(&key).await.is_some());
    h.engine.reconcile().await;

    assert_eq!(h.pass(&key).await, PassOutcome::Removed);
    assert!(h.engine.list_monitors().await.is_empty());
}

// =============================================================================
// Engine API edges
// =============================================================================

#[tokio::test]
async fn duplicate_monitor_is_rejected() {
    let h = Harness::new(false, false);
    h.engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();
    assert!(h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .is_err());
}

#[tokio::test]
async fn close_monitor_tears_down_administratively() {
    let mut h = Harness::new(false, false);
    let key = h
        .engine
        .place_trade(conservative_spec(false, Vec::new()))
        .await
        .unwrap();
    h.main.set_position("0.100", "60000", "60000");
    h.pass(&key).await;
    h.drain_events();

    h.engine.close_monitor(&key).await.unwrap();
    assert!(h.engine.list_monitors().await.is_empty());
    assert_eq!(h.main.open_order_count(), 0);
    let names = h.event_names();
    assert!(names.contains(&"PositionClosed"));
}
