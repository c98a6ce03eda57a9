//! Monitoring engine core
//!
//! Owns the monitor registry, routes exchange calls per account, and runs the
//! monitor pass - the atomic unit of work that reads one position's cached
//! view, classifies the size delta, drives phase transitions, rebalances exit
//! orders, and commits the record. The scheduler (`crate::scheduler`)
//! dispatches passes; external callers use `place_trade`, `close_monitor`,
//! and `list_monitors`.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bybit::{ExchangeApi, Order, OrderType};
use crate::cache::MonitorCache;
use crate::common::RequestLimiter;
use crate::config::Config;
use crate::detector::{detect_size_change, DetectionContext, SizeChange};
use crate::events::{overall_status, EngineEventKind, EventSender};
use crate::linkid::OrderLinkRegistry;
use crate::mirror::{apply_tp_recovery, display_limit_fills};
use crate::monitor::{
    EntryOrder, EntryStatus, MonitorRecord, MonitorSnapshot, SlOrder, TpOrder, TP_PERCENTAGES,
};
use crate::persistence::{Counters, EngineSnapshot, PersistenceStore};
use crate::phase::{
    advance_phase, cancel_unfilled_entry_limits, compute_pnl, move_sl_to_breakeven, tear_down,
};
use crate::rebalance::{
    adjust_sl_quantity, prune_stale_exit_orders, rebalance_take_profits,
};
use crate::types::{Account, InstrumentInfo, Money, Phase, Side, Symbol, Urgency};

/// One entry leg the trade executor already placed and handed over.
#[derive(Debug, Clone)]
pub struct EntryLeg {
    pub order_type: OrderType,
    pub qty: Money,
    pub price: Option<Money>,
    pub order_id: String,
    pub order_link_id: String,
}

/// Input to `place_trade`: the orders the executor placed and the exit plan
/// the engine must maintain.
#[derive(Debug, Clone)]
pub struct TradeSpec {
    pub symbol: Symbol,
    pub side: Side,
    pub leverage: u32,
    pub margin: Money,
    /// One market leg plus up to two limit legs.
    pub entries: Vec<EntryLeg>,
    /// Trigger prices in execution order (TP1 first to be hit).
    pub take_profits: [Money; 4],
    pub stop_loss: Money,
    pub chat_id: Option<i64>,
    pub mirror: bool,
    /// Entry legs the executor placed on the mirror account. Empty with
    /// `mirror = true` seeds a mirror record sized like the main one; the
    /// stale-order validation and TP recovery reconcile it against reality.
    pub mirror_entries: Vec<EntryLeg>,
}

/// What a finished pass did, so the scheduler can reschedule sensibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Idle,
    Activity,
    Removed,
}

pub struct Engine {
    config: Arc<Config>,
    main_exchange: Arc<dyn ExchangeApi>,
    mirror_exchange: Option<Arc<dyn ExchangeApi>>,
    cache: Arc<MonitorCache>,
    store: Arc<PersistenceStore>,
    links: Arc<OrderLinkRegistry>,
    events: EventSender,
    monitors: RwLock<HashMap<String, Arc<Mutex<MonitorRecord>>>>,
    instruments: Mutex<HashMap<Symbol, InstrumentInfo>>,
    counters: StdMutex<Counters>,
    /// Per-account request limiters, raised during execution mode.
    limiters: Vec<Arc<RequestLimiter>>,
    execution_mode: AtomicBool,
    execution_deadline: StdMutex<Option<Instant>>,
    /// Reconciliation: consecutive rounds each monitor's position was absent.
    missing_positions: StdMutex<HashMap<String, u8>>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        main_exchange: Arc<dyn ExchangeApi>,
        mirror_exchange: Option<Arc<dyn ExchangeApi>>,
        events: EventSender,
        limiters: Vec<Arc<RequestLimiter>>,
    ) -> Self {
        let cache = Arc::new(MonitorCache::new(
            config.cache_default_ttl,
            config.cache_execution_ttl,
        ));
        let store = Arc::new(PersistenceStore::new(
            &config.persistence_path,
            config.max_backups,
            config.backup_interval,
        ));
        Self {
            config,
            main_exchange,
            mirror_exchange,
            cache,
            store,
            links: Arc::new(OrderLinkRegistry::new()),
            events,
            monitors: RwLock::new(HashMap::new()),
            instruments: Mutex::new(HashMap::new()),
            counters: StdMutex::new(Counters::default()),
            limiters,
            execution_mode: AtomicBool::new(false),
            execution_deadline: StdMutex::new(None),
            missing_positions: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MonitorCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<PersistenceStore> {
        &self.store
    }

    /// Restore monitors and counters from the snapshot file. Runtime
    /// deadlines restart at "due now".
    pub async fn load_state(&self) -> Result<usize> {
        let snapshot = self.store.load().context("failed to load snapshot")?;
        *self.counters.lock().expect("counters poisoned") = snapshot.counters.clone();

        let mut restored = 0;
        let mut monitors = self.monitors.write().await;
        for (key, mut record) in snapshot.monitors {
            if record.is_closed() {
                continue;
            }
            record.next_due_at = Utc::now();
            for link in record_link_ids(&record) {
                self.links.adopt(&link);
            }
            monitors.insert(key, Arc::new(Mutex::new(record)));
            restored += 1;
        }
        if restored > 0 {
            info!("recovered {} active monitors from snapshot", restored);
        }
        Ok(restored)
    }

    fn exchange_for(&self, account: Account) -> Result<&Arc<dyn ExchangeApi>> {
        match account {
            Account::Main => Ok(&self.main_exchange),
            Account::Mirror => self
                .mirror_exchange
                .as_ref()
                .ok_or_else(|| anyhow!("mirror account is not configured")),
        }
    }

    /// Accounts the engine actively monitors.
    pub fn active_accounts(&self) -> Vec<Account> {
        let mut accounts = vec![Account::Main];
        if self.mirror_exchange.is_some() {
            accounts.push(Account::Mirror);
        }
        accounts
    }

    async fn instrument_info(
        &self,
        account: Account,
        symbol: &Symbol,
    ) -> Result<InstrumentInfo> {
        if let Some(info) = self.instruments.lock().await.get(symbol) {
            return Ok(info.clone());
        }
        let exchange = self.exchange_for(account)?;
        let info = exchange
            .get_instrument_info(symbol)
            .await
            .with_context(|| format!("instrument info for {}", symbol))?;
        self.instruments
            .lock()
            .await
            .insert(symbol.clone(), info.clone());
        Ok(info)
    }

    // ========================================================================
    // External API
    // ========================================================================

    /// Register a freshly executed trade and start monitoring it. Returns
    /// the trade id (the main monitor key).
    pub async fn place_trade(&self, spec: TradeSpec) -> Result<String> {
        if spec.entries.is_empty() {
            bail!("trade spec has no entry orders");
        }
        if spec.entries.len() > 3 {
            bail!("trade spec has more than one market and two limit legs");
        }

        let main_key = self
            .seed_monitor(Account::Main, &spec, &spec.entries)
            .await?;

        if spec.mirror && self.config.mirror_enabled {
            if self.mirror_exchange.is_none() {
                bail!("trade requests mirror but no mirror account is configured");
            }
            let legs = if spec.mirror_entries.is_empty() {
                &spec.entries
            } else {
                &spec.mirror_entries
            };
            self.seed_monitor(Account::Mirror, &spec, legs).await?;
        }

        {
            let mut counters = self.counters.lock().expect("counters poisoned");
            counters.stats_conservative_trades += 1;
        }
        self.persist(true).await;
        Ok(main_key)
    }

    async fn seed_monitor(
        &self,
        account: Account,
        spec: &TradeSpec,
        legs: &[EntryLeg],
    ) -> Result<String> {
        let target_size: Money = legs.iter().map(|leg| leg.qty).sum();
        if !target_size.is_positive() {
            bail!("entry legs sum to zero size");
        }

        let mut record = MonitorRecord::new(
            spec.symbol.clone(),
            spec.side,
            account,
            target_size,
            spec.chat_id,
        );
        record.entry_orders = legs
            .iter()
            .map(|leg| EntryOrder {
                order_id: leg.order_id.clone(),
                order_link_id: leg.order_link_id.clone(),
                order_type: leg.order_type,
                qty: leg.qty,
                price: leg.price,
                status: EntryStatus::Pending,
            })
            .collect();
        for leg in legs {
            self.links.adopt(&leg.order_link_id);
        }

        for (i, (trigger, pct)) in spec
            .take_profits
            .iter()
            .zip(TP_PERCENTAGES.iter())
            .enumerate()
        {
            let index = (i + 1) as u8;
            record.tp_orders.insert(
                index,
                TpOrder {
                    index,
                    tp_percent: Money::from_i64(*pct as i64),
                    trigger_price: *trigger,
                    qty: Money::ZERO,
                    order_id: String::new(),
                    order_link_id: String::new(),
                    filled_qty: Money::ZERO,
                },
            );
        }
        record.sl_order = Some(SlOrder {
            trigger_price: spec.stop_loss,
            qty: Money::ZERO,
            order_id: String::new(),
            order_link_id: String::new(),
            breakeven_applied: false,
        });

        let key = record.key_string();
        let mut monitors = self.monitors.write().await;
        if monitors.contains_key(&key) {
            bail!("monitor {} already exists", key);
        }
        info!(monitor = %key, "monitor created (target size {})", target_size);
        monitors.insert(key.clone(), Arc::new(Mutex::new(record)));
        Ok(key)
    }

    /// Administrative tear-down of one monitor.
    pub async fn close_monitor(&self, key: &str) -> Result<()> {
        let record_arc = self
            .monitors
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no monitor {}", key))?;

        let mut record = record_arc.lock().await;
        let exchange = self.exchange_for(record.account)?.clone();
        let snapshot = self
            .cache
            .read(exchange.as_ref(), self.cache.max_age_for(Urgency::Critical))
            .await;
        let open_orders: Vec<Order> = match &snapshot {
            Ok(s) => s.orders_for(&record.symbol).cloned().collect(),
            Err(_) => Vec::new(),
        };

        tear_down(
            exchange.as_ref(),
            &mut record,
            &open_orders,
            self.config.external_order_protection,
        )
        .await;
        advance_phase(&mut record, Phase::Closed);
        let pnl = compute_pnl(&record, Money::ZERO, self.config.breakeven_fee_rate);
        self.events
            .emit(&record, EngineEventKind::PositionClosed { pnl });
        drop(record);

        self.monitors.write().await.remove(key);
        self.cache
            .invalidate(
                key.parse::<crate::types::MonitorKey>()
                    .map_err(|e| anyhow::anyhow!(e))?
                    .account,
            )
            .await;
        self.persist(true).await;
        info!(monitor = %key, "monitor closed administratively");
        Ok(())
    }

    /// Read-only snapshots for dashboards and the CLI.
    pub async fn list_monitors(&self) -> Vec<MonitorSnapshot> {
        let monitors = self.monitors.read().await;
        let mut snapshots = Vec::with_capacity(monitors.len());
        for record_arc in monitors.values() {
            let record = record_arc.lock().await;
            snapshots.push(MonitorSnapshot::from(&*record));
        }
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub async fn monitor_keys(&self) -> Vec<String> {
        self.monitors.read().await.keys().cloned().collect()
    }

    pub(crate) async fn monitor_arc(&self, key: &str) -> Option<Arc<Mutex<MonitorRecord>>> {
        self.monitors.read().await.get(key).cloned()
    }

    // ========================================================================
    // Execution mode
    // ========================================================================

    /// Toggle execution mode (shorter cache TTLs, more request permits,
    /// wider background intervals). Auto-expires after the configured TTL.
    pub fn set_execution_mode(&self, active: bool) {
        self.execution_mode.store(active, Ordering::Relaxed);
        self.cache.set_execution_mode(active);
        let rate = if active {
            self.config.execution_exchange_requests
        } else {
            self.config.max_exchange_requests
        };
        for limiter in &self.limiters {
            limiter.set_rate(rate);
        }
        *self
            .execution_deadline
            .lock()
            .expect("execution deadline poisoned") = if active {
            Some(Instant::now() + self.config.execution_mode_ttl)
        } else {
            None
        };
        info!("execution mode {}", if active { "on" } else { "off" });
    }

    pub fn execution_mode_active(&self) -> bool {
        self.execution_mode.load(Ordering::Relaxed)
    }

    /// Expire execution mode when its TTL lapses. Called by the scheduler.
    pub fn maintain_execution_mode(&self) {
        let expired = {
            let deadline = self
                .execution_deadline
                .lock()
                .expect("execution deadline poisoned");
            matches!(*deadline, Some(d) if Instant::now() >= d)
        };
        if expired {
            self.set_execution_mode(false);
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Build a snapshot of all records and hand it to the store.
    pub async fn persist(&self, critical: bool) {
        let monitors = self.monitors.read().await;
        let mut snapshot = EngineSnapshot {
            counters: self.counters.lock().expect("counters poisoned").clone(),
            ..EngineSnapshot::default()
        };
        for (key, record_arc) in monitors.iter() {
            let record = record_arc.lock().await;
            snapshot.monitors.insert(key.clone(), record.clone());
        }
        drop(monitors);
        self.store.commit(snapshot, critical);
    }

    pub fn persistence_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    // ========================================================================
    // Monitor pass
    // ========================================================================

    /// Run one monitor pass. Errors abort the pass cleanly; the record is
    /// untouched past the last consistent commit and the scheduler simply
    /// reschedules.
    pub async fn run_monitor_pass(&self, key: &str) -> Result<PassOutcome> {
        let Some(record_arc) = self.monitor_arc(key).await else {
            return Ok(PassOutcome::Idle);
        };
        // Per-monitor mutex: a pass already in flight wins.
        let Ok(mut record) = record_arc.try_lock() else {
            debug!(monitor = %key, "pass skipped; already in flight");
            return Ok(PassOutcome::Idle);
        };
        if record.is_closed() {
            return Ok(PassOutcome::Idle);
        }

        let account = record.account;
        let exchange = self.exchange_for(account)?.clone();
        let exchange = exchange.as_ref();

        // Step 1: refresh the cached view. A failed read is an aborted pass;
        // closure confirmations never advance on API errors.
        let max_age = self.cache.max_age_for(record.urgency);
        let snapshot = self
            .cache
            .read(exchange, max_age)
            .await
            .with_context(|| format!("cache read failed for {}", key))?;

        let symbol = record.symbol.clone();
        let info = self.instrument_info(account, &symbol).await?;
        let position = snapshot.position_for(&symbol, record.side).cloned();
        let open_orders: Vec<Order> = snapshot.orders_for(&record.symbol).cloned().collect();

        let observed_size = position.as_ref().map(|p| p.size).unwrap_or(Money::ZERO);
        let mark_price = position.as_ref().map(|p| p.mark_price).unwrap_or(Money::ZERO);

        // Mirror ladder recovery: a profit-taking mirror monitor with no
        // live TP orders rebuilds its descriptors from the open reduce-only
        // limits before anything else happens this pass.
        let mut recovered = false;
        if record.account == Account::Mirror
            && record.phase == Phase::ProfitTaking
            && observed_size.is_positive()
            && !record.tp_orders.values().any(|tp| tp.is_armed())
        {
            recovered = apply_tp_recovery(&mut record, &open_orders);
        }

        // Step 2: size delta, with order history pulled only when something
        // moved. History failures degrade to "no evidence", which biases
        // the detector toward the safe external-close classification.
        let delta = observed_size - record.last_known_size;
        let history = if delta.is_zero() {
            Vec::new()
        } else {
            let since = record.updated_at - ChronoDuration::minutes(5);
            match exchange.get_order_history(&record.symbol, since).await {
                Ok(history) => history,
                Err(e) => {
                    warn!(monitor = %key, "order history unavailable: {}", e);
                    Vec::new()
                }
            }
        };

        let change = detect_size_change(&DetectionContext {
            record: &*record,
            observed_size,
            mark_price,
            open_orders: open_orders.as_slice(),
            history: history.as_slice(),
            qty_step: info.qty_step,
        });

        let mut activity = recovered;
        let mut sl_exit_qty = Money::ZERO;

        match change {
            SizeChange::Unchanged => {}
            SizeChange::EntryFill {
                qty,
                price,
                filled_limit_links,
            } => {
                self.handle_entry_fill(
                    exchange,
                    &mut record,
                    &info,
                    &open_orders,
                    observed_size,
                    qty,
                    price,
                    &filled_limit_links,
                )
                .await;
                activity = true;
            }
            SizeChange::TpFills { fills } => {
                self.handle_tp_fills(exchange, &mut record, &info, observed_size, &fills)
                    .await;
                activity = true;
            }
            SizeChange::SlFill { qty } => {
                info!(monitor = %key, "stop-loss fill detected ({} closed)", qty);
                sl_exit_qty = qty;
                record.current_size = observed_size;
                record.remaining_size = observed_size;
                if let Some(sl) = record.sl_order.as_ref() {
                    self.events.emit(
                        &record,
                        EngineEventKind::SlHit {
                            qty,
                            trigger_price: sl.trigger_price,
                        },
                    );
                }
                // The SL-missing check already confirmed closure.
                record.closed_confirmations = record.closed_confirmations.max(2);
                activity = true;
            }
            SizeChange::ExternalReduce { qty } => {
                warn!(
                    monitor = %key,
                    "external partial close of {} detected; not a TP fill",
                    qty
                );
                record.current_size = observed_size;
                record.remaining_size = observed_size;
                // The closed portion never comes back: shrink the plan so
                // the stop keeps covering exactly what can still exist.
                record.target_size = (record.target_size - qty).max(observed_size);
                if observed_size.is_positive() {
                    prune_stale_exit_orders(&mut record, &open_orders);
                    let results =
                        rebalance_take_profits(exchange, &self.links, &mut record, &info).await;
                    let sl_adjusted =
                        adjust_sl_quantity(exchange, &self.links, &mut record, &info)
                            .await
                            .unwrap_or(false);
                    self.events.emit(
                        &record,
                        EngineEventKind::RebalanceDone {
                            status: overall_status(&results),
                            per_tp: results,
                            sl_adjusted,
                        },
                    );
                    self.cache.invalidate(account).await;
                }
                record.last_event_ts = Utc::now();
                activity = true;
            }
            SizeChange::UnexpectedIncrease { qty } => {
                warn!(monitor = %key, "position grew by {} outside entry flow", qty);
                record.current_size = observed_size;
                record.remaining_size = observed_size;
                activity = true;
            }
        }

        // Step 6: closure bookkeeping. Two consecutive confirmations guard
        // against a transiently wrong read closing a live monitor.
        let closure_observed =
            position.is_none() || observed_size.is_zero() || record.all_tps_filled();
        if closure_observed {
            record.closed_confirmations = record.closed_confirmations.saturating_add(1).min(2);
        } else {
            record.closed_confirmations = 0;
        }

        let mut removed = false;
        if record.closed_confirmations >= 2 && !record.is_closed() {
            self.finalize_closure(exchange, &mut record, &open_orders, sl_exit_qty)
                .await;
            removed = true;
        }

        // Step 7: commit.
        record.last_known_size = record.current_size;
        record.touch();
        drop(record);

        if removed {
            self.monitors.write().await.remove(key);
            self.persist(true).await;
            return Ok(PassOutcome::Removed);
        }
        self.persist(activity).await;
        Ok(if activity {
            PassOutcome::Activity
        } else {
            PassOutcome::Idle
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_entry_fill(
        &self,
        exchange: &dyn ExchangeApi,
        record: &mut MonitorRecord,
        info: &InstrumentInfo,
        open_orders: &[Order],
        observed_size: Money,
        qty: Money,
        price: Money,
        filled_limit_links: &[String],
    ) {
        record.record_fill(qty, price, Utc::now());
        record.current_size = observed_size;
        record.remaining_size = observed_size;

        // Mark confirmed limit legs; the first fill with no limit evidence
        // is the market leg landing.
        if filled_limit_links.is_empty() {
            if let Some(market_leg) = record
                .entry_orders
                .iter_mut()
                .find(|e| e.order_type == OrderType::Market && e.is_pending())
            {
                market_leg.status = EntryStatus::Filled;
            }
        } else {
            for link in filled_limit_links {
                if let Some(leg) = record
                    .entry_orders
                    .iter_mut()
                    .find(|e| &e.order_link_id == link)
                {
                    leg.status = EntryStatus::Filled;
                }
            }
            record.limit_fills_count += filled_limit_links.len() as u32;
        }

        if record.phase == Phase::Building {
            advance_phase(record, Phase::Monitoring);
        }

        let display_fills = display_limit_fills(
            record.limit_fills_count,
            self.sibling_limit_fills(record).await,
        );
        self.events.emit(
            record,
            EngineEventKind::EntryFilled {
                fill_qty: qty,
                fill_price: price,
                avg_entry_price: record.avg_entry_price,
                current_size: record.current_size,
                limit_fills_count: display_fills,
            },
        );

        // Rebalance the whole exit ladder to the grown position. On the
        // mirror account a lost ladder is first recovered from open orders.
        prune_stale_exit_orders(record, open_orders);
        if record.account == Account::Mirror {
            apply_tp_recovery(record, open_orders);
        }
        let results = rebalance_take_profits(exchange, &self.links, record, info).await;
        let sl_adjusted = adjust_sl_quantity(exchange, &self.links, record, info)
            .await
            .unwrap_or_else(|e| {
                warn!("SL adjust failed: {}", e);
                false
            });
        self.events.emit(
            record,
            EngineEventKind::RebalanceDone {
                status: overall_status(&results),
                per_tp: results,
                sl_adjusted,
            },
        );
        self.cache.invalidate(record.account).await;
        record.last_event_ts = Utc::now();
    }

    async fn handle_tp_fills(
        &self,
        exchange: &dyn ExchangeApi,
        record: &mut MonitorRecord,
        info: &InstrumentInfo,
        observed_size: Money,
        fills: &[crate::detector::TpFillObservation],
    ) {
        record.current_size = observed_size;
        record.remaining_size = observed_size;

        for fill in fills {
            if let Some(tp) = record.tp_orders.get_mut(&fill.index) {
                tp.filled_qty = tp.qty;
            }
            record.filled_tp_count = record.filled_tp_count.saturating_add(1);

            if fill.index == 1 && !record.tp1_hit {
                record.tp1_hit = true;
                advance_phase(record, Phase::ProfitTaking);

                match move_sl_to_breakeven(
                    exchange,
                    &self.links,
                    record,
                    info,
                    self.config.breakeven_fee_rate,
                    self.config.breakeven_safety_margin,
                )
                .await
                {
                    Ok(trigger) => {
                        self.events.emit(
                            record,
                            EngineEventKind::SlMovedToBreakeven {
                                trigger_price: trigger,
                            },
                        );
                    }
                    Err(e) => warn!("breakeven move failed: {}", e),
                }

                if self.config.cancel_limits_on_tp1 && !record.limits_cancelled {
                    let cancelled = cancel_unfilled_entry_limits(exchange, record).await;
                    self.events.emit(
                        record,
                        EngineEventKind::LimitsCancelledOnTp1 { cancelled },
                    );
                }
            } else if fill.index > 1 {
                if let Err(e) =
                    adjust_sl_quantity(exchange, &self.links, record, info).await
                {
                    warn!("SL adjust after TP{} failed: {}", fill.index, e);
                }
            }

            self.events.emit(
                record,
                EngineEventKind::TpHit {
                    index: fill.index,
                    qty: fill.qty,
                    remaining_size: record.current_size,
                },
            );
        }

        self.cache.invalidate(record.account).await;
        record.last_event_ts = Utc::now();
    }

    async fn finalize_closure(
        &self,
        exchange: &dyn ExchangeApi,
        record: &mut MonitorRecord,
        open_orders: &[Order],
        sl_exit_qty: Money,
    ) {
        let swept = tear_down(
            exchange,
            record,
            open_orders,
            self.config.external_order_protection,
        )
        .await;
        advance_phase(record, Phase::Closed);

        let pnl = compute_pnl(record, sl_exit_qty, self.config.breakeven_fee_rate);
        {
            let mut counters = self.counters.lock().expect("counters poisoned");
            counters.stats_total_trades += 1;
            if pnl.net.is_positive() {
                counters.stats_total_wins += 1;
            } else {
                counters.stats_total_losses += 1;
            }
        }
        info!(
            monitor = %record.key_string(),
            "position closed; {} residual orders swept, gross pnl {}",
            swept,
            pnl.gross
        );
        self.events
            .emit(record, EngineEventKind::PositionClosed { pnl });
        self.cache.invalidate(record.account).await;
    }

    /// Per-account fill count of the sibling monitor (other account, same
    /// position), for display-only synchronization.
    async fn sibling_limit_fills(&self, record: &MonitorRecord) -> u32 {
        let sibling_account = match record.account {
            Account::Main => Account::Mirror,
            Account::Mirror => Account::Main,
        };
        let sibling_key = crate::types::MonitorKey::new(
            record.symbol.clone(),
            record.side,
            sibling_account,
        )
        .to_string();

        let Some(sibling_arc) = self.monitor_arc(&sibling_key).await else {
            return 0;
        };
        // The sibling may be mid-pass; its count is display-only, so a
        // non-blocking peek is enough.
        let count = match sibling_arc.try_lock() {
            Ok(sibling) => sibling.limit_fills_count,
            Err(_) => 0,
        };
        count
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Background sweep aligning the monitor set with exchange reality. The
    /// only code path allowed to create records outside `place_trade`.
    pub async fn reconcile(&self) {
        self.check_reload_signal().await;

        for account in self.active_accounts() {
            let Ok(exchange) = self.exchange_for(account) else {
                continue;
            };
            let snapshot = match self
                .cache
                .read(exchange.as_ref(), self.config.cache_default_ttl)
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(account = %account, "reconciliation skipped: {}", e);
                    continue;
                }
            };

            // Orphan positions: open on the exchange, unknown to the engine.
            for position in &snapshot.positions {
                let key = crate::types::MonitorKey::new(
                    position.symbol.clone(),
                    position.side,
                    account,
                )
                .to_string();
                if self.monitor_arc(&key).await.is_some() {
                    continue;
                }
                if !self.config.adopt_orphan_positions {
                    debug!(monitor = %key, "unmanaged position (adoption off)");
                    continue;
                }
                let mut record = MonitorRecord::new(
                    position.symbol.clone(),
                    position.side,
                    account,
                    position.size,
                    None,
                );
                record.current_size = position.size;
                record.last_known_size = position.size;
                record.remaining_size = position.size;
                record.avg_entry_price = position.avg_price;
                record.phase = Phase::Monitoring;
                warn!(monitor = %key, "adopted orphan position of size {}", position.size);
                self.monitors
                    .write()
                    .await
                    .insert(key, Arc::new(Mutex::new(record)));
            }

            // Ghost monitors: a record whose position vanished. Two
            // consecutive rounds force the next pass to finalize tear-down.
            for key in self.monitor_keys().await {
                let Some(record_arc) = self.monitor_arc(&key).await else {
                    continue;
                };
                let Ok(mut record) = record_arc.try_lock() else {
                    continue;
                };
                if record.account != account || record.is_closed() {
                    continue;
                }
                let present = snapshot
                    .position_for(&record.symbol, record.side)
                    .is_some();
                let mut missing = self
                    .missing_positions
                    .lock()
                    .expect("missing positions poisoned");
                if present {
                    missing.remove(&key);
                } else {
                    let rounds = missing.entry(key.clone()).or_insert(0);
                    *rounds += 1;
                    if *rounds >= 2 {
                        warn!(monitor = %key, "position missing for two rounds; scheduling tear-down");
                        record.closed_confirmations = 2;
                        missing.remove(&key);
                    }
                }
            }
        }
    }

    /// Honor a `reload_monitors` signal file next to the snapshot.
    async fn check_reload_signal(&self) {
        let signal = Path::new("reload_monitors");
        if !signal.exists() {
            return;
        }
        info!("reload_monitors signal found; reloading snapshot");
        if let Err(e) = self.load_state().await {
            warn!("snapshot reload failed: {}", e);
        }
        if let Err(e) = std::fs::remove_file(signal) {
            warn!("could not remove reload signal: {}", e);
        }
    }
}

fn record_link_ids(record: &MonitorRecord) -> Vec<String> {
    let mut ids = Vec::new();
    for entry in &record.entry_orders {
        ids.push(entry.order_link_id.clone());
    }
    for tp in record.tp_orders.values() {
        ids.push(tp.order_link_id.clone());
    }
    if let Some(sl) = &record.sl_order {
        ids.push(sl.order_link_id.clone());
    }
    ids.retain(|id| !id.is_empty());
    ids
}
