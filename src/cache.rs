//! Account-scoped monitoring cache
//!
//! Holds one short-TTL snapshot of all positions and all open orders per
//! account. Monitor passes never call the exchange for reads; every read
//! funnels through [`MonitorCache::read`], which refreshes on miss with a
//! single in-flight refresh per account and a minimum-interval guard against
//! refresh storms.
//!
//! TTL policy:
//! - default 15s, shrinking to 5s while execution mode is active
//! - critical monitors bypass the cache once a snapshot is older than 2s
//! - under critical-monitor pressure the TTL for everyone else stretches to
//!   75s so the critical set gets the request budget

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::bybit::{ExchangeApi, Order, Position};
use crate::error::ExchangeError;
use crate::types::{Account, Side, Symbol, Urgency};

/// Snapshot age ceiling for critical monitors.
pub const CRITICAL_MAX_AGE: Duration = Duration::from_secs(2);

/// Stretched TTL applied to non-critical reads under pressure.
pub const EXTENDED_TTL: Duration = Duration::from_secs(75);

/// Number of critical monitors at which the stretched TTL kicks in.
pub const PRESSURE_THRESHOLD: usize = 10;

/// One consistent view of an account: all positions and all open orders,
/// taken in a single refresh.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub fetched_at: Instant,
}

impl AccountSnapshot {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// The open position for one monitor, if any.
    pub fn position_for(&self, symbol: &Symbol, side: Side) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| &p.symbol == symbol && p.side == side)
    }

    /// All open orders for one symbol.
    pub fn orders_for<'a>(&'a self, symbol: &'a Symbol) -> impl Iterator<Item = &'a Order> {
        self.orders.iter().filter(move |o| &o.symbol == symbol)
    }

    /// Look an order up by its client link ID.
    pub fn order_by_link_id(&self, link_id: &str) -> Option<&Order> {
        if link_id.is_empty() {
            return None;
        }
        self.orders.iter().find(|o| o.order_link_id == link_id)
    }
}

#[derive(Debug, Default)]
struct AccountSlot {
    snapshot: Mutex<Option<Arc<AccountSnapshot>>>,
    /// Single-flight guard: at most one refresh per account in flight.
    refresh: Mutex<()>,
}

/// Process-wide cache, one slot per account.
#[derive(Debug)]
pub struct MonitorCache {
    main: AccountSlot,
    mirror: AccountSlot,
    default_ttl: Duration,
    execution_ttl: Duration,
    /// Completed refreshes younger than this are reused by non-bypass reads.
    min_refresh_interval: Duration,
    execution_mode: AtomicBool,
    critical_pressure: AtomicUsize,
}

impl MonitorCache {
    pub fn new(default_ttl: Duration, execution_ttl: Duration) -> Self {
        Self {
            main: AccountSlot::default(),
            mirror: AccountSlot::default(),
            default_ttl,
            execution_ttl,
            min_refresh_interval: default_ttl,
            execution_mode: AtomicBool::new(false),
            critical_pressure: AtomicUsize::new(0),
        }
    }

    fn slot(&self, account: Account) -> &AccountSlot {
        match account {
            Account::Main => &self.main,
            Account::Mirror => &self.mirror,
        }
    }

    /// Toggled by the engine when the trade executor is placing a position.
    pub fn set_execution_mode(&self, active: bool) {
        self.execution_mode.store(active, Ordering::Relaxed);
    }

    /// Updated by the scheduler each tick with the current CRITICAL count.
    pub fn set_critical_pressure(&self, count: usize) {
        self.critical_pressure.store(count, Ordering::Relaxed);
    }

    /// Maximum acceptable snapshot age for a read on behalf of a monitor
    /// with the given urgency.
    pub fn max_age_for(&self, urgency: Urgency) -> Duration {
        if urgency == Urgency::Critical {
            return CRITICAL_MAX_AGE;
        }
        if self.critical_pressure.load(Ordering::Relaxed) > PRESSURE_THRESHOLD {
            return EXTENDED_TTL;
        }
        if self.execution_mode.load(Ordering::Relaxed) {
            return self.execution_ttl;
        }
        self.default_ttl
    }

    /// Read the snapshot for an account, refreshing it if older than
    /// `max_age`. Concurrent readers share one refresh.
    pub async fn read(
        &self,
        exchange: &dyn ExchangeApi,
        max_age: Duration,
    ) -> Result<Arc<AccountSnapshot>, ExchangeError> {
        let account = exchange.account();
        let slot = self.slot(account);

        if let Some(snapshot) = slot.snapshot.lock().await.as_ref() {
            if snapshot.age() <= max_age {
                return Ok(Arc::clone(snapshot));
            }
        }

        let _refresh_guard = slot.refresh.lock().await;

        // Someone else may have refreshed while we waited for the guard.
        // Bypass reads (max_age below the storm guard) insist on their own
        // freshness; everyone else reuses any refresh younger than the guard.
        if let Some(snapshot) = slot.snapshot.lock().await.as_ref() {
            let horizon = if max_age < self.min_refresh_interval {
                max_age
            } else {
                max_age.max(self.min_refresh_interval)
            };
            if snapshot.age() <= horizon {
                return Ok(Arc::clone(snapshot));
            }
        }

        debug!(account = %account, "cache refresh");
        let positions = exchange.get_all_positions().await?;
        let orders = exchange.get_all_open_orders().await?;

        let snapshot = Arc::new(AccountSnapshot {
            positions,
            orders,
            fetched_at: Instant::now(),
        });
        *slot.snapshot.lock().await = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Drop the snapshot for an account so the next read refreshes. Called
    /// after the engine mutates orders on the exchange.
    pub async fn invalidate(&self, account: Account) {
        *self.slot(account).snapshot.lock().await = None;
    }

    /// Current snapshot without refreshing, whatever its age. The scheduler
    /// uses this for urgency classification, which must never trigger I/O.
    pub async fn peek(&self, account: Account) -> Option<Arc<AccountSnapshot>> {
        self.slot(account).snapshot.lock().await.clone()
    }
}
