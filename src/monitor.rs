//! Per-position monitor record
//!
//! One record exists per `{symbol, side, account}` and is the single source
//! of truth for that position's exit-order set and lifecycle phase. Records
//! are created by `place_trade`, mutated only by the scheduler-held monitor
//! pass, and destroyed at tear-down. Everything here is serializable;
//! runtime handles (mutexes, timers) live in the engine's registry and are
//! rebuilt on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bybit::OrderType;
use crate::types::{Account, Money, MonitorKey, Phase, Side, Symbol, Urgency};

/// Exit ladder percentages for the conservative approach: TP1 takes 85% of
/// the position, TP2-TP4 take 5% each.
pub const TP_PERCENTAGES: [u32; 4] = [85, 5, 5, 5];

/// Number of take-profit rungs.
pub const TP_COUNT: u8 = 4;

/// Entry strategy. Conservative (gradual market + limit entry with a four-rung
/// TP ladder) is the only approach in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Approach {
    #[default]
    Conservative,
}

/// Lifecycle of one entry leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntryStatus {
    #[default]
    Pending,
    Filled,
    Cancelled,
}

/// One entry-side order (market leg or limit leg).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOrder {
    pub order_id: String,
    pub order_link_id: String,
    pub order_type: OrderType,
    pub qty: Money,
    pub price: Option<Money>,
    #[serde(default)]
    pub status: EntryStatus,
}

impl EntryOrder {
    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }
}

/// One take-profit rung descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpOrder {
    pub index: u8,
    /// Share of `current_size` this rung exits, in percent.
    pub tp_percent: Money,
    pub trigger_price: Money,
    pub qty: Money,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    #[serde(default)]
    pub filled_qty: Money,
}

impl TpOrder {
    /// Whether an exchange order is believed to back this descriptor.
    pub fn is_armed(&self) -> bool {
        !self.order_id.is_empty() || !self.order_link_id.is_empty()
    }
}

/// The stop-loss descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlOrder {
    pub trigger_price: Money,
    pub qty: Money,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    #[serde(default)]
    pub breakeven_applied: bool,
}

/// One observed entry-side fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    pub qty: Money,
    pub price: Money,
    pub ts: DateTime<Utc>,
}

/// Per-position state container. See module docs for ownership rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorRecord {
    pub symbol: Symbol,
    pub side: Side,
    pub account: Account,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub approach: Approach,

    /// Planned full size if every entry leg fills.
    pub target_size: Money,
    /// Latest observed position size.
    #[serde(default)]
    pub current_size: Money,
    /// Size at the previous monitoring pass; the delta source.
    #[serde(default)]
    pub last_known_size: Money,
    /// Position size still exposed.
    #[serde(default)]
    pub remaining_size: Money,
    #[serde(default)]
    pub avg_entry_price: Money,
    #[serde(default)]
    pub fills: Vec<FillRecord>,

    #[serde(default)]
    pub entry_orders: Vec<EntryOrder>,
    #[serde(default)]
    pub tp_orders: BTreeMap<u8, TpOrder>,
    #[serde(default)]
    pub sl_order: Option<SlOrder>,

    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub tp1_hit: bool,
    #[serde(default)]
    pub limits_cancelled: bool,
    #[serde(default)]
    pub sl_moved_to_be: bool,
    #[serde(default)]
    pub filled_tp_count: u8,
    /// Entry-limit fills observed on this account. Event payloads report the
    /// max across accounts; this field keeps per-account truth.
    #[serde(default)]
    pub limit_fills_count: u32,

    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default = "Utc::now")]
    pub next_due_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_event_ts: DateTime<Utc>,
    /// Consecutive passes that observed size zero (or a missing position).
    #[serde(default)]
    pub closed_confirmations: u8,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl MonitorRecord {
    pub fn new(
        symbol: Symbol,
        side: Side,
        account: Account,
        target_size: Money,
        chat_id: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        MonitorRecord {
            symbol,
            side,
            account,
            chat_id,
            approach: Approach::Conservative,
            target_size,
            current_size: Money::ZERO,
            last_known_size: Money::ZERO,
            remaining_size: Money::ZERO,
            avg_entry_price: Money::ZERO,
            fills: Vec::new(),
            entry_orders: Vec::new(),
            tp_orders: BTreeMap::new(),
            sl_order: None,
            phase: Phase::Building,
            tp1_hit: false,
            limits_cancelled: false,
            sl_moved_to_be: false,
            filled_tp_count: 0,
            limit_fills_count: 0,
            urgency: Urgency::Building,
            next_due_at: now,
            last_event_ts: now,
            closed_confirmations: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> MonitorKey {
        MonitorKey::new(self.symbol.clone(), self.side, self.account)
    }

    pub fn key_string(&self) -> String {
        self.key().to_string()
    }

    /// Record an entry-side fill and recompute the weighted average entry.
    pub fn record_fill(&mut self, qty: Money, price: Money, ts: DateTime<Utc>) {
        self.fills.push(FillRecord { qty, price, ts });
        let total_qty: Money = self.fills.iter().map(|f| f.qty).sum();
        let weighted: Money = self.fills.iter().map(|f| f.qty * f.price).sum();
        self.avg_entry_price = weighted / total_qty;
        self.last_event_ts = ts;
    }

    /// Quantity of entry limits still resting (could still grow the
    /// position).
    pub fn pending_entry_qty(&self) -> Money {
        self.entry_orders
            .iter()
            .filter(|e| e.is_pending() && e.order_type == OrderType::Limit)
            .map(|e| e.qty)
            .sum()
    }

    /// Sum of quantities across all armed TP rungs.
    pub fn tp_qty_sum(&self) -> Money {
        self.tp_orders.values().map(|tp| tp.qty).sum()
    }

    /// Relative distance from the mark price to the nearest exit trigger.
    /// Used for urgency classification; `None` when no exits are armed or
    /// the mark is unknown.
    pub fn nearest_trigger_distance(&self, mark: Money) -> Option<Money> {
        if !mark.is_positive() {
            return None;
        }
        let mut nearest: Option<Money> = None;
        for tp in self.tp_orders.values() {
            if tp.is_armed() {
                let d = mark.abs_diff(tp.trigger_price);
                nearest = Some(nearest.map_or(d, |n| n.min(d)));
            }
        }
        if let Some(sl) = &self.sl_order {
            let d = mark.abs_diff(sl.trigger_price);
            nearest = Some(nearest.map_or(d, |n| n.min(d)));
        }
        nearest.map(|d| d / mark)
    }

    /// All TP rungs filled.
    pub fn all_tps_filled(&self) -> bool {
        self.filled_tp_count >= TP_COUNT
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Read-only view handed to external callers; the record itself never leaves
/// the engine.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub key: String,
    pub symbol: Symbol,
    pub side: Side,
    pub account: Account,
    pub phase: Phase,
    pub urgency: Urgency,
    pub current_size: Money,
    pub target_size: Money,
    pub avg_entry_price: Money,
    pub tp1_hit: bool,
    pub sl_moved_to_be: bool,
    pub filled_tp_count: u8,
    pub limit_fills_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<&MonitorRecord> for MonitorSnapshot {
    fn from(record: &MonitorRecord) -> Self {
        MonitorSnapshot {
            key: record.key_string(),
            symbol: record.symbol.clone(),
            side: record.side,
            account: record.account,
            phase: record.phase,
            urgency: record.urgency,
            current_size: record.current_size,
            target_size: record.target_size,
            avg_entry_price: record.avg_entry_price,
            tp1_hit: record.tp1_hit,
            sl_moved_to_be: record.sl_moved_to_be,
            filled_tp_count: record.filled_tp_count,
            limit_fills_count: record.limit_fills_count,
            updated_at: record.updated_at,
        }
    }
}
