//! Fill detection by position-size delta
//!
//! The engine never consumes order-fill events; it diffs the observed
//! position size against the last known size and infers what happened from
//! the monitor's own order ladder, the open-orders view, and recent order
//! history. Classification is pure so every branch is unit-testable.
//!
//! A size decrease while the position is still building is only accepted as
//! a TP fill when order history confirms one; otherwise it is an external
//! partial close (a user manually reducing the position must never fake a
//! TP1 hit).

use tracing::debug;

use crate::bybit::Order;
use crate::linkid::{classify_link_id, OrderKind};
use crate::monitor::MonitorRecord;
use crate::types::{Money, Phase};

/// One inferred take-profit fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpFillObservation {
    pub index: u8,
    pub qty: Money,
}

/// What the size delta means for this monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeChange {
    /// No delta beyond one quantity step.
    Unchanged,
    /// Position grew while building: an entry leg filled.
    EntryFill {
        qty: Money,
        price: Money,
        /// Link IDs of entry limit legs confirmed filled by order history.
        filled_limit_links: Vec<String>,
    },
    /// Position shrank along the TP ladder.
    TpFills { fills: Vec<TpFillObservation> },
    /// Position went to zero and the stop-loss left the open-orders view.
    SlFill { qty: Money },
    /// Position shrank in a way the ladder does not explain (manual close,
    /// foreign reduce-only order). Never treated as a TP fill.
    ExternalReduce { qty: Money },
    /// Position grew outside the building phases; logged and left alone.
    UnexpectedIncrease { qty: Money },
}

/// Inputs for one detection: the record plus the consistent exchange view
/// taken at pass start.
pub struct DetectionContext<'a> {
    pub record: &'a MonitorRecord,
    /// Observed position size; zero when the position row is gone.
    pub observed_size: Money,
    pub mark_price: Money,
    /// Open orders for this symbol on this account.
    pub open_orders: &'a [Order],
    /// Order history for this symbol since the last pass.
    pub history: &'a [Order],
    pub qty_step: Money,
}

/// Classify the size delta for one monitor pass.
pub fn detect_size_change(ctx: &DetectionContext) -> SizeChange {
    let record = ctx.record;
    let delta = ctx.observed_size - record.last_known_size;

    if delta.is_zero() || delta.abs() < ctx.qty_step {
        return SizeChange::Unchanged;
    }

    if delta.is_positive() {
        if matches!(record.phase, Phase::Building | Phase::Monitoring) {
            let (price, filled_limit_links) = entry_fill_evidence(ctx, delta);
            return SizeChange::EntryFill {
                qty: delta,
                price,
                filled_limit_links,
            };
        }
        debug!(
            monitor = %record.key_string(),
            "position grew by {} outside building phases",
            delta
        );
        return SizeChange::UnexpectedIncrease { qty: delta };
    }

    let reduction = -delta;
    classify_reduction(ctx, reduction)
}

fn classify_reduction(ctx: &DetectionContext, reduction: Money) -> SizeChange {
    let record = ctx.record;
    let tp_confirmed = history_confirms_tp_fill(ctx);

    // Building/monitoring positions only shrink through a confirmed TP fill;
    // anything else is an external partial close.
    if matches!(record.phase, Phase::Building | Phase::Monitoring) && !tp_confirmed {
        return SizeChange::ExternalReduce { qty: reduction };
    }

    if let Some(fills) = match_tp_ladder(record, reduction, ctx.qty_step) {
        // A filled order leaves the book. If every matched rung still rests
        // in the open-orders view, the reduction came from somewhere else
        // (an equal-sized stop fill, a manual close).
        let any_consumed_gone = fills.iter().any(|fill| {
            record
                .tp_orders
                .get(&fill.index)
                .map(|tp| {
                    !tp.is_armed()
                        || !ctx
                            .open_orders
                            .iter()
                            .any(|o| o.status.is_live() && is_same_order(o, &tp.order_id, &tp.order_link_id))
                })
                .unwrap_or(true)
        });
        if any_consumed_gone {
            return SizeChange::TpFills { fills };
        }
    }

    // Full closure with the stop gone from the book reads as an SL fill.
    if ctx.observed_size.is_zero() && sl_vanished(ctx) {
        return SizeChange::SlFill { qty: reduction };
    }

    SizeChange::ExternalReduce { qty: reduction }
}

/// Match a cumulative reduction against the unfilled TP rungs in index
/// order. Returns the rungs consumed when a prefix of the ladder explains
/// the reduction within one quantity step.
pub fn match_tp_ladder(
    record: &MonitorRecord,
    reduction: Money,
    qty_step: Money,
) -> Option<Vec<TpFillObservation>> {
    let mut cumulative = Money::ZERO;
    let mut consumed = Vec::new();

    for tp in record.tp_orders.values() {
        let outstanding = tp.qty - tp.filled_qty;
        if !outstanding.is_positive() {
            continue;
        }
        cumulative += outstanding;
        consumed.push(TpFillObservation {
            index: tp.index,
            qty: outstanding,
        });
        if cumulative.abs_diff(reduction) <= qty_step {
            return Some(consumed);
        }
        if cumulative > reduction + qty_step {
            return None;
        }
    }
    None
}

/// Whether recent history shows one of this monitor's TP orders filling.
fn history_confirms_tp_fill(ctx: &DetectionContext) -> bool {
    ctx.history.iter().any(|order| {
        if !order.cum_exec_qty.is_positive() {
            return false;
        }
        if ctx
            .record
            .tp_orders
            .values()
            .any(|tp| is_same_order(order, &tp.order_id, &tp.order_link_id))
        {
            return true;
        }
        classify_link_id(&order.order_link_id)
            .map(|identity| {
                identity.kind == OrderKind::TakeProfit
                    && identity.account == ctx.record.account
            })
            .unwrap_or(false)
    })
}

/// The stop-loss descriptor is armed but no longer on the book.
fn sl_vanished(ctx: &DetectionContext) -> bool {
    let Some(sl) = &ctx.record.sl_order else {
        return false;
    };
    if sl.order_id.is_empty() && sl.order_link_id.is_empty() {
        return false;
    }
    !ctx.open_orders
        .iter()
        .any(|order| is_same_order(order, &sl.order_id, &sl.order_link_id))
}

fn is_same_order(order: &Order, order_id: &str, link_id: &str) -> bool {
    (!order_id.is_empty() && order.order_id == order_id)
        || (!link_id.is_empty() && order.order_link_id == link_id)
}

/// Pick the entry fill price (last trade price from history when available,
/// else mark) and collect which registered limit legs filled.
fn entry_fill_evidence(ctx: &DetectionContext, _delta: Money) -> (Money, Vec<String>) {
    let record = ctx.record;
    let mut price = ctx.mark_price;
    let mut filled_limit_links = Vec::new();

    for entry in &record.entry_orders {
        if !entry.is_pending() {
            continue;
        }
        let filled = ctx.history.iter().find(|order| {
            is_same_order(order, &entry.order_id, &entry.order_link_id)
                && order.cum_exec_qty.is_positive()
        });
        if let Some(order) = filled {
            if let Some(fill_price) = order.avg_fill_price {
                price = fill_price;
            }
            if entry.order_type == crate::bybit::OrderType::Limit {
                filled_limit_links.push(entry.order_link_id.clone());
            }
        }
    }

    (price, filled_limit_links)
}
