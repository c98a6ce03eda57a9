//! Phase engine: lifecycle transitions and their side effects
//!
//! Transitions move strictly forward along
//! BUILDING -> MONITORING -> PROFIT_TAKING -> CLOSED. The side effects
//! attached to each transition live here: the breakeven stop move on TP1,
//! cancellation of unfilled entry limits, and the closing tear-down that
//! sweeps every residual exit order.

use tracing::{debug, info, warn};

use crate::bybit::{ExchangeApi, Order, OrderRef};
use crate::error::ExchangeError;
use crate::events::PnlSummary;
use crate::linkid::{classify_by_shape, classify_link_id, OrderLinkRegistry};
use crate::monitor::{EntryStatus, MonitorRecord};
use crate::rebalance::{cancel_tolerating_gone, replace_stop_loss};
use crate::types::{InstrumentInfo, Money, Phase, Side};

/// Advance the record's phase, refusing reversals. Returns whether the
/// transition happened.
pub fn advance_phase(record: &mut MonitorRecord, to: Phase) -> bool {
    if to <= record.phase {
        debug!(
            monitor = %record.key_string(),
            "ignoring phase transition {} -> {}",
            record.phase,
            to
        );
        return false;
    }
    info!(
        monitor = %record.key_string(),
        "phase {} -> {}",
        record.phase,
        to
    );
    record.phase = to;
    record.touch();
    true
}

/// Breakeven trigger price: average entry shifted by the round-trip fee plus
/// a safety margin, in the direction that keeps the exit profitable.
pub fn breakeven_trigger(
    avg_entry: Money,
    side: Side,
    fee_rate: Money,
    safety_margin: Money,
    tick_size: Money,
) -> Money {
    let two = Money::from_i64(2);
    let margin = avg_entry * (fee_rate * two + safety_margin);
    let trigger = match side {
        Side::Buy => avg_entry + margin,
        Side::Sell => avg_entry - margin,
    };
    trigger.round_to_tick(tick_size)
}

/// Move the stop-loss to breakeven after TP1 (cancel-then-place with a fresh
/// link ID). Returns the new trigger price.
pub async fn move_sl_to_breakeven(
    exchange: &dyn ExchangeApi,
    links: &OrderLinkRegistry,
    record: &mut MonitorRecord,
    info: &InstrumentInfo,
    fee_rate: Money,
    safety_margin: Money,
) -> Result<Money, ExchangeError> {
    let trigger = breakeven_trigger(
        record.avg_entry_price,
        record.side,
        fee_rate,
        safety_margin,
        info.tick_size,
    );
    let qty = record.current_size;

    replace_stop_loss(exchange, links, record, trigger, qty).await?;
    if let Some(sl) = record.sl_order.as_mut() {
        sl.breakeven_applied = true;
    }
    record.sl_moved_to_be = true;
    record.touch();
    info!(
        monitor = %record.key_string(),
        "SL moved to breakeven at {} (qty {})",
        trigger,
        qty
    );
    Ok(trigger)
}

/// Cancel entry limits that never filled (runs on TP1 when configured).
/// `AlreadyGone` counts as success. Returns how many orders were cancelled.
pub async fn cancel_unfilled_entry_limits(
    exchange: &dyn ExchangeApi,
    record: &mut MonitorRecord,
) -> usize {
    let symbol = record.symbol.clone();
    let mut cancelled = 0;

    for entry in record.entry_orders.iter_mut() {
        if !entry.is_pending() {
            continue;
        }
        let reference = if !entry.order_id.is_empty() {
            OrderRef::ById(entry.order_id.clone())
        } else if !entry.order_link_id.is_empty() {
            OrderRef::ByLinkId(entry.order_link_id.clone())
        } else {
            entry.status = EntryStatus::Cancelled;
            continue;
        };

        match cancel_tolerating_gone(exchange, &symbol, &reference).await {
            Ok(_) => {
                entry.status = EntryStatus::Cancelled;
                cancelled += 1;
            }
            Err(e) => {
                warn!(
                    "failed to cancel entry limit {}: {}",
                    reference.describe(),
                    e
                );
            }
        }
    }

    record.limits_cancelled = true;
    record.touch();
    cancelled
}

/// Tear down a closing monitor: cancel every residual exit order that
/// belongs to it, then sweep unknown reduce-only stragglers for the symbol
/// unless external-order protection keeps foreign orders off limits.
pub async fn tear_down(
    exchange: &dyn ExchangeApi,
    record: &mut MonitorRecord,
    open_orders: &[Order],
    external_order_protection: bool,
) -> usize {
    let symbol = record.symbol.clone();
    let mut cancelled = 0;
    let mut known: Vec<String> = Vec::new();

    for tp in record.tp_orders.values_mut() {
        if tp.is_armed() {
            let reference = if !tp.order_id.is_empty() {
                OrderRef::ById(tp.order_id.clone())
            } else {
                OrderRef::ByLinkId(tp.order_link_id.clone())
            };
            if cancel_tolerating_gone(exchange, &symbol, &reference)
                .await
                .unwrap_or(false)
            {
                cancelled += 1;
            }
            known.push(tp.order_id.clone());
            known.push(tp.order_link_id.clone());
            tp.order_id.clear();
            tp.order_link_id.clear();
        }
    }

    if let Some(sl) = record.sl_order.as_mut() {
        if !sl.order_id.is_empty() || !sl.order_link_id.is_empty() {
            let reference = if !sl.order_id.is_empty() {
                OrderRef::ById(sl.order_id.clone())
            } else {
                OrderRef::ByLinkId(sl.order_link_id.clone())
            };
            if cancel_tolerating_gone(exchange, &symbol, &reference)
                .await
                .unwrap_or(false)
            {
                cancelled += 1;
            }
            known.push(sl.order_id.clone());
            known.push(sl.order_link_id.clone());
            sl.order_id.clear();
            sl.order_link_id.clear();
        }
    }

    // Straggler sweep: reduce-only orders for this symbol we did not place
    // through a tracked descriptor.
    for order in open_orders {
        if order.symbol != symbol || !order.status.is_live() {
            continue;
        }
        if known.iter().any(|k| !k.is_empty() && (*k == order.order_id || *k == order.order_link_id))
        {
            continue;
        }
        let ours = classify_link_id(&order.order_link_id)
            .map(|identity| identity.account == record.account)
            .unwrap_or(false);
        let foreign_exit =
            !ours && classify_by_shape(order, record.side).is_some();

        if ours || (foreign_exit && !external_order_protection) {
            let reference = OrderRef::ById(order.order_id.clone());
            match cancel_tolerating_gone(exchange, &symbol, &reference).await {
                Ok(true) => {
                    cancelled += 1;
                    debug!("swept straggler {}", order.order_id);
                }
                Ok(false) => {}
                Err(e) => warn!("straggler sweep failed for {}: {}", order.order_id, e),
            }
        }
    }

    record.touch();
    cancelled
}

/// Realized P&L summary at closure, computed from the exit ladder. TP rungs
/// contribute their filled quantity at their trigger price; an SL exit
/// contributes the swept quantity at the stop trigger. The fee estimate is
/// round-trip taker fees on the closed notional.
pub fn compute_pnl(record: &MonitorRecord, sl_exit_qty: Money, fee_rate: Money) -> PnlSummary {
    let entry = record.avg_entry_price;
    let sign = match record.side {
        Side::Buy => Money::ONE,
        Side::Sell => -Money::ONE,
    };

    let mut gross = Money::ZERO;
    let mut closed_qty = Money::ZERO;

    for tp in record.tp_orders.values() {
        if tp.filled_qty.is_positive() {
            gross += (tp.trigger_price - entry) * tp.filled_qty * sign;
            closed_qty += tp.filled_qty;
        }
    }
    if sl_exit_qty.is_positive() {
        if let Some(sl) = record.sl_order.as_ref() {
            gross += (sl.trigger_price - entry) * sl_exit_qty * sign;
            closed_qty += sl_exit_qty;
        }
    }

    let two = Money::from_i64(2);
    let fee_estimate = closed_qty * entry * fee_rate * two;
    PnlSummary {
        gross,
        fee_estimate,
        net: gross - fee_estimate,
    }
}
