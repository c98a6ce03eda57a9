//! Exit-order rebalancing
//!
//! Invoked after entry fills (position grew: every TP and the SL cover the
//! new size) and after TP fills (position shrank: the SL shrinks with it).
//! All order replacement is cancel-then-place with a freshly generated link
//! ID; `AlreadyGone` cancels are success, one `DuplicateLinkId` triggers a
//! single regeneration, and `Fatal` marks the rung FAILED without advancing
//! phase.

use tracing::{debug, info, warn};

use crate::bybit::{ExchangeApi, Order, OrderParams, OrderRef};
use crate::error::ExchangeError;
use crate::events::{TpResult, TpResultStatus};
use crate::linkid::{OrderKind, OrderLinkRegistry};
use crate::monitor::{MonitorRecord, TP_PERCENTAGES};
use crate::types::{InstrumentInfo, Money};

/// One rung of the planned TP ladder after quantity splitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpSlice {
    pub index: u8,
    /// Percentage this rung ended up carrying (skipped rungs roll theirs
    /// forward).
    pub percent: Money,
    pub qty: Money,
    pub skipped: bool,
}

/// Split `current_size` across the conservative 85/5/5/5 ladder.
///
/// Quantities floor to the exchange step; a rung whose quantity would fall
/// under `min_qty` is skipped and its percentage rolls into the next rung;
/// the last surviving rung absorbs the rounding remainder so the ladder sums
/// to `current_size` exactly.
pub fn split_tp_quantities(
    current_size: Money,
    qty_step: Money,
    min_qty: Money,
) -> Vec<TpSlice> {
    let mut slices = Vec::with_capacity(TP_PERCENTAGES.len());
    let mut carry = Money::ZERO;
    let mut allocated = Money::ZERO;
    let last = TP_PERCENTAGES.len() - 1;

    for (i, pct) in TP_PERCENTAGES.iter().enumerate() {
        let index = (i + 1) as u8;
        let percent = Money::from_i64(*pct as i64) + carry;

        let qty = if i == last {
            // Remainder absorption keeps the ladder sum exact.
            (current_size - allocated).floor_to_step(qty_step)
        } else {
            (current_size * percent / Money::ONE_HUNDRED).floor_to_step(qty_step)
        };

        if qty < min_qty && i != last {
            slices.push(TpSlice {
                index,
                percent,
                qty: Money::ZERO,
                skipped: true,
            });
            carry = percent;
            continue;
        }
        carry = Money::ZERO;

        if i == last && qty < min_qty {
            // Nothing meaningful left for the last rung: hand the remainder
            // to the previous surviving rung.
            if let Some(prev) = slices.iter_mut().rev().find(|s| !s.skipped) {
                prev.qty += qty;
                prev.percent += percent;
                slices.push(TpSlice {
                    index,
                    percent: Money::ZERO,
                    qty: Money::ZERO,
                    skipped: true,
                });
                continue;
            }
        }

        allocated += qty;
        slices.push(TpSlice {
            index,
            percent,
            qty,
            skipped: false,
        });
    }

    slices
}

/// Drop references to exit orders that are no longer live on the exchange.
/// Descriptors keep their prices and percentages so a later rebalance can
/// re-place them. Returns how many references were pruned.
pub fn prune_stale_exit_orders(record: &mut MonitorRecord, open_orders: &[Order]) -> usize {
    let mut pruned = 0;

    for tp in record.tp_orders.values_mut() {
        if tp.is_armed() && !order_is_live(open_orders, &tp.order_id, &tp.order_link_id) {
            debug!(
                monitor = %format!("{}_{}_{}", record.symbol, record.side, record.account),
                "pruning dead TP{} reference {}",
                tp.index,
                tp.order_link_id
            );
            tp.order_id.clear();
            tp.order_link_id.clear();
            pruned += 1;
        }
    }
    if let Some(sl) = record.sl_order.as_mut() {
        let armed = !sl.order_id.is_empty() || !sl.order_link_id.is_empty();
        if armed && !order_is_live(open_orders, &sl.order_id, &sl.order_link_id) {
            sl.order_id.clear();
            sl.order_link_id.clear();
            pruned += 1;
        }
    }

    pruned
}

fn order_is_live(open_orders: &[Order], order_id: &str, link_id: &str) -> bool {
    open_orders.iter().any(|order| {
        order.status.is_live()
            && ((!order_id.is_empty() && order.order_id == order_id)
                || (!link_id.is_empty() && order.order_link_id == link_id))
    })
}

/// Cancel an order, treating `AlreadyGone` as success. Returns whether the
/// order was actually cancelled (false: it was already gone).
pub async fn cancel_tolerating_gone(
    exchange: &dyn ExchangeApi,
    symbol: &crate::types::Symbol,
    reference: &OrderRef,
) -> Result<bool, ExchangeError> {
    match exchange.cancel_order(symbol, reference).await {
        Ok(()) => Ok(true),
        Err(ExchangeError::AlreadyGone(_)) => {
            debug!("cancel target {} already gone", reference.describe());
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Place an order, regenerating the link ID exactly once on a duplicate
/// rejection. The successful link ID is written back into `params`.
pub async fn place_with_fresh_link(
    exchange: &dyn ExchangeApi,
    links: &OrderLinkRegistry,
    kind: OrderKind,
    index: u8,
    params: &mut OrderParams,
) -> Result<crate::bybit::PlacedOrder, ExchangeError> {
    match exchange.place_order(params).await {
        Err(ExchangeError::DuplicateLinkId(msg)) => {
            warn!(
                "duplicate link id {} ({}), regenerating",
                params.order_link_id, msg
            );
            params.order_link_id =
                links.next(exchange.account(), kind, index, &params.symbol);
            exchange.place_order(params).await
        }
        other => other,
    }
}

/// Rebalance every TP rung to the current position size.
/// Returns the per-rung outcomes for the `RebalanceDone` event.
pub async fn rebalance_take_profits(
    exchange: &dyn ExchangeApi,
    links: &OrderLinkRegistry,
    record: &mut MonitorRecord,
    info: &InstrumentInfo,
) -> Vec<TpResult> {
    let slices = split_tp_quantities(record.current_size, info.qty_step, info.min_qty);
    let mut results = Vec::with_capacity(slices.len());

    for slice in &slices {
        let Some(tp) = record.tp_orders.get_mut(&slice.index) else {
            continue;
        };

        if slice.skipped {
            // Quantity fell under the exchange minimum; its share rolled
            // into a neighboring rung. Remove any resting order.
            if tp.is_armed() {
                let reference = order_ref(&tp.order_id, &tp.order_link_id);
                if let Err(e) =
                    cancel_tolerating_gone(exchange, &record.symbol, &reference).await
                {
                    warn!("failed to cancel skipped TP{}: {}", slice.index, e);
                }
                tp.order_id.clear();
                tp.order_link_id.clear();
            }
            tp.qty = Money::ZERO;
            results.push(TpResult {
                index: slice.index,
                status: TpResultStatus::Skipped,
                qty: Money::ZERO,
                detail: Some("below minimum quantity".to_string()),
            });
            continue;
        }

        // Unchanged within one step: leave the resting order alone.
        if tp.is_armed() && tp.qty.abs_diff(slice.qty) < info.qty_step {
            results.push(TpResult {
                index: slice.index,
                status: TpResultStatus::Ok,
                qty: tp.qty,
                detail: None,
            });
            continue;
        }

        let mut cancelled = false;
        if tp.is_armed() {
            let reference = order_ref(&tp.order_id, &tp.order_link_id);
            match cancel_tolerating_gone(exchange, &record.symbol, &reference).await {
                Ok(_) => cancelled = true,
                Err(e) => {
                    results.push(TpResult {
                        index: slice.index,
                        status: TpResultStatus::Failed,
                        qty: tp.qty,
                        detail: Some(format!("cancel failed: {}", e)),
                    });
                    continue;
                }
            }
        }

        let link_id = links.next(
            exchange.account(),
            OrderKind::TakeProfit,
            slice.index,
            &record.symbol,
        );
        let mut params = OrderParams::take_profit(
            record.symbol.clone(),
            record.side,
            slice.qty,
            tp.trigger_price,
            link_id,
        );

        match place_with_fresh_link(
            exchange,
            links,
            OrderKind::TakeProfit,
            slice.index,
            &mut params,
        )
        .await
        {
            Ok(placed) => {
                tp.order_id = placed.order_id;
                tp.order_link_id = placed.order_link_id;
                tp.qty = slice.qty;
                tp.tp_percent = slice.percent;
                results.push(TpResult {
                    index: slice.index,
                    status: TpResultStatus::Ok,
                    qty: slice.qty,
                    detail: None,
                });
            }
            Err(e) => {
                // The old order is gone but the new one never landed.
                let status = if cancelled {
                    TpResultStatus::Partial
                } else {
                    TpResultStatus::Failed
                };
                if cancelled {
                    tp.order_id.clear();
                    tp.order_link_id.clear();
                }
                results.push(TpResult {
                    index: slice.index,
                    status,
                    qty: slice.qty,
                    detail: Some(e.to_string()),
                });
            }
        }
    }

    clamp_tp_sum(exchange, links, record, info).await;
    results
}

/// Sum-clamp: if the armed ladder exceeds what the position (plus pending
/// entries) can cover, shave rungs from the last one down until it fits.
/// Logged, never fatal.
pub async fn clamp_tp_sum(
    exchange: &dyn ExchangeApi,
    links: &OrderLinkRegistry,
    record: &mut MonitorRecord,
    info: &InstrumentInfo,
) {
    let allowed = record.current_size + record.pending_entry_qty();
    let total = record.tp_qty_sum();
    if total <= allowed {
        return;
    }

    let mut excess = total - allowed;
    warn!(
        monitor = %format!("{}_{}_{}", record.symbol, record.side, record.account),
        "TP ladder exceeds coverable size by {}; clamping",
        excess
    );

    let symbol = record.symbol.clone();
    let side = record.side;
    let mut indices: Vec<u8> = record
        .tp_orders
        .values()
        .filter(|tp| tp.qty.is_positive())
        .map(|tp| tp.index)
        .collect();
    indices.sort_unstable_by(|a, b| b.cmp(a));

    for index in indices {
        if !excess.is_positive() {
            break;
        }
        let tp = record.tp_orders.get_mut(&index).expect("rung exists");
        let shave = excess.min(tp.qty);
        let clamped = (tp.qty - shave).floor_to_step(info.qty_step).max(Money::ZERO);
        excess -= tp.qty - clamped;

        if tp.is_armed() {
            let reference = order_ref(&tp.order_id, &tp.order_link_id);
            if let Err(e) = cancel_tolerating_gone(exchange, &symbol, &reference).await {
                warn!("sum-clamp cancel failed on TP{}: {}", index, e);
                continue;
            }
            tp.order_id.clear();
            tp.order_link_id.clear();
        }
        tp.qty = clamped;

        if clamped < info.min_qty {
            continue;
        }

        let link_id = links.next(exchange.account(), OrderKind::TakeProfit, index, &symbol);
        let mut params =
            OrderParams::take_profit(symbol.clone(), side, clamped, tp.trigger_price, link_id);
        match place_with_fresh_link(exchange, links, OrderKind::TakeProfit, index, &mut params)
            .await
        {
            Ok(placed) => {
                tp.order_id = placed.order_id;
                tp.order_link_id = placed.order_link_id;
            }
            Err(e) => warn!("sum-clamp replace failed on TP{}: {}", index, e),
        }
    }
}

/// Adjust the stop-loss quantity: full target size before TP1 (covering
/// limits that may still fill), remaining position after. Replaces only on a
/// change of at least one step. Returns whether a replace happened.
pub async fn adjust_sl_quantity(
    exchange: &dyn ExchangeApi,
    links: &OrderLinkRegistry,
    record: &mut MonitorRecord,
    info: &InstrumentInfo,
) -> Result<bool, ExchangeError> {
    let desired = if record.tp1_hit {
        record.current_size
    } else {
        record.target_size
    };

    let Some(sl) = record.sl_order.as_ref() else {
        return Ok(false);
    };
    if sl.qty.abs_diff(desired) < info.qty_step {
        return Ok(false);
    }
    if !desired.is_positive() {
        return Ok(false);
    }

    let trigger_price = sl.trigger_price;
    replace_stop_loss(exchange, links, record, trigger_price, desired).await?;
    info!(
        monitor = %format!("{}_{}_{}", record.symbol, record.side, record.account),
        "SL quantity adjusted to {}",
        desired
    );
    Ok(true)
}

/// Cancel-then-place the stop-loss with a fresh link ID. Used by both the
/// quantity adjustment and the breakeven move.
pub async fn replace_stop_loss(
    exchange: &dyn ExchangeApi,
    links: &OrderLinkRegistry,
    record: &mut MonitorRecord,
    trigger_price: Money,
    qty: Money,
) -> Result<(), ExchangeError> {
    if let Some(sl) = record.sl_order.as_ref() {
        if !sl.order_id.is_empty() || !sl.order_link_id.is_empty() {
            let reference = order_ref(&sl.order_id, &sl.order_link_id);
            cancel_tolerating_gone(exchange, &record.symbol, &reference).await?;
        }
    }

    let link_id = links.next(exchange.account(), OrderKind::StopLoss, 1, &record.symbol);
    let mut params = OrderParams::stop_loss(
        record.symbol.clone(),
        record.side,
        qty,
        trigger_price,
        link_id,
    );
    let placed =
        place_with_fresh_link(exchange, links, OrderKind::StopLoss, 1, &mut params).await?;

    let sl = record.sl_order.get_or_insert_with(|| crate::monitor::SlOrder {
        trigger_price,
        qty,
        order_id: String::new(),
        order_link_id: String::new(),
        breakeven_applied: false,
    });
    sl.trigger_price = trigger_price;
    sl.qty = qty;
    sl.order_id = placed.order_id;
    sl.order_link_id = placed.order_link_id;
    Ok(())
}

fn order_ref(order_id: &str, link_id: &str) -> OrderRef {
    if !order_id.is_empty() {
        OrderRef::ById(order_id.to_string())
    } else {
        OrderRef::ByLinkId(link_id.to_string())
    }
}
