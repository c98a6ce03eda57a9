//! Mirror-account coordination
//!
//! Mirror monitors are first-class: same scheduler, same pass, their own
//! credentials, their own sizes. The two mirror-specific behaviors live
//! here: recovery of lost TP descriptors from the open-orders view, and the
//! display-only fill-count synchronization used in event payloads.

use tracing::{info, warn};

use crate::bybit::{Order, OrderType};
use crate::monitor::{MonitorRecord, TpOrder, TP_COUNT, TP_PERCENTAGES};
use crate::types::{Money, Side};

/// Rebuild TP descriptors for a monitor that lost them (typically a mirror
/// record persisted before its ladder was registered). Candidates are the
/// live reduce-only limit orders resting against the position; indices are
/// assigned by trigger price in execution order - ascending for a long
/// (nearest TP fills first), descending for a short - and anchored so the
/// ladder ends at TP4.
pub fn recover_tp_descriptors(record: &MonitorRecord, open_orders: &[Order]) -> Vec<TpOrder> {
    let exit_side = record.side.opposite();
    let mut candidates: Vec<&Order> = open_orders
        .iter()
        .filter(|order| {
            order.symbol == record.symbol
                && order.side == exit_side
                && order.reduce_only
                && order.order_type == OrderType::Limit
                && order.status.is_live()
                && order.price.is_some()
        })
        .collect();

    if candidates.is_empty() || candidates.len() > TP_COUNT as usize {
        if candidates.len() > TP_COUNT as usize {
            warn!(
                monitor = %record.key_string(),
                "{} reduce-only limits found, expected at most {}; not recovering",
                candidates.len(),
                TP_COUNT
            );
        }
        return Vec::new();
    }

    match record.side {
        Side::Buy => candidates.sort_by_key(|order| order.price),
        Side::Sell => {
            candidates.sort_by_key(|order| order.price);
            candidates.reverse();
        }
    }

    // Three surviving orders mean TP1 already filled: they become TP2..TP4.
    let start_index = TP_COUNT - candidates.len() as u8 + 1;
    candidates
        .into_iter()
        .enumerate()
        .map(|(offset, order)| {
            let index = start_index + offset as u8;
            let percent = TP_PERCENTAGES[(index - 1) as usize];
            TpOrder {
                index,
                tp_percent: Money::from_i64(percent as i64),
                trigger_price: order.price.expect("filtered on price"),
                qty: order.qty,
                order_id: order.order_id.clone(),
                order_link_id: order.order_link_id.clone(),
                filled_qty: Money::ZERO,
            }
        })
        .collect()
}

/// Replace a monitor's empty ladder with recovered descriptors. Returns
/// whether a recovery happened.
pub fn apply_tp_recovery(record: &mut MonitorRecord, open_orders: &[Order]) -> bool {
    let has_armed = record.tp_orders.values().any(|tp| tp.is_armed());
    if has_armed {
        return false;
    }
    let recovered = recover_tp_descriptors(record, open_orders);
    if recovered.is_empty() {
        return false;
    }

    info!(
        monitor = %record.key_string(),
        "recovered {} TP descriptors from open orders",
        recovered.len()
    );
    record.tp_orders.clear();
    for tp in recovered {
        record.tp_orders.insert(tp.index, tp);
    }
    record.touch();
    true
}

/// User-facing fill count: both accounts report the max of the two. Records
/// keep per-account truth; this only shapes event payloads.
pub fn display_limit_fills(main_count: u32, mirror_count: u32) -> u32 {
    main_count.max(mirror_count)
}
