//! Client order-link ID registry
//!
//! Every order the engine places carries a client-generated `orderLinkId`
//! with the shape `{PREFIX}_{KIND}{N}_{SYMBOL}_{MS_EPOCH}_{RAND4}`. The
//! prefix identifies the account (`BOT` primary, `MIR` mirror), the kind
//! segment identifies what the order does, and the suffix makes every
//! attempt unique. A fresh ID is generated for every replace so duplicate
//! link-ID rejections cannot repeat.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::bybit::{Order, OrderType, StopOrderType};
use crate::types::{Account, Side, Symbol};

/// Exchange-enforced maximum length of an orderLinkId.
pub const MAX_LINK_ID_LEN: usize = 36;

/// What an order does for its monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderKind {
    Entry,
    TakeProfit,
    StopLoss,
}

impl OrderKind {
    fn tag(self) -> &'static str {
        match self {
            OrderKind::Entry => "ENTRY",
            OrderKind::TakeProfit => "TP",
            OrderKind::StopLoss => "SL",
        }
    }
}

/// Parsed identity of a bot-placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkIdentity {
    pub account: Account,
    pub kind: OrderKind,
    /// TP index 1..=4, entry leg number, or SL sequence
    pub index: Option<u8>,
}

/// Process-global registry guaranteeing link-ID uniqueness for the lifetime
/// of the process.
#[derive(Debug, Default)]
pub struct OrderLinkRegistry {
    issued: Mutex<HashSet<String>>,
}

impl OrderLinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next unique link ID for an order.
    pub fn next(
        &self,
        account: Account,
        kind: OrderKind,
        index: u8,
        symbol: &Symbol,
    ) -> String {
        let mut issued = self.issued.lock().expect("link registry poisoned");
        loop {
            let candidate = build_link_id(account, kind, index, symbol);
            if issued.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Record an externally supplied link ID (entry orders handed over by
    /// the trade executor) so we never re-issue it.
    pub fn adopt(&self, link_id: &str) {
        if !link_id.is_empty() {
            self.issued
                .lock()
                .expect("link registry poisoned")
                .insert(link_id.to_string());
        }
    }

    /// Number of IDs issued so far (diagnostics only).
    pub fn issued_count(&self) -> usize {
        self.issued.lock().expect("link registry poisoned").len()
    }
}

fn build_link_id(account: Account, kind: OrderKind, index: u8, symbol: &Symbol) -> String {
    let prefix = account.link_prefix();
    let kind_seg = format!("{}{}", kind.tag(), index);
    let ms = Utc::now().timestamp_millis();
    let rand4: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();

    // Overhead: prefix + kind + ms + rand + four separators. The symbol
    // absorbs whatever truncation is needed to stay under the limit.
    let overhead = prefix.len() + kind_seg.len() + 13 + 4 + 4;
    let budget = MAX_LINK_ID_LEN.saturating_sub(overhead);
    let sym = &symbol.as_str()[..symbol.as_str().len().min(budget)];

    format!("{}_{}_{}_{}_{}", prefix, kind_seg, sym, ms, rand4)
}

/// Classify an order by its link ID. Returns `None` for orders the engine
/// did not place (or whose link ID is unreadable).
pub fn classify_link_id(link_id: &str) -> Option<LinkIdentity> {
    let mut parts = link_id.split('_');
    let account = match parts.next()? {
        "BOT" => Account::Main,
        "MIR" => Account::Mirror,
        _ => return None,
    };
    let kind_seg = parts.next()?;
    let (kind, digits) = if let Some(rest) = kind_seg.strip_prefix("ENTRY") {
        (OrderKind::Entry, rest)
    } else if let Some(rest) = kind_seg.strip_prefix("TP") {
        (OrderKind::TakeProfit, rest)
    } else if let Some(rest) = kind_seg.strip_prefix("SL") {
        (OrderKind::StopLoss, rest)
    } else {
        return None;
    };
    let index = digits.parse::<u8>().ok();
    Some(LinkIdentity {
        account,
        kind,
        index,
    })
}

/// Fallback classifier for orders whose link IDs are missing or foreign:
/// reduce-only orders on the side opposite the position are exits, split
/// into SL (market with trigger) and TP (resting limit).
pub fn classify_by_shape(order: &Order, position_side: Side) -> Option<OrderKind> {
    if !order.reduce_only || order.side != position_side.opposite() {
        return None;
    }
    if order.stop_order_type == Some(StopOrderType::StopLoss) {
        return Some(OrderKind::StopLoss);
    }
    if order.trigger_price.is_some() && order.order_type == OrderType::Market {
        return Some(OrderKind::StopLoss);
    }
    if order.order_type == OrderType::Limit {
        return Some(OrderKind::TakeProfit);
    }
    None
}
