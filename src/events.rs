//! Structured engine events
//!
//! The engine describes what happened; the alert dispatcher owns formatting
//! and delivery. Events for one monitor are emitted in observation order
//! (the emitting pass is the only writer), no ordering holds across
//! monitors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::monitor::MonitorRecord;
use crate::types::{Account, Money, Side, Symbol};

/// Outcome of one TP rung during a rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TpResultStatus {
    Ok,
    Partial,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TpResult {
    pub index: u8,
    pub status: TpResultStatus,
    pub qty: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Overall rebalance outcome derived from the per-TP results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceStatus {
    Ok,
    Partial,
    Failed,
}

/// Realized P&L summary attached to closure events. Gross is
/// `Σ (exit - entry) × qty` respecting side; fees are estimated from
/// round-trip notional.
#[derive(Debug, Clone, Serialize)]
pub struct PnlSummary {
    pub gross: Money,
    pub fee_estimate: Money,
    pub net: Money,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEventKind {
    EntryFilled {
        fill_qty: Money,
        fill_price: Money,
        avg_entry_price: Money,
        current_size: Money,
        /// Display value: max across main and mirror at emission time.
        limit_fills_count: u32,
    },
    TpHit {
        index: u8,
        qty: Money,
        remaining_size: Money,
    },
    SlMovedToBreakeven {
        trigger_price: Money,
    },
    LimitsCancelledOnTp1 {
        cancelled: usize,
    },
    RebalanceDone {
        status: RebalanceStatus,
        per_tp: Vec<TpResult>,
        sl_adjusted: bool,
    },
    SlHit {
        qty: Money,
        trigger_price: Money,
    },
    PositionClosed {
        pnl: PnlSummary,
    },
}

impl EngineEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEventKind::EntryFilled { .. } => "EntryFilled",
            EngineEventKind::TpHit { .. } => "TPHit",
            EngineEventKind::SlMovedToBreakeven { .. } => "SLMovedToBreakeven",
            EngineEventKind::LimitsCancelledOnTp1 { .. } => "LimitsCancelledOnTP1",
            EngineEventKind::RebalanceDone { .. } => "RebalanceDone",
            EngineEventKind::SlHit { .. } => "SLHit",
            EngineEventKind::PositionClosed { .. } => "PositionClosed",
        }
    }
}

/// Full event envelope handed to the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub monitor_key: String,
    pub account: Account,
    pub symbol: Symbol,
    pub side: Side,
    pub ts: DateTime<Utc>,
    pub chat_id: Option<i64>,
    #[serde(flatten)]
    pub kind: EngineEventKind,
}

/// Emits events into the dispatcher channel, filling in the envelope and the
/// configured fallback chat.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<EngineEvent>,
    default_chat_id: Option<i64>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>, default_chat_id: Option<i64>) -> Self {
        Self {
            tx,
            default_chat_id,
        }
    }

    /// Build and send one event for a monitor. A closed receiver only drops
    /// alerting, never the engine.
    pub fn emit(&self, record: &MonitorRecord, kind: EngineEventKind) {
        let event = EngineEvent {
            monitor_key: record.key_string(),
            account: record.account,
            symbol: record.symbol.clone(),
            side: record.side,
            ts: Utc::now(),
            chat_id: record.chat_id.or(self.default_chat_id),
            kind,
        };
        info!(
            monitor = %event.monitor_key,
            event = event.kind.name(),
            "engine event"
        );
        if self.tx.send(event).is_err() {
            debug!("event receiver dropped; alert lost");
        }
    }
}

/// Derive the overall rebalance status from per-TP outcomes.
pub fn overall_status(per_tp: &[TpResult]) -> RebalanceStatus {
    let any_failed = per_tp.iter().any(|r| r.status == TpResultStatus::Failed);
    let any_ok = per_tp
        .iter()
        .any(|r| matches!(r.status, TpResultStatus::Ok | TpResultStatus::Skipped));
    match (any_failed, any_ok) {
        (false, _) => RebalanceStatus::Ok,
        (true, true) => RebalanceStatus::Partial,
        (true, false) => RebalanceStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Account, Side};
    use rust_decimal_macros::dec;

    fn record_with_chat(chat_id: Option<i64>) -> MonitorRecord {
        MonitorRecord::new(
            Symbol::new("BTCUSDT"),
            Side::Buy,
            Account::Main,
            Money::from(dec!(0.3)),
            chat_id,
        )
    }

    #[tokio::test]
    async fn emit_fills_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(tx, Some(99));
        let record = record_with_chat(Some(42));

        sender.emit(
            &record,
            EngineEventKind::TpHit {
                index: 1,
                qty: Money::from(dec!(0.255)),
                remaining_size: Money::from(dec!(0.045)),
            },
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.monitor_key, "BTCUSDT_Buy_main");
        assert_eq!(event.account, Account::Main);
        assert_eq!(event.chat_id, Some(42));
        assert_eq!(event.kind.name(), "TPHit");
    }

    #[tokio::test]
    async fn default_chat_id_is_fallback_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(tx, Some(99));

        sender.emit(
            &record_with_chat(None),
            EngineEventKind::LimitsCancelledOnTp1 { cancelled: 2 },
        );
        assert_eq!(rx.recv().await.unwrap().chat_id, Some(99));
    }

    #[test]
    fn emit_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sender = EventSender::new(tx, None);
        sender.emit(
            &record_with_chat(None),
            EngineEventKind::SlMovedToBreakeven {
                trigger_price: Money::from(dec!(60084)),
            },
        );
    }

    #[test]
    fn overall_status_derivation() {
        let ok = TpResult {
            index: 1,
            status: TpResultStatus::Ok,
            qty: Money::ZERO,
            detail: None,
        };
        let failed = TpResult {
            index: 2,
            status: TpResultStatus::Failed,
            qty: Money::ZERO,
            detail: Some("bad params".into()),
        };
        let skipped = TpResult {
            index: 3,
            status: TpResultStatus::Skipped,
            qty: Money::ZERO,
            detail: None,
        };

        assert_eq!(
            overall_status(&[ok.clone(), skipped.clone()]),
            RebalanceStatus::Ok
        );
        assert_eq!(
            overall_status(&[ok.clone(), failed.clone()]),
            RebalanceStatus::Partial
        );
        assert_eq!(overall_status(&[failed.clone()]), RebalanceStatus::Failed);
        assert_eq!(overall_status(&[]), RebalanceStatus::Ok);
    }

    #[test]
    fn event_serializes_with_flattened_kind() {
        let record = record_with_chat(Some(1));
        let event = EngineEvent {
            monitor_key: record.key_string(),
            account: record.account,
            symbol: record.symbol.clone(),
            side: record.side,
            ts: Utc::now(),
            chat_id: record.chat_id,
            kind: EngineEventKind::EntryFilled {
                fill_qty: Money::from(dec!(0.1)),
                fill_price: Money::from(dec!(60000)),
                avg_entry_price: Money::from(dec!(60000)),
                current_size: Money::from(dec!(0.1)),
                limit_fills_count: 2,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "entry_filled");
        assert_eq!(json["limit_fills_count"], 2);
        assert_eq!(json["monitor_key"], "BTCUSDT_Buy_main");
    }
}
