//! Bybit v5 exchange access
//!
//! One [`ExchangeApi`] instance per account; the engine routes every call
//! through the instance matching the monitor's account tag and never falls
//! back across accounts. The live implementation is [`BybitClient`]; tests
//! drive the engine through an in-memory implementation of the same trait.

pub mod auth;
pub mod client;
pub mod types;

pub use client::{BybitClient, ClientConfig};
pub use types::{
    AmendParams, Order, OrderParams, OrderRef, OrderStatus, OrderType, PlacedOrder, Position,
    StopOrderType, TriggerDirection,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ExchangeError;
use crate::types::{Account, InstrumentInfo, Symbol};

/// Typed exchange surface the engine depends on.
///
/// Retry policy: implementations retry `Transient`/`RateLimited`
/// failures internally with backoff and jitter; `AlreadyGone`,
/// `DuplicateLinkId`, and `Fatal` are returned to the caller, which owns the
/// semantic response (tolerate, regenerate, or surface).
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// The account this instance is bound to.
    fn account(&self) -> Account;

    /// All open positions for the account (settleCoin-wide query).
    async fn get_all_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// All open (live or untriggered) orders for the account.
    async fn get_all_open_orders(&self) -> Result<Vec<Order>, ExchangeError>;

    /// Order history for one symbol since a timestamp, newest first.
    async fn get_order_history(
        &self,
        symbol: &Symbol,
        since: DateTime<Utc>,
    ) -> Result<Vec<Order>, ExchangeError>;

    async fn place_order(&self, params: &OrderParams) -> Result<PlacedOrder, ExchangeError>;

    async fn amend_order(&self, params: &AmendParams) -> Result<PlacedOrder, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        reference: &OrderRef,
    ) -> Result<(), ExchangeError>;

    async fn get_instrument_info(&self, symbol: &Symbol)
        -> Result<InstrumentInfo, ExchangeError>;
}
