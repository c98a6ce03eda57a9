//! Request and response types for the Bybit v5 API
//!
//! Wire structs mirror the exchange's camelCase JSON exactly; numeric fields
//! travel as strings and are parsed into [`Money`] at the boundary. The
//! engine only ever sees the parsed domain views ([`Position`], [`Order`]).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::types::{InstrumentInfo, Money, Side, Symbol};

/// Product category; the engine only trades linear (USDT-settled) perps.
pub const CATEGORY_LINEAR: &str = "linear";

/// Settle coin carried on account-wide position/order queries.
pub const SETTLE_COIN: &str = "USDT";

// ============================================================================
// Enumerations shared between wire and domain
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Conditional order classification carried in `stopOrderType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOrderType {
    StopLoss,
    TakeProfit,
}

/// Trigger direction: 1 = triggered when price rises to `triggerPrice`,
/// 2 = triggered when price falls to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDirection {
    Rising,
    Falling,
}

impl TriggerDirection {
    pub fn as_wire(self) -> u8 {
        match self {
            TriggerDirection::Rising => 1,
            TriggerDirection::Falling => 2,
        }
    }
}

impl Serialize for TriggerDirection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for TriggerDirection {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(TriggerDirection::Rising),
            2 => Ok(TriggerDirection::Falling),
            other => Err(serde::de::Error::custom(format!(
                "unknown triggerDirection: {}",
                other
            ))),
        }
    }
}

/// Exchange order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Untriggered,
    Triggered,
    Filled,
    Cancelled,
    Rejected,
    Deactivated,
}

impl OrderStatus {
    /// Whether the order is still resting on the book (or waiting to
    /// trigger) and can fill.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            OrderStatus::New
                | OrderStatus::PartiallyFilled
                | OrderStatus::Untriggered
                | OrderStatus::Triggered
        )
    }

    /// Terminal state where no further fills can occur.
    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

// ============================================================================
// Domain views
// ============================================================================

/// One open position as the exchange reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: Side,
    pub size: Money,
    pub avg_price: Money,
    pub mark_price: Money,
    pub position_idx: u8,
}

/// One order (open or historical) as the exchange reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub order_link_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub qty: Money,
    pub price: Option<Money>,
    pub trigger_price: Option<Money>,
    pub stop_order_type: Option<StopOrderType>,
    pub reduce_only: bool,
    pub close_on_trigger: bool,
    pub cum_exec_qty: Money,
    pub avg_fill_price: Option<Money>,
    pub updated_at: DateTime<Utc>,
}

/// Identifier accepted by amend/cancel: exchange order ID or our link ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    ById(String),
    ByLinkId(String),
}

impl OrderRef {
    pub fn describe(&self) -> &str {
        match self {
            OrderRef::ById(id) => id,
            OrderRef::ByLinkId(id) => id,
        }
    }
}

/// Parameters for placing one order, in engine-domain types.
#[derive(Debug, Clone)]
pub struct OrderParams {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Money,
    pub price: Option<Money>,
    pub trigger_price: Option<Money>,
    pub trigger_direction: Option<TriggerDirection>,
    pub stop_order_type: Option<StopOrderType>,
    pub reduce_only: bool,
    pub close_on_trigger: bool,
    pub order_link_id: String,
    pub position_idx: u8,
}

impl OrderParams {
    /// Limit, reduce-only take-profit resting at `price`.
    pub fn take_profit(
        symbol: Symbol,
        position_side: Side,
        qty: Money,
        price: Money,
        order_link_id: String,
    ) -> Self {
        OrderParams {
            symbol,
            side: position_side.opposite(),
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            trigger_price: None,
            trigger_direction: None,
            stop_order_type: None,
            reduce_only: true,
            close_on_trigger: false,
            order_link_id,
            position_idx: 0,
        }
    }

    /// Market stop-loss triggered at `trigger_price`, reduce-only and
    /// close-on-trigger.
    pub fn stop_loss(
        symbol: Symbol,
        position_side: Side,
        qty: Money,
        trigger_price: Money,
        order_link_id: String,
    ) -> Self {
        let trigger_direction = match position_side {
            Side::Buy => TriggerDirection::Falling,
            Side::Sell => TriggerDirection::Rising,
        };
        OrderParams {
            symbol,
            side: position_side.opposite(),
            order_type: OrderType::Market,
            qty,
            price: None,
            trigger_price: Some(trigger_price),
            trigger_direction: Some(trigger_direction),
            stop_order_type: Some(StopOrderType::StopLoss),
            reduce_only: true,
            close_on_trigger: true,
            order_link_id,
            position_idx: 0,
        }
    }
}

/// Parameters for amending a live order in place.
#[derive(Debug, Clone)]
pub struct AmendParams {
    pub symbol: Symbol,
    pub order: OrderRef,
    pub qty: Option<Money>,
    pub price: Option<Money>,
    pub trigger_price: Option<Money>,
}

/// Identifiers returned by a successful place/amend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_id: String,
    pub order_link_id: String,
}

// ============================================================================
// Wire envelope and payloads
// ============================================================================

/// Standard v5 response envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T> {
    pub ret_code: i64,
    pub ret_msg: String,
    pub result: Option<T>,
    #[serde(default)]
    pub time: i64,
}

impl<T> ApiEnvelope<T> {
    /// Convert the envelope into its payload, classifying non-zero
    /// `retCode`s through the failure taxonomy.
    pub fn into_result(self) -> Result<T, ExchangeError> {
        if self.ret_code != 0 {
            return Err(ExchangeError::from_ret_code(self.ret_code, self.ret_msg));
        }
        self.result.ok_or_else(|| {
            ExchangeError::Transient("retCode 0 but result payload missing".to_string())
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListResult<T> {
    pub list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePosition {
    pub symbol: String,
    pub side: String,
    pub size: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub mark_price: String,
    #[serde(default)]
    pub position_idx: u8,
}

impl WirePosition {
    /// Parse into the domain view. Rows with zero size or an empty side are
    /// dropped by the caller.
    pub fn into_position(self) -> Result<Option<Position>, ExchangeError> {
        let side = match self.side.as_str() {
            "Buy" => Side::Buy,
            "Sell" => Side::Sell,
            // Bybit reports flat one-way slots with side "" and size "0"
            "" | "None" => return Ok(None),
            other => {
                return Err(ExchangeError::Fatal {
                    code: 0,
                    message: format!("unknown position side: {}", other),
                })
            }
        };
        let size = parse_money_field(&self.size, "size")?;
        if size.is_zero() {
            return Ok(None);
        }
        Ok(Some(Position {
            symbol: Symbol::new(&self.symbol),
            side,
            size,
            avg_price: parse_money_opt(&self.avg_price).unwrap_or(Money::ZERO),
            mark_price: parse_money_opt(&self.mark_price).unwrap_or(Money::ZERO),
            position_idx: self.position_idx,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOrder {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: OrderType,
    pub order_status: OrderStatus,
    pub qty: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub trigger_price: String,
    #[serde(default)]
    pub stop_order_type: String,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_on_trigger: bool,
    #[serde(default)]
    pub cum_exec_qty: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub updated_time: String,
}

impl WireOrder {
    pub fn into_order(self) -> Result<Order, ExchangeError> {
        let side = self.side.parse::<Side>().map_err(|e| ExchangeError::Fatal {
            code: 0,
            message: e,
        })?;
        let stop_order_type = match self.stop_order_type.as_str() {
            "StopLoss" => Some(StopOrderType::StopLoss),
            "TakeProfit" => Some(StopOrderType::TakeProfit),
            _ => None,
        };
        let updated_at = self
            .updated_time
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        Ok(Order {
            order_id: self.order_id,
            order_link_id: self.order_link_id,
            symbol: Symbol::new(&self.symbol),
            side,
            order_type: self.order_type,
            status: self.order_status,
            qty: parse_money_field(&self.qty, "qty")?,
            price: parse_money_opt(&self.price),
            trigger_price: parse_money_opt(&self.trigger_price),
            stop_order_type,
            reduce_only: self.reduce_only,
            close_on_trigger: self.close_on_trigger,
            cum_exec_qty: parse_money_opt(&self.cum_exec_qty).unwrap_or(Money::ZERO),
            avg_fill_price: parse_money_opt(&self.avg_price),
            updated_at,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireInstrument {
    pub symbol: String,
    #[serde(default)]
    pub price_scale: String,
    pub lot_size_filter: WireLotSizeFilter,
    pub price_filter: WirePriceFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLotSizeFilter {
    pub qty_step: String,
    pub min_order_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePriceFilter {
    pub tick_size: String,
}

impl WireInstrument {
    pub fn into_info(self) -> Result<InstrumentInfo, ExchangeError> {
        Ok(InstrumentInfo {
            symbol: Symbol::new(&self.symbol),
            qty_step: parse_money_field(&self.lot_size_filter.qty_step, "qtyStep")?,
            min_qty: parse_money_field(&self.lot_size_filter.min_order_qty, "minOrderQty")?,
            tick_size: parse_money_field(&self.price_filter.tick_size, "tickSize")?,
            price_scale: self.price_scale.parse().unwrap_or(2),
        })
    }
}

/// Outgoing order-create body, serialized exactly as the exchange expects.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePlaceOrderRequest {
    pub category: &'static str,
    pub symbol: String,
    pub side: String,
    pub order_type: OrderType,
    pub qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_direction: Option<TriggerDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_order_type: Option<StopOrderType>,
    pub reduce_only: bool,
    pub close_on_trigger: bool,
    pub order_link_id: String,
    pub position_idx: u8,
}

impl From<&OrderParams> for WirePlaceOrderRequest {
    fn from(params: &OrderParams) -> Self {
        WirePlaceOrderRequest {
            category: CATEGORY_LINEAR,
            symbol: params.symbol.as_str().to_string(),
            side: params.side.as_str().to_string(),
            order_type: params.order_type,
            qty: params.qty.to_string(),
            price: params.price.map(|p| p.to_string()),
            trigger_price: params.trigger_price.map(|p| p.to_string()),
            trigger_direction: params.trigger_direction,
            stop_order_type: params.stop_order_type,
            reduce_only: params.reduce_only,
            close_on_trigger: params.close_on_trigger,
            order_link_id: params.order_link_id.clone(),
            position_idx: params.position_idx,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAmendOrderRequest {
    pub category: &'static str,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_link_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<String>,
}

impl From<&AmendParams> for WireAmendOrderRequest {
    fn from(params: &AmendParams) -> Self {
        let (order_id, order_link_id) = match &params.order {
            OrderRef::ById(id) => (Some(id.clone()), None),
            OrderRef::ByLinkId(id) => (None, Some(id.clone())),
        };
        WireAmendOrderRequest {
            category: CATEGORY_LINEAR,
            symbol: params.symbol.as_str().to_string(),
            order_id,
            order_link_id,
            qty: params.qty.map(|q| q.to_string()),
            price: params.price.map(|p| p.to_string()),
            trigger_price: params.trigger_price.map(|p| p.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCancelOrderRequest {
    pub category: &'static str,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_link_id: Option<String>,
}

impl WireCancelOrderRequest {
    pub fn new(symbol: &Symbol, reference: &OrderRef) -> Self {
        let (order_id, order_link_id) = match reference {
            OrderRef::ById(id) => (Some(id.clone()), None),
            OrderRef::ByLinkId(id) => (None, Some(id.clone())),
        };
        WireCancelOrderRequest {
            category: CATEGORY_LINEAR,
            symbol: symbol.as_str().to_string(),
            order_id,
            order_link_id,
        }
    }
}

fn parse_money_field(raw: &str, field: &str) -> Result<Money, ExchangeError> {
    raw.parse::<Money>().map_err(|e| ExchangeError::Fatal {
        code: 0,
        message: format!("unparseable {}: {:?} ({})", field, raw, e),
    })
}

/// Empty strings mean "not set" on the wire.
fn parse_money_opt(raw: &str) -> Option<Money> {
    if raw.is_empty() {
        return None;
    }
    raw.parse::<Money>().ok().filter(|m| !m.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn envelope_classifies_ret_codes() {
        let env: ApiEnvelope<ListResult<WireOrder>> = serde_json::from_str(
            r#"{"retCode":110072,"retMsg":"OrderLinkedID is duplicate","result":null,"time":1}"#,
        )
        .unwrap();
        assert!(matches!(
            env.into_result(),
            Err(ExchangeError::DuplicateLinkId(_))
        ));
    }

    #[test]
    fn wire_position_parses() {
        let wire: WirePosition = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","side":"Buy","size":"0.300","avgPrice":"60000","markPrice":"60500.5","positionIdx":0}"#,
        )
        .unwrap();
        let position = wire.into_position().unwrap().unwrap();
        assert_eq!(position.size, Money::from(dec!(0.300)));
        assert_eq!(position.mark_price, Money::from(dec!(60500.5)));
        assert_eq!(position.side, Side::Buy);
    }

    #[test]
    fn flat_position_slot_is_skipped() {
        let wire: WirePosition = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","side":"","size":"0","avgPrice":"","markPrice":"","positionIdx":0}"#,
        )
        .unwrap();
        assert!(wire.into_position().unwrap().is_none());
    }

    #[test]
    fn wire_order_parses_stop_loss() {
        let wire: WireOrder = serde_json::from_str(
            r#"{"orderId":"abc","orderLinkId":"BOT_SL1_BTCUSDT_1700000000000_a1b2",
                "symbol":"BTCUSDT","side":"Sell","orderType":"Market","orderStatus":"Untriggered",
                "qty":"0.300","price":"","triggerPrice":"58800","stopOrderType":"StopLoss",
                "reduceOnly":true,"closeOnTrigger":true,"cumExecQty":"0","avgPrice":"",
                "updatedTime":"1700000000000"}"#,
        )
        .unwrap();
        let order = wire.into_order().unwrap();
        assert_eq!(order.stop_order_type, Some(StopOrderType::StopLoss));
        assert_eq!(order.trigger_price, Some(Money::from(dec!(58800))));
        assert!(order.status.is_live());
        assert!(order.reduce_only && order.close_on_trigger);
    }

    #[test]
    fn place_request_serializes_camel_case() {
        let params = OrderParams::take_profit(
            Symbol::new("BTCUSDT"),
            Side::Buy,
            Money::from(dec!(0.255)),
            Money::from(dec!(61200)),
            "BOT_TP1_BTCUSDT_1700000000000_a1b2".to_string(),
        );
        let wire = WirePlaceOrderRequest::from(&params);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["category"], "linear");
        assert_eq!(json["side"], "Sell");
        assert_eq!(json["orderType"], "Limit");
        assert_eq!(json["qty"], "0.255");
        assert_eq!(json["price"], "61200");
        assert_eq!(json["reduceOnly"], true);
        assert_eq!(json["closeOnTrigger"], false);
        assert!(json.get("triggerPrice").is_none());
        assert!(json["orderLinkId"].as_str().unwrap().starts_with("BOT_TP1"));
    }

    #[test]
    fn stop_loss_params_set_trigger_direction() {
        let long = OrderParams::stop_loss(
            Symbol::new("BTCUSDT"),
            Side::Buy,
            Money::from(dec!(0.3)),
            Money::from(dec!(58800)),
            "BOT_SL1_BTCUSDT_1700000000000_a1b2".to_string(),
        );
        assert_eq!(long.trigger_direction, Some(TriggerDirection::Falling));
        assert_eq!(long.side, Side::Sell);

        let short = OrderParams::stop_loss(
            Symbol::new("BTCUSDT"),
            Side::Sell,
            Money::from(dec!(0.3)),
            Money::from(dec!(61000)),
            "BOT_SL1_BTCUSDT_1700000000001_c3d4".to_string(),
        );
        assert_eq!(short.trigger_direction, Some(TriggerDirection::Rising));
        assert_eq!(short.side, Side::Buy);

        let wire = WirePlaceOrderRequest::from(&long);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["triggerDirection"], 2);
        assert_eq!(json["stopOrderType"], "StopLoss");
    }

    #[test]
    fn instrument_info_parses() {
        let wire: WireInstrument = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","priceScale":"2",
                "lotSizeFilter":{"qtyStep":"0.001","minOrderQty":"0.001"},
                "priceFilter":{"tickSize":"0.10"}}"#,
        )
        .unwrap();
        let info = wire.into_info().unwrap();
        assert_eq!(info.qty_step, Money::from(dec!(0.001)));
        assert_eq!(info.min_qty, Money::from(dec!(0.001)));
        assert_eq!(info.tick_size, Money::from(dec!(0.10)));
        assert_eq!(info.price_scale, 2);
    }
}
