use anyhow::{Context, Result};
use broker_trait::{BrokerOrder, BrokerOrderSide, BrokerPosition};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub account_number: String,
    pub status: String,
    pub currency: String,
    pub buying_power: String,
    pub cash: String,
    pub portfolio_value: String,
    pub trading_blocked: bool,
    pub account_blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, qty: Decimal, side: BrokerOrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            qty: qty.normalize().to_string(),
            side: match side {
                BrokerOrderSide::Buy => OrderSide::Buy,
                BrokerOrderSide::Sell => OrderSide::Sell,
            },
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub symbol: String,
    #[serde(rename = "qty")]
    pub quantity: Option<String>,
    #[serde(rename = "filled_qty")]
    pub filled_quantity: Option<String>,
    pub filled_avg_price: Option<String>,
    pub side: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Position {
    pub symbol: String,
    pub qty: String,
    pub side: String,
    pub market_value: String,
    pub cost_basis: String,
    pub unrealized_pl: String,
    pub current_price: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Clock {
    pub timestamp: DateTime<Utc>,
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LatestTrade {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "p")]
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LatestTradeResponse {
    pub symbol: String,
    pub trade: LatestTrade,
}

fn decimal(field: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Invalid {} from Alpaca: {:?}", field, raw))
}

fn optional_decimal(raw: &Option<String>) -> Option<Decimal> {
    raw.as_deref().and_then(|s| Decimal::from_str(s).ok())
}

impl Account {
    pub fn cash_decimal(&self) -> Result<Decimal> {
        decimal("cash", &self.cash)
    }
}

impl Position {
    pub fn to_broker(&self) -> Result<BrokerPosition> {
        Ok(BrokerPosition {
            symbol: self.symbol.clone(),
            qty: decimal("qty", &self.qty)?,
            market_value: decimal("market_value", &self.market_value)?,
            cost_basis: decimal("cost_basis", &self.cost_basis)?,
            unrealized_pl: decimal("unrealized_pl", &self.unrealized_pl)?,
            current_price: decimal("current_price", &self.current_price)?,
        })
    }
}

impl Order {
    pub fn to_broker(&self) -> BrokerOrder {
        let qty = optional_decimal(&self.quantity).unwrap_or_default();
        BrokerOrder {
            id: self.id.clone(),
            created_at: self.created_at,
            filled_at: self.filled_at,
            symbol: self.symbol.clone(),
            qty,
            filled_qty: optional_decimal(&self.filled_quantity),
            filled_avg_price: optional_decimal(&self.filled_avg_price),
            side: if self.side == "sell" {
                BrokerOrderSide::Sell
            } else {
                BrokerOrderSide::Buy
            },
            status: self.status.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_conversion_keeps_short_sign() {
        let json = r#"{
            "symbol": "IVV",
            "qty": "-3",
            "side": "short",
            "market_value": "-1500.30",
            "cost_basis": "-1400.00",
            "unrealized_pl": "-100.30",
            "current_price": "500.10"
        }"#;
        let position: Position = serde_json::from_str(json).unwrap();
        let broker = position.to_broker().unwrap();

        assert_eq!(broker.qty, Decimal::from(-3));
        assert_eq!(broker.unrealized_pl, Decimal::from_str("-100.30").unwrap());
    }

    #[test]
    fn test_bad_decimal_is_an_error() {
        let position = Position {
            symbol: "VOO".into(),
            qty: "ten".into(),
            side: "long".into(),
            market_value: "0".into(),
            cost_basis: "0".into(),
            unrealized_pl: "0".into(),
            current_price: "0".into(),
        };
        assert!(position.to_broker().is_err());
    }

    #[test]
    fn test_market_order_request_serialization() {
        let request = OrderRequest::market(
            "VOO",
            Decimal::from_str("12.000").unwrap(),
            BrokerOrderSide::Sell,
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["qty"], "12");
        assert_eq!(value["side"], "sell");
        assert_eq!(value["type"], "market");
        assert_eq!(value["time_in_force"], "day");
    }

    #[test]
    fn test_latest_trade_parsing() {
        let json = r#"{"symbol":"VOO","trade":{"t":"2024-03-06T19:59:59Z","p":471.23,"s":100}}"#;
        let response: LatestTradeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.trade.price, 471.23);
    }
}
