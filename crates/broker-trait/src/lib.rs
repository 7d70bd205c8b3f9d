use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod paper;

pub use paper::PaperBroker;

// ---------------------------------------------------------------------------
// Unified broker types (broker-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed share count, negative for shorts
    #[serde(with = "rust_decimal::serde::float")]
    pub qty: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub market_value: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub cost_basis: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub unrealized_pl: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub current_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerOrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for BrokerOrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerOrderSide::Buy => write!(f, "buy"),
            BrokerOrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub symbol: String,
    /// Always positive; direction is carried by `side`
    pub qty: Decimal,
    pub side: BrokerOrderSide,
}

impl BrokerOrderRequest {
    pub fn buy(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: BrokerOrderSide::Buy,
        }
    }

    pub fn sell(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side: BrokerOrderSide::Sell,
        }
    }

    /// Order for a signed share delta: positive buys, negative sells.
    /// Returns None for a zero delta.
    pub fn from_signed(symbol: impl Into<String>, delta: Decimal) -> Option<Self> {
        if delta.is_zero() {
            None
        } else if delta.is_sign_positive() {
            Some(Self::buy(symbol, delta))
        } else {
            Some(Self::sell(symbol, -delta))
        }
    }

    /// Signed share delta of this order
    pub fn signed_qty(&self) -> Decimal {
        match self.side {
            BrokerOrderSide::Buy => self.qty,
            BrokerOrderSide::Sell => -self.qty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub symbol: String,
    pub qty: Decimal,
    pub filled_qty: Option<Decimal>,
    pub filled_avg_price: Option<Decimal>,
    pub side: BrokerOrderSide,
    pub status: String,
}

impl BrokerOrder {
    pub fn is_open(&self) -> bool {
        matches!(
            self.status.as_str(),
            "new" | "accepted" | "pending_new" | "partially_filled"
        )
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MarketClock: Send + Sync {
    /// Current time as the broker sees it
    async fn now(&self) -> Result<DateTime<Utc>>;

    /// Whether the exchange trading `symbol` is open
    async fn is_market_open(&self, symbol: &str) -> Result<bool>;
}

#[async_trait]
pub trait PortfolioView: Send + Sync {
    async fn cash(&self) -> Result<Decimal>;

    /// All non-zero positions
    async fn positions(&self) -> Result<Vec<BrokerPosition>>;

    async fn has_open_orders(&self) -> Result<bool>;

    /// Add cash to the account (simulated accounts only)
    async fn deposit(&self, amount: Decimal) -> Result<()>;
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Latest trade price, None if the symbol has no data yet
    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>>;
}

#[async_trait]
pub trait OrderSink: Send + Sync {
    async fn submit_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder>;
}

/// Everything the rebalancer needs from a brokerage
pub trait BrokerClient: MarketClock + PortfolioView + PriceSource + OrderSink {
    /// Whether this is a paper/simulated account
    fn is_paper(&self) -> bool;

    /// Broker name for logging
    fn broker_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_from_signed_delta() {
        let buy = BrokerOrderRequest::from_signed("VOO", Decimal::from(3)).unwrap();
        assert_eq!(buy.side, BrokerOrderSide::Buy);
        assert_eq!(buy.qty, Decimal::from(3));

        let sell = BrokerOrderRequest::from_signed("VOO", Decimal::from(-7)).unwrap();
        assert_eq!(sell.side, BrokerOrderSide::Sell);
        assert_eq!(sell.qty, Decimal::from(7));
        assert_eq!(sell.signed_qty(), Decimal::from(-7));

        assert!(BrokerOrderRequest::from_signed("VOO", Decimal::ZERO).is_none());
    }

    #[test]
    fn test_position_json_uses_numbers() {
        let position = BrokerPosition {
            symbol: "BND".into(),
            qty: Decimal::from(12),
            market_value: Decimal::new(86_400, 2),
            cost_basis: Decimal::from(900),
            unrealized_pl: Decimal::new(-3_600, 2),
            current_price: Decimal::from(72),
        };
        let value = serde_json::to_value(&position).unwrap();
        assert_eq!(value["qty"], 12.0);
        assert_eq!(value["unrealized_pl"], -36.0);

        let restored: BrokerPosition = serde_json::from_value(value).unwrap();
        assert_eq!(restored, position);
    }
}
