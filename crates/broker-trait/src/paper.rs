//! In-memory simulated brokerage.
//!
//! Market orders fill immediately at the latest set price. The clock only
//! moves when told to, which makes the broker usable for backtests and tests.

use crate::{
    BrokerClient, BrokerOrder, BrokerOrderRequest, BrokerPosition, MarketClock, OrderSink,
    PortfolioView, PriceSource,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    qty: Decimal,
    /// Signed total cost; negative for shorts
    cost_basis: Decimal,
}

#[derive(Debug)]
struct PaperAccount {
    cash: Decimal,
    positions: BTreeMap<String, PaperPosition>,
    prices: HashMap<String, Decimal>,
    now: DateTime<Utc>,
    market_open: bool,
    pending_orders: bool,
    orders: Vec<BrokerOrder>,
}

impl PaperAccount {
    fn apply_fill(&mut self, symbol: &str, delta: Decimal, price: Decimal) {
        let position = self.positions.entry(symbol.to_string()).or_default();
        let old_qty = position.qty;
        let new_qty = old_qty + delta;

        if new_qty.is_zero() {
            self.positions.remove(symbol);
        } else if old_qty.is_zero() || old_qty.is_sign_positive() == delta.is_sign_positive() {
            position.cost_basis += delta * price;
            position.qty = new_qty;
        } else if old_qty.is_sign_positive() == new_qty.is_sign_positive() {
            position.cost_basis = position.cost_basis * new_qty / old_qty;
            position.qty = new_qty;
        } else {
            // crossed through zero
            position.cost_basis = new_qty * price;
            position.qty = new_qty;
        }

        self.cash -= delta * price;
    }
}

pub struct PaperBroker {
    account: RwLock<PaperAccount>,
}

impl PaperBroker {
    /// Open, empty account with `cash` at time `now`
    pub fn new(cash: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            account: RwLock::new(PaperAccount {
                cash,
                positions: BTreeMap::new(),
                prices: HashMap::new(),
                now,
                market_open: true,
                pending_orders: false,
                orders: Vec::new(),
            }),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.account
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    pub async fn set_prices(&self, prices: HashMap<String, Decimal>) {
        self.account.write().await.prices.extend(prices);
    }

    /// Seed a position bought at `cost_per_share` without touching cash
    pub async fn seed_position(&self, symbol: &str, qty: Decimal, cost_per_share: Decimal) {
        let mut account = self.account.write().await;
        account.positions.insert(
            symbol.to_string(),
            PaperPosition {
                qty,
                cost_basis: qty * cost_per_share,
            },
        );
    }

    pub async fn set_cash(&self, cash: Decimal) {
        self.account.write().await.cash = cash;
    }

    pub async fn set_market_open(&self, open: bool) {
        self.account.write().await.market_open = open;
    }

    /// Make `has_open_orders` report unfilled orders
    pub async fn set_pending_orders(&self, pending: bool) {
        self.account.write().await.pending_orders = pending;
    }

    pub async fn advance(&self, by: Duration) {
        let mut account = self.account.write().await;
        account.now += by;
    }

    /// Every order submitted so far, oldest first
    pub async fn orders(&self) -> Vec<BrokerOrder> {
        self.account.read().await.orders.clone()
    }
}

#[async_trait]
impl MarketClock for PaperBroker {
    async fn now(&self) -> Result<DateTime<Utc>> {
        Ok(self.account.read().await.now)
    }

    async fn is_market_open(&self, _symbol: &str) -> Result<bool> {
        Ok(self.account.read().await.market_open)
    }
}

#[async_trait]
impl PortfolioView for PaperBroker {
    async fn cash(&self) -> Result<Decimal> {
        Ok(self.account.read().await.cash)
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        let account = self.account.read().await;
        account
            .positions
            .iter()
            .map(|(symbol, position)| {
                let price = account
                    .prices
                    .get(symbol)
                    .copied()
                    .ok_or_else(|| anyhow!("No price for held symbol {}", symbol))?;
                let market_value = position.qty * price;
                Ok(BrokerPosition {
                    symbol: symbol.clone(),
                    qty: position.qty,
                    market_value,
                    cost_basis: position.cost_basis,
                    unrealized_pl: market_value - position.cost_basis,
                    current_price: price,
                })
            })
            .collect()
    }

    async fn has_open_orders(&self) -> Result<bool> {
        Ok(self.account.read().await.pending_orders)
    }

    async fn deposit(&self, amount: Decimal) -> Result<()> {
        if amount.is_sign_negative() {
            bail!("Deposit must not be negative: {}", amount);
        }
        self.account.write().await.cash += amount;
        tracing::debug!("Paper deposit of {}", amount);
        Ok(())
    }
}

#[async_trait]
impl PriceSource for PaperBroker {
    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        Ok(self.account.read().await.prices.get(symbol).copied())
    }
}

#[async_trait]
impl OrderSink for PaperBroker {
    async fn submit_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder> {
        let mut account = self.account.write().await;
        if !account.market_open {
            bail!("Market closed, rejecting order for {}", order.symbol);
        }
        let price = account
            .prices
            .get(&order.symbol)
            .copied()
            .filter(|p| p.is_sign_positive() && !p.is_zero())
            .ok_or_else(|| anyhow!("No usable price for {}", order.symbol))?;

        account.apply_fill(&order.symbol, order.signed_qty(), price);

        let filled = BrokerOrder {
            id: format!("paper-{}", account.orders.len() + 1),
            created_at: account.now,
            filled_at: Some(account.now),
            symbol: order.symbol.clone(),
            qty: order.qty,
            filled_qty: Some(order.qty),
            filled_avg_price: Some(price),
            side: order.side,
            status: "filled".to_string(),
        };
        tracing::info!(
            "Paper fill: {} {} {} @ {}",
            filled.side,
            filled.qty,
            filled.symbol,
            price
        );
        account.orders.push(filled.clone());
        Ok(filled)
    }
}

impl BrokerClient for PaperBroker {
    fn is_paper(&self) -> bool {
        true
    }

    fn broker_name(&self) -> &str {
        "paper"
    }
}
