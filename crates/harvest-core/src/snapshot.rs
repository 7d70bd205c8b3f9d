use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One held position, read-only for the duration of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub symbol: String,
    /// Signed share count; negative means short
    pub quantity: f64,
    /// Market value of the holding (negative for shorts)
    pub holdings_value: f64,
    pub unrealized_profit: f64,
}

impl PositionView {
    pub fn new(
        symbol: impl Into<String>,
        quantity: f64,
        holdings_value: f64,
        unrealized_profit: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            holdings_value,
            unrealized_profit,
        }
    }

    /// Profit per unit of value. The `+ 0.1` keeps zero-value positions finite.
    pub fn profit_ratio(&self) -> f64 {
        profit_ratio(self.unrealized_profit, self.holdings_value)
    }

    pub fn unrealized_profit_percent(&self) -> f64 {
        let cost = self.holdings_value - self.unrealized_profit;
        if cost.abs() > f64::EPSILON {
            self.unrealized_profit / cost * 100.0
        } else {
            0.0
        }
    }

    pub fn is_short(&self) -> bool {
        self.quantity < 0.0
    }
}

pub(crate) fn profit_ratio(profit: f64, value: f64) -> f64 {
    profit / (value + 0.1)
}

/// Everything the engine reads about the portfolio for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub cash: f64,
    /// Held positions keyed by symbol; zero-quantity entries are ignored
    pub positions: BTreeMap<String, PositionView>,
    /// Latest price per symbol
    pub prices: HashMap<String, f64>,
    pub market_open: bool,
    pub has_open_orders: bool,
}

impl PortfolioSnapshot {
    pub fn new(cash: f64) -> Self {
        Self {
            cash,
            market_open: true,
            ..Default::default()
        }
    }

    pub fn with_position(mut self, position: PositionView) -> Self {
        self.positions.insert(position.symbol.clone(), position);
        self
    }

    pub fn with_price(mut self, symbol: impl Into<String>, price: f64) -> Self {
        self.prices.insert(symbol.into(), price);
        self
    }

    pub fn market_closed(mut self) -> Self {
        self.market_open = false;
        self
    }

    /// Latest price, falling back to value per share for held symbols.
    pub fn price(&self, symbol: &str) -> Option<f64> {
        if let Some(price) = self.prices.get(symbol) {
            return Some(*price);
        }
        self.positions
            .get(symbol)
            .filter(|p| p.quantity != 0.0)
            .map(|p| p.holdings_value / p.quantity)
    }

    pub fn is_invested(&self) -> bool {
        self.positions.values().any(|p| p.quantity != 0.0)
    }

    /// Sum of holdings values
    pub fn holdings_value(&self) -> f64 {
        self.positions.values().map(|p| p.holdings_value).sum()
    }

    pub fn total_value(&self) -> f64 {
        self.cash + self.holdings_value()
    }
}
