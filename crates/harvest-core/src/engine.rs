//! Tax-Lot Substitution Rebalancing Engine
//!
//! Pure decision function: (snapshot, policy, clock) -> ordered actions.
//! Sells always come before buy sizing so that freed cash is visible to it.
//! The engine does no I/O; an executor submits the returned actions in order
//! and persists the cooldown ledger after every sell.

use crate::cooldown::CooldownLedger;
use crate::policy::{AssetClass, PolicyConfig};
use crate::snapshot::{profit_ratio, PortfolioSnapshot, PositionView};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which host the engine is running for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Simulation: periodic deposits, no cash buffer
    Backtest,
    /// Real account: covers negative cash, keeps a buy-limit buffer
    Live,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Backtest => write!(f, "backtest"),
            RunMode::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "backtest" | "simulation" | "paper" => Ok(RunMode::Backtest),
            "live" => Ok(RunMode::Live),
            other => Err(format!("unknown run mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Log intended actions without recording sales in the ledger
    pub email_only: bool,
}

impl RunOptions {
    pub fn backtest() -> Self {
        Self {
            mode: RunMode::Backtest,
            email_only: false,
        }
    }

    pub fn live() -> Self {
        Self {
            mode: RunMode::Live,
            email_only: false,
        }
    }

    pub fn email_only(mut self) -> Self {
        self.email_only = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SellReason {
    /// Held symbol is not in any asset class
    OutOfPolicy,
    /// Negative position being closed
    ShortCover,
    /// Live cash balance was negative
    CashShortfall,
    /// Non-target substitute with a loss past the harvest limit
    HarvestLoss,
}

impl std::fmt::Display for SellReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SellReason::OutOfPolicy => write!(f, "out of policy"),
            SellReason::ShortCover => write!(f, "short cover"),
            SellReason::CashShortfall => write!(f, "cash shortfall"),
            SellReason::HarvestLoss => write!(f, "harvest loss"),
        }
    }
}

/// One decision for the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Reduce a position by `quantity` shares. A full liquidation carries the
    /// held quantity, which is negative for a short.
    Sell {
        symbol: String,
        quantity: f64,
        reason: SellReason,
    },
    Buy {
        symbol: String,
        quantity: f64,
        asset_class: String,
    },
}

impl Action {
    pub fn symbol(&self) -> &str {
        match self {
            Action::Sell { symbol, .. } | Action::Buy { symbol, .. } => symbol,
        }
    }

    /// Signed market-order quantity: negative sells, positive buys.
    pub fn order_quantity(&self) -> f64 {
        match self {
            Action::Sell { quantity, .. } => -quantity,
            Action::Buy { quantity, .. } => *quantity,
        }
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, Action::Sell { .. })
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Sell {
                symbol,
                quantity,
                reason,
            } => write!(f, "SELL {} x{} ({})", symbol, quantity, reason),
            Action::Buy {
                symbol,
                quantity,
                asset_class,
            } => write!(f, "BUY {} x{} (class {})", symbol, quantity, asset_class),
        }
    }
}

/// Why a run did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    MarketClosed,
    OrdersPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    Skipped(SkipReason),
}

/// Recoverable problems met during a run. They are recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunAnomaly {
    /// Every substitute of the class is still cooling down
    NoEligibleTarget { asset_class: String },
    /// Cash stayed negative with nothing left to sell; buys were skipped
    InsufficientCash { shortfall: f64 },
    NonPositivePrice { symbol: String, price: f64 },
    MissingPrice { symbol: String },
}

impl std::fmt::Display for RunAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunAnomaly::NoEligibleTarget { asset_class } => {
                write!(f, "no eligible buy target for {}", asset_class)
            }
            RunAnomaly::InsufficientCash { shortfall } => {
                write!(f, "cash short by {:.2} with nothing left to sell", shortfall)
            }
            RunAnomaly::NonPositivePrice { symbol, price } => {
                write!(f, "non-positive price {} for {}", price, symbol)
            }
            RunAnomaly::MissingPrice { symbol } => write!(f, "no price for {}", symbol),
        }
    }
}

/// Line log of a run, sent as the notification body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    pub fn push(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!("{}", line);
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

/// Result of one engine invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceOutcome {
    pub status: RunStatus,
    /// Actions in the order they must be executed
    pub actions: Vec<Action>,
    pub anomalies: Vec<RunAnomaly>,
    pub transcript: Transcript,
    /// Deposit the engine assumed was added to cash
    pub deposited: f64,
    /// Asset class id -> chosen buy symbol
    pub buy_targets: BTreeMap<String, String>,
    /// Simulated cash after every action
    pub ending_cash: f64,
}

impl RebalanceOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self.status, RunStatus::Skipped(_))
    }

    pub fn sells(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.is_sell())
    }

    pub fn buys(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| !a.is_sell())
    }
}

/// Mutable working state of a single pass. Never persisted.
struct RebalanceState<'a> {
    options: RunOptions,
    now: DateTime<Utc>,
    ledger: &'a mut CooldownLedger,
    cash: f64,
    positions: BTreeMap<String, PositionView>,
    actions: Vec<Action>,
    anomalies: Vec<RunAnomaly>,
    transcript: Transcript,
    buy_targets: BTreeMap<String, String>,
    deposited: f64,
}

impl RebalanceState<'_> {
    fn held_symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    fn profit_ratio(&self, symbol: &str) -> f64 {
        self.positions
            .get(symbol)
            .map(|p| p.profit_ratio())
            .unwrap_or_else(|| profit_ratio(0.0, 0.0))
    }

    fn record_sale(&mut self, symbol: &str) {
        if !self.options.email_only {
            self.ledger.record_sale(symbol, self.now);
        }
    }

    /// Sell the whole position; its value (negative for shorts) lands in cash.
    fn liquidate(&mut self, symbol: &str, reason: SellReason) {
        let Some(position) = self.positions.remove(symbol) else {
            return;
        };
        self.transcript.push(format!(
            "Sell ({}): {}",
            reason,
            position_row(&position)
        ));
        self.cash += position.holdings_value;
        self.actions.push(Action::Sell {
            symbol: symbol.to_string(),
            quantity: position.quantity,
            reason,
        });
        self.record_sale(symbol);
    }

    /// Sell part of a long position at `price`.
    fn sell_partial(&mut self, symbol: &str, quantity: f64, price: f64, reason: SellReason) {
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };
        let quantity = quantity.min(position.quantity);
        if quantity >= position.quantity {
            self.liquidate(symbol, reason);
            return;
        }

        let remaining = (position.quantity - quantity) / position.quantity;
        position.quantity -= quantity;
        position.holdings_value *= remaining;
        position.unrealized_profit *= remaining;

        self.transcript.push(format!(
            "Sell ({}): {}:\tquantity: {}\tprice: {}\tvalue: {}",
            reason,
            symbol,
            quantity,
            price,
            quantity * price
        ));
        self.cash += quantity * price;
        self.actions.push(Action::Sell {
            symbol: symbol.to_string(),
            quantity,
            reason,
        });
        self.record_sale(symbol);
    }

    fn buy(&mut self, class: &AssetClass, symbol: &str, quantity: f64, price: f64) {
        if quantity <= 0.0 {
            return;
        }
        self.transcript.push(format!(
            "Buy: {}:\tquantity: {}\tprice: {}\tvalue: {}",
            symbol,
            quantity,
            price,
            price * quantity
        ));
        self.cash -= quantity * price;
        self.actions.push(Action::Buy {
            symbol: symbol.to_string(),
            quantity,
            asset_class: class.id.clone(),
        });
    }

    fn anomaly(&mut self, anomaly: RunAnomaly) {
        tracing::warn!("Rebalance anomaly: {}", anomaly);
        self.transcript.push(format!("Warning: {}", anomaly));
        self.anomalies.push(anomaly);
    }

    fn finish(self, status: RunStatus) -> RebalanceOutcome {
        RebalanceOutcome {
            status,
            actions: self.actions,
            anomalies: self.anomalies,
            transcript: self.transcript,
            deposited: self.deposited,
            buy_targets: self.buy_targets,
            ending_cash: self.cash,
        }
    }
}

fn position_row(position: &PositionView) -> String {
    format!(
        "{}:\tquantity: {}\tvalue: {}\tprofit: {}\tpercent: {:.2}",
        position.symbol,
        position.quantity,
        position.holdings_value,
        position.unrealized_profit,
        position.unrealized_profit_percent()
    )
}

/// Highest ratio wins; an exact tie goes to the lexicographically smaller symbol.
fn select_best<'s, I>(candidates: I) -> Option<(&'s str, f64)>
where
    I: IntoIterator<Item = (&'s str, f64)>,
{
    candidates
        .into_iter()
        .fold(None, |best, (symbol, ratio)| match best {
            None => Some((symbol, ratio)),
            Some((best_symbol, best_ratio)) => {
                if ratio > best_ratio || (ratio == best_ratio && symbol < best_symbol) {
                    Some((symbol, ratio))
                } else {
                    Some((best_symbol, best_ratio))
                }
            }
        })
}

/// Decides sells and buys for one rebalance pass
pub struct RebalanceEngine<'a> {
    policy: &'a PolicyConfig,
}

impl<'a> RebalanceEngine<'a> {
    /// The policy must already have passed [`PolicyConfig::validate`].
    pub fn new(policy: &'a PolicyConfig) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PolicyConfig {
        self.policy
    }

    /// Run one pass. Sales are recorded in `ledger` unless the run is
    /// email-only; the caller persists it.
    pub fn run(
        &self,
        snapshot: &PortfolioSnapshot,
        ledger: &mut CooldownLedger,
        now: DateTime<Utc>,
        options: RunOptions,
    ) -> RebalanceOutcome {
        let mut state = RebalanceState {
            options,
            now,
            ledger,
            cash: snapshot.cash,
            positions: snapshot
                .positions
                .iter()
                .filter(|(_, p)| p.quantity != 0.0)
                .map(|(symbol, p)| (symbol.clone(), p.clone()))
                .collect(),
            actions: Vec::new(),
            anomalies: Vec::new(),
            transcript: Transcript::default(),
            buy_targets: BTreeMap::new(),
            deposited: 0.0,
        };

        state.transcript.push(format!(
            "{}Rebalance Run ({}) at {}",
            if options.email_only { "Faux " } else { "" },
            options.mode,
            now.to_rfc3339()
        ));

        if !snapshot.market_open {
            state.transcript.push("Market Closed");
            return state.finish(RunStatus::Skipped(SkipReason::MarketClosed));
        }
        if snapshot.has_open_orders {
            state.transcript.push("Orders Still Open");
            return state.finish(RunStatus::Skipped(SkipReason::OrdersPending));
        }

        if options.mode == RunMode::Backtest && self.policy.deposit > 0.0 {
            state.cash += self.policy.deposit;
            state.deposited = self.policy.deposit;
            state
                .transcript
                .push(format!("Deposit: {}", self.policy.deposit));
        }

        self.purge_out_of_policy(&mut state);
        self.cover_shorts(&mut state);

        let cash_covered = match options.mode {
            RunMode::Live => self.cover_cash_shortfall(&mut state, snapshot),
            RunMode::Backtest => true,
        };

        self.select_buy_targets(&mut state);
        self.harvest_losses(&mut state);

        if cash_covered {
            self.size_buys(&mut state, snapshot);
        } else {
            state.transcript.push("Skipping buys: cash shortfall not covered");
        }

        tracing::info!(
            "Rebalance pass finished: {} actions, {} anomalies, cash {:.2}",
            state.actions.len(),
            state.anomalies.len(),
            state.cash
        );
        state.finish(RunStatus::Completed)
    }

    fn purge_out_of_policy(&self, state: &mut RebalanceState<'_>) {
        for symbol in state.held_symbols() {
            if !self.policy.in_universe(&symbol) {
                state.liquidate(&symbol, SellReason::OutOfPolicy);
            }
        }
    }

    fn cover_shorts(&self, state: &mut RebalanceState<'_>) {
        for symbol in state.held_symbols() {
            let is_short = state
                .positions
                .get(&symbol)
                .map(|p| p.is_short())
                .unwrap_or(false);
            if is_short {
                state.liquidate(&symbol, SellReason::ShortCover);
            }
        }
    }

    /// Sell the most profitable holdings until cash is non-negative.
    /// Returns false when cash stays negative with nothing sellable.
    fn cover_cash_shortfall(
        &self,
        state: &mut RebalanceState<'_>,
        snapshot: &PortfolioSnapshot,
    ) -> bool {
        while state.cash < 0.0 {
            let best = select_best(
                state
                    .positions
                    .values()
                    .filter(|p| p.quantity > 0.0)
                    .filter(|p| snapshot.price(&p.symbol).is_some_and(|price| price > 0.0))
                    .map(|p| (p.symbol.as_str(), p.profit_ratio())),
            )
            .map(|(symbol, _)| symbol.to_string());

            let Some(symbol) = best else {
                let shortfall = -state.cash;
                state.anomaly(RunAnomaly::InsufficientCash { shortfall });
                return false;
            };

            let price = snapshot.price(&symbol).unwrap_or(0.0);
            let quantity = ((self.policy.buy_limit - state.cash) / price).ceil();
            state.sell_partial(&symbol, quantity, price, SellReason::CashShortfall);
        }
        true
    }

    fn select_buy_targets(&self, state: &mut RebalanceState<'_>) {
        let cooldown = self.policy.wash_sale_cooldown_secs;
        for class in &self.policy.asset_classes {
            let eligible: Vec<(&str, f64)> = class
                .substitutes
                .iter()
                .filter(|s| state.ledger.is_cleared(s, state.now, cooldown))
                .map(|s| (s.as_str(), state.profit_ratio(s)))
                .collect();

            state.transcript.push(format!(
                "{} eligible profit ratios: {:?}",
                class.id, eligible
            ));

            match select_best(eligible.iter().copied()) {
                Some((symbol, _)) => {
                    state
                        .buy_targets
                        .insert(class.id.clone(), symbol.to_string());
                }
                None => state.anomaly(RunAnomaly::NoEligibleTarget {
                    asset_class: class.id.clone(),
                }),
            }
        }
        state
            .transcript
            .push(format!("Buy targets: {:?}", state.buy_targets));
    }

    fn harvest_losses(&self, state: &mut RebalanceState<'_>) {
        for symbol in state.held_symbols() {
            let Some(class) = self.policy.class_of(&symbol) else {
                continue;
            };
            let Some(target) = state.buy_targets.get(&class.id) else {
                continue;
            };
            if *target == symbol {
                continue;
            }
            let profit = state
                .positions
                .get(&symbol)
                .map(|p| p.unrealized_profit)
                .unwrap_or(0.0);
            if profit < -self.policy.harvest_limit {
                state.liquidate(&symbol, SellReason::HarvestLoss);
            }
        }
    }

    fn size_buys(&self, state: &mut RebalanceState<'_>, snapshot: &PortfolioSnapshot) {
        let buy_limit = self.policy.buy_limit;
        let year = state.now.year();

        let mut cash = state.cash;
        state.transcript.push(format!("Cash after sells: {}", cash));
        if state.options.mode == RunMode::Live {
            if cash < buy_limit * 2.0 {
                state
                    .transcript
                    .push("Cash below twice the buy limit, nothing to buy");
                return;
            }
            cash -= buy_limit;
        }
        if cash <= 0.0 {
            state.transcript.push("No cash to invest");
            return;
        }

        let class_values: Vec<(&AssetClass, f64)> = self
            .policy
            .asset_classes
            .iter()
            .map(|class| {
                let held: f64 = class
                    .substitutes
                    .iter()
                    .filter_map(|s| state.positions.get(s))
                    .map(|p| p.holdings_value)
                    .sum();
                (class, held + self.policy.outside_allocation(class, year))
            })
            .collect();

        let total_value = class_values.iter().map(|(_, v)| v).sum::<f64>() + cash;

        let desired: Vec<(&AssetClass, f64)> = class_values
            .iter()
            .map(|(class, value)| {
                let target = total_value * self.policy.effective_weight(class, year);
                (*class, (target - value).max(0.0))
            })
            .collect();
        state.transcript.push(format!(
            "Class values: {:?}, total: {}",
            class_values
                .iter()
                .map(|(c, v)| (c.id.as_str(), *v))
                .collect::<Vec<_>>(),
            total_value
        ));

        let surviving: Vec<(&AssetClass, f64)> = desired
            .into_iter()
            .filter(|(_, want)| *want >= buy_limit)
            .collect();
        let desired_sum: f64 = surviving.iter().map(|(_, want)| want).sum();
        state.transcript.push(format!(
            "Desired buys: {:?}",
            surviving
                .iter()
                .map(|(c, v)| (c.id.as_str(), *v))
                .collect::<Vec<_>>()
        ));
        if desired_sum <= 0.0 {
            state.transcript.push("All classes at target");
            return;
        }

        for (class, want) in surviving {
            let allotted = cash / desired_sum * want;
            if allotted <= buy_limit {
                continue;
            }
            // a class without a target keeps its share in cash
            let Some(symbol) = state.buy_targets.get(&class.id).cloned() else {
                continue;
            };
            match snapshot.price(&symbol) {
                None => state.anomaly(RunAnomaly::MissingPrice { symbol }),
                Some(price) if price <= 0.0 => {
                    state.anomaly(RunAnomaly::NonPositivePrice { symbol, price })
                }
                Some(price) => {
                    let quantity = (allotted / price).floor();
                    state.buy(class, &symbol, quantity, price);
                }
            }
        }
    }
}
