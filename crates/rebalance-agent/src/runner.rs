use crate::state::{save_ledger, KeyValueStore};
use anyhow::{Context, Result};
use broker_trait::{BrokerClient, BrokerOrder, BrokerOrderRequest};
use harvest_core::{
    portfolio_report, Action, CooldownLedger, PolicyConfig, PortfolioSnapshot, PositionView,
    RebalanceEngine, RebalanceOutcome, RunMode, RunOptions, RunStatus, Transcript,
};
use notification_service::{Alert, AlertType, NotificationService};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;

/// What a rebalance run decided and what actually reached the broker
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RebalanceOutcome,
    pub orders: Vec<BrokerOrder>,
    pub failed_orders: usize,
}

/// Serializes rebalance runs against one broker account.
///
/// The ledger lock is held for a whole run, so two runs never overlap.
pub struct Rebalancer {
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn KeyValueStore>,
    notifier: Option<Arc<NotificationService>>,
    policy: PolicyConfig,
    mode: RunMode,
    ledger: Mutex<CooldownLedger>,
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl Rebalancer {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn KeyValueStore>,
        policy: PolicyConfig,
        mode: RunMode,
        ledger: CooldownLedger,
    ) -> Self {
        Self {
            broker,
            store,
            notifier: None,
            policy,
            mode,
            ledger: Mutex::new(ledger),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<NotificationService>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Read cash, positions, flags and universe prices from the broker.
    pub async fn snapshot(&self) -> Result<PortfolioSnapshot> {
        let market_open = self
            .broker
            .is_market_open(&self.policy.reference_symbol)
            .await
            .context("Failed to read market clock")?;
        let has_open_orders = self
            .broker
            .has_open_orders()
            .await
            .context("Failed to read open orders")?;
        let cash = self.broker.cash().await.context("Failed to read cash")?;

        let mut snapshot = PortfolioSnapshot::new(to_f64(cash));
        snapshot.market_open = market_open;
        snapshot.has_open_orders = has_open_orders;

        for position in self
            .broker
            .positions()
            .await
            .context("Failed to read positions")?
        {
            snapshot
                .prices
                .insert(position.symbol.clone(), to_f64(position.current_price));
            snapshot = snapshot.with_position(PositionView::new(
                position.symbol,
                to_f64(position.qty),
                to_f64(position.market_value),
                to_f64(position.unrealized_pl),
            ));
        }

        for symbol in self.policy.universe() {
            if snapshot.prices.contains_key(&symbol) {
                continue;
            }
            match self.broker.latest_price(&symbol).await {
                Ok(Some(price)) => {
                    snapshot.prices.insert(symbol, to_f64(price));
                }
                Ok(None) => tracing::debug!("No price for {}", symbol),
                Err(e) => tracing::warn!("Price lookup failed for {}: {}", symbol, e),
            }
        }

        Ok(snapshot)
    }

    /// One full rebalance pass. With `email_only` nothing is submitted and
    /// the ledger is left alone.
    pub async fn rebalance(&self, email_only: bool) -> Result<RunReport> {
        let mut ledger = self.ledger.lock().await;

        let snapshot = self.snapshot().await?;
        let now = self.broker.now().await?;
        let options = RunOptions {
            mode: self.mode,
            email_only,
        };

        let before = ledger.clone();
        let mut outcome =
            RebalanceEngine::new(&self.policy).run(&snapshot, &mut ledger, now, options);
        let mut orders = Vec::new();
        let mut failed_orders = 0;

        if !email_only && !outcome.is_skipped() {
            if outcome.deposited > 0.0 {
                let amount = Decimal::from_f64(outcome.deposited).unwrap_or_default();
                if let Err(e) = self.broker.deposit(amount).await {
                    *ledger = before;
                    return Err(e.context("Deposit failed, no orders submitted"));
                }
            }

            for action in &outcome.actions {
                match self.execute(action).await {
                    Ok(order) => {
                        outcome
                            .transcript
                            .push(format!("Submitted {} (order {})", action, order.id));
                        orders.push(order);
                        // the in-memory ledger stays current; the next save retries
                        if action.is_sell() {
                            if let Err(e) = save_ledger(self.store.as_ref(), &ledger).await {
                                tracing::error!("Failed to persist cooldown ledger: {:#}", e);
                                outcome.transcript.push(format!(
                                    "Ledger save failed after {}: {:#}",
                                    action, e
                                ));
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("Order for {} failed: {}", action.symbol(), e);
                        outcome
                            .transcript
                            .push(format!("Order failed for {}: {}", action, e));
                        failed_orders += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Rebalance {:?}: {} actions, {} submitted, {} failed",
            outcome.status,
            outcome.actions.len(),
            orders.len(),
            failed_orders
        );

        self.notify_run(&outcome, email_only).await;
        Ok(RunReport {
            outcome,
            orders,
            failed_orders,
        })
    }

    async fn execute(&self, action: &Action) -> Result<BrokerOrder> {
        let delta = Decimal::from_f64(action.order_quantity())
            .with_context(|| format!("Quantity not representable: {}", action))?;
        let request = BrokerOrderRequest::from_signed(action.symbol(), delta)
            .with_context(|| format!("Zero quantity order: {}", action))?;
        self.broker.submit_market_order(request).await
    }

    /// Holdings, cash and total value as a transcript
    pub async fn portfolio_report(&self) -> Result<Transcript> {
        let snapshot = self.snapshot().await?;
        let transcript = portfolio_report(&snapshot);

        if self.mode == RunMode::Live {
            if let Some(notifier) = &self.notifier {
                let alert = Alert::new(
                    AlertType::PortfolioReport {
                        cash: snapshot.cash,
                        total_value: snapshot.total_value(),
                        positions_count: snapshot.positions.len(),
                    },
                    "Portfolio Report",
                    transcript.render(),
                );
                notifier.send_alert_async(&alert).await;
            }
        }
        Ok(transcript)
    }

    pub async fn persist_ledger(&self) -> Result<()> {
        let ledger = self.ledger.lock().await;
        save_ledger(self.store.as_ref(), &ledger).await
    }

    pub async fn ledger(&self) -> CooldownLedger {
        self.ledger.lock().await.clone()
    }

    // Notifications are best-effort and only sent for live accounts
    async fn notify_run(&self, outcome: &RebalanceOutcome, email_only: bool) {
        if self.mode != RunMode::Live {
            return;
        }
        let Some(notifier) = &self.notifier else {
            return;
        };

        let prefix = if email_only { "Faux " } else { "" };
        let alert_type = match outcome.status {
            RunStatus::Skipped(reason) => AlertType::RunSkipped {
                reason: format!("{:?}", reason),
            },
            RunStatus::Completed => AlertType::RebalanceReport {
                mode: self.mode.to_string(),
                preview: email_only,
                sells: outcome.sells().count(),
                buys: outcome.buys().count(),
            },
        };
        let alert = Alert::new(
            alert_type,
            format!("{}Rebalance", prefix),
            outcome.transcript.render(),
        );
        notifier.send_alert_async(&alert).await;
    }

    /// Report a run that never reached the engine
    pub async fn notify_failure(&self, error: &anyhow::Error) {
        if self.mode != RunMode::Live {
            return;
        }
        if let Some(notifier) = &self.notifier {
            let alert = Alert::new(
                AlertType::RunFailed {
                    reason: format!("{:#}", error),
                },
                "Rebalance failed",
                format!("{:#}", error),
            );
            notifier.send_alert_async(&alert).await;
        }
    }
}
