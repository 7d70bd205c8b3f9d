//! Data readiness gate
//!
//! Runs wait here until every universe symbol has a usable price.

use anyhow::{bail, Result};
use broker_trait::PriceSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct DataReadiness {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for DataReadiness {
    fn default() -> Self {
        Self::new()
    }
}

impl DataReadiness {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Already-ready gate, for backtests
    pub fn ready() -> Self {
        let readiness = Self::new();
        readiness.mark_ready();
        readiness
    }

    pub fn mark_ready(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Block until ready or until `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => bail!("Readiness gate dropped before data was ready"),
            Err(_) => bail!("Market data not ready after {}s", timeout.as_secs()),
        }
    }

    /// Poll `prices` until every symbol has a positive price, then mark ready.
    pub fn spawn_poller(
        &self,
        prices: Arc<dyn PriceSource>,
        symbols: Vec<String>,
        poll_interval: Duration,
    ) -> JoinHandle<()> {
        let readiness = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                match missing_prices(prices.as_ref(), &symbols).await {
                    Ok(missing) if missing.is_empty() => {
                        tracing::info!("Market data ready for {} symbols", symbols.len());
                        readiness.mark_ready();
                        return;
                    }
                    Ok(missing) => {
                        tracing::debug!("Waiting on prices for {:?}", missing);
                    }
                    Err(e) => tracing::warn!("Price poll failed: {}", e),
                }
            }
        })
    }
}

async fn missing_prices(prices: &dyn PriceSource, symbols: &[String]) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for symbol in symbols {
        let usable = prices
            .latest_price(symbol)
            .await?
            .map(|p| p.is_sign_positive() && !p.is_zero())
            .unwrap_or(false);
        if !usable {
            missing.push(symbol.clone());
        }
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_trait::PaperBroker;
    use chrono::Utc;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_wait_times_out_when_never_ready() {
        let readiness = DataReadiness::new();
        let result = readiness.wait_ready(Duration::from_millis(20)).await;
        assert!(result.is_err());
        assert!(!readiness.is_ready());
    }

    #[tokio::test]
    async fn test_ready_gate_returns_immediately() {
        let readiness = DataReadiness::ready();
        readiness.wait_ready(Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_poller_marks_ready_once_all_prices_exist() {
        let broker = Arc::new(PaperBroker::new(Decimal::ZERO, Utc::now()));
        broker.set_price("VOO", Decimal::from(400)).await;

        let readiness = DataReadiness::new();
        let handle = readiness.spawn_poller(
            broker.clone(),
            vec!["VOO".to_string(), "BND".to_string()],
            Duration::from_millis(5),
        );

        assert!(readiness.wait_ready(Duration::from_millis(30)).await.is_err());

        broker.set_price("BND", Decimal::from(72)).await;
        readiness.wait_ready(Duration::from_secs(2)).await.unwrap();
        handle.await.unwrap();
    }
}
