use crate::models::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use broker_trait::{
    BrokerClient, BrokerOrder, BrokerOrderRequest, BrokerPosition, MarketClock, OrderSink,
    PortfolioView, PriceSource,
};
use chrono::{DateTime, Utc};
use reqwest::{header, Client};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::time::Duration;

const DEFAULT_DATA_URL: &str = "https://data.alpaca.markets";

pub struct AlpacaClient {
    client: Client,
    base_url: String,
    data_url: String,
    headers: header::HeaderMap,
}

impl AlpacaClient {
    /// Create a new Alpaca client
    pub fn new(api_key: String, secret_key: String, base_url: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            header::HeaderValue::from_str(&api_key)
                .context("API key contains invalid header characters")?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            header::HeaderValue::from_str(&secret_key)
                .context("Secret key contains invalid header characters")?,
        );

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            data_url: DEFAULT_DATA_URL.to_string(),
            headers,
        })
    }

    /// Create client from environment variables.
    /// Accepts both APCA_API_KEY_ID / APCA_API_SECRET_KEY (standard Alpaca names)
    /// and ALPACA_API_KEY / ALPACA_SECRET_KEY as fallbacks.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("APCA_API_KEY_ID")
            .or_else(|_| std::env::var("ALPACA_API_KEY"))
            .map_err(|_| anyhow!("APCA_API_KEY_ID (or ALPACA_API_KEY) not set"))?;
        let secret_key = std::env::var("APCA_API_SECRET_KEY")
            .or_else(|_| std::env::var("ALPACA_SECRET_KEY"))
            .map_err(|_| anyhow!("APCA_API_SECRET_KEY (or ALPACA_SECRET_KEY) not set"))?;
        let base_url = std::env::var("ALPACA_BASE_URL")
            .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string());

        let mut client = Self::new(api_key, secret_key, base_url)?;
        if let Ok(data_url) = std::env::var("ALPACA_DATA_URL") {
            client.data_url = data_url.trim_end_matches('/').to_string();
        }
        Ok(client)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Alpaca {} request failed: {}", what, error_text));
        }

        Ok(response.json::<T>().await?)
    }

    /// Get account information
    pub async fn get_account(&self) -> Result<Account> {
        let url = format!("{}/v2/account", self.base_url);
        self.get_json(&url, "account").await
    }

    pub async fn get_clock(&self) -> Result<Clock> {
        let url = format!("{}/v2/clock", self.base_url);
        self.get_json(&url, "clock").await
    }

    /// Get all open positions
    pub async fn get_positions(&self) -> Result<Vec<Position>> {
        let url = format!("{}/v2/positions", self.base_url);
        self.get_json(&url, "positions").await
    }

    /// Orders that have not reached a terminal state
    pub async fn get_open_orders(&self) -> Result<Vec<Order>> {
        let url = format!("{}/v2/orders?status=open", self.base_url);
        self.get_json(&url, "orders").await
    }

    /// Most recent trade for a symbol, or None if the feed has nothing
    pub async fn get_latest_trade(&self, symbol: &str) -> Result<Option<LatestTrade>> {
        let url = format!("{}/v2/stocks/{}/trades/latest", self.data_url, symbol);

        let response = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Alpaca latest trade failed for {}: {}", symbol, error_text));
        }

        let latest = response.json::<LatestTradeResponse>().await?;
        Ok(Some(latest.trade))
    }

    /// Submit an order
    pub async fn submit_order(&self, order: OrderRequest) -> Result<Order> {
        let url = format!("{}/v2/orders", self.base_url);

        tracing::info!("Submitting order to Alpaca: {:?}", order);

        let response = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .json(&order)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Alpaca order failed: {}", error_text));
        }

        let order_response = response.json::<Order>().await?;
        tracing::info!("Order submitted successfully: {}", order_response.id);
        Ok(order_response)
    }
}

#[async_trait]
impl MarketClock for AlpacaClient {
    async fn now(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }

    // Alpaca exposes a single equities session, so the symbol is not consulted
    async fn is_market_open(&self, _symbol: &str) -> Result<bool> {
        Ok(self.get_clock().await?.is_open)
    }
}

#[async_trait]
impl PortfolioView for AlpacaClient {
    async fn cash(&self) -> Result<Decimal> {
        self.get_account().await?.cash_decimal()
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>> {
        self.get_positions()
            .await?
            .iter()
            .map(Position::to_broker)
            .collect()
    }

    async fn has_open_orders(&self) -> Result<bool> {
        Ok(!self.get_open_orders().await?.is_empty())
    }

    async fn deposit(&self, amount: Decimal) -> Result<()> {
        Err(anyhow!(
            "Alpaca accounts cannot be funded through the trading API (requested {})",
            amount
        ))
    }
}

#[async_trait]
impl PriceSource for AlpacaClient {
    async fn latest_price(&self, symbol: &str) -> Result<Option<Decimal>> {
        Ok(self
            .get_latest_trade(symbol)
            .await?
            .and_then(|trade| Decimal::from_f64_retain(trade.price)))
    }
}

#[async_trait]
impl OrderSink for AlpacaClient {
    async fn submit_market_order(&self, order: BrokerOrderRequest) -> Result<BrokerOrder> {
        let request = OrderRequest::market(order.symbol.clone(), order.qty, order.side);
        Ok(self.submit_order(request).await?.to_broker())
    }
}

impl BrokerClient for AlpacaClient {
    fn is_paper(&self) -> bool {
        self.base_url.contains("paper-api")
    }

    fn broker_name(&self) -> &str {
        "alpaca"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paper_detection_and_url_trim() {
        let client = AlpacaClient::new(
            "key".into(),
            "secret".into(),
            "https://paper-api.alpaca.markets/".into(),
        )
        .unwrap();
        assert!(client.is_paper());
        assert_eq!(client.base_url, "https://paper-api.alpaca.markets");
        assert_eq!(client.broker_name(), "alpaca");
    }

    #[test]
    fn test_rejects_invalid_header_characters() {
        let result = AlpacaClient::new(
            "bad\nkey".into(),
            "secret".into(),
            "https://api.alpaca.markets".into(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_deposit_is_unsupported() {
        let client = AlpacaClient::new(
            "key".into(),
            "secret".into(),
            "https://paper-api.alpaca.markets".into(),
        )
        .unwrap();
        assert!(client.deposit(Decimal::from(100)).await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires API credentials
    async fn test_get_account() {
        let client = AlpacaClient::from_env().unwrap();
        let account = client.get_account().await.unwrap();
        println!("Account: {:?}", account);
    }

    #[tokio::test]
    #[ignore] // Requires API credentials
    async fn test_clock_and_latest_price() {
        let client = AlpacaClient::from_env().unwrap();
        let _ = client.is_market_open("VOO").await.unwrap();
        let price = client.latest_price("VOO").await.unwrap();
        assert!(price.is_some());
    }
}
