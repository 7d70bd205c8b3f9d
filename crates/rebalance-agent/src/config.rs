use anyhow::{bail, Context, Result};
use harvest_core::{PolicyConfig, RunMode};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

const ONE_WEEK_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Paper,
    Alpaca,
}

impl FromStr for BrokerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "paper" => Ok(BrokerKind::Paper),
            "alpaca" => Ok(BrokerKind::Alpaca),
            other => bail!("Unknown BROKER {:?} (expected paper or alpaca)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub broker: BrokerKind,
    pub run_mode: RunMode,
    pub policy_file: Option<PathBuf>,

    // Persistence
    pub database_url: String,
    pub refresh_last_sold_times: bool,

    // Scheduling
    pub rebalance_interval_secs: u64,
    pub preview_interval_secs: Option<u64>,
    pub report_interval_secs: Option<u64>,
    pub run_on_startup: bool,

    // Data readiness
    pub data_ready_timeout_secs: u64,
    pub data_poll_interval_secs: u64,

    // Paper broker seed
    pub paper_cash: Decimal,
    pub paper_prices_file: Option<PathBuf>,
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; missing keys fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker: BrokerKind = lookup("BROKER")
            .unwrap_or_else(|| "paper".to_string())
            .parse()?;

        let run_mode = match lookup("RUN_MODE") {
            Some(mode) => mode
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid RUN_MODE")?,
            None if broker == BrokerKind::Paper => RunMode::Backtest,
            None => RunMode::Live,
        };
        // backtests deposit every run and Alpaca cannot take deposits
        if broker == BrokerKind::Alpaca && run_mode == RunMode::Backtest {
            bail!("RUN_MODE=backtest needs BROKER=paper; Alpaca accounts only run live");
        }

        let optional_secs = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .filter(|v| !v.is_empty())
                .map(|v| v.parse::<u64>().with_context(|| format!("Invalid {}", key)))
                .transpose()
        };

        let config = Self {
            broker,
            run_mode,
            policy_file: lookup("POLICY_FILE").filter(|v| !v.is_empty()).map(PathBuf::from),

            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:rebalance.db".to_string()),
            refresh_last_sold_times: flag(lookup("REFRESH_LAST_SOLD_TIMES")),

            rebalance_interval_secs: optional_secs("REBALANCE_INTERVAL_SECS")?
                .unwrap_or(ONE_WEEK_SECS),
            preview_interval_secs: optional_secs("PREVIEW_INTERVAL_SECS")?,
            report_interval_secs: optional_secs("REPORT_INTERVAL_SECS")?,
            run_on_startup: flag(lookup("RUN_ON_STARTUP")),

            data_ready_timeout_secs: optional_secs("DATA_READY_TIMEOUT_SECS")?.unwrap_or(600),
            data_poll_interval_secs: optional_secs("DATA_POLL_INTERVAL_SECS")?.unwrap_or(5),

            paper_cash: lookup("PAPER_CASH")
                .unwrap_or_else(|| "10000".to_string())
                .parse()
                .context("Invalid PAPER_CASH")?,
            paper_prices_file: lookup("PAPER_PRICES_FILE")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        };

        if config.rebalance_interval_secs == 0 {
            bail!("REBALANCE_INTERVAL_SECS must be positive");
        }
        if config.data_poll_interval_secs == 0 {
            bail!("DATA_POLL_INTERVAL_SECS must be positive");
        }

        Ok(config)
    }

    /// Policy from POLICY_FILE or the built-in default, validated.
    pub fn load_policy(&self) -> Result<PolicyConfig> {
        let policy = match &self.policy_file {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read policy file {}", path.display()))?;
                PolicyConfig::from_json(&json)
                    .with_context(|| format!("Failed to parse policy file {}", path.display()))?
            }
            None => PolicyConfig::diversified_default(),
        };
        policy.validate().context("Invalid policy")?;
        Ok(policy)
    }

    /// Symbol -> price map used to seed the paper broker
    pub fn load_paper_prices(&self) -> Result<HashMap<String, Decimal>> {
        let Some(path) = &self.paper_prices_file else {
            return Ok(HashMap::new());
        };
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prices file {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse prices file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.broker, BrokerKind::Paper);
        assert_eq!(config.run_mode, RunMode::Backtest);
        assert_eq!(config.database_url, "sqlite:rebalance.db");
        assert_eq!(config.rebalance_interval_secs, ONE_WEEK_SECS);
        assert_eq!(config.preview_interval_secs, None);
        assert!(!config.refresh_last_sold_times);
        assert_eq!(config.paper_cash, Decimal::from(10_000));
    }

    #[test]
    fn test_alpaca_defaults_to_live() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("BROKER", "alpaca"),
            ("REFRESH_LAST_SOLD_TIMES", "true"),
            ("PREVIEW_INTERVAL_SECS", "3600"),
        ]))
        .unwrap();
        assert_eq!(config.run_mode, RunMode::Live);
        assert!(config.refresh_last_sold_times);
        assert_eq!(config.preview_interval_secs, Some(3600));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(AgentConfig::from_lookup(lookup(&[("BROKER", "ibkr")])).is_err());
        assert!(AgentConfig::from_lookup(lookup(&[("RUN_MODE", "yolo")])).is_err());
        assert!(AgentConfig::from_lookup(lookup(&[("REBALANCE_INTERVAL_SECS", "0")])).is_err());
        assert!(AgentConfig::from_lookup(lookup(&[("PAPER_CASH", "lots")])).is_err());
    }

    #[test]
    fn test_alpaca_backtest_is_rejected() {
        let result = AgentConfig::from_lookup(lookup(&[
            ("BROKER", "alpaca"),
            ("RUN_MODE", "backtest"),
        ]));
        assert!(result.is_err());

        let paper_live =
            AgentConfig::from_lookup(lookup(&[("BROKER", "paper"), ("RUN_MODE", "live")])).unwrap();
        assert_eq!(paper_live.run_mode, RunMode::Live);
    }

    #[test]
    fn test_default_policy_loads() {
        let config = AgentConfig::from_lookup(lookup(&[])).unwrap();
        let policy = config.load_policy().unwrap();
        assert_eq!(policy.asset_classes.len(), 11);
        assert!(config.load_paper_prices().unwrap().is_empty());
    }
}
