//! Wash Sale Cooldown Ledger
//!
//! Durable symbol -> last-sold time map. A substitute may only be chosen as a
//! buy target once its cooldown has elapsed.

use crate::error::LedgerError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key the ledger is stored under
pub const LEDGER_KEY: &str = "last_sold_times";

/// Last-sold time assumed for symbols never sold: 2015-01-01T00:00:00Z
pub const SENTINEL_LAST_SOLD: i64 = 1_420_070_400;

/// Cooldown status of a single symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CooldownStatus {
    /// Cooldown elapsed, safe to buy
    Cleared,
    /// Sold too recently
    Cooling { seconds_remaining: i64 },
}

impl std::fmt::Display for CooldownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CooldownStatus::Cleared => write!(f, "Cleared"),
            CooldownStatus::Cooling { seconds_remaining } => {
                write!(f, "Cooling ({}d left)", seconds_remaining / 86_400)
            }
        }
    }
}

/// Symbol -> last sold epoch seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownLedger {
    last_sold: BTreeMap<String, i64>,
    default_last_sold: i64,
}

impl Default for CooldownLedger {
    fn default() -> Self {
        Self::new(SENTINEL_LAST_SOLD)
    }
}

impl CooldownLedger {
    pub fn new(default_last_sold: i64) -> Self {
        Self {
            last_sold: BTreeMap::new(),
            default_last_sold,
        }
    }

    /// Ledger with every symbol in `universe` seeded at the sentinel time
    pub fn seeded<I, S>(universe: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ledger = Self::default();
        for symbol in universe {
            ledger
                .last_sold
                .insert(symbol.into(), ledger.default_last_sold);
        }
        ledger
    }

    /// Last sale of `symbol` in epoch seconds, or the sentinel if never sold
    pub fn last_sold(&self, symbol: &str) -> i64 {
        self.last_sold
            .get(symbol)
            .copied()
            .unwrap_or(self.default_last_sold)
    }

    pub fn last_sold_at(&self, symbol: &str) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.last_sold(symbol), 0).single()
    }

    pub fn record_sale(&mut self, symbol: &str, sold_at: DateTime<Utc>) {
        self.last_sold
            .insert(symbol.to_string(), sold_at.timestamp());
    }

    /// Cleared once strictly more than `cooldown_secs` have passed.
    pub fn status(&self, symbol: &str, now: DateTime<Utc>, cooldown_secs: i64) -> CooldownStatus {
        let elapsed = now.timestamp() - self.last_sold(symbol);
        if elapsed > cooldown_secs {
            CooldownStatus::Cleared
        } else {
            CooldownStatus::Cooling {
                seconds_remaining: cooldown_secs - elapsed + 1,
            }
        }
    }

    pub fn is_cleared(&self, symbol: &str, now: DateTime<Utc>, cooldown_secs: i64) -> bool {
        self.status(symbol, now, cooldown_secs) == CooldownStatus::Cleared
    }

    /// Overlay stored entries on top of the current ones.
    pub fn merge(&mut self, stored: BTreeMap<String, i64>) {
        self.last_sold.extend(stored);
    }

    pub fn entries(&self) -> &BTreeMap<String, i64> {
        &self.last_sold
    }

    pub fn len(&self) -> usize {
        self.last_sold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sold.is_empty()
    }

    /// Flat JSON object of symbol -> epoch seconds
    pub fn to_json(&self) -> Result<String, LedgerError> {
        Ok(serde_json::to_string(&self.last_sold)?)
    }

    /// Parse a flat JSON map. Fractional timestamps are truncated.
    pub fn parse_json(json: &str) -> Result<BTreeMap<String, i64>, LedgerError> {
        let raw: BTreeMap<String, f64> = serde_json::from_str(json)?;
        Ok(raw
            .into_iter()
            .map(|(symbol, ts)| (symbol, ts as i64))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DEFAULT_COOLDOWN_SECS;
    use chrono::Duration;

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[test]
    fn test_unknown_symbol_uses_sentinel() {
        let ledger = CooldownLedger::default();
        assert_eq!(ledger.last_sold("VOO"), SENTINEL_LAST_SOLD);
        assert_eq!(
            ledger.last_sold_at("VOO").unwrap().to_rfc3339(),
            "2015-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_cooldown_window() {
        let mut ledger = CooldownLedger::seeded(["VOO", "IVV"]);
        let sold = at(1_700_000_000);
        ledger.record_sale("VOO", sold);

        let within = sold + Duration::days(10);
        assert!(!ledger.is_cleared("VOO", within, DEFAULT_COOLDOWN_SECS));
        assert!(ledger.is_cleared("IVV", within, DEFAULT_COOLDOWN_SECS));

        // exactly at the boundary is still cooling
        let boundary = sold + Duration::seconds(DEFAULT_COOLDOWN_SECS);
        assert_eq!(
            ledger.status("VOO", boundary, DEFAULT_COOLDOWN_SECS),
            CooldownStatus::Cooling { seconds_remaining: 1 }
        );
        assert!(ledger.is_cleared(
            "VOO",
            boundary + Duration::seconds(1),
            DEFAULT_COOLDOWN_SECS
        ));
    }

    #[test]
    fn test_json_persistence() {
        let mut ledger = CooldownLedger::seeded(["VOO", "IVV"]);
        ledger.record_sale("IVV", at(1_700_000_000));

        let json = ledger.to_json().unwrap();
        assert_eq!(json, r#"{"IVV":1700000000,"VOO":1420070400}"#);

        let mut restored = CooldownLedger::seeded(["VOO", "IVV", "SPLG"]);
        restored.merge(CooldownLedger::parse_json(&json).unwrap());
        assert_eq!(restored.last_sold("IVV"), 1_700_000_000);
        assert_eq!(restored.last_sold("SPLG"), SENTINEL_LAST_SOLD);
        assert_eq!(restored.len(), 3);
    }

    #[test]
    fn test_parse_accepts_float_timestamps() {
        let parsed = CooldownLedger::parse_json(r#"{"VOO": 1700000000.75}"#).unwrap();
        assert_eq!(parsed["VOO"], 1_700_000_000);
        assert!(CooldownLedger::parse_json("not json").is_err());
    }
}
