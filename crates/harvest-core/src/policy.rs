//! Rebalancing Policy
//!
//! Target allocation, substitute baskets and thresholds for one portfolio.
//! A policy is immutable for the lifetime of a run and is validated once,
//! up front, with [`PolicyConfig::validate`].

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Default wash-sale cooldown: 35 days
pub const DEFAULT_COOLDOWN_SECS: i64 = 35 * 24 * 60 * 60;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Value held outside the managed portfolio that still counts toward a class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutsideAllocationSchedule {
    /// Amount held in the start year
    pub initial: f64,
    /// Amount added every year after the start year
    pub yearly_increase: f64,
    /// First year the allocation exists
    pub start_year: i32,
}

impl OutsideAllocationSchedule {
    /// Amount counted for `year`; zero before the schedule starts.
    pub fn amount_for_year(&self, year: i32) -> f64 {
        if year < self.start_year {
            return 0.0;
        }
        self.initial + self.yearly_increase * (year - self.start_year) as f64
    }
}

/// A target allocation bucket with interchangeable substitute tickers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetClass {
    /// Class identifier, e.g. "VOO"
    pub id: String,
    /// Substitute symbols in preference order
    pub substitutes: Vec<String>,
    /// Static target weight (fraction of the portfolio)
    pub weight: f64,
    /// Whether this class grows with age (bonds, TIPS, gold, commodities)
    #[serde(default)]
    pub age_weighted: bool,
    /// Holdings outside this portfolio counted toward the class
    #[serde(default)]
    pub outside_allocation: Option<OutsideAllocationSchedule>,
}

impl AssetClass {
    pub fn new(id: impl Into<String>, substitutes: &[&str], weight: f64) -> Self {
        Self {
            id: id.into(),
            substitutes: substitutes.iter().map(|s| s.to_string()).collect(),
            weight,
            age_weighted: false,
            outside_allocation: None,
        }
    }

    pub fn age_weighted(mut self) -> Self {
        self.age_weighted = true;
        self
    }

    pub fn with_outside_allocation(mut self, schedule: OutsideAllocationSchedule) -> Self {
        self.outside_allocation = Some(schedule);
        self
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.substitutes.iter().any(|s| s == symbol)
    }
}

/// Shift weight from growth classes to age-weighted classes as the owner ages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeAdjustment {
    pub birth_year: i32,
}

/// Immutable configuration for the rebalancing engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Asset classes in evaluation order
    pub asset_classes: Vec<AssetClass>,
    /// Sell a non-target substitute once its loss exceeds this amount
    pub harvest_limit: f64,
    /// Minimum buy size, also the cash buffer kept back in live runs
    pub buy_limit: f64,
    /// Seconds after a sale before a symbol may be bought again
    #[serde(default = "default_cooldown")]
    pub wash_sale_cooldown_secs: i64,
    /// Cash added before every backtest run
    #[serde(default)]
    pub deposit: f64,
    #[serde(default)]
    pub age_adjustment: Option<AgeAdjustment>,
    /// Master switch for every class's outside allocation
    #[serde(default)]
    pub use_outside_allocation: bool,
    /// Symbol whose exchange hours decide whether the market is open
    #[serde(default = "default_reference_symbol")]
    pub reference_symbol: String,
}

fn default_cooldown() -> i64 {
    DEFAULT_COOLDOWN_SECS
}

fn default_reference_symbol() -> String {
    "VOO".to_string()
}

impl PolicyConfig {
    /// Parse a policy from JSON. The result is not yet validated.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Fail fast on configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.asset_classes.is_empty() {
            return Err(PolicyError::NoAssetClasses);
        }

        let mut class_ids = HashSet::new();
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for class in &self.asset_classes {
            if !class_ids.insert(class.id.as_str()) {
                return Err(PolicyError::DuplicateClass(class.id.clone()));
            }
            if class.substitutes.is_empty() {
                return Err(PolicyError::EmptySubstitutes(class.id.clone()));
            }
            if class.weight < 0.0 || !class.weight.is_finite() {
                return Err(PolicyError::NegativeWeight {
                    class: class.id.clone(),
                    weight: class.weight,
                });
            }
            for symbol in &class.substitutes {
                if let Some(first) = owner.insert(symbol.as_str(), class.id.as_str()) {
                    // A class listing the same ticker twice is still one owner.
                    if first != class.id {
                        return Err(PolicyError::SymbolInMultipleClasses {
                            symbol: symbol.clone(),
                            first: first.to_string(),
                            second: class.id.clone(),
                        });
                    }
                }
            }
        }

        let total: f64 = self.asset_classes.iter().map(|c| c.weight).sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(PolicyError::WeightsDoNotSumToOne(total));
        }

        if self.harvest_limit < 0.0 {
            return Err(PolicyError::InvalidThreshold(format!(
                "harvest_limit must not be negative, got {}",
                self.harvest_limit
            )));
        }
        if self.buy_limit < 0.0 {
            return Err(PolicyError::InvalidThreshold(format!(
                "buy_limit must not be negative, got {}",
                self.buy_limit
            )));
        }
        if self.deposit < 0.0 {
            return Err(PolicyError::InvalidThreshold(format!(
                "deposit must not be negative, got {}",
                self.deposit
            )));
        }
        if self.wash_sale_cooldown_secs <= 0 {
            return Err(PolicyError::InvalidThreshold(format!(
                "wash_sale_cooldown_secs must be positive, got {}",
                self.wash_sale_cooldown_secs
            )));
        }

        if self.age_adjustment.is_some() {
            let (aged, growth) = self.partition_sums();
            if aged <= 0.0 {
                return Err(PolicyError::EmptyAgePartition(
                    "no age-weighted class carries weight".into(),
                ));
            }
            if growth <= 0.0 {
                return Err(PolicyError::EmptyAgePartition(
                    "no growth class carries weight".into(),
                ));
            }
        }

        Ok(())
    }

    /// Static weight sums of the (age-weighted, growth) partitions
    pub(crate) fn partition_sums(&self) -> (f64, f64) {
        self.asset_classes
            .iter()
            .fold((0.0, 0.0), |(aged, growth), class| {
                if class.age_weighted {
                    (aged + class.weight, growth)
                } else {
                    (aged, growth + class.weight)
                }
            })
    }

    pub fn class(&self, id: &str) -> Option<&AssetClass> {
        self.asset_classes.iter().find(|c| c.id == id)
    }

    /// Asset class owning `symbol`, if the symbol is in the universe
    pub fn class_of(&self, symbol: &str) -> Option<&AssetClass> {
        self.asset_classes.iter().find(|c| c.contains(symbol))
    }

    /// Every configured substitute symbol, in class order
    pub fn universe(&self) -> Vec<String> {
        self.asset_classes
            .iter()
            .flat_map(|c| c.substitutes.iter().cloned())
            .collect()
    }

    pub fn in_universe(&self, symbol: &str) -> bool {
        self.class_of(symbol).is_some()
    }

    /// Long-horizon allocation used when no policy file is supplied.
    ///
    /// Eleven classes, three substitutes each, bonds and real assets
    /// age-weighted, with 401k holdings counted toward large cap and bonds.
    pub fn diversified_default() -> Self {
        Self {
            asset_classes: vec![
                AssetClass::new("VOO", &["VOO", "IVV", "SPLG"], 0.35).with_outside_allocation(
                    OutsideAllocationSchedule {
                        initial: 10_000.0,
                        yearly_increase: 100.0,
                        start_year: 2022,
                    },
                ),
                AssetClass::new("VO", &["VO", "IJH", "SPMD"], 0.10),
                AssetClass::new("VB", &["VB", "IJR", "SLY"], 0.05),
                AssetClass::new("VXUS", &["VXUS", "IXUS", "CWI"], 0.15),
                AssetClass::new("BND", &["BND", "IUSB", "SPAB"], 0.05)
                    .age_weighted()
                    .with_outside_allocation(OutsideAllocationSchedule {
                        initial: 50_000.0,
                        yearly_increase: 5_000.0,
                        start_year: 2022,
                    }),
                AssetClass::new("BNDX", &["BNDX", "IAGG", "BWX"], 0.05).age_weighted(),
                AssetClass::new("VTIP", &["VTIP", "SCHP", "TIP"], 0.05).age_weighted(),
                AssetClass::new("VNQ", &["VNQ", "IVR", "RWR"], 0.05),
                AssetClass::new("VNQI", &["VNQI", "IFGL", "RWX"], 0.05),
                AssetClass::new("GLD", &["GLD", "IAU", "DBP"], 0.05).age_weighted(),
                AssetClass::new("COMT", &["COMT", "DBC", "GSG"], 0.05).age_weighted(),
            ],
            harvest_limit: 300.0,
            buy_limit: 1000.0,
            wash_sale_cooldown_secs: DEFAULT_COOLDOWN_SECS,
            deposit: 1000.0,
            age_adjustment: Some(AgeAdjustment { birth_year: 1992 }),
            use_outside_allocation: true,
            reference_symbol: default_reference_symbol(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_class_policy() -> PolicyConfig {
        PolicyConfig {
            asset_classes: vec![
                AssetClass::new("A", &["A1", "A2"], 0.5),
                AssetClass::new("B", &["B1", "B2"], 0.5),
            ],
            harvest_limit: 300.0,
            buy_limit: 1000.0,
            wash_sale_cooldown_secs: DEFAULT_COOLDOWN_SECS,
            deposit: 0.0,
            age_adjustment: None,
            use_outside_allocation: false,
            reference_symbol: "A1".into(),
        }
    }

    #[test]
    fn test_default_policy_is_valid() {
        let policy = PolicyConfig::diversified_default();
        assert_eq!(policy.validate(), Ok(()));
        assert_eq!(policy.universe().len(), 33);
        assert_eq!(policy.class_of("IAU").map(|c| c.id.as_str()), Some("GLD"));
    }

    #[test]
    fn test_symbol_in_two_classes_rejected() {
        let mut policy = two_class_policy();
        policy.asset_classes[1].substitutes.push("A2".into());

        match policy.validate() {
            Err(PolicyError::SymbolInMultipleClasses { symbol, first, second }) => {
                assert_eq!(symbol, "A2");
                assert_eq!(first, "A");
                assert_eq!(second, "B");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut policy = two_class_policy();
        policy.asset_classes[0].weight = 0.6;
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::WeightsDoNotSumToOne(_))
        ));
    }

    #[test]
    fn test_age_adjustment_needs_both_partitions() {
        let mut policy = two_class_policy();
        policy.age_adjustment = Some(AgeAdjustment { birth_year: 1990 });
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::EmptyAgePartition(_))
        ));

        policy.asset_classes[1].age_weighted = true;
        assert_eq!(policy.validate(), Ok(()));
    }

    #[test]
    fn test_outside_allocation_schedule() {
        let schedule = OutsideAllocationSchedule {
            initial: 10_000.0,
            yearly_increase: 100.0,
            start_year: 2022,
        };
        assert_eq!(schedule.amount_for_year(2021), 0.0);
        assert_eq!(schedule.amount_for_year(2022), 10_000.0);
        assert_eq!(schedule.amount_for_year(2025), 10_300.0);
    }

    #[test]
    fn test_policy_from_json_applies_defaults() {
        let json = r#"{
            "asset_classes": [
                {"id": "A", "substitutes": ["A1", "A2"], "weight": 1.0}
            ],
            "harvest_limit": 300,
            "buy_limit": 1000
        }"#;
        let policy = PolicyConfig::from_json(json).unwrap();
        assert_eq!(policy.wash_sale_cooldown_secs, DEFAULT_COOLDOWN_SECS);
        assert_eq!(policy.reference_symbol, "VOO");
        assert!(policy.age_adjustment.is_none());
        assert_eq!(policy.validate(), Ok(()));
    }
}
