//! Harvest Core
//!
//! Tax-aware periodic rebalancing: sells out-of-policy holdings, shorts and
//! harvestable losses, then buys the best cooled-down substitute per asset
//! class up to its target weight.

pub mod cooldown;
pub mod engine;
pub mod error;
pub mod policy;
pub mod report;
pub mod snapshot;
mod weights;

pub use cooldown::{CooldownLedger, CooldownStatus, LEDGER_KEY, SENTINEL_LAST_SOLD};
pub use engine::{
    Action, RebalanceEngine, RebalanceOutcome, RunAnomaly, RunMode, RunOptions, RunStatus,
    SellReason, SkipReason, Transcript,
};
pub use error::{LedgerError, PolicyError};
pub use policy::{
    AgeAdjustment, AssetClass, OutsideAllocationSchedule, PolicyConfig, DEFAULT_COOLDOWN_SECS,
};
pub use report::portfolio_report;
pub use snapshot::{PortfolioSnapshot, PositionView};
