use thiserror::Error;

/// Problems found while validating a [`crate::PolicyConfig`].
///
/// These are raised before any run starts; an invalid policy never reaches
/// the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("No asset classes configured")]
    NoAssetClasses,

    #[error("Asset class {0} is configured more than once")]
    DuplicateClass(String),

    #[error("Asset class {0} has no substitute symbols")]
    EmptySubstitutes(String),

    #[error("Symbol {symbol} belongs to both {first} and {second}")]
    SymbolInMultipleClasses {
        symbol: String,
        first: String,
        second: String,
    },

    #[error("Target weights sum to {0}, expected 1.0")]
    WeightsDoNotSumToOne(f64),

    #[error("Asset class {class} has negative weight {weight}")]
    NegativeWeight { class: String, weight: f64 },

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Age adjustment needs a positive weight in both partitions: {0}")]
    EmptyAgePartition(String),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Last sold times are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
