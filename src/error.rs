// ⚠️ Error Taxonomy
// One enum per boundary. Anything scoped to a single unit/source pair is
// recoverable and reported in the run summary; anything that would leave the
// store or the catalog inconsistent aborts the run before the cursor moves.

use crate::units::Source;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

/// Catalog load failures. Always fatal: the pipeline never runs with a
/// partial population.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read unit catalog: {0}")]
    Csv(#[from] csv::Error),

    #[error("unit catalog is missing required column '{0}'")]
    MissingColumn(&'static str),

    #[error("unit catalog line {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    #[error("duplicate unit_id '{unit_id}' in catalog (line {line})")]
    DuplicateUnit { unit_id: String, line: u64 },

    #[error("unit catalog contains no units")]
    Empty,
}

/// Per-operation registry lookups. Callers skip the operation, they don't abort.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("unit {unit_id} has no lookup key for source {provider}")]
    MissingSourceKey { unit_id: String, provider: Source },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate sample for {unit_id}/{provider} at {captured_at}")]
    DuplicateSample {
        unit_id: String,
        provider: Source,
        captured_at: DateTime<Utc>,
    },

    #[error("duplicate sale for {unit_id} on {sale_date}")]
    DuplicateSale { unit_id: String, sale_date: NaiveDate },

    #[error("sample for {unit_id}/{provider} at {captured_at} precedes latest stored capture {latest}")]
    OutOfOrder {
        unit_id: String,
        provider: Source,
        captured_at: DateTime<Utc>,
        latest: DateTime<Utc>,
    },

    #[error("non-finite price {price} for {unit_id}/{provider} at {captured_at}")]
    NonFinitePrice {
        unit_id: String,
        provider: Source,
        captured_at: DateTime<Utc>,
        price: f64,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Rejected writes the caller can shrug off; everything else means the
    /// write layer itself is unhealthy.
    pub fn is_rejected_write(&self) -> bool {
        matches!(
            self,
            StoreError::DuplicateSample { .. }
                | StoreError::DuplicateSale { .. }
                | StoreError::OutOfOrder { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum SaleError {
    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("duplicate sale for {unit_id} on {sale_date}")]
    DuplicateSale { unit_id: String, sale_date: NaiveDate },

    #[error("sale price must be positive, got {0}")]
    InvalidPrice(f64),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SaleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateSale { unit_id, sale_date } => {
                SaleError::DuplicateSale { unit_id, sale_date }
            }
            other => SaleError::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Fatal collection-run failure. The cursor has not advanced when this is returned.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("rotation selected unit missing from catalog: {0}")]
    Registry(#[from] RegistryError),
}
