// Estimate Tracker - Core Library
// Longitudinal tracking of third-party valuation estimates against actual
// sale prices. Exposes all modules for use in the CLI and tests.

pub mod clock;
pub mod command_fetch;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod pipeline;
pub mod reconciliation;
pub mod rotation;
pub mod sales;
pub mod statistics;
pub mod units;
pub mod validator;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use command_fetch::CommandFetch;
pub use config::{CaptureResolution, FetchConfig, PipelineConfig, RotationConfig, ValidationConfig};
pub use db::{
    AnomalyFlag, EstimateSample, HistorySnapshot, ListingStatus, SaleEvent, SaleFlag,
    SaleSourceOfRecord, SampleKey, SampleReview, StoreStats, TimeSeriesStore, ValidityWindow,
};
pub use error::{CatalogError, ConfigError, RegistryError, RunError, SaleError, StoreError};
pub use fetcher::{
    EstimateFetch, FetchError, FetchFailure, FetchFailureKind, Fetched, RateLimitedFetcher,
    RawResponse,
};
pub use pipeline::{Collector, OutcomeCounts, PairOutcome, PairStatus, RunScope, RunSummary};
pub use reconciliation::{
    ErrorPoint, ReconciledSale, ReconciliationEngine, ReconciliationTable, SourceSeries,
};
pub use rotation::{CursorStore, RotationCursor, RotationScheduler, RunSelection};
pub use sales::{record_sale, SaleRequest};
pub use statistics::{
    AnalysisReport, ErrorAggregate, LatestEstimate, LeadDaysDistribution, SourceReport,
    SourceStatistics, StaleAfterSale, StatisticsReporter,
};
pub use units::{Source, Unit, UnitRegistry};
pub use validator::{ValidationContext, Validator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
