// 🚚 Collection Run - one scheduled batch
// select units → for each unit × source: lookup key → fetch → validate → append
// → commit (cursor advance + run log, one transaction)
//
// Per-pair problems (missing key, fetch failure, rejected write) are recorded
// in the summary and the run moves on. A store that can't be written aborts
// the run before the cursor moves; the next run repeats the same subset and
// the duplicate check absorbs whatever already landed.

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::db::{AnomalyFlag, TimeSeriesStore};
use crate::error::{RegistryError, RunError};
use crate::fetcher::{EstimateFetch, FetchFailure, FetchFailureKind, Fetched, RateLimitedFetcher};
use crate::rotation::{RotationScheduler, RunSelection};
use crate::units::{Source, UnitRegistry};
use crate::validator::Validator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

// ============================================================================
// RUN SUMMARY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunScope {
    /// Next K units from the rotation cursor
    Rotation,
    /// Whole population; the cursor is neither read nor moved
    All,
}

impl RunScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunScope::Rotation => "rotation",
            RunScope::All => "all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PairStatus {
    Stored { price: f64, flag: AnomalyFlag },
    /// Duplicate or out-of-order write turned away by the store
    Rejected { reason: String },
    /// No lookup key for this source
    Skipped { reason: String },
    FetchFailed { failure: FetchFailure },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOutcome {
    pub unit_id: String,
    pub source: Source,
    #[serde(flatten)]
    pub status: PairStatus,
}

/// `success` counts stored samples, flagged or not; `anomaly` is the
/// flagged subset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub success: usize,
    pub anomaly: usize,
    pub transient_failure: usize,
    pub permanent_failure: usize,
    pub rejected: usize,
    pub skipped: usize,
}

impl OutcomeCounts {
    fn add(&mut self, status: &PairStatus) {
        match status {
            PairStatus::Stored { flag, .. } => {
                self.success += 1;
                if flag.is_anomaly() {
                    self.anomaly += 1;
                }
            }
            PairStatus::Rejected { .. } => self.rejected += 1,
            PairStatus::Skipped { .. } => self.skipped += 1,
            PairStatus::FetchFailed { failure } => match failure.kind {
                FetchFailureKind::Exhausted => self.transient_failure += 1,
                FetchFailureKind::Permanent => self.permanent_failure += 1,
            },
        }
    }

    pub fn failures(&self) -> usize {
        self.transient_failure + self.permanent_failure
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub scope: RunScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<String>,
    pub cursor_before: Option<usize>,
    pub cursor_after: Option<usize>,
    pub outcomes: Vec<PairOutcome>,
}

impl RunSummary {
    pub fn totals(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for outcome in &self.outcomes {
            counts.add(&outcome.status);
        }
        counts
    }

    pub fn per_unit(&self) -> BTreeMap<String, OutcomeCounts> {
        let mut by_unit: BTreeMap<String, OutcomeCounts> = BTreeMap::new();
        for outcome in &self.outcomes {
            by_unit.entry(outcome.unit_id.clone()).or_default().add(&outcome.status);
        }
        by_unit
    }

    pub fn summary(&self) -> String {
        let t = self.totals();
        format!(
            "Run {} ({}): {} units, {} stored ({} flagged), {} transient failures, {} permanent failures, {} rejected, {} skipped",
            &self.run_id[..8.min(self.run_id.len())],
            self.scope.as_str(),
            self.units.len(),
            t.success,
            t.anomaly,
            t.transient_failure,
            t.permanent_failure,
            t.rejected,
            t.skipped
        )
    }
}

// ============================================================================
// COLLECTOR
// ============================================================================

pub struct Collector<'a, F: EstimateFetch> {
    registry: &'a UnitRegistry,
    store: &'a TimeSeriesStore,
    scheduler: RotationScheduler,
    fetcher: RateLimitedFetcher<F>,
    validator: Validator,
    clock: Arc<dyn Clock>,
}

impl<'a, F: EstimateFetch> Collector<'a, F> {
    pub fn new(
        registry: &'a UnitRegistry,
        store: &'a TimeSeriesStore,
        fetch: F,
        clock: Arc<dyn Clock>,
        config: &PipelineConfig,
    ) -> Self {
        Collector {
            registry,
            store,
            scheduler: RotationScheduler::new(registry, &config.rotation),
            fetcher: RateLimitedFetcher::new(fetch, clock.clone(), &config.fetch, config.capture_resolution),
            validator: Validator::new(config.validation.clone()),
            clock,
        }
    }

    pub fn scheduler(&self) -> &RotationScheduler {
        &self.scheduler
    }

    /// Units the next run would cover
    pub fn select(&self, scope: RunScope) -> Result<Option<RunSelection>, RunError> {
        match scope {
            RunScope::Rotation => Ok(Some(self.scheduler.select_for_run(self.store, self.clock.now_utc())?)),
            RunScope::All => Ok(None),
        }
    }

    /// Execute one run end to end
    pub fn run(&mut self, scope: RunScope) -> Result<RunSummary, RunError> {
        let started_at = self.clock.now_utc();
        let run_id = Uuid::new_v4().to_string();

        let selection = self.select(scope)?;
        let units = match &selection {
            Some(selection) => selection.unit_ids.clone(),
            None => self.registry.unit_ids(),
        };

        info!(
            run_id = %run_id,
            scope = scope.as_str(),
            units = units.len(),
            start = selection.as_ref().map(|s| s.start),
            "collection run started"
        );

        let mut outcomes = Vec::with_capacity(units.len() * Source::ALL.len());
        for unit_id in &units {
            outcomes.extend(self.collect_unit(unit_id)?);
        }

        let finished_at = self.clock.now_utc();
        let cursor = selection
            .as_ref()
            .map(|s| self.scheduler.next_cursor(s, finished_at));

        let summary = RunSummary {
            run_id,
            scope,
            started_at,
            finished_at,
            units,
            cursor_before: selection.as_ref().map(|s| s.start),
            cursor_after: cursor.as_ref().map(|c| c.position),
            outcomes,
        };

        self.store.complete_run(&summary, cursor.as_ref())?;
        info!("{}", summary.summary());

        Ok(summary)
    }

    /// Collect every source for one unit
    pub fn collect_unit(&mut self, unit_id: &str) -> Result<Vec<PairOutcome>, RunError> {
        self.registry.get(unit_id)?;

        let mut outcomes = Vec::with_capacity(Source::ALL.len());
        for source in Source::ALL {
            let status = self.collect_pair(unit_id, source)?;
            outcomes.push(PairOutcome {
                unit_id: unit_id.to_string(),
                source,
                status,
            });
        }
        Ok(outcomes)
    }

    fn collect_pair(&mut self, unit_id: &str, source: Source) -> Result<PairStatus, RunError> {
        let key = match self.registry.lookup_key(unit_id, source) {
            Ok(key) => key,
            Err(err @ RegistryError::MissingSourceKey { .. }) => {
                warn!(unit_id, source = %source, "no lookup key, skipping");
                return Ok(PairStatus::Skipped { reason: err.to_string() });
            }
            Err(err) => return Err(err.into()),
        };

        let Fetched { sample, fetched_at } = match self.fetcher.fetch(unit_id, source, key) {
            Ok(fetched) => fetched,
            Err(failure) => {
                warn!(unit_id, source = %source, kind = ?failure.kind, attempts = failure.attempts, "fetch failed: {}", failure.message);
                return Ok(PairStatus::FetchFailed { failure });
            }
        };

        let sample = self.validator.screen(self.store, sample, fetched_at)?;
        if sample.anomaly_flag.is_anomaly() {
            warn!(
                unit_id,
                source = %source,
                price = sample.estimated_price,
                flag = %sample.anomaly_flag,
                "anomalous sample stored with flag"
            );
        }

        match self.store.append_estimate(&sample) {
            Ok(()) => Ok(PairStatus::Stored {
                price: sample.estimated_price,
                flag: sample.anomaly_flag,
            }),
            Err(err) if err.is_rejected_write() => {
                warn!(unit_id, source = %source, "{}", err);
                Ok(PairStatus::Rejected { reason: err.to_string() })
            }
            Err(err) => Err(err.into()),
        }
    }
}
