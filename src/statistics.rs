// 📊 Statistics Reporter - accuracy and bias per source
// Aggregates the reconciliation table into per-source summaries. Two views:
// every eligible pre-sale sample, and only the closest-to-sale sample per sale
// (the headline comparison).
//
// Fewer than two reconciled units for a source yields an explicit
// InsufficientSample marker instead of numbers.

use crate::clock::Clock;
use crate::db::{AnomalyFlag, HistorySnapshot, TimeSeriesStore};
use crate::error::StoreError;
use crate::reconciliation::{ErrorPoint, ReconciliationEngine, ReconciliationTable};
use crate::units::Source;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Below this many distinct reconciled units a source gets no point statistics
pub const MIN_RECONCILED_UNITS: usize = 2;

// ============================================================================
// NUMERIC HELPERS
// ============================================================================

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    Some(percentile_sorted(&sorted, 50.0))
}

/// Sample standard deviation (n - 1). Undefined below two values.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = mean(values)?;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Percentile of a sorted slice using linear interpolation.
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = rank - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

// ============================================================================
// AGGREGATES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAggregate {
    pub samples: usize,
    pub median_error: f64,
    pub median_relative_error: f64,
    pub mean_error: f64,
    pub mean_relative_error: f64,
    pub mean_absolute_error: f64,
    /// None with a single sample
    pub std_error: Option<f64>,
    pub std_relative_error: Option<f64>,
    /// Fraction of samples with estimate > sale price
    pub bias_fraction: f64,
}

impl ErrorAggregate {
    pub fn from_points(points: &[&ErrorPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }

        let errors: Vec<f64> = points.iter().map(|p| p.error).collect();
        let relative: Vec<f64> = points.iter().map(|p| p.relative_error).collect();
        let absolute: Vec<f64> = errors.iter().map(|e| e.abs()).collect();
        let over = points.iter().filter(|p| p.is_over()).count();

        Some(ErrorAggregate {
            samples: points.len(),
            median_error: median(&errors)?,
            median_relative_error: median(&relative)?,
            mean_error: mean(&errors)?,
            mean_relative_error: mean(&relative)?,
            mean_absolute_error: mean(&absolute)?,
            std_error: std_dev(&errors),
            std_relative_error: std_dev(&relative),
            bias_fraction: over as f64 / points.len() as f64,
        })
    }
}

/// How far ahead of the sale the headline comparison points were captured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadDaysDistribution {
    pub count: usize,
    pub min: i64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub max: i64,
    pub mean: f64,
    pub values: Vec<i64>,
}

impl LeadDaysDistribution {
    pub fn from_points(points: &[&ErrorPoint]) -> Option<Self> {
        let mut values: Vec<i64> = points.iter().map(|p| p.lead_days).collect();
        if values.is_empty() {
            return None;
        }
        values.sort_unstable();

        let as_f64: Vec<f64> = values.iter().map(|&v| v as f64).collect();
        Some(LeadDaysDistribution {
            count: values.len(),
            min: values[0],
            p25: percentile_sorted(&as_f64, 25.0),
            median: percentile_sorted(&as_f64, 50.0),
            p75: percentile_sorted(&as_f64, 75.0),
            max: values[values.len() - 1],
            mean: mean(&as_f64)?,
            values,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatistics {
    Reported {
        reconciled_units: usize,
        all_samples: ErrorAggregate,
        closest_to_sale: ErrorAggregate,
        lead_days: LeadDaysDistribution,
    },
    InsufficientSample {
        reconciled_units: usize,
        samples: usize,
    },
}

impl SourceStatistics {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, SourceStatistics::InsufficientSample { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: Source,
    pub statistics: SourceStatistics,
}

/// Most recent stored estimate for one (unit, source) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestEstimate {
    pub unit_id: String,
    pub source: Source,
    pub estimated_price: f64,
    pub captured_at: DateTime<Utc>,
    pub anomaly_flag: AnomalyFlag,
}

/// The unit's latest sale is newer than anything collected for `source`.
/// Its pre-sale history for that source needs another look.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleAfterSale {
    pub unit_id: String,
    pub source: Source,
    pub sale_date: NaiveDate,
    pub sale_price: f64,
    pub latest_capture: Option<DateTime<Utc>>,
}

/// Latest estimate per (unit, source), ordered by unit then source
pub fn latest_estimates(snapshot: &HistorySnapshot) -> Vec<LatestEstimate> {
    snapshot
        .estimates
        .values()
        .filter_map(|samples| samples.last())
        .map(|sample| LatestEstimate {
            unit_id: sample.unit_id.clone(),
            source: sample.source,
            estimated_price: sample.estimated_price,
            captured_at: sample.captured_at,
            anomaly_flag: sample.anomaly_flag,
        })
        .collect()
}

/// Sold units whose latest sale date is after the latest capture date for a
/// source, or that have no capture for it at all
pub fn stale_after_sale(snapshot: &HistorySnapshot) -> Vec<StaleAfterSale> {
    let mut signals = Vec::new();

    for (unit_id, sales) in &snapshot.sales {
        let Some(sale) = sales.iter().max_by_key(|s| s.sale_date) else {
            continue;
        };

        for source in Source::ALL {
            let latest_capture = snapshot.history(unit_id, source).last().map(|s| s.captured_at);
            let behind = latest_capture
                .map(|at| sale.sale_date > at.date_naive())
                .unwrap_or(true);

            if behind {
                signals.push(StaleAfterSale {
                    unit_id: unit_id.clone(),
                    source,
                    sale_date: sale.sale_date,
                    sale_price: sale.sale_price,
                    latest_capture,
                });
            }
        }
    }

    signals
}

/// Structured output handed to whatever renders charts or writes reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub generated_at: DateTime<Utc>,
    pub reconciled_units: usize,
    pub sources: Vec<SourceReport>,
    pub reconciliation: ReconciliationTable,
    #[serde(default)]
    pub latest_estimates: Vec<LatestEstimate>,
    #[serde(default)]
    pub stale_after_sale: Vec<StaleAfterSale>,
}

impl AnalysisReport {
    pub fn source(&self, source: Source) -> Option<&SourceStatistics> {
        self.sources.iter().find(|r| r.source == source).map(|r| &r.statistics)
    }

    pub fn summary(&self) -> String {
        let reported = self.sources.iter().filter(|s| !s.statistics.is_insufficient()).count();
        format!(
            "Analysis: {} reconciled units, {} sales, {}/{} sources reported, {} stale-after-sale",
            self.reconciled_units,
            self.reconciliation.sales.len(),
            reported,
            self.sources.len(),
            self.stale_after_sale.len()
        )
    }
}

// ============================================================================
// STATISTICS REPORTER
// ============================================================================

pub struct StatisticsReporter {
    min_units: usize,
}

impl StatisticsReporter {
    pub fn new() -> Self {
        StatisticsReporter {
            min_units: MIN_RECONCILED_UNITS,
        }
    }

    pub fn report(&self, table: ReconciliationTable, generated_at: DateTime<Utc>) -> AnalysisReport {
        let sources = Source::ALL
            .iter()
            .map(|&source| SourceReport {
                source,
                statistics: self.source_statistics(&table, source),
            })
            .collect();

        AnalysisReport {
            generated_at,
            reconciled_units: table.reconciled_units().len(),
            sources,
            reconciliation: table,
            latest_estimates: Vec::new(),
            stale_after_sale: Vec::new(),
        }
    }

    pub fn source_statistics(&self, table: &ReconciliationTable, source: Source) -> SourceStatistics {
        let units = table.units_for(source).len();
        let all = table.eligible_points(source);
        let closest = table.closest_points(source);

        if units < self.min_units {
            return SourceStatistics::InsufficientSample {
                reconciled_units: units,
                samples: all.len(),
            };
        }

        match (
            ErrorAggregate::from_points(&all),
            ErrorAggregate::from_points(&closest),
            LeadDaysDistribution::from_points(&closest),
        ) {
            (Some(all_samples), Some(closest_to_sale), Some(lead_days)) => SourceStatistics::Reported {
                reconciled_units: units,
                all_samples,
                closest_to_sale,
                lead_days,
            },
            _ => SourceStatistics::InsufficientSample {
                reconciled_units: units,
                samples: all.len(),
            },
        }
    }

    /// Snapshot the store, reconcile, aggregate
    pub fn analyze(&self, store: &TimeSeriesStore, clock: &dyn Clock) -> Result<AnalysisReport, StoreError> {
        let snapshot = store.snapshot()?;
        let table = ReconciliationEngine::reconcile(&snapshot);
        let mut report = self.report(table, clock.now_utc());
        report.latest_estimates = latest_estimates(&snapshot);
        report.stale_after_sale = stale_after_sale(&snapshot);

        for signal in &report.stale_after_sale {
            warn!(
                unit_id = %signal.unit_id,
                source = %signal.source,
                sale_date = %signal.sale_date,
                "sale is newer than the latest estimate"
            );
        }
        info!(
            estimates = snapshot.estimate_count(),
            reconciled_units = report.reconciled_units,
            stale_after_sale = report.stale_after_sale.len(),
            "analysis complete"
        );
        Ok(report)
    }
}

impl Default for StatisticsReporter {
    fn default() -> Self {
        Self::new()
    }
}
