// ⚖️ Reconciliation Engine - pair estimate history with sale events
// Derived output only: recomputed from the store on every analysis run and
// never written back.
//
// For a sample captured on or before sale_date:
//   error          = estimated_price - sale_price
//   relative_error = error / sale_price
//   lead_days      = sale_date - capture date
//
// With re-sales, each sample pairs with the earliest sale on or after its
// capture date.

use crate::db::{AnomalyFlag, EstimateSample, HistorySnapshot, SaleEvent, SaleFlag};
use crate::units::Source;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// ERROR POINT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPoint {
    pub captured_at: DateTime<Utc>,
    pub estimated_price: f64,
    pub error: f64,
    pub relative_error: f64,
    pub lead_days: i64,
    pub anomaly_flag: AnomalyFlag,

    /// Counts toward headline statistics (not out-of-range, or accepted on review)
    pub eligible: bool,
}

impl ErrorPoint {
    pub fn from_sample(sample: &EstimateSample, sale: &SaleEvent, eligible: bool) -> Self {
        let error = sample.estimated_price - sale.sale_price;
        ErrorPoint {
            captured_at: sample.captured_at,
            estimated_price: sample.estimated_price,
            error,
            relative_error: error / sale.sale_price,
            lead_days: (sale.sale_date - sample.captured_at.date_naive()).num_days(),
            anomaly_flag: sample.anomaly_flag,
            eligible,
        }
    }

    /// Estimate above the sale price
    pub fn is_over(&self) -> bool {
        self.error > 0.0
    }
}

// ============================================================================
// RECONCILED SALE
// ============================================================================

/// One source's error series against one sale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSeries {
    pub source: Source,

    /// Capture-time order
    pub points: Vec<ErrorPoint>,

    /// Eligible point with the smallest lead (latest capture on ties)
    pub closest: Option<ErrorPoint>,
}

impl SourceSeries {
    fn new(source: Source, points: Vec<ErrorPoint>) -> Self {
        let closest = points
            .iter()
            .filter(|p| p.eligible)
            .min_by(|a, b| a.lead_days.cmp(&b.lead_days).then(b.captured_at.cmp(&a.captured_at)))
            .cloned();

        SourceSeries {
            source,
            points,
            closest,
        }
    }

    pub fn eligible_points(&self) -> impl Iterator<Item = &ErrorPoint> {
        self.points.iter().filter(|p| p.eligible)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledSale {
    pub unit_id: String,
    pub sale_date: NaiveDate,
    pub sale_price: f64,
    pub sale_flag: SaleFlag,
    pub series: Vec<SourceSeries>,
}

impl ReconciledSale {
    pub fn series_for(&self, source: Source) -> Option<&SourceSeries> {
        self.series.iter().find(|s| s.source == source)
    }

    pub fn has_eligible_points(&self) -> bool {
        self.series.iter().any(|s| s.eligible_points().next().is_some())
    }
}

// ============================================================================
// RECONCILIATION TABLE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationTable {
    pub sales: Vec<ReconciledSale>,
}

impl ReconciliationTable {
    /// Units with at least one eligible point in any source
    pub fn reconciled_units(&self) -> BTreeSet<String> {
        self.sales
            .iter()
            .filter(|s| s.has_eligible_points())
            .map(|s| s.unit_id.clone())
            .collect()
    }

    /// Every eligible point for a source
    pub fn eligible_points(&self, source: Source) -> Vec<&ErrorPoint> {
        self.sales
            .iter()
            .filter_map(|sale| sale.series_for(source))
            .flat_map(|series| series.eligible_points())
            .collect()
    }

    /// Closest-to-sale point per sale for a source
    pub fn closest_points(&self, source: Source) -> Vec<&ErrorPoint> {
        self.sales
            .iter()
            .filter_map(|sale| sale.series_for(source))
            .filter_map(|series| series.closest.as_ref())
            .collect()
    }

    /// Distinct units contributing eligible points for a source
    pub fn units_for(&self, source: Source) -> BTreeSet<String> {
        self.sales
            .iter()
            .filter(|sale| {
                sale.series_for(source)
                    .map(|series| series.eligible_points().next().is_some())
                    .unwrap_or(false)
            })
            .map(|sale| sale.unit_id.clone())
            .collect()
    }

    pub fn find(&self, unit_id: &str) -> Vec<&ReconciledSale> {
        self.sales.iter().filter(|s| s.unit_id == unit_id).collect()
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine;

impl ReconciliationEngine {
    /// Reconcile every unit that has at least one sale
    pub fn reconcile(snapshot: &HistorySnapshot) -> ReconciliationTable {
        let sales = snapshot
            .units_with_sales()
            .iter()
            .flat_map(|unit_id| Self::reconcile_unit(snapshot, unit_id))
            .collect();

        ReconciliationTable { sales }
    }

    /// One row per sale of the unit, in sale-date order
    pub fn reconcile_unit(snapshot: &HistorySnapshot, unit_id: &str) -> Vec<ReconciledSale> {
        let sales = snapshot.sales_of(unit_id);

        sales
            .iter()
            .enumerate()
            .map(|(i, sale)| {
                // Samples after the previous sale belong to that one
                let after = if i == 0 { None } else { Some(sales[i - 1].sale_date) };

                let series = Source::ALL
                    .iter()
                    .map(|&source| {
                        let points = snapshot
                            .history(unit_id, source)
                            .iter()
                            .filter(|sample| {
                                let day = sample.captured_at.date_naive();
                                day <= sale.sale_date && after.map(|prev| day > prev).unwrap_or(true)
                            })
                            .map(|sample| {
                                let eligible = sample.counts_toward_headline(snapshot.review_for(&sample.key()));
                                ErrorPoint::from_sample(sample, sale, eligible)
                            })
                            .collect();
                        SourceSeries::new(source, points)
                    })
                    .collect();

                ReconciledSale {
                    unit_id: unit_id.to_string(),
                    sale_date: sale.sale_date,
                    sale_price: sale.sale_price,
                    sale_flag: sale.flag,
                    series,
                }
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SaleSourceOfRecord, SampleReview, TimeSeriesStore};
    use chrono::{Duration, TimeZone};

    fn sale_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 20).unwrap()
    }

    fn days_before_sale(days: i64) -> DateTime<Utc> {
        Utc.from_utc_datetime(&sale_day().and_hms_opt(0, 0, 0).unwrap()) - Duration::days(days)
    }

    fn create_test_sample(unit: &str, source: Source, captured_at: DateTime<Utc>, price: f64) -> EstimateSample {
        EstimateSample {
            unit_id: unit.to_string(),
            source,
            captured_at,
            estimated_price: price,
            listing_status: None,
            asking_price: None,
            validity_window: None,
            anomaly_flag: AnomalyFlag::None,
        }
    }

    fn create_test_sale(unit: &str, date: NaiveDate, price: f64) -> SaleEvent {
        SaleEvent {
            unit_id: unit.to_string(),
            sale_price: price,
            sale_date: date,
            recorded_at: Utc::now(),
            source_of_record: SaleSourceOfRecord::Manual,
            asking_price: None,
            flag: SaleFlag::None,
        }
    }

    #[test]
    fn test_error_point_math() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        store
            .append_estimate(&create_test_sample("U01", Source::Zillow, days_before_sale(10), 620_000.0))
            .unwrap();
        store.append_sale(&create_test_sale("U01", sale_day(), 600_000.0)).unwrap();

        let table = ReconciliationEngine::reconcile(&store.snapshot().unwrap());
        let point = &table.sales[0].series_for(Source::Zillow).unwrap().points[0];

        assert_eq!(point.error, 20_000.0);
        assert!((point.relative_error - 0.0333).abs() < 1e-4);
        assert_eq!(point.lead_days, 10);
        assert!(point.is_over());

        println!("✅ Reconciliation math test PASSED");
    }

    #[test]
    fn test_samples_after_sale_excluded() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        for (days, price) in [(30, 590_000.0), (5, 605_000.0), (0, 607_000.0), (-3, 611_000.0)] {
            store
                .append_estimate(&create_test_sample("U01", Source::Redfin, days_before_sale(days), price))
                .unwrap();
        }
        store.append_sale(&create_test_sale("U01", sale_day(), 600_000.0)).unwrap();

        let table = ReconciliationEngine::reconcile(&store.snapshot().unwrap());
        let series = table.sales[0].series_for(Source::Redfin).unwrap();

        assert_eq!(series.points.len(), 3);
        let closest = series.closest.as_ref().unwrap();
        assert_eq!(closest.lead_days, 0);
        assert_eq!(closest.estimated_price, 607_000.0);
    }

    #[test]
    fn test_units_without_sale_excluded() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        store
            .append_estimate(&create_test_sample("U01", Source::Zillow, days_before_sale(3), 600_000.0))
            .unwrap();
        store
            .append_estimate(&create_test_sample("U02", Source::Zillow, days_before_sale(3), 500_000.0))
            .unwrap();
        store.append_sale(&create_test_sale("U01", sale_day(), 600_000.0)).unwrap();

        let table = ReconciliationEngine::reconcile(&store.snapshot().unwrap());
        assert_eq!(table.sales.len(), 1);
        assert_eq!(table.reconciled_units().into_iter().collect::<Vec<_>>(), vec!["U01"]);
        assert!(table.find("U02").is_empty());
    }

    #[test]
    fn test_out_of_range_excluded_until_accepted() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        store
            .append_estimate(&create_test_sample("U01", Source::Zillow, days_before_sale(20), 600_000.0))
            .unwrap();
        let mut wild = create_test_sample("U01", Source::Zillow, days_before_sale(2), 1_900_000.0);
        wild.anomaly_flag = AnomalyFlag::OutOfRange;
        store.append_estimate(&wild).unwrap();
        store.append_sale(&create_test_sale("U01", sale_day(), 610_000.0)).unwrap();

        let table = ReconciliationEngine::reconcile(&store.snapshot().unwrap());
        let series = table.sales[0].series_for(Source::Zillow).unwrap();
        assert_eq!(series.points.len(), 2);
        assert_eq!(series.eligible_points().count(), 1);
        assert_eq!(series.closest.as_ref().unwrap().lead_days, 20);

        store
            .append_review(&SampleReview {
                unit_id: "U01".to_string(),
                source: Source::Zillow,
                captured_at: wild.captured_at,
                reviewed_at: Utc::now(),
                accepted: true,
                note: None,
            })
            .unwrap();

        let table = ReconciliationEngine::reconcile(&store.snapshot().unwrap());
        let series = table.sales[0].series_for(Source::Zillow).unwrap();
        assert_eq!(series.eligible_points().count(), 2);
        assert_eq!(series.closest.as_ref().unwrap().lead_days, 2);
    }

    #[test]
    fn test_resale_pairs_with_next_sale() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        let resale_day = sale_day() + Duration::days(400);
        store
            .append_estimate(&create_test_sample("U01", Source::Zillow, days_before_sale(10), 590_000.0))
            .unwrap();
        store
            .append_estimate(&create_test_sample("U01", Source::Zillow, days_before_sale(-100), 640_000.0))
            .unwrap();
        store.append_sale(&create_test_sale("U01", sale_day(), 600_000.0)).unwrap();
        store.append_sale(&create_test_sale("U01", resale_day, 650_000.0)).unwrap();

        let table = ReconciliationEngine::reconcile(&store.snapshot().unwrap());
        assert_eq!(table.sales.len(), 2);
        assert_eq!(table.sales[0].series_for(Source::Zillow).unwrap().points.len(), 1);

        let second = &table.sales[1].series_for(Source::Zillow).unwrap().points;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].lead_days, 300);
        assert_eq!(second[0].error, -10_000.0);
    }

    #[test]
    fn test_reconcile_is_repeatable() {
        let store = TimeSeriesStore::open_in_memory().unwrap();
        store
            .append_estimate(&create_test_sample("U01", Source::Redfin, days_before_sale(4), 598_000.0))
            .unwrap();
        store.append_sale(&create_test_sale("U01", sale_day(), 600_000.0)).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(
            ReconciliationEngine::reconcile(&snapshot),
            ReconciliationEngine::reconcile(&snapshot)
        );
    }
}
