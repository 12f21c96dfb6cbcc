// 🏷️ Sale Recording - manual entry boundary for closed transactions
// Anything that detects a sale (MLS lookup, a listing going pending) ends up
// here as a SaleRequest. Soft invariant: a sale dated before the unit's first
// estimate is flagged, not rejected.

use crate::clock::Clock;
use crate::db::{SaleEvent, SaleFlag, SaleSourceOfRecord, TimeSeriesStore};
use crate::error::SaleError;
use crate::units::UnitRegistry;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRequest {
    pub unit_id: String,
    pub sale_price: f64,
    pub sale_date: NaiveDate,
    pub source_of_record: SaleSourceOfRecord,
    pub asking_price: Option<f64>,
}

impl SaleRequest {
    pub fn manual(unit_id: &str, sale_price: f64, sale_date: NaiveDate) -> Self {
        SaleRequest {
            unit_id: unit_id.to_string(),
            sale_price,
            sale_date,
            source_of_record: SaleSourceOfRecord::Manual,
            asking_price: None,
        }
    }
}

/// Validate and append a sale event. Returns the stored event.
pub fn record_sale(
    registry: &UnitRegistry,
    store: &TimeSeriesStore,
    request: SaleRequest,
    clock: &dyn Clock,
) -> Result<SaleEvent, SaleError> {
    if !registry.contains(&request.unit_id) {
        return Err(SaleError::UnitNotFound(request.unit_id));
    }
    if !request.sale_price.is_finite() || request.sale_price <= 0.0 {
        return Err(SaleError::InvalidPrice(request.sale_price));
    }

    let flag = match store.earliest_capture(&request.unit_id)? {
        Some(first) if request.sale_date < first.date_naive() => {
            warn!(
                unit_id = %request.unit_id,
                sale_date = %request.sale_date,
                first_estimate = %first.date_naive(),
                "sale predates the unit's first estimate"
            );
            SaleFlag::PrecedesFirstEstimate
        }
        _ => SaleFlag::None,
    };

    let event = SaleEvent {
        unit_id: request.unit_id,
        sale_price: request.sale_price,
        sale_date: request.sale_date,
        recorded_at: clock.now_utc(),
        source_of_record: request.source_of_record,
        asking_price: request.asking_price,
        flag,
    };

    store.append_sale(&event)?;
    info!(unit_id = %event.unit_id, price = event.sale_price, date = %event.sale_date, "sale recorded");

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{AnomalyFlag, EstimateSample};
    use crate::units::{Source, Unit};
    use chrono::{TimeZone, Utc};

    fn setup() -> (UnitRegistry, TimeSeriesStore, ManualClock) {
        let registry = UnitRegistry::from_units(vec![
            Unit::new("U01", "Woodgate", "1 Main St #1"),
            Unit::new("U02", "Woodgate", "1 Main St #2"),
        ])
        .unwrap();
        let store = TimeSeriesStore::open_in_memory().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap());
        (registry, store, clock)
    }

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, d).unwrap()
    }

    #[test]
    fn test_record_sale() {
        let (registry, store, clock) = setup();
        let request = SaleRequest {
            asking_price: Some(615_000.0),
            source_of_record: SaleSourceOfRecord::Mls,
            ..SaleRequest::manual("U01", 600_000.0, date(8, 15))
        };

        let event = record_sale(&registry, &store, request, &clock).unwrap();
        assert_eq!(event.flag, SaleFlag::None);
        assert_eq!(event.recorded_at, clock.now_utc());
        assert_eq!(store.sale_of("U01").unwrap().unwrap(), event);
    }

    #[test]
    fn test_unknown_unit() {
        let (registry, store, clock) = setup();
        let err = record_sale(&registry, &store, SaleRequest::manual("U99", 1.0, date(8, 1)), &clock).unwrap_err();
        assert!(matches!(err, SaleError::UnitNotFound(ref id) if id == "U99"));
    }

    #[test]
    fn test_duplicate_sale() {
        let (registry, store, clock) = setup();
        record_sale(&registry, &store, SaleRequest::manual("U01", 600_000.0, date(8, 15)), &clock).unwrap();

        let err = record_sale(&registry, &store, SaleRequest::manual("U01", 605_000.0, date(8, 15)), &clock)
            .unwrap_err();
        assert!(matches!(err, SaleError::DuplicateSale { .. }));

        // A re-sale on another date is fine
        record_sale(&registry, &store, SaleRequest::manual("U01", 640_000.0, date(12, 1)), &clock).unwrap();
        assert_eq!(store.sales_of("U01").unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_price() {
        let (registry, store, clock) = setup();
        let err = record_sale(&registry, &store, SaleRequest::manual("U01", 0.0, date(8, 15)), &clock).unwrap_err();
        assert!(matches!(err, SaleError::InvalidPrice(_)));
    }

    #[test]
    fn test_sale_before_first_estimate_is_flagged() {
        let (registry, store, clock) = setup();
        store
            .append_estimate(&EstimateSample {
                unit_id: "U02".to_string(),
                source: Source::Redfin,
                captured_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
                estimated_price: 500_000.0,
                listing_status: None,
                asking_price: None,
                validity_window: None,
                anomaly_flag: AnomalyFlag::None,
            })
            .unwrap();

        let event = record_sale(&registry, &store, SaleRequest::manual("U02", 510_000.0, date(5, 20)), &clock).unwrap();
        assert_eq!(event.flag, SaleFlag::PrecedesFirstEstimate);

        let stored = store.sale_of("U02").unwrap().unwrap();
        assert_eq!(stored.flag, SaleFlag::PrecedesFirstEstimate);
    }
}
