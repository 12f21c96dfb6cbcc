// Collect → record sale → analyze, through the public API.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use estimate_tracker::{
    record_sale, AnomalyFlag, Collector, FetchError, ManualClock, PairStatus, PipelineConfig,
    RawResponse, RunScope, SaleRequest, Source, SourceStatistics, StatisticsReporter,
    TimeSeriesStore, UnitRegistry,
};
use std::collections::HashMap;
use std::sync::Arc;

const CATALOG: &str = "\
unit_id,development,address,zillow_url,redfin_url
U01,Woodgate,1 Main St #1,https://z/1,https://r/1
U02,Woodgate,1 Main St #2,https://z/2,https://r/2
U03,Woodgate,1 Main St #3,https://z/3,
";

fn registry() -> UnitRegistry {
    UnitRegistry::from_reader(csv::Reader::from_reader(CATALOG.as_bytes())).unwrap()
}

/// Fetch answering from a fixed price table
fn prices(table: &[(&str, f64)]) -> impl Fn(Source, &str) -> Result<RawResponse, FetchError> {
    let table: HashMap<String, f64> = table.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    move |_source: Source, key: &str| {
        table
            .get(key)
            .map(|&price| RawResponse::new(price))
            .ok_or_else(|| FetchError::Permanent(format!("no listing at {}", key)))
    }
}

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, m, d).unwrap()
}

#[test]
fn test_collect_sale_report() {
    let registry = registry();
    let store = TimeSeriesStore::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 8, 10, 6, 0, 0).unwrap()));
    let config = PipelineConfig::default();

    let fetch = prices(&[
        ("https://z/1", 620_000.0),
        ("https://r/1", 605_000.0),
        ("https://z/2", 500_000.0),
        ("https://r/2", 498_000.0),
        ("https://z/3", 510_000.0),
    ]);
    let mut collector = Collector::new(&registry, &store, fetch, clock.clone(), &config);
    let summary = collector.run(RunScope::All).unwrap();

    let totals = summary.totals();
    assert_eq!(totals.success, 5);
    assert_eq!(totals.skipped, 1);
    assert_eq!(totals.anomaly, 0);

    record_sale(&registry, &store, SaleRequest::manual("U01", 600_000.0, date(8, 20)), clock.as_ref()).unwrap();
    record_sale(&registry, &store, SaleRequest::manual("U02", 510_000.0, date(8, 25)), clock.as_ref()).unwrap();

    let report = StatisticsReporter::new().analyze(&store, clock.as_ref()).unwrap();
    assert_eq!(report.reconciled_units, 2);
    assert!(report.reconciliation.find("U03").is_empty());

    let u01 = &report.reconciliation.find("U01")[0];
    let point = &u01.series_for(Source::Zillow).unwrap().points[0];
    assert_eq!(point.error, 20_000.0);
    assert!((point.relative_error - 0.0333).abs() < 1e-4);
    assert_eq!(point.lead_days, 10);

    match report.source(Source::Zillow).unwrap() {
        SourceStatistics::Reported {
            reconciled_units,
            closest_to_sale,
            lead_days,
            ..
        } => {
            assert_eq!(*reconciled_units, 2);
            assert_eq!(closest_to_sale.samples, 2);
            // +20000 and -10000
            assert_eq!(closest_to_sale.median_error, 5_000.0);
            assert_eq!(closest_to_sale.bias_fraction, 0.5);
            assert_eq!(lead_days.values, vec![10, 15]);
        }
        other => panic!("expected zillow statistics, got {:?}", other),
    }

    // Every stored pair has a latest estimate; both sales came after the only collection day
    assert_eq!(report.latest_estimates.len(), 5);
    assert_eq!(report.stale_after_sale.len(), 4);
    assert!(report
        .stale_after_sale
        .iter()
        .all(|s| s.unit_id == "U01" || s.unit_id == "U02"));

    // JSON is the hand-off format
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["sources"][0]["statistics"]["status"], "reported");

    println!("✅ End-to-end test PASSED");
}

#[test]
fn test_jump_flagged_through_pipeline() {
    let registry = registry();
    let store = TimeSeriesStore::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 8, 1, 6, 0, 0).unwrap()));
    let config = PipelineConfig::default();

    let baseline = prices(&[("https://z/1", 500_000.0), ("https://z/2", 500_000.0)]);
    Collector::new(&registry, &store, baseline, clock.clone(), &config)
        .run(RunScope::All)
        .unwrap();

    clock.advance(Duration::days(2).to_std().unwrap());
    let next = prices(&[("https://z/1", 700_000.0), ("https://z/2", 540_000.0)]);
    let summary = Collector::new(&registry, &store, next, clock.clone(), &config)
        .run(RunScope::All)
        .unwrap();

    let flag_of = |unit: &str| {
        summary
            .outcomes
            .iter()
            .find(|o| o.unit_id == unit && o.source == Source::Zillow)
            .and_then(|o| match &o.status {
                PairStatus::Stored { flag, .. } => Some(*flag),
                _ => None,
            })
    };
    assert_eq!(flag_of("U01"), Some(AnomalyFlag::HighJump));
    assert_eq!(flag_of("U02"), Some(AnomalyFlag::None));

    let history = store.history("U01", Source::Zillow).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].anomaly_flag, AnomalyFlag::HighJump);
}

#[test]
fn test_empty_store_reports_insufficient_sample() {
    let store = TimeSeriesStore::open_in_memory().unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap());

    let report = StatisticsReporter::new().analyze(&store, &clock).unwrap();

    assert_eq!(report.reconciled_units, 0);
    assert!(report.sources.iter().all(|s| s.statistics.is_insufficient()));
}
