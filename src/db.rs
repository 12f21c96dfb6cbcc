use crate::error::StoreError;
use crate::pipeline::RunSummary;
use crate::rotation::{CursorStore, RotationCursor};
use crate::units::Source;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingStatus {
    ForSale,
    OffMarket,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyFlag {
    None,
    HighJump,
    OutOfRange,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaleSourceOfRecord {
    Manual,
    Mls,
    ListingStatusChange,
}

/// Soft-invariant result recorded on a sale. Never a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaleFlag {
    None,
    /// sale_date is earlier than the unit's first estimate
    PrecedesFirstEstimate,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("invalid {}: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(ListingStatus {
    ForSale => "for-sale",
    OffMarket => "off-market",
    Pending => "pending",
});

text_enum!(AnomalyFlag {
    None => "none",
    HighJump => "high-jump",
    OutOfRange => "out-of-range",
    Stale => "stale",
});

text_enum!(SaleSourceOfRecord {
    Manual => "manual",
    Mls => "mls",
    ListingStatusChange => "listing-status-change",
});

text_enum!(SaleFlag {
    None => "none",
    PrecedesFirstEstimate => "precedes-first-estimate",
});

impl AnomalyFlag {
    pub fn is_anomaly(&self) -> bool {
        *self != AnomalyFlag::None
    }
}

/// Provider-declared freshness interval. Opaque and advisory: the only thing
/// derived from it is the `stale` flag. Bounds are treated as inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ValidityWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// One estimate reading. Immutable once persisted; corrections are new samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateSample {
    pub unit_id: String,
    pub source: Source,
    pub captured_at: DateTime<Utc>,
    pub estimated_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_status: Option<ListingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asking_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity_window: Option<ValidityWindow>,
    pub anomaly_flag: AnomalyFlag,
}

impl EstimateSample {
    pub fn key(&self) -> SampleKey {
        SampleKey {
            unit_id: self.unit_id.clone(),
            source: self.source,
            captured_at: self.captured_at,
        }
    }

    /// Whether this sample belongs in headline statistics.
    /// An explicit review always wins; otherwise only out-of-range samples
    /// are held back.
    pub fn counts_toward_headline(&self, review: Option<&SampleReview>) -> bool {
        match review {
            Some(review) => review.accepted,
            None => self.anomaly_flag != AnomalyFlag::OutOfRange,
        }
    }
}

/// Store key of an estimate sample
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey {
    pub unit_id: String,
    pub source: Source,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleEvent {
    pub unit_id: String,
    pub sale_price: f64,
    pub sale_date: NaiveDate,
    pub recorded_at: DateTime<Utc>,
    pub source_of_record: SaleSourceOfRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asking_price: Option<f64>,
    pub flag: SaleFlag,
}

/// Manual decision on a stored sample. Append-only; the latest one wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleReview {
    pub unit_id: String,
    pub source: Source,
    pub captured_at: DateTime<Utc>,
    pub reviewed_at: DateTime<Utc>,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SampleReview {
    pub fn key(&self) -> SampleKey {
        SampleKey {
            unit_id: self.unit_id.clone(),
            source: self.source,
            captured_at: self.captured_at,
        }
    }
}

/// Record counts for the status view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub estimates: i64,
    pub flagged_estimates: i64,
    pub units_with_estimates: i64,
    pub sales: i64,
    pub reviews: i64,
    pub runs: i64,
    pub last_capture: Option<DateTime<Utc>>,
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Everything the analysis path needs, read inside one transaction.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    pub estimates: BTreeMap<(String, Source), Vec<EstimateSample>>,
    pub sales: BTreeMap<String, Vec<SaleEvent>>,
    pub reviews: HashMap<SampleKey, SampleReview>,
    pub taken_at: Option<DateTime<Utc>>,
}

impl HistorySnapshot {
    pub fn history(&self, unit_id: &str, source: Source) -> &[EstimateSample] {
        self.estimates
            .get(&(unit_id.to_string(), source))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Sales for a unit, ordered by sale_date
    pub fn sales_of(&self, unit_id: &str) -> &[SaleEvent] {
        self.sales.get(unit_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn units_with_sales(&self) -> BTreeSet<String> {
        self.sales.keys().cloned().collect()
    }

    pub fn review_for(&self, key: &SampleKey) -> Option<&SampleReview> {
        self.reviews.get(key)
    }

    pub fn estimate_count(&self) -> usize {
        self.estimates.values().map(Vec::len).sum()
    }
}

// ============================================================================
// TIMESTAMP ENCODING
// ============================================================================

/// Fixed-width RFC 3339 (microseconds, `Z`), so text order == time order.
pub(crate) fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn ts_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", text, e)))
}

fn opt_ts_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(_) => ts_column(row, idx).map(Some),
    }
}

fn date_column(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| conversion_error(idx, format!("bad date '{}': {}", text, e)))
}

fn enum_column<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn opt_enum_column<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

/// UNIQUE or PRIMARY KEY failures only. NOT NULL and CHECK failures are
/// real write errors, not duplicates.
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

const ESTIMATE_COLUMNS: &str = "unit_id, source, captured_at, estimated_price, listing_status,
                                asking_price, valid_from, valid_until, anomaly_flag";

fn estimate_from_row(row: &Row) -> rusqlite::Result<EstimateSample> {
    let valid_from = opt_ts_column(row, 6)?;
    let valid_until = opt_ts_column(row, 7)?;
    let validity_window = match (valid_from, valid_until) {
        (Some(start), Some(end)) => Some(ValidityWindow { start, end }),
        _ => None,
    };

    Ok(EstimateSample {
        unit_id: row.get(0)?,
        source: enum_column(row, 1)?,
        captured_at: ts_column(row, 2)?,
        estimated_price: row.get(3)?,
        listing_status: opt_enum_column(row, 4)?,
        asking_price: row.get(5)?,
        validity_window,
        anomaly_flag: enum_column(row, 8)?,
    })
}

const SALE_COLUMNS: &str =
    "unit_id, sale_price, sale_date, recorded_at, source_of_record, asking_price, flag";

fn sale_from_row(row: &Row) -> rusqlite::Result<SaleEvent> {
    Ok(SaleEvent {
        unit_id: row.get(0)?,
        sale_price: row.get(1)?,
        sale_date: date_column(row, 2)?,
        recorded_at: ts_column(row, 3)?,
        source_of_record: enum_column(row, 4)?,
        asking_price: row.get(5)?,
        flag: enum_column(row, 6)?,
    })
}

const REVIEW_COLUMNS: &str = "unit_id, source, captured_at, reviewed_at, accepted, note";

fn review_from_row(row: &Row) -> rusqlite::Result<SampleReview> {
    Ok(SampleReview {
        unit_id: row.get(0)?,
        source: enum_column(row, 1)?,
        captured_at: ts_column(row, 2)?,
        reviewed_at: ts_column(row, 3)?,
        accepted: row.get(4)?,
        note: row.get(5)?,
    })
}

// ============================================================================
// TIME SERIES STORE
// ============================================================================

/// Append-only history of estimate samples and sale events, plus the
/// rotation cursor. Every append is its own SQLite transaction, so a crash
/// mid-run leaves whole records only.
pub struct TimeSeriesStore {
    conn: Connection,
}

impl TimeSeriesStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        setup_database(&conn)?;
        Ok(TimeSeriesStore { conn })
    }

    // ------------------------------------------------------------------------
    // Appends
    // ------------------------------------------------------------------------

    /// Append one sample. Rejects exact (unit, source, captured_at) duplicates
    /// and anything older than the latest capture for the pair.
    pub fn append_estimate(&self, sample: &EstimateSample) -> Result<(), StoreError> {
        // SQLite binds NaN as NULL
        if !sample.estimated_price.is_finite() {
            return Err(StoreError::NonFinitePrice {
                unit_id: sample.unit_id.clone(),
                provider: sample.source,
                captured_at: sample.captured_at,
                price: sample.estimated_price,
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        let captured_at = encode_ts(sample.captured_at);
        let source = sample.source.as_str();

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM estimates
                           WHERE unit_id = ?1 AND source = ?2 AND captured_at = ?3)",
            params![sample.unit_id, source, captured_at],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::DuplicateSample {
                unit_id: sample.unit_id.clone(),
                provider: sample.source,
                captured_at: sample.captured_at,
            });
        }

        let latest: Option<String> = tx.query_row(
            "SELECT MAX(captured_at) FROM estimates WHERE unit_id = ?1 AND source = ?2",
            params![sample.unit_id, source],
            |row| row.get(0),
        )?;
        if let Some(latest) = latest {
            if captured_at < latest {
                let latest = DateTime::parse_from_rfc3339(&latest)
                    .map_err(|e| StoreError::Corrupt(format!("bad stored timestamp: {}", e)))?
                    .with_timezone(&Utc);
                return Err(StoreError::OutOfOrder {
                    unit_id: sample.unit_id.clone(),
                    provider: sample.source,
                    captured_at: sample.captured_at,
                    latest,
                });
            }
        }

        let result = tx.execute(
            "INSERT INTO estimates (
                unit_id, source, captured_at, estimated_price, listing_status,
                asking_price, valid_from, valid_until, anomaly_flag, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                sample.unit_id,
                source,
                captured_at,
                sample.estimated_price,
                sample.listing_status.map(|s| s.as_str()),
                sample.asking_price,
                sample.validity_window.map(|w| encode_ts(w.start)),
                sample.validity_window.map(|w| encode_ts(w.end)),
                sample.anomaly_flag.as_str(),
                encode_ts(Utc::now()),
            ],
        );

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateSample {
                    unit_id: sample.unit_id.clone(),
                    provider: sample.source,
                    captured_at: sample.captured_at,
                });
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit()?;
        debug!(unit_id = %sample.unit_id, source = %sample.source, captured_at = %captured_at, "estimate appended");
        Ok(())
    }

    /// Append a sale event. (unit_id, sale_date) is unique.
    pub fn append_sale(&self, event: &SaleEvent) -> Result<(), StoreError> {
        let result = self.conn.execute(
            "INSERT INTO sales (
                unit_id, sale_price, sale_date, recorded_at, source_of_record, asking_price, flag
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.unit_id,
                event.sale_price,
                encode_date(event.sale_date),
                encode_ts(event.recorded_at),
                event.source_of_record.as_str(),
                event.asking_price,
                event.flag.as_str(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateSale {
                unit_id: event.unit_id.clone(),
                sale_date: event.sale_date,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn append_review(&self, review: &SampleReview) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO sample_reviews (unit_id, source, captured_at, reviewed_at, accepted, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                review.unit_id,
                review.source.as_str(),
                encode_ts(review.captured_at),
                encode_ts(review.reviewed_at),
                review.accepted,
                review.note,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Samples for one (unit, source), capture-time order
    pub fn history(&self, unit_id: &str, source: Source) -> Result<Vec<EstimateSample>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM estimates
             WHERE unit_id = ?1 AND source = ?2
             ORDER BY captured_at ASC, id ASC",
            ESTIMATE_COLUMNS
        ))?;

        let samples = stmt
            .query_map(params![unit_id, source.as_str()], estimate_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(samples)
    }

    pub fn latest_estimate(&self, unit_id: &str, source: Source) -> Result<Option<EstimateSample>, StoreError> {
        let sample = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM estimates
                     WHERE unit_id = ?1 AND source = ?2
                     ORDER BY captured_at DESC, id DESC LIMIT 1",
                    ESTIMATE_COLUMNS
                ),
                params![unit_id, source.as_str()],
                estimate_from_row,
            )
            .optional()?;
        Ok(sample)
    }

    /// Most recent sample for the pair that counts toward headline statistics
    pub fn latest_accepted_estimate(
        &self,
        unit_id: &str,
        source: Source,
    ) -> Result<Option<EstimateSample>, StoreError> {
        let reviews = self.reviews_for_pair(unit_id, source)?;
        let history = self.history(unit_id, source)?;

        Ok(history
            .into_iter()
            .rev()
            .find(|s| s.counts_toward_headline(reviews.get(&s.key()))))
    }

    /// Latest accepted price per unit for one source
    pub fn latest_accepted_prices(&self, source: Source) -> Result<BTreeMap<String, f64>, StoreError> {
        let reviews = self.latest_reviews()?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM estimates WHERE source = ?1 ORDER BY unit_id, captured_at ASC, id ASC",
            ESTIMATE_COLUMNS
        ))?;

        let mut latest = BTreeMap::new();
        for sample in stmt.query_map(params![source.as_str()], estimate_from_row)? {
            let sample = sample?;
            if sample.counts_toward_headline(reviews.get(&sample.key())) {
                latest.insert(sample.unit_id.clone(), sample.estimated_price);
            }
        }

        Ok(latest)
    }

    /// First capture for a unit across all sources
    pub fn earliest_capture(&self, unit_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let text: Option<String> = self.conn.query_row(
            "SELECT MIN(captured_at) FROM estimates WHERE unit_id = ?1",
            params![unit_id],
            |row| row.get(0),
        )?;

        text.map(|t| {
            DateTime::parse_from_rfc3339(&t)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt(format!("bad stored timestamp '{}': {}", t, e)))
        })
        .transpose()
    }

    /// The unit's first recorded sale, if any
    pub fn sale_of(&self, unit_id: &str) -> Result<Option<SaleEvent>, StoreError> {
        Ok(self.sales_of(unit_id)?.into_iter().next())
    }

    /// All sales for a unit, ordered by sale_date
    pub fn sales_of(&self, unit_id: &str) -> Result<Vec<SaleEvent>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sales WHERE unit_id = ?1 ORDER BY sale_date ASC",
            SALE_COLUMNS
        ))?;

        let sales = stmt
            .query_map(params![unit_id], sale_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sales)
    }

    pub fn all_units_with_sales(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT unit_id FROM sales")?;
        let units = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(units)
    }

    fn reviews_for_pair(&self, unit_id: &str, source: Source) -> Result<HashMap<SampleKey, SampleReview>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sample_reviews
             WHERE unit_id = ?1 AND source = ?2
             ORDER BY reviewed_at ASC, id ASC",
            REVIEW_COLUMNS
        ))?;

        let mut latest = HashMap::new();
        for review in stmt.query_map(params![unit_id, source.as_str()], review_from_row)? {
            let review = review?;
            latest.insert(review.key(), review);
        }
        Ok(latest)
    }

    /// Latest review per sample (later reviews supersede earlier ones)
    pub fn latest_reviews(&self) -> Result<HashMap<SampleKey, SampleReview>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sample_reviews ORDER BY reviewed_at ASC, id ASC",
            REVIEW_COLUMNS
        ))?;

        let mut latest = HashMap::new();
        for review in stmt.query_map([], review_from_row)? {
            let review = review?;
            latest.insert(review.key(), review);
        }
        Ok(latest)
    }

    /// Consistent read of the whole history for the analysis path.
    /// All queries run inside one transaction, so a concurrent collection run
    /// is either fully visible up to some append or not at all.
    pub fn snapshot(&self) -> Result<HistorySnapshot, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut snapshot = HistorySnapshot {
            taken_at: Some(Utc::now()),
            ..HistorySnapshot::default()
        };

        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM estimates ORDER BY unit_id, source, captured_at ASC, id ASC",
                ESTIMATE_COLUMNS
            ))?;
            for sample in stmt.query_map([], estimate_from_row)? {
                let sample = sample?;
                snapshot
                    .estimates
                    .entry((sample.unit_id.clone(), sample.source))
                    .or_default()
                    .push(sample);
            }

            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM sales ORDER BY unit_id, sale_date ASC",
                SALE_COLUMNS
            ))?;
            for sale in stmt.query_map([], sale_from_row)? {
                let sale = sale?;
                snapshot.sales.entry(sale.unit_id.clone()).or_default().push(sale);
            }

            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM sample_reviews ORDER BY reviewed_at ASC, id ASC",
                REVIEW_COLUMNS
            ))?;
            for review in stmt.query_map([], review_from_row)? {
                let review = review?;
                snapshot.reviews.insert(review.key(), review);
            }
        }

        tx.commit()?;
        Ok(snapshot)
    }

    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    /// Record a finished run and, for rotation runs, move the cursor.
    /// Both happen in one transaction: either the run counts or it doesn't.
    pub fn complete_run(&self, summary: &RunSummary, cursor: Option<&RotationCursor>) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;

        if let Some(cursor) = cursor {
            write_cursor(&tx, cursor)?;
        }

        tx.execute(
            "INSERT INTO runs (run_id, scope, started_at, finished_at, summary)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                summary.run_id,
                summary.scope.as_str(),
                encode_ts(summary.started_at),
                encode_ts(summary.finished_at),
                serde_json::to_string(summary)?,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Most recent runs first
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT summary FROM runs ORDER BY finished_at DESC, id DESC LIMIT ?1")?;

        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let (estimates, flagged_estimates, units_with_estimates, last): (i64, i64, i64, Option<String>) =
            self.conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN anomaly_flag != 'none' THEN 1 ELSE 0 END), 0),
                        COUNT(DISTINCT unit_id),
                        MAX(captured_at)
                 FROM estimates",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        let sales: i64 = self.conn.query_row("SELECT COUNT(*) FROM sales", [], |row| row.get(0))?;
        let reviews: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sample_reviews", [], |row| row.get(0))?;
        let runs: i64 = self.conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;

        let last_capture = last
            .map(|t| {
                DateTime::parse_from_rfc3339(&t)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StoreError::Corrupt(format!("bad stored timestamp '{}': {}", t, e)))
            })
            .transpose()?;

        Ok(StoreStats {
            estimates,
            flagged_estimates,
            units_with_estimates,
            sales,
            reviews,
            runs,
            last_capture,
        })
    }
}

// ============================================================================
// CURSOR
// ============================================================================

fn write_cursor(conn: &Connection, cursor: &RotationCursor) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO rotation_cursor (id, position, catalog_fingerprint, advanced_at)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            position = excluded.position,
            catalog_fingerprint = excluded.catalog_fingerprint,
            advanced_at = excluded.advanced_at",
        params![
            cursor.position as i64,
            cursor.catalog_fingerprint,
            cursor.advanced_at.map(encode_ts),
        ],
    )?;
    Ok(())
}

impl CursorStore for TimeSeriesStore {
    fn load_cursor(&self) -> Result<Option<RotationCursor>, StoreError> {
        let cursor = self
            .conn
            .query_row(
                "SELECT position, catalog_fingerprint, advanced_at FROM rotation_cursor WHERE id = 1",
                [],
                |row| {
                    let position: i64 = row.get(0)?;
                    Ok(RotationCursor {
                        position: usize::try_from(position)
                            .map_err(|_| conversion_error(0, format!("negative cursor {}", position)))?,
                        catalog_fingerprint: row.get(1)?,
                        advanced_at: opt_ts_column(row, 2)?,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    fn save_cursor(&self, cursor: &RotationCursor) -> Result<(), StoreError> {
        write_cursor(&self.conn, cursor)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // Enable WAL mode for crash recovery and concurrent readers
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS estimates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            unit_id TEXT NOT NULL,
            source TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            estimated_price REAL NOT NULL,
            listing_status TEXT,
            asking_price REAL,
            valid_from TEXT,
            valid_until TEXT,
            anomaly_flag TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            UNIQUE(unit_id, source, captured_at)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sales (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            unit_id TEXT NOT NULL,
            sale_price REAL NOT NULL,
            sale_date TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            source_of_record TEXT NOT NULL,
            asking_price REAL,
            flag TEXT NOT NULL,
            UNIQUE(unit_id, sale_date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sample_reviews (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            unit_id TEXT NOT NULL,
            source TEXT NOT NULL,
            captured_at TEXT NOT NULL,
            reviewed_at TEXT NOT NULL,
            accepted INTEGER NOT NULL,
            note TEXT
        )",
        [],
    )?;

    // Single scalar row
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rotation_cursor (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            position INTEGER NOT NULL,
            catalog_fingerprint TEXT NOT NULL,
            advanced_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT UNIQUE NOT NULL,
            scope TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            summary TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_estimates_pair ON estimates(unit_id, source, captured_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_estimates_source ON estimates(source, unit_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reviews_sample ON sample_reviews(unit_id, source, captured_at)",
        [],
    )?;

    Ok(())
}
