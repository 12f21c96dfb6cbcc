// 🌐 Rate-Limited Fetcher
// Wraps the external raw-fetch capability with a process-wide request throttle
// and bounded retry.
//
// Pacing: every outbound request (first attempts and retries alike) waits until
// at least D has passed since the previous one. Retries wait D·2^(n-1) instead,
// or longer if the remote sent a Retry-After hint.

use crate::clock::Clock;
use crate::config::{CaptureResolution, FetchConfig};
use crate::db::{AnomalyFlag, EstimateSample, ListingStatus, ValidityWindow};
use crate::units::Source;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

// ============================================================================
// FETCH CAPABILITY
// ============================================================================

/// What a provider returned for one lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    pub estimated_price: f64,
    #[serde(default)]
    pub listing_status: Option<ListingStatus>,
    #[serde(default)]
    pub asking_price: Option<f64>,
    #[serde(default)]
    pub validity_window: Option<ValidityWindow>,
}

impl RawResponse {
    pub fn new(estimated_price: f64) -> Self {
        RawResponse {
            estimated_price,
            listing_status: None,
            asking_price: None,
            validity_window: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// Network, timeout, 5xx. Worth retrying.
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// Remote asked us to slow down
    #[error("rate limited by remote (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The pair is unreachable (delisted, malformed page). Never retried.
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::Permanent(_))
    }
}

/// External per-(source, key) fetch. How it talks to a provider is not our concern.
pub trait EstimateFetch {
    fn fetch_raw(&self, source: Source, lookup_key: &str) -> Result<RawResponse, FetchError>;
}

impl<F> EstimateFetch for F
where
    F: Fn(Source, &str) -> Result<RawResponse, FetchError>,
{
    fn fetch_raw(&self, source: Source, lookup_key: &str) -> Result<RawResponse, FetchError> {
        self(source, lookup_key)
    }
}

// ============================================================================
// FETCH FAILURE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchFailureKind {
    /// Transient errors outlasted the retry budget
    Exhausted,
    Permanent,
}

/// Terminal outcome of a failed fetch. Recorded as a gap; the run continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?} fetch failure after {attempts} attempt(s): {message}")]
pub struct FetchFailure {
    pub kind: FetchFailureKind,
    pub attempts: u32,
    pub message: String,
}

/// A fetched sample plus the untruncated instant the response arrived.
/// `sample.captured_at` is already cut to the capture resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub sample: EstimateSample,
    pub fetched_at: DateTime<Utc>,
}

// ============================================================================
// RATE-LIMITED FETCHER
// ============================================================================

pub struct RateLimitedFetcher<F: EstimateFetch> {
    inner: F,
    clock: Arc<dyn Clock>,
    delay: Duration,
    max_retries: u32,
    max_retry_after: Duration,
    resolution: CaptureResolution,
    last_request: Option<Instant>,
    requests: u64,
}

impl<F: EstimateFetch> RateLimitedFetcher<F> {
    pub fn new(inner: F, clock: Arc<dyn Clock>, config: &FetchConfig, resolution: CaptureResolution) -> Self {
        RateLimitedFetcher {
            inner,
            clock,
            delay: config.delay(),
            max_retries: config.max_retries,
            max_retry_after: config.max_retry_after(),
            resolution,
            last_request: None,
            requests: 0,
        }
    }

    /// Outbound requests made so far
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Fetch one (unit, source) pair. The caller resolves `lookup_key` from
    /// the registry; `unit_id` only labels the resulting sample.
    ///
    /// Never fails with anything other than a `FetchFailure`. A non-finite
    /// price is a permanent failure.
    pub fn fetch(&mut self, unit_id: &str, source: Source, lookup_key: &str) -> Result<Fetched, FetchFailure> {
        let mut attempts: u32 = 0;
        let mut spacing = self.delay;

        loop {
            self.wait_for_slot(spacing);
            let result = self.inner.fetch_raw(source, lookup_key);
            self.last_request = Some(self.clock.monotonic());
            self.requests += 1;
            attempts += 1;

            let error = match result {
                Ok(raw) if !raw.estimated_price.is_finite() => {
                    return Err(FetchFailure {
                        kind: FetchFailureKind::Permanent,
                        attempts,
                        message: format!("non-finite estimate: {}", raw.estimated_price),
                    });
                }
                Ok(raw) => {
                    let fetched_at = self.clock.now_utc();
                    let sample = EstimateSample {
                        unit_id: unit_id.to_string(),
                        source,
                        captured_at: self.resolution.apply(fetched_at),
                        estimated_price: raw.estimated_price,
                        listing_status: raw.listing_status,
                        asking_price: raw.asking_price,
                        validity_window: raw.validity_window,
                        anomaly_flag: AnomalyFlag::None,
                    };
                    return Ok(Fetched { sample, fetched_at });
                }
                Err(FetchError::Permanent(message)) => {
                    return Err(FetchFailure {
                        kind: FetchFailureKind::Permanent,
                        attempts,
                        message,
                    });
                }
                Err(error) => error,
            };

            if attempts > self.max_retries {
                return Err(FetchFailure {
                    kind: FetchFailureKind::Exhausted,
                    attempts,
                    message: error.to_string(),
                });
            }

            spacing = self.retry_spacing(attempts, &error);
            warn!(
                unit_id,
                source = %source,
                attempt = attempts,
                wait_ms = spacing.as_millis() as u64,
                error = %error,
                "transient fetch failure, retrying"
            );
        }
    }

    /// Gap before retry number `retry` (1-based): D·2^(retry-1), stretched to
    /// a capped Retry-After hint when one was given.
    fn retry_spacing(&self, retry: u32, error: &FetchError) -> Duration {
        let backoff = self
            .delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));

        match error {
            FetchError::RateLimited {
                retry_after_secs: Some(secs),
            } => backoff.max(Duration::from_secs(*secs).min(self.max_retry_after)),
            _ => backoff,
        }
    }

    fn wait_for_slot(&self, spacing: Duration) {
        let Some(last) = self.last_request else {
            return;
        };

        let elapsed = self.clock.monotonic().saturating_duration_since(last);
        if elapsed < spacing {
            let wait = spacing - elapsed;
            debug!(wait_ms = wait.as_millis() as u64, "throttling");
            self.clock.sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::cell::RefCell;
    use std::collections::VecDeque;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap()))
    }

    fn config() -> FetchConfig {
        FetchConfig {
            delay_ms: 1500,
            max_retries: 2,
            max_retry_after_secs: 60,
            ..FetchConfig::default()
        }
    }

    /// Replays scripted responses in order
    fn scripted(
        responses: Vec<Result<RawResponse, FetchError>>,
    ) -> impl Fn(Source, &str) -> Result<RawResponse, FetchError> {
        let queue = RefCell::new(VecDeque::from(responses));
        move |_source: Source, _key: &str| {
            queue
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Permanent("script exhausted".to_string())))
        }
    }

    fn always(
        result: Result<RawResponse, FetchError>,
    ) -> impl Fn(Source, &str) -> Result<RawResponse, FetchError> {
        move |_source: Source, _key: &str| result.clone()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_success_builds_sample() {
        let clock = clock();
        let mut fetcher = RateLimitedFetcher::new(
            scripted(vec![Ok(RawResponse {
                listing_status: Some(ListingStatus::ForSale),
                asking_price: Some(629_000.0),
                ..RawResponse::new(612_000.0)
            })]),
            clock.clone(),
            &config(),
            CaptureResolution::Day,
        );

        let Fetched { sample, fetched_at } = fetcher.fetch("U01", Source::Zillow, "https://z/1").unwrap();
        assert_eq!(fetched_at, Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap());
        assert_eq!(sample.unit_id, "U01");
        assert_eq!(sample.estimated_price, 612_000.0);
        assert_eq!(sample.listing_status, Some(ListingStatus::ForSale));
        assert_eq!(sample.captured_at, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(sample.anomaly_flag, AnomalyFlag::None);

        // First request ever: no wait
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_delay_between_successive_calls() {
        let clock = clock();
        let mut fetcher = RateLimitedFetcher::new(
            always(Ok(RawResponse::new(500_000.0))),
            clock.clone(),
            &config(),
            CaptureResolution::Exact,
        );

        fetcher.fetch("U01", Source::Zillow, "a").unwrap();
        fetcher.fetch("U01", Source::Redfin, "b").unwrap();
        clock.advance(ms(1000));
        fetcher.fetch("U02", Source::Zillow, "c").unwrap();

        assert_eq!(clock.sleeps(), vec![ms(1500), ms(500)]);
        assert_eq!(fetcher.requests(), 3);
    }

    #[test]
    fn test_transient_retries_with_backoff() {
        let clock = clock();
        let mut fetcher = RateLimitedFetcher::new(
            scripted(vec![
                Err(FetchError::Transient("timeout".to_string())),
                Err(FetchError::Transient("502".to_string())),
                Ok(RawResponse::new(500_000.0)),
            ]),
            clock.clone(),
            &config(),
            CaptureResolution::Exact,
        );

        let sample = fetcher.fetch("U01", Source::Redfin, "rf-1").unwrap().sample;
        assert_eq!(sample.estimated_price, 500_000.0);
        assert_eq!(clock.sleeps(), vec![ms(1500), ms(3000)]);

        println!("✅ Backoff test PASSED");
    }

    #[test]
    fn test_exhausted_after_retry_budget() {
        let clock = clock();
        let mut fetcher = RateLimitedFetcher::new(
            always(Err(FetchError::Transient("connection reset".to_string()))),
            clock.clone(),
            &config(),
            CaptureResolution::Exact,
        );

        let failure = fetcher.fetch("U01", Source::Zillow, "z").unwrap_err();
        assert_eq!(failure.kind, FetchFailureKind::Exhausted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(fetcher.requests(), 3);

        // Next call still respects D after the failed attempts
        let _ = fetcher.fetch("U02", Source::Zillow, "z2");
        assert_eq!(clock.sleeps()[2], ms(1500));
    }

    #[test]
    fn test_permanent_is_not_retried() {
        let clock = clock();
        let mut fetcher = RateLimitedFetcher::new(
            scripted(vec![
                Err(FetchError::Permanent("listing removed".to_string())),
                Ok(RawResponse::new(1.0)),
            ]),
            clock.clone(),
            &config(),
            CaptureResolution::Exact,
        );

        let failure = fetcher.fetch("U01", Source::Zillow, "z").unwrap_err();
        assert_eq!(failure.kind, FetchFailureKind::Permanent);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.message, "listing removed");
        assert_eq!(fetcher.requests(), 1);
    }

    #[test]
    fn test_retry_after_hint_is_honored_and_capped() {
        let clock = clock();
        let mut fetcher = RateLimitedFetcher::new(
            scripted(vec![
                Err(FetchError::RateLimited {
                    retry_after_secs: Some(10),
                }),
                Err(FetchError::RateLimited {
                    retry_after_secs: Some(3600),
                }),
                Ok(RawResponse::new(500_000.0)),
            ]),
            clock.clone(),
            &config(),
            CaptureResolution::Exact,
        );

        fetcher.fetch("U01", Source::Redfin, "rf").unwrap();
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10), Duration::from_secs(60)]);
    }

    #[test]
    fn test_rate_limited_without_hint_uses_backoff() {
        let clock = clock();
        let mut fetcher = RateLimitedFetcher::new(
            scripted(vec![
                Err(FetchError::RateLimited { retry_after_secs: None }),
                Ok(RawResponse::new(500_000.0)),
            ]),
            clock.clone(),
            &config(),
            CaptureResolution::Exact,
        );

        fetcher.fetch("U01", Source::Redfin, "rf").unwrap();
        assert_eq!(clock.sleeps(), vec![ms(1500)]);
    }

    #[test]
    fn test_non_finite_price_is_permanent_failure() {
        let clock = clock();
        let mut fetcher = RateLimitedFetcher::new(
            always(Ok(RawResponse::new(f64::NAN))),
            clock.clone(),
            &config(),
            CaptureResolution::Day,
        );

        let failure = fetcher.fetch("U01", Source::Zillow, "z").unwrap_err();
        assert_eq!(failure.kind, FetchFailureKind::Permanent);
        assert_eq!(failure.attempts, 1);
        assert!(failure.message.contains("non-finite"));
    }
}
