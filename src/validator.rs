// ✅ Sample Validator - plausibility screening before append
// Flags are advisory: a flagged sample is still stored. Only fetch failures
// leave a gap in history.
//
// Checks in priority order (first hit wins):
//   1. out-of-range: non-positive price, or outside [low, high] × reference
//   2. high-jump:    |Δ| vs immediately prior sample above threshold, within window
//   3. stale:        fetch instant outside the provider's validity window

use crate::config::ValidationConfig;
use crate::db::{AnomalyFlag, EstimateSample, TimeSeriesStore};
use crate::error::StoreError;
use crate::statistics::median;
use crate::units::Source;
use chrono::{DateTime, Duration, Utc};

// ============================================================================
// VALIDATION CONTEXT
// ============================================================================

/// History the checks compare against
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Latest prior sample for the pair that counts toward statistics
    pub prior_accepted: Option<EstimateSample>,

    /// Latest prior sample for the pair regardless of flag
    pub immediately_prior: Option<EstimateSample>,

    /// Median latest accepted price of the other units, same source
    pub peer_median: Option<f64>,

    /// When the response actually arrived. `captured_at` may be truncated
    /// to the day; staleness is judged against this instead when present.
    pub fetched_at: Option<DateTime<Utc>>,
}

impl ValidationContext {
    pub fn load(store: &TimeSeriesStore, unit_id: &str, source: Source) -> Result<Self, StoreError> {
        let immediately_prior = store.latest_estimate(unit_id, source)?;
        let prior_accepted = store.latest_accepted_estimate(unit_id, source)?;

        // Peers are only needed when the unit has no baseline of its own
        let peer_median = if prior_accepted.is_none() {
            let peers: Vec<f64> = store
                .latest_accepted_prices(source)?
                .into_iter()
                .filter(|(peer, _)| peer != unit_id)
                .map(|(_, price)| price)
                .collect();
            median(&peers)
        } else {
            None
        };

        Ok(ValidationContext {
            prior_accepted,
            immediately_prior,
            peer_median,
            fetched_at: None,
        })
    }

    /// Price the plausibility band is centered on
    pub fn reference_price(&self) -> Option<f64> {
        self.prior_accepted
            .as_ref()
            .map(|s| s.estimated_price)
            .or(self.peer_median)
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Validator { config }
    }

    pub fn classify(&self, sample: &EstimateSample, context: &ValidationContext) -> AnomalyFlag {
        if !self.in_range(sample, context) {
            AnomalyFlag::OutOfRange
        } else if self.is_high_jump(sample, context) {
            AnomalyFlag::HighJump
        } else if is_stale(sample, context) {
            AnomalyFlag::Stale
        } else {
            AnomalyFlag::None
        }
    }

    /// Classify against stored history and return the sample with its flag set
    pub fn screen(
        &self,
        store: &TimeSeriesStore,
        mut sample: EstimateSample,
        fetched_at: DateTime<Utc>,
    ) -> Result<EstimateSample, StoreError> {
        let mut context = ValidationContext::load(store, &sample.unit_id, sample.source)?;
        context.fetched_at = Some(fetched_at);
        sample.anomaly_flag = self.classify(&sample, &context);
        Ok(sample)
    }

    fn in_range(&self, sample: &EstimateSample, context: &ValidationContext) -> bool {
        let price = sample.estimated_price;
        if !price.is_finite() || price <= 0.0 {
            return false;
        }

        match context.reference_price() {
            Some(reference) if reference > 0.0 => {
                price >= reference * self.config.band_low && price <= reference * self.config.band_high
            }
            // First sample for the whole source: nothing to compare against
            _ => true,
        }
    }

    fn is_high_jump(&self, sample: &EstimateSample, context: &ValidationContext) -> bool {
        let Some(prior) = &context.immediately_prior else {
            return false;
        };
        if prior.estimated_price <= 0.0 {
            return false;
        }

        let gap = sample.captured_at - prior.captured_at;
        match Duration::try_days(self.config.jump_window_days) {
            Some(window) if gap > window => return false,
            _ => {}
        }

        let change = (sample.estimated_price - prior.estimated_price).abs() / prior.estimated_price;
        change > self.config.jump_threshold
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

fn is_stale(sample: &EstimateSample, context: &ValidationContext) -> bool {
    let at = context.fetched_at.unwrap_or(sample.captured_at);
    sample
        .validity_window
        .map(|window| !window.contains(at))
        .unwrap_or(false)
}
