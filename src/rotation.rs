// 🔄 Rotation Scheduler
// Round-robin over the registration-ordered population with a persisted cursor.
//
// Each run takes the next K units starting at the cursor (wrapping), and the
// cursor moves by K only after the run's appends have all succeeded. A crashed
// run therefore restarts from the same position.

use crate::config::RotationConfig;
use crate::error::StoreError;
use crate::units::UnitRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Persisted scheduler state. `position` indexes the registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationCursor {
    pub position: usize,
    pub catalog_fingerprint: String,
    pub advanced_at: Option<DateTime<Utc>>,
}

/// Where the cursor lives
pub trait CursorStore {
    fn load_cursor(&self) -> Result<Option<RotationCursor>, StoreError>;
    fn save_cursor(&self, cursor: &RotationCursor) -> Result<(), StoreError>;
}

/// Units chosen for one run, plus what committing the run will do to the cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSelection {
    pub unit_ids: Vec<String>,
    pub start: usize,
    pub advance_by: usize,
    pub selected_at: DateTime<Utc>,
}

pub struct RotationScheduler {
    unit_ids: Vec<String>,
    units_per_run: usize,
    target_cycle_runs: usize,
    fingerprint: String,
}

impl RotationScheduler {
    pub fn new(registry: &UnitRegistry, config: &RotationConfig) -> Self {
        let scheduler = RotationScheduler {
            unit_ids: registry.unit_ids(),
            units_per_run: config.effective_units_per_run(registry.len()),
            target_cycle_runs: config.target_cycle_runs,
            fingerprint: registry.fingerprint(),
        };

        if scheduler.cycle_runs() > scheduler.target_cycle_runs {
            warn!(
                population = scheduler.population(),
                units_per_run = scheduler.units_per_run,
                cycle_runs = scheduler.cycle_runs(),
                target_cycle_runs = scheduler.target_cycle_runs,
                "rotation cannot cover the population within the target cycle"
            );
        }

        scheduler
    }

    pub fn population(&self) -> usize {
        self.unit_ids.len()
    }

    pub fn units_per_run(&self) -> usize {
        self.units_per_run
    }

    /// Runs needed to visit every unit once: ⌈N/K⌉
    pub fn cycle_runs(&self) -> usize {
        self.population().div_ceil(self.units_per_run.max(1))
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Cursor position to start the next run from.
    /// No stored cursor means a fresh deployment; a cursor written against a
    /// different catalog is kept but clamped into range.
    pub fn current_position<S: CursorStore + ?Sized>(&self, cursors: &S) -> Result<usize, StoreError> {
        let population = self.population();
        if population == 0 {
            return Ok(0);
        }

        let Some(cursor) = cursors.load_cursor()? else {
            return Ok(0);
        };

        if cursor.catalog_fingerprint != self.fingerprint {
            warn!(
                stored_position = cursor.position,
                population,
                "unit catalog changed since the cursor was written; clamping cursor"
            );
        }

        Ok(cursor.position % population)
    }

    /// Pick this run's units from the persisted cursor
    pub fn select_for_run<S: CursorStore + ?Sized>(
        &self,
        cursors: &S,
        now: DateTime<Utc>,
    ) -> Result<RunSelection, StoreError> {
        let start = self.current_position(cursors)?;
        Ok(self.select_from(start, now))
    }

    /// Pick K units starting at `start`, wrapping. When the whole population
    /// fits in one run, all units are selected and the cursor stays put.
    pub fn select_from(&self, start: usize, now: DateTime<Utc>) -> RunSelection {
        let population = self.population();
        if population == 0 {
            return RunSelection {
                unit_ids: Vec::new(),
                start: 0,
                advance_by: 0,
                selected_at: now,
            };
        }

        let start = start % population;
        let (count, advance_by) = if population <= self.units_per_run {
            (population, 0)
        } else {
            (self.units_per_run, self.units_per_run)
        };

        let unit_ids = (0..count)
            .map(|offset| self.unit_ids[(start + offset) % population].clone())
            .collect();

        debug!(start, count, population, "rotation selection");

        RunSelection {
            unit_ids,
            start,
            advance_by,
            selected_at: now,
        }
    }

    /// Cursor after moving `count` units past `from`
    pub fn advance(&self, from: usize, count: usize, now: DateTime<Utc>) -> RotationCursor {
        let population = self.population().max(1);
        RotationCursor {
            position: (from + count) % population,
            catalog_fingerprint: self.fingerprint.clone(),
            advanced_at: Some(now),
        }
    }

    /// Cursor that committing `selection` produces
    pub fn next_cursor(&self, selection: &RunSelection, now: DateTime<Utc>) -> RotationCursor {
        self.advance(selection.start, selection.advance_by, now)
    }

    /// Persist the advance for a completed run
    pub fn commit<S: CursorStore + ?Sized>(
        &self,
        cursors: &S,
        selection: &RunSelection,
        now: DateTime<Utc>,
    ) -> Result<RotationCursor, StoreError> {
        let cursor = self.next_cursor(selection, now);
        cursors.save_cursor(&cursor)?;
        Ok(cursor)
    }
}
