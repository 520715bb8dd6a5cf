//! [`CycleScheduler`] decides when the next monitoring cycle starts.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::debug;

use crate::lifecycle::CycleError;

use super::cron::{is_cron_due, normalize_cron};

/// Cron schedule plus the start time of the last cycle.
#[derive(Debug, Clone)]
pub struct CycleScheduler {
    cron_expression: String,
    schedule: Schedule,
    last_run: Option<DateTime<Utc>>,
}

impl CycleScheduler {
    /// Parse a 5- or 6-field cron expression.
    pub fn new(cron: &str) -> Result<Self, CycleError> {
        let cron_expression = normalize_cron(cron);
        let schedule =
            Schedule::from_str(&cron_expression).map_err(|e| CycleError::InvalidSchedule {
                expression: cron.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            cron_expression,
            schedule,
            last_run: None,
        })
    }

    /// Normalized 6-field expression.
    pub fn cron_expression(&self) -> &str {
        &self.cron_expression
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    /// Whether a tick has passed since the last recorded run.
    ///
    /// A scheduler that never ran is due immediately.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let due = is_cron_due(&self.schedule, now, self.last_run);
        if !due {
            debug!(cron = %self.cron_expression, "cycle not due yet");
        }
        due
    }

    /// Record that a cycle started at `at`.
    pub fn record_run(&mut self, at: DateTime<Utc>) {
        self.last_run = Some(at);
    }

    /// First tick strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}
