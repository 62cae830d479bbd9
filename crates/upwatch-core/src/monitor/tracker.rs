//! Outage hysteresis.
//!
//! The tracker only decides. Persisting the decision is the caller's job; the
//! tracker changes state once the caller confirms the write with
//! [`OutageTracker::outage_opened`] or [`OutageTracker::outage_closed`]. A
//! failed write therefore leaves the streaks intact and the next qualifying
//! check asks again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::duration_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Down,
}

/// An outage row that is open in storage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpenOutage {
    pub id: i64,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Unchanged,
    /// Persist a new outage starting at the first failure of the streak.
    OpenOutage { start_time: DateTime<Utc> },
    /// Close the open outage.
    CloseOutage {
        outage: OpenOutage,
        end_time: DateTime<Utc>,
        duration_seconds: f64,
    },
}

#[derive(Debug, Clone)]
pub struct OutageTracker {
    fail_threshold: u32,
    recover_threshold: u32,
    consecutive_failures: u32,
    consecutive_successes: u32,
    first_failure_at: Option<DateTime<Utc>>,
    open: Option<OpenOutage>,
}

impl OutageTracker {
    pub fn new(fail_threshold: u32, recover_threshold: u32) -> Self {
        Self {
            fail_threshold: fail_threshold.max(1),
            recover_threshold: recover_threshold.max(1),
            consecutive_failures: 0,
            consecutive_successes: 0,
            first_failure_at: None,
            open: None,
        }
    }

    /// Feed one check outcome observed at `at`.
    pub fn record(&mut self, success: bool, at: DateTime<Utc>) -> Decision {
        if success {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            self.first_failure_at = None;

            match self.open {
                Some(outage) if self.consecutive_successes >= self.recover_threshold => {
                    Decision::CloseOutage {
                        outage,
                        end_time: at,
                        duration_seconds: duration_seconds(outage.start_time, at),
                    }
                }
                _ => Decision::Unchanged,
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            let first = *self.first_failure_at.get_or_insert(at);

            if self.open.is_none() && self.consecutive_failures >= self.fail_threshold {
                // Back-dated to the first failure so the outage covers the
                // checks absorbed before the threshold fired.
                Decision::OpenOutage { start_time: first }
            } else {
                Decision::Unchanged
            }
        }
    }

    pub fn outage_opened(&mut self, id: i64, start_time: DateTime<Utc>) {
        self.open = Some(OpenOutage { id, start_time });
    }

    pub fn outage_closed(&mut self) {
        self.open = None;
    }

    /// Take over an outage left open by a previous run.
    pub fn adopt(&mut self, outage: OpenOutage) {
        self.open = Some(outage);
    }

    pub fn health(&self) -> Health {
        if self.open.is_some() {
            Health::Down
        } else {
            Health::Healthy
        }
    }

    pub fn open_outage(&self) -> Option<OpenOutage> {
        self.open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub fn first_failure_at(&self) -> Option<DateTime<Utc>> {
        self.first_failure_at
    }
}
