use std::path::PathBuf;

use chrono::{DateTime, Utc};
use insightwatch_core::state_file::write_json_atomic;
use insightwatch_core::{HealthRecord, HealthStatus, RunOutcome};
use tracing::{debug, warn};

/// Owns the daemon's [`HealthRecord`] and applies run outcomes to it.
///
/// Status moves `starting -> running` on the first successful run,
/// `running -> error` on a failed run and back to `running` on the next
/// success. A run that could not store some of its posts counts as failed. `stopped` is only reached through [`HealthReporter::mark_stopped`]
/// and is never left.
#[derive(Debug)]
pub struct HealthReporter {
    record: HealthRecord,
    path: Option<PathBuf>,
}

impl HealthReporter {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            record: HealthRecord::new(started_at),
            path: None,
        }
    }

    /// Persist the record to `path` after every change.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self.persist(Utc::now());
        self
    }

    /// Start the cumulative count from what the store already holds.
    pub fn seed_total(&mut self, total: u64) {
        self.record.total_insights = total;
        self.persist(Utc::now());
    }

    pub fn update(&mut self, outcome: &RunOutcome, now: DateTime<Utc>) -> HealthRecord {
        self.roll_day(now);

        let record = &mut self.record;
        record.last_run = Some(now);
        record.last_evaluated = outcome.evaluated_count;
        record.last_accepted = outcome.accepted_count;
        record.total_insights += outcome.accepted_count as u64;
        record.insights_today += outcome.accepted_count as u64;
        record.storage_errors += outcome.storage_errors as u64;

        match run_failure(outcome) {
            Some(message) => {
                record.error_count += 1;
                record.last_error = Some(message);
                if record.status != HealthStatus::Stopped {
                    record.status = HealthStatus::Error;
                }
            }
            None => {
                record.last_success = Some(now);
                if record.status != HealthStatus::Stopped {
                    record.status = HealthStatus::Running;
                }
            }
        }

        debug!(status = %record.status, errors = record.error_count, "Health updated");
        self.persist(now);
        self.current(now)
    }

    /// Snapshot with uptime computed at `now`.
    pub fn current(&self, now: DateTime<Utc>) -> HealthRecord {
        let mut record = self.record.clone().as_of(now);
        record.uptime_seconds = uptime(record.started_at, now);
        record
    }

    pub fn mark_stopped(&mut self, now: DateTime<Utc>) {
        self.record.status = HealthStatus::Stopped;
        self.record.uptime_seconds = uptime(self.record.started_at, now);
        self.persist(now);
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.record.counted_day() {
            self.record.insights_today = 0;
        }
        self.record.uptime_seconds = uptime(self.record.started_at, now);
    }

    /// Writes the record as seen at `now` so readers of the file get a rolled day.
    fn persist(&self, now: DateTime<Utc>) {
        if let Some(path) = &self.path {
            let record = self.current(now);
            if let Err(e) = write_json_atomic(path, &record) {
                warn!("Failed to write health record to {}: {}", path.display(), e);
            }
        }
    }
}

fn run_failure(outcome: &RunOutcome) -> Option<String> {
    match (&outcome.error, outcome.storage_errors) {
        (Some(message), _) => Some(message.clone()),
        (None, 0) => None,
        (None, 1) => Some("1 post could not be stored".to_string()),
        (None, n) => Some(format!("{n} posts could not be stored")),
    }
}

fn uptime(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - started_at).num_seconds().max(0) as u64
}
