//! Progress monitor for in-flight checks.
//!
//! Every status change is timestamped. A check whose last update is older
//! than the stall timeout and whose status is not terminal is "stalled".
//! The watchdog task polls [`ProgressMonitor::check_stalled`] on an interval
//! and logs anything that has stopped moving.
//!
//! # Graceful Shutdown
//!
//! The watchdog exits when its cancellation token is triggered.

use chrono::{DateTime, Utc};
use common::types::CheckStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default age after which a non-terminal check is considered stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default watchdog polling interval.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Status of one check as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    SettingUp,
    Running,
    TearingDown,
    Pass,
    Fail,
    Error,
    Skipped,
}

impl ProgressStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProgressStatus::Pass | ProgressStatus::Fail | ProgressStatus::Error | ProgressStatus::Skipped
        )
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProgressStatus::SettingUp | ProgressStatus::Running | ProgressStatus::TearingDown
        )
    }
}

impl From<CheckStatus> for ProgressStatus {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Pass => ProgressStatus::Pass,
            CheckStatus::Fail => ProgressStatus::Fail,
            CheckStatus::Error => ProgressStatus::Error,
            CheckStatus::Skipped => ProgressStatus::Skipped,
        }
    }
}

/// Timestamped history of one check.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressRecord {
    pub status: ProgressStatus,
    pub history: Vec<(ProgressStatus, DateTime<Utc>)>,
    pub last_update: DateTime<Utc>,
    #[serde(skip)]
    last_seen: Instant,
}

/// Aggregate counts over all known checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub running: usize,
    pub pending: usize,
    pub completion_percentage: f64,
    pub by_status: BTreeMap<ProgressStatus, usize>,
}

/// Shared, internally synchronized progress table.
#[derive(Debug, Default)]
pub struct ProgressMonitor {
    records: Mutex<BTreeMap<String, ProgressRecord>>,
}

impl ProgressMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ProgressRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a status change for `name`.
    pub fn update_progress(&self, name: &str, status: ProgressStatus) {
        apply(&mut self.lock(), name, status);
    }

    /// Record a status change for `name` unless it already finished.
    /// Returns whether the change was recorded.
    pub fn update_unless_finished(&self, name: &str, status: ProgressStatus) -> bool {
        let mut records = self.lock();
        if records.get(name).is_some_and(|r| r.status.is_terminal()) {
            return false;
        }
        apply(&mut records, name, status);
        true
    }

    /// Names of non-terminal checks not updated for at least `timeout`, sorted.
    #[must_use]
    pub fn check_stalled(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter(|(_, r)| !r.status.is_terminal())
            .filter(|(_, r)| now.saturating_duration_since(r.last_seen) >= timeout)
            .map(|(name, _)| name.clone())
            .collect()
    }

    #[must_use]
    pub fn get_summary(&self) -> ProgressSummary {
        let records = self.lock();
        let mut summary = ProgressSummary {
            total: records.len(),
            ..ProgressSummary::default()
        };
        for record in records.values() {
            *summary.by_status.entry(record.status).or_default() += 1;
            if record.status.is_terminal() {
                summary.completed += 1;
            } else if record.status.is_active() {
                summary.running += 1;
            } else {
                summary.pending += 1;
            }
        }
        if summary.total > 0 {
            // Check counts are far below f64 precision limits
            #[allow(clippy::cast_precision_loss)]
            let pct = summary.completed as f64 * 100.0 / summary.total as f64;
            summary.completion_percentage = pct;
        }
        summary
    }

    /// Current record for one check.
    #[must_use]
    pub fn record(&self, name: &str) -> Option<ProgressRecord> {
        self.lock().get(name).cloned()
    }
}

/// Progress reporting bound to one name.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    monitor: Arc<ProgressMonitor>,
    name: String,
}

impl ProgressHandle {
    #[must_use]
    pub fn new(monitor: Arc<ProgressMonitor>, name: impl Into<String>) -> Self {
        Self {
            monitor,
            name: name.into(),
        }
    }

    /// Environment lifecycle updates never overwrite a recorded outcome.
    pub fn update(&self, status: ProgressStatus) {
        if !self.monitor.update_unless_finished(&self.name, status) {
            debug!(
                target: "validator.progress",
                check = %self.name,
                status = ?status,
                "Ignoring update for finished check"
            );
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn apply(records: &mut BTreeMap<String, ProgressRecord>, name: &str, status: ProgressStatus) {
    let now = Utc::now();
    let seen = Instant::now();
    let record = records
        .entry(name.to_string())
        .or_insert_with(|| ProgressRecord {
            status,
            history: Vec::new(),
            last_update: now,
            last_seen: seen,
        });
    record.status = status;
    record.history.push((status, now));
    record.last_update = now;
    record.last_seen = seen;
}

/// Run the stall watchdog loop until `cancel_token` fires.
pub async fn run_stall_watchdog(
    monitor: Arc<ProgressMonitor>,
    stall_timeout: Duration,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "validator.progress",
        stall_timeout_secs = stall_timeout.as_secs(),
        "Stall watchdog starting"
    );
    let mut ticker = tokio::time::interval(interval);
    let mut reported: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stalled = monitor.check_stalled(stall_timeout);
                crate::observability::metrics::set_stalled_checks(stalled.len());
                if !stalled.is_empty() && stalled != reported {
                    warn!(
                        target: "validator.progress",
                        stalled_count = stalled.len(),
                        checks = %stalled.join(", "),
                        "Checks have stopped making progress"
                    );
                }
                reported = stalled;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "validator.progress",
                    "Stall watchdog received shutdown signal, exiting"
                );
                break;
            }
        }
    }
}
