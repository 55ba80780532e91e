//! Task state, counters and progress arithmetic.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a task selects and replaces records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Only primaries with no existing linkage result.
    Incremental,
    /// All primaries, overwriting per primary_id.
    Update,
    /// All primaries after clearing the result store.
    Full,
}

impl Default for TaskMode {
    fn default() -> Self {
        TaskMode::Incremental
    }
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Incremental => "incremental",
            TaskMode::Update => "update",
            TaskMode::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incremental" => Some(TaskMode::Incremental),
            "update" => Some(TaskMode::Update),
            "full" => Some(TaskMode::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "error" => Some(TaskStatus::Error),
            "stopped" => Some(TaskStatus::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Invariant: processed == matched + skipped + errored, and
/// processed <= total at all times.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskCounters {
    pub total: u64,
    pub processed: u64,
    pub matched: u64,
    /// Existing results overwritten by this task (update/full modes).
    pub updated: u64,
    /// Records processed without finding a match.
    pub skipped: u64,
    pub errored: u64,
}

impl TaskCounters {
    pub fn is_consistent(&self) -> bool {
        self.processed == self.matched + self.skipped + self.errored
            && self.processed <= self.total
    }
}

/// Window of the moving average used for the remaining-time estimate.
const ETA_WINDOW: usize = 1000;

/// Mutable state of one task, owned by the coordinator and observed
/// through the registry.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub task_id: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub counters: TaskCounters,
    pub current_batch_index: u64,
    pub last_processed_primary_id: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    recent_record_secs: VecDeque<f64>,
}

impl TaskState {
    pub fn new(task_id: String, mode: TaskMode, total: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            mode,
            status: TaskStatus::Running,
            counters: TaskCounters {
                total,
                ..TaskCounters::default()
            },
            current_batch_index: 0,
            last_processed_primary_id: None,
            error_message: None,
            started_at,
            finished_at: None,
            recent_record_secs: VecDeque::with_capacity(ETA_WINDOW),
        }
    }

    pub fn record_duration(&mut self, seconds: f64) {
        if self.recent_record_secs.len() == ETA_WINDOW {
            self.recent_record_secs.pop_front();
        }
        self.recent_record_secs.push_back(seconds);
    }

    /// Simple moving average over the last window of records.
    pub fn avg_record_secs(&self) -> Option<f64> {
        if self.recent_record_secs.is_empty() {
            return None;
        }
        Some(self.recent_record_secs.iter().sum::<f64>() / self.recent_record_secs.len() as f64)
    }

    pub fn progress_percent(&self) -> f64 {
        if self.counters.total == 0 {
            return 100.0;
        }
        (self.counters.processed as f64 / self.counters.total as f64 * 100.0).min(100.0)
    }

    pub fn match_rate(&self) -> f64 {
        if self.counters.processed == 0 {
            return 0.0;
        }
        self.counters.matched as f64 / self.counters.processed as f64
    }

    pub fn report(&self, now: DateTime<Utc>) -> ProgressReport {
        let elapsed = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let remaining_records = self.counters.total.saturating_sub(self.counters.processed);
        let estimated_remaining_seconds = if self.status.is_terminal() {
            Some(0.0)
        } else {
            self.avg_record_secs()
                .map(|avg| avg * remaining_records as f64)
        };
        ProgressReport {
            task_id: self.task_id.clone(),
            mode: self.mode,
            status: self.status,
            progress_percent: self.progress_percent(),
            total: self.counters.total,
            processed: self.counters.processed,
            matched: self.counters.matched,
            updated: self.counters.updated,
            skipped: self.counters.skipped,
            errored: self.counters.errored,
            match_rate: self.match_rate(),
            elapsed_seconds: elapsed,
            estimated_remaining_seconds,
            error_message: self.error_message.clone(),
        }
    }
}

/// Snapshot handed to callers of the progress operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub task_id: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub progress_percent: f64,
    pub total: u64,
    pub processed: u64,
    pub matched: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errored: u64,
    pub match_rate: f64,
    pub elapsed_seconds: f64,
    pub estimated_remaining_seconds: Option<f64>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(total: u64) -> TaskState {
        TaskState::new("t1".into(), TaskMode::Incremental, total, Utc::now())
    }

    #[test]
    fn counter_consistency_invariant() {
        let mut c = TaskCounters {
            total: 10,
            processed: 6,
            matched: 3,
            skipped: 2,
            errored: 1,
            updated: 0,
        };
        assert!(c.is_consistent());
        c.processed = 7;
        assert!(!c.is_consistent());
        c.processed = 11;
        assert!(!c.is_consistent());
    }

    #[test]
    fn percent_and_rate() {
        let mut s = state(200);
        s.counters.processed = 50;
        s.counters.matched = 30;
        s.counters.skipped = 20;
        assert_eq!(s.progress_percent(), 25.0);
        assert_eq!(s.match_rate(), 0.6);
    }

    #[test]
    fn empty_input_set_reads_as_done() {
        let s = state(0);
        assert_eq!(s.progress_percent(), 100.0);
        assert_eq!(s.match_rate(), 0.0);
    }

    #[test]
    fn eta_is_moving_average_times_remaining() {
        let mut s = state(100);
        s.counters.processed = 40;
        for _ in 0..10 {
            s.record_duration(0.5);
        }
        let report = s.report(Utc::now());
        let eta = report.estimated_remaining_seconds.unwrap();
        assert!((eta - 30.0).abs() < 1e-9, "eta was {eta}");
    }

    #[test]
    fn eta_window_is_bounded() {
        let mut s = state(10);
        for _ in 0..2500 {
            s.record_duration(1.0);
        }
        assert_eq!(s.recent_record_secs.len(), 1000);
    }

    #[test]
    fn terminal_tasks_report_zero_remaining() {
        let mut s = state(100);
        s.status = TaskStatus::Stopped;
        let report = s.report(Utc::now());
        assert_eq!(report.estimated_remaining_seconds, Some(0.0));
    }

    #[test]
    fn mode_and_status_round_trip() {
        for mode in [TaskMode::Incremental, TaskMode::Update, TaskMode::Full] {
            assert_eq!(TaskMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(TaskMode::parse("both"), None);
        for status in [
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Error,
            TaskStatus::Stopped,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }
}
