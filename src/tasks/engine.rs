//! The long-running batch matching engine.
//!
//! Modeled as an explicit state machine: a coordinator owns the page loop,
//! the counters and the flush; per-record matching fans out to a small
//! worker pool that only computes and reports back. Cancellation is a flag
//! checked between records and between pages; the in-flight page is always
//! flushed before the task transitions, so observers see whole pages or
//! nothing.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MatchingConfig;
use crate::error::LinkageError;
use crate::matching::{decide, AttributeGraph, MatchStrategySet};
use crate::models::{LinkageResult, MatchExplanation, SourceKind, Unit};
use crate::normalize::normalize_unit;
use crate::store::prefilter::Prefilter;
use crate::store::results::ResultStore;
use crate::store::{schema, units, PgPool};
use crate::tasks::progress::{ProgressReport, TaskCounters, TaskMode, TaskState, TaskStatus};
use crate::tasks::registry::{TaskHandle, TaskRegistry};

/// Caller-facing knobs for one task. Unset fields fall back to the
/// engine-wide configuration, which is snapshotted once at task start.
#[derive(Debug, Clone, Default)]
pub struct StartTaskOptions {
    pub mode: TaskMode,
    pub batch_size: Option<usize>,
    pub strategies: MatchStrategySet,
    /// Clear the result store before matching. Implied by full mode.
    pub clear_existing: bool,
    /// Resume a task that was interrupted by a process restart.
    pub resume_task_id: Option<String>,
}

enum RecordKind {
    Matched,
    Unmatched,
    Errored,
}

struct RecordOutcome {
    result: LinkageResult,
    kind: RecordKind,
    duration_secs: f64,
}

/// Bounded exponential backoff for transient store errors; the last error
/// is surfaced when all attempts fail.
async fn with_retry<T, F, Fut>(attempts: u32, base_backoff_ms: u64, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay_ms = base_backoff_ms;
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{what} failed (attempt {attempt}/{attempts}): {e:#}");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = delay_ms.saturating_mul(2);
                }
            }
        }
    }
    Err(last_err.expect("retry loop ran at least once"))
}

pub struct MatchEngine {
    pool: PgPool,
    registry: Arc<TaskRegistry>,
    config: MatchingConfig,
}

impl MatchEngine {
    pub fn new(pool: PgPool, registry: Arc<TaskRegistry>, config: MatchingConfig) -> Self {
        Self {
            pool,
            registry,
            config,
        }
    }

    /// Start (or resume) a matching task. Returns its id immediately; the
    /// work continues on a background tokio task.
    pub async fn start(&self, options: StartTaskOptions) -> Result<String, LinkageError> {
        // A missing declared index is a persistent store error: fatal
        // before any state is touched.
        schema::verify_indexes(&self.pool).await?;

        let primary_total = units::count_primary(&self.pool).await?;
        if primary_total == 0 {
            return Err(LinkageError::EmptyPrimary);
        }

        let now = Utc::now();
        let (state, resume_cursor) = match options.resume_task_id.as_deref() {
            Some(task_id) => {
                let persisted = load_task_row(&self.pool, task_id)
                    .await?
                    .ok_or_else(|| LinkageError::UnknownTask(task_id.to_string()))?;
                if persisted.status != TaskStatus::Running {
                    return Err(LinkageError::TaskNotRunning(task_id.to_string()));
                }
                let cursor = persisted.last_processed_primary_id.clone();
                (persisted, cursor)
            }
            None => {
                let total = match options.mode {
                    TaskMode::Incremental => units::count_unmatched_primary(&self.pool).await?,
                    TaskMode::Update | TaskMode::Full => primary_total,
                };
                let task_id = Uuid::new_v4().to_string();
                (
                    TaskState::new(task_id, options.mode, total as u64, now),
                    None,
                )
            }
        };

        let task_id = state.task_id.clone();
        let mode = state.mode;
        let handle = self.registry.try_begin(state).await?;

        let setup: Result<()> = async {
            if mode == TaskMode::Full || options.clear_existing {
                let store = ResultStore::new(self.pool.clone());
                store.clear_all().await?;
            }
            persist_task_row(&self.pool, &*handle.state.lock().await)
                .await
                .context("Failed to persist initial task state")
        }
        .await;
        if let Err(e) = setup {
            // Release the single-task slot before surfacing the failure.
            let mut state = handle.state.lock().await;
            state.status = TaskStatus::Error;
            state.error_message = Some(format!("{e:#}"));
            state.finished_at = Some(Utc::now());
            return Err(LinkageError::Store(e));
        }

        let pool = self.pool.clone();
        let config = self.config.clone();
        let strategies = options.strategies;
        let batch_size = options.batch_size.unwrap_or(config.batch_size).max(1);
        info!(
            "Starting {} match task {} (batch_size={}, total={})",
            mode.as_str(),
            task_id,
            batch_size,
            handle.state.lock().await.counters.total
        );
        tokio::spawn(run_task(
            pool,
            handle,
            config,
            strategies,
            mode,
            batch_size,
            resume_cursor,
        ));
        Ok(task_id)
    }

    /// Progress for a live task, falling back to the persisted row for
    /// tasks from before the last restart.
    pub async fn progress(&self, task_id: &str) -> Result<ProgressReport, LinkageError> {
        match self.registry.progress(task_id).await {
            Ok(report) => Ok(report),
            Err(LinkageError::UnknownTask(_)) => {
                let state = load_task_row(&self.pool, task_id)
                    .await?
                    .ok_or_else(|| LinkageError::UnknownTask(task_id.to_string()))?;
                let at = state.finished_at.unwrap_or_else(Utc::now);
                Ok(state.report(at))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn stop(&self, task_id: &str) -> Result<(), LinkageError> {
        self.registry.request_stop(task_id).await
    }
}

/// In-flight tasks from a previous process are unrecoverable unless
/// explicitly resumed; flag them on startup so their progress reads as
/// error rather than running forever.
pub async fn mark_stale_running_tasks(pool: &PgPool) -> Result<u64> {
    let conn = pool
        .get()
        .await
        .context("mark_stale_running_tasks: pool get failed")?;
    let updated = conn
        .execute(
            "UPDATE match_tasks
             SET status = 'error', error_message = 'process restarted mid-task',
                 finished_at = now(), updated_at = now()
             WHERE status = 'running'",
            &[],
        )
        .await
        .context("Failed to mark stale running tasks")?;
    if updated > 0 {
        warn!("Marked {} stale running tasks as error", updated);
    }
    Ok(updated)
}

async fn run_task(
    pool: PgPool,
    handle: TaskHandle,
    config: MatchingConfig,
    strategies: MatchStrategySet,
    mode: TaskMode,
    batch_size: usize,
    mut cursor: Option<String>,
) {
    let started = Instant::now();
    let prefilter = Arc::new(Prefilter::new(pool.clone(), &config));

    // The attribute graph is built eagerly over the most recent secondary
    // window; primaries join it page by page.
    let graph = Arc::new(RwLock::new(AttributeGraph::new()));
    if strategies.graph_assisted {
        match units::fetch_recent_secondary(&pool, config.graph_unit_limit as i64).await {
            Ok(secondaries) => {
                let mut g = graph.write().expect("graph lock poisoned");
                for unit in &secondaries {
                    g.add_unit(SourceKind::Secondary, &unit.id, &normalize_unit(unit));
                }
                info!(
                    "Attribute graph built: {} vertices, {} edges",
                    g.vertex_count(),
                    g.edge_count()
                );
            }
            Err(e) => {
                // The graph layer degrades to L1-L3 rather than failing
                // the task.
                warn!("Attribute graph unavailable: {e:#}");
            }
        }
    }

    let store = ResultStore::new(pool.clone());
    let unmatched_only = mode == TaskMode::Incremental;

    let outcome: Result<TaskStatus> = async {
        loop {
            if handle.is_cancelled() {
                return Ok(TaskStatus::Stopped);
            }
            if config.task_deadline_secs > 0
                && started.elapsed() > Duration::from_secs(config.task_deadline_secs)
            {
                anyhow::bail!("task deadline exceeded");
            }

            let page = with_retry(
                config.store_retry_attempts,
                config.store_retry_backoff_ms,
                "primary page fetch",
                || units::fetch_primary_page(&pool, cursor.as_deref(), batch_size as i64, unmatched_only),
            )
            .await?;
            if page.is_empty() {
                return Ok(TaskStatus::Completed);
            }
            let page_last_id = page.last().map(|u| u.id.clone());
            let page_len = page.len();

            if strategies.graph_assisted {
                let mut g = graph.write().expect("graph lock poisoned");
                for unit in &page {
                    g.add_unit(SourceKind::Primary, &unit.id, &normalize_unit(unit));
                }
            }

            // Worker pool: cancellation is honored between records by not
            // feeding further work once the flag is up; in-flight records
            // finish and are flushed with the page.
            let cancel = handle.cancel.clone();
            let outcomes: Vec<RecordOutcome> = stream::iter(
                page.into_iter()
                    .take_while(move |_| !cancel.load(Ordering::Relaxed)),
            )
            .map(|unit| {
                let prefilter = prefilter.clone();
                let graph = graph.clone();
                let config = config.clone();
                async move { process_record(unit, prefilter, graph, strategies, &config).await }
            })
            .buffer_unordered(config.workers_per_page)
            .collect()
            .await;

            // Errored records must not clobber a previously stored
            // decision; they only materialize where no result exists yet.
            let mut replace: Vec<LinkageResult> = Vec::new();
            let mut keep_if_present: Vec<LinkageResult> = Vec::new();
            for outcome in &outcomes {
                match outcome.kind {
                    RecordKind::Errored => keep_if_present.push(outcome.result.clone()),
                    _ => replace.push(outcome.result.clone()),
                }
            }
            let counts = with_retry(
                config.store_retry_attempts,
                config.store_retry_backoff_ms,
                "page flush",
                || store.flush_page(&replace, &keep_if_present),
            )
            .await?;
            debug!(
                "Page flushed: {} results ({} inserted, {} updated)",
                outcomes.len(),
                counts.inserted,
                counts.modified
            );

            let page_completed = outcomes.len() == page_len;
            {
                let mut state = handle.state.lock().await;
                for outcome in &outcomes {
                    state.counters.processed += 1;
                    match outcome.kind {
                        RecordKind::Matched => state.counters.matched += 1,
                        RecordKind::Unmatched => state.counters.skipped += 1,
                        RecordKind::Errored => state.counters.errored += 1,
                    }
                    state.record_duration(outcome.duration_secs);
                }
                state.counters.updated += counts.modified;
                state.current_batch_index += 1;
                // The read cursor only advances through whole pages, so it
                // never regresses and never skips an unprocessed record.
                if page_completed {
                    state.last_processed_primary_id = page_last_id.clone();
                }
                if let Err(e) = persist_task_row(&pool, &state).await {
                    warn!("Task state persistence failed: {e:#}");
                }
            }
            if page_completed {
                cursor = page_last_id;
            }
        }
    }
    .await;

    let final_status = match outcome {
        Ok(status) => status,
        Err(e) => {
            error!("Task failed: {e:#}");
            let mut state = handle.state.lock().await;
            state.error_message = Some(format!("{e:#}"));
            TaskStatus::Error
        }
    };

    let mut state = handle.state.lock().await;
    state.status = final_status;
    state.finished_at = Some(Utc::now());
    info!(
        "Task {} finished: {} ({} processed, {} matched, {} skipped, {} errored in {:.1}s)",
        state.task_id,
        final_status.as_str(),
        state.counters.processed,
        state.counters.matched,
        state.counters.skipped,
        state.counters.errored,
        started.elapsed().as_secs_f64()
    );
    if let Err(e) = persist_task_row(&pool, &state).await {
        warn!("Final task state persistence failed: {e:#}");
    }
}

async fn process_record(
    unit: Unit,
    prefilter: Arc<Prefilter>,
    graph: Arc<RwLock<AttributeGraph>>,
    strategies: MatchStrategySet,
    config: &MatchingConfig,
) -> RecordOutcome {
    let started = Instant::now();
    let now = Utc::now();
    let deadline = Duration::from_millis(config.per_record_deadline_ms.max(1));

    let normalized = normalize_unit(&unit);
    let attempt = tokio::time::timeout(deadline, async {
        let prefiltered = prefilter.candidates(&unit, &normalized).await;
        let graph_guard = graph.read().expect("graph lock poisoned");
        let outcome = decide(
            &unit,
            &normalized,
            &prefiltered.candidates,
            if strategies.graph_assisted {
                Some(&*graph_guard)
            } else {
                None
            },
            strategies,
            config,
            prefiltered.store_failed,
        );
        (prefiltered, outcome)
    })
    .await;

    let (result, kind) = match attempt {
        Ok((prefiltered, outcome)) => {
            let matched_unit = outcome.matched.map(|i| &prefiltered.candidates[i].unit);
            let result = match matched_unit {
                Some(matched) => LinkageResult::new(
                    &unit,
                    Some(matched),
                    outcome.match_type,
                    outcome.similarity_score,
                    outcome.explanation,
                    now,
                ),
                None => LinkageResult::unmatched(&unit, outcome.explanation, now),
            };
            if prefiltered.store_failed {
                let mut result = result;
                result.review_notes = Some("transient error".to_string());
                (result, RecordKind::Errored)
            } else if result.match_type.is_match() {
                (result, RecordKind::Matched)
            } else {
                (result, RecordKind::Unmatched)
            }
        }
        Err(_) => {
            let explanation =
                MatchExplanation::default().negative("match deadline exceeded");
            let mut result = LinkageResult::unmatched(&unit, explanation, now);
            result.review_notes = Some("transient error".to_string());
            (result, RecordKind::Errored)
        }
    };

    RecordOutcome {
        result,
        kind,
        duration_secs: started.elapsed().as_secs_f64(),
    }
}

async fn persist_task_row(pool: &PgPool, state: &TaskState) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("persist_task_row: pool get failed")?;
    conn.execute(
        "INSERT INTO match_tasks (
            task_id, mode, status, total, processed, matched, updated, skipped,
            errored, current_batch_index, last_processed_primary_id, error_message,
            started_at, updated_at, finished_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now(), $14)
         ON CONFLICT (task_id) DO UPDATE SET
            status = EXCLUDED.status,
            total = EXCLUDED.total,
            processed = EXCLUDED.processed,
            matched = EXCLUDED.matched,
            updated = EXCLUDED.updated,
            skipped = EXCLUDED.skipped,
            errored = EXCLUDED.errored,
            current_batch_index = EXCLUDED.current_batch_index,
            last_processed_primary_id = EXCLUDED.last_processed_primary_id,
            error_message = EXCLUDED.error_message,
            updated_at = now(),
            finished_at = EXCLUDED.finished_at",
        &[
            &state.task_id,
            &state.mode.as_str(),
            &state.status.as_str(),
            &(state.counters.total as i64),
            &(state.counters.processed as i64),
            &(state.counters.matched as i64),
            &(state.counters.updated as i64),
            &(state.counters.skipped as i64),
            &(state.counters.errored as i64),
            &(state.current_batch_index as i64),
            &state.last_processed_primary_id,
            &state.error_message,
            &state.started_at,
            &state.finished_at,
        ],
    )
    .await
    .context("Failed to upsert match_tasks row")?;
    Ok(())
}

async fn load_task_row(pool: &PgPool, task_id: &str) -> Result<Option<TaskState>> {
    let conn = pool
        .get()
        .await
        .context("load_task_row: pool get failed")?;
    let row = conn
        .query_opt(
            "SELECT task_id, mode, status, total, processed, matched, updated, skipped,
                    errored, current_batch_index, last_processed_primary_id, error_message,
                    started_at, finished_at
             FROM match_tasks WHERE task_id = $1",
            &[&task_id],
        )
        .await
        .context("Failed to read match_tasks row")?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mode_raw: String = row.get("mode");
    let status_raw: String = row.get("status");
    let mode = TaskMode::parse(&mode_raw)
        .ok_or_else(|| anyhow::anyhow!("unknown task mode in store: {mode_raw}"))?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| anyhow::anyhow!("unknown task status in store: {status_raw}"))?;
    let started_at: DateTime<Utc> = row.get("started_at");

    let mut state = TaskState::new(row.get("task_id"), mode, row.get::<_, i64>("total") as u64, started_at);
    state.status = status;
    state.counters = TaskCounters {
        total: row.get::<_, i64>("total") as u64,
        processed: row.get::<_, i64>("processed") as u64,
        matched: row.get::<_, i64>("matched") as u64,
        updated: row.get::<_, i64>("updated") as u64,
        skipped: row.get::<_, i64>("skipped") as u64,
        errored: row.get::<_, i64>("errored") as u64,
    };
    state.current_batch_index = row.get::<_, i64>("current_batch_index") as u64;
    state.last_processed_primary_id = row.get("last_processed_primary_id");
    state.error_message = row.get("error_message");
    state.finished_at = row.get("finished_at");
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_surfaces_last_error_after_exhaustion() {
        let mut calls = 0u32;
        let result: Result<()> = with_retry(3, 1, "test op", || {
            calls += 1;
            async move { Err(anyhow::anyhow!("boom")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let mut calls = 0u32;
        let result = with_retry(3, 1, "test op", || {
            calls += 1;
            let ok = calls >= 2;
            async move {
                if ok {
                    Ok(42)
                } else {
                    Err(anyhow::anyhow!("transient"))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 2);
    }
}
