//! The narrow operation surface of the linkage core.
//!
//! Transport (HTTP, RPC) lives elsewhere; these are the operations and
//! their contracts. Everything here validates inputs up front and returns
//! domain errors without mutating any state on a contract violation.

use std::sync::Arc;

use anyhow::Context;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::aggregate;
use crate::config::MatchingConfig;
use crate::error::LinkageError;
use crate::matching::MatchStrategySet;
use crate::models::{LinkageResult, LinkageStatistics, MatchType, ReviewStatus};
use crate::store::associations::AssociationStore;
use crate::store::results::{ResultFilter, ResultStore};
use crate::store::PgPool;
use crate::tasks::{mark_stale_running_tasks, MatchEngine, ProgressReport, StartTaskOptions, TaskMode, TaskRegistry};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartMatchTaskRequest {
    pub mode: String,
    pub batch_size: Option<usize>,
    pub match_strategies: Option<Vec<String>>,
    #[serde(default)]
    pub clear_existing: bool,
    pub resume_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedTask {
    pub task_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListResultsRequest {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub match_type: Option<String>,
    pub review_status: Option<String>,
    pub name_query: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultPage {
    pub items: Vec<LinkageResult>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetResultRequest {
    pub primary_id: Option<String>,
    pub match_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetReviewStatusRequest {
    pub match_id: String,
    pub status: String,
    pub notes: Option<String>,
    pub reviewer: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartEnhancedAssociationRequest {
    pub strategy: Option<String>,
    #[serde(default)]
    pub clear_existing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssociationRunSummary {
    pub ok: bool,
    pub groups_written: u64,
}

/// The linkage core: one instance per process, owning the task registry
/// explicitly (no ambient globals).
pub struct LinkageService {
    engine: MatchEngine,
    results: ResultStore,
    associations: AssociationStore,
    pool: PgPool,
}

impl LinkageService {
    /// Build the service over a connected pool. Tasks left `running` by a
    /// previous process are flagged as errored unless resumed explicitly.
    pub async fn new(pool: PgPool, config: MatchingConfig) -> anyhow::Result<Self> {
        mark_stale_running_tasks(&pool)
            .await
            .context("Failed to reconcile stale task state")?;
        let registry = Arc::new(TaskRegistry::new());
        Ok(Self {
            engine: MatchEngine::new(pool.clone(), registry, config),
            results: ResultStore::new(pool.clone()),
            associations: AssociationStore::new(pool.clone()),
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn start_match_task(
        &self,
        request: StartMatchTaskRequest,
    ) -> Result<StartedTask, LinkageError> {
        let mode = TaskMode::parse(&request.mode)
            .ok_or_else(|| LinkageError::InvalidMode(request.mode.clone()))?;
        let strategies = match &request.match_strategies {
            Some(names) if !names.is_empty() => MatchStrategySet::from_names(names)
                .map_err(LinkageError::InvalidStrategy)?,
            _ => MatchStrategySet::default(),
        };
        let task_id = self
            .engine
            .start(StartTaskOptions {
                mode,
                batch_size: request.batch_size,
                strategies,
                clear_existing: request.clear_existing,
                resume_task_id: request.resume_task_id,
            })
            .await?;
        Ok(StartedTask { task_id })
    }

    pub async fn get_task_progress(&self, task_id: &str) -> Result<ProgressReport, LinkageError> {
        self.engine.progress(task_id).await
    }

    pub async fn stop_task(&self, task_id: &str) -> Result<(), LinkageError> {
        self.engine.stop(task_id).await
    }

    pub async fn list_results(
        &self,
        request: ListResultsRequest,
    ) -> Result<ResultPage, LinkageError> {
        // The listing contract has no error cases; unknown filter values
        // filter nothing and are logged instead.
        let match_type = request.match_type.as_deref().and_then(|raw| {
            let parsed = MatchType::parse(raw);
            if parsed.is_none() {
                warn!("Ignoring unknown match_type filter: {raw}");
            }
            parsed
        });
        let review_status = request.review_status.as_deref().and_then(|raw| {
            let parsed = ReviewStatus::parse(raw);
            if parsed.is_none() {
                warn!("Ignoring unknown review_status filter: {raw}");
            }
            parsed
        });
        let filter = ResultFilter {
            match_type,
            review_status,
            name_query: request.name_query,
        };
        let page = request.page.unwrap_or(1).max(1);
        let page_size = request.page_size.unwrap_or(20).clamp(1, 500);
        let (items, total) = self.results.list(&filter, page, page_size).await?;
        Ok(ResultPage {
            items,
            total,
            page,
            page_size,
        })
    }

    pub async fn get_result(
        &self,
        request: GetResultRequest,
    ) -> Result<LinkageResult, LinkageError> {
        if let Some(primary_id) = request.primary_id.as_deref() {
            return self
                .results
                .get(primary_id)
                .await?
                .ok_or_else(|| LinkageError::NotFound(primary_id.to_string()));
        }
        if let Some(match_id) = request.match_id.as_deref() {
            return self
                .results
                .get_by_match_id(match_id)
                .await?
                .ok_or_else(|| LinkageError::NotFound(match_id.to_string()));
        }
        Err(LinkageError::NotFound("<no id supplied>".to_string()))
    }

    /// Validated review transition with optimistic concurrency against
    /// concurrent task flushes and other reviewers.
    pub async fn set_review_status(
        &self,
        request: SetReviewStatusRequest,
    ) -> Result<LinkageResult, LinkageError> {
        let status = ReviewStatus::parse(&request.status)
            .ok_or_else(|| LinkageError::InvalidReviewStatus(request.status.clone()))?;
        let current = self
            .results
            .get_by_match_id(&request.match_id)
            .await?
            .ok_or_else(|| LinkageError::NotFound(request.match_id.clone()))?;
        self.results
            .set_review(
                &request.match_id,
                status,
                request.notes.as_deref(),
                &request.reviewer,
                current.updated_time,
                current.review_status,
            )
            .await
    }

    pub async fn start_enhanced_association(
        &self,
        request: StartEnhancedAssociationRequest,
    ) -> Result<AssociationRunSummary, LinkageError> {
        let strategy = aggregate::parse_strategy(request.strategy.as_deref())?;
        let groups_written =
            aggregate::run_enhanced_association(&self.pool, strategy, request.clear_existing)
                .await?;
        Ok(AssociationRunSummary {
            ok: true,
            groups_written,
        })
    }

    pub async fn get_statistics(&self) -> Result<LinkageStatistics, LinkageError> {
        let mut stats = self.results.statistics().await?;
        let (groups, avg_quality) = self.associations.statistics().await?;
        stats.association_groups = groups;
        stats.association_avg_quality = avg_quality;
        Ok(stats)
    }
}
