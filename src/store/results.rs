//! The linkage-result store adapter.
//!
//! One row per PRIMARY id, enforced by the primary-key upsert: re-running a
//! task replaces rather than duplicates. Review fields survive re-runs (an
//! approved or rejected decision is human work the pipeline must not
//! clobber); `full` mode resets them by clearing the table first.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::error::LinkageError;
use crate::models::{
    LinkageResult, LinkageStatistics, MatchConfidence, MatchExplanation, MatchType, ReviewStatus,
};
use crate::store::PgPool;

/// Outcome counts of one bulk upsert, in the store's native terms.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertCounts {
    /// Rows that already existed and were hit by the batch.
    pub matched: u64,
    /// Rows whose stored decision was overwritten.
    pub modified: u64,
    /// Rows newly created.
    pub inserted: u64,
}

/// Optional filters for the paginated listing.
#[derive(Debug, Default, Clone)]
pub struct ResultFilter {
    pub match_type: Option<MatchType>,
    pub review_status: Option<ReviewStatus>,
    pub name_query: Option<String>,
}

pub struct ResultStore {
    pool: PgPool,
}

/// Multi-row VALUES clause plus the boxed parameters backing it.
fn build_result_values(
    results: &[LinkageResult],
) -> Result<(String, Vec<Box<dyn ToSql + Sync + Send>>)> {
    let mut values_clause_parts = Vec::with_capacity(results.len());
    let mut params: Vec<Box<dyn ToSql + Sync + Send>> =
        Vec::with_capacity(results.len() * COLUMNS_PER_ROW);
    let mut param_idx = 1usize;

    for result in results {
        let placeholders: Vec<String> = (param_idx..param_idx + COLUMNS_PER_ROW)
            .map(|i| format!("${i}"))
            .collect();
        values_clause_parts.push(format!("({})", placeholders.join(", ")));
        param_idx += COLUMNS_PER_ROW;

        let explanation = serde_json::to_value(&result.match_explanation)
            .context("failed to serialize match explanation")?;

        params.push(Box::new(result.match_id.clone()));
        params.push(Box::new(result.primary_id.clone()));
        params.push(Box::new(result.primary_name.clone()));
        params.push(Box::new(result.primary_credit_code.clone()));
        params.push(Box::new(result.primary_address.clone()));
        params.push(Box::new(result.primary_legal_representative.clone()));
        params.push(Box::new(result.primary_safety_manager.clone()));
        params.push(Box::new(result.primary_contact_phone.clone()));
        params.push(Box::new(result.primary_building_id.clone()));
        params.push(Box::new(result.matched_id.clone()));
        params.push(Box::new(result.matched_name.clone()));
        params.push(Box::new(result.matched_credit_code.clone()));
        params.push(Box::new(result.matched_address.clone()));
        params.push(Box::new(result.matched_legal_representative.clone()));
        params.push(Box::new(result.matched_safety_manager.clone()));
        params.push(Box::new(result.matched_contact_phone.clone()));
        params.push(Box::new(result.combined_name.clone()));
        params.push(Box::new(result.match_type.as_str().to_string()));
        params.push(Box::new(result.similarity_score));
        params.push(Box::new(result.match_confidence.as_str().to_string()));
        params.push(Box::new(explanation));
        params.push(Box::new(result.review_status.as_str().to_string()));
        params.push(Box::new(result.review_notes.clone()));
        params.push(Box::new(result.reviewer.clone()));
        params.push(Box::new(result.review_timestamp));
        params.push(Box::new(result.created_time));
        params.push(Box::new(result.updated_time));
    }

    Ok((values_clause_parts.join(", "), params))
}

const RESULT_COLUMNS: &str = "match_id, primary_id, primary_name, primary_credit_code, \
    primary_address, primary_legal_representative, primary_safety_manager, \
    primary_contact_phone, primary_building_id, matched_id, matched_name, \
    matched_credit_code, matched_address, matched_legal_representative, \
    matched_safety_manager, matched_contact_phone, combined_name, match_type, \
    similarity_score, match_confidence, match_explanation, review_status, review_notes, \
    reviewer, review_timestamp, created_time, updated_time";

const COLUMNS_PER_ROW: usize = 27;

fn row_to_result(row: &Row) -> Result<LinkageResult> {
    let match_type_raw: String = row.get("match_type");
    let match_type = MatchType::parse(&match_type_raw)
        .ok_or_else(|| anyhow!("unknown match_type in store: {match_type_raw}"))?;
    let confidence_raw: String = row.get("match_confidence");
    let review_raw: String = row.get("review_status");
    let review_status = ReviewStatus::parse(&review_raw)
        .ok_or_else(|| anyhow!("unknown review_status in store: {review_raw}"))?;
    let explanation: serde_json::Value = row.get("match_explanation");
    let match_explanation: MatchExplanation = serde_json::from_value(explanation)
        .context("match_explanation column is not a valid explanation document")?;

    Ok(LinkageResult {
        match_id: row.get("match_id"),
        primary_id: row.get("primary_id"),
        primary_name: row.get("primary_name"),
        primary_credit_code: row.get("primary_credit_code"),
        primary_address: row.get("primary_address"),
        primary_legal_representative: row.get("primary_legal_representative"),
        primary_safety_manager: row.get("primary_safety_manager"),
        primary_contact_phone: row.get("primary_contact_phone"),
        primary_building_id: row.get("primary_building_id"),
        matched_id: row.get("matched_id"),
        matched_name: row.get("matched_name"),
        matched_credit_code: row.get("matched_credit_code"),
        matched_address: row.get("matched_address"),
        matched_legal_representative: row.get("matched_legal_representative"),
        matched_safety_manager: row.get("matched_safety_manager"),
        matched_contact_phone: row.get("matched_contact_phone"),
        combined_name: row.get("combined_name"),
        match_type,
        similarity_score: row.get("similarity_score"),
        match_confidence: match confidence_raw.as_str() {
            "high" => MatchConfidence::High,
            "medium" => MatchConfidence::Medium,
            "low" => MatchConfidence::Low,
            _ => MatchConfidence::None,
        },
        match_explanation,
        review_status,
        review_notes: row.get("review_notes"),
        reviewer: row.get("reviewer"),
        review_timestamp: row.get("review_timestamp"),
        created_time: row.get("created_time"),
        updated_time: row.get("updated_time"),
    })
}

impl ResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert-or-replace one result. Thin wrapper over the page flush so
    /// single and batch writes share semantics.
    pub async fn upsert(&self, result: &LinkageResult) -> Result<UpsertCounts> {
        self.flush_page(std::slice::from_ref(result), &[]).await
    }

    /// Replace-semantics flush of one page.
    pub async fn bulk_upsert(&self, results: &[LinkageResult]) -> Result<UpsertCounts> {
        self.flush_page(results, &[]).await
    }

    /// Apply one page atomically: `replace` rows are upserted (review
    /// fields of existing rows preserved), `keep_if_present` rows are
    /// inserted only where no result exists yet — errored records must not
    /// clobber a previously stored decision. At most one row per
    /// primary_id across both sets.
    pub async fn flush_page(
        &self,
        replace: &[LinkageResult],
        keep_if_present: &[LinkageResult],
    ) -> Result<UpsertCounts> {
        if replace.is_empty() && keep_if_present.is_empty() {
            return Ok(UpsertCounts::default());
        }
        {
            let mut ids: Vec<&str> = replace
                .iter()
                .chain(keep_if_present)
                .map(|r| r.primary_id.as_str())
                .collect();
            let expected = ids.len();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != expected {
                return Err(anyhow!("page flush contains duplicate primary ids"));
            }
        }

        let mut conn = self
            .pool
            .get()
            .await
            .context("flush_page: failed to get DB connection")?;
        let transaction = conn
            .transaction()
            .await
            .context("flush_page: failed to start transaction")?;

        let mut counts = UpsertCounts::default();

        if !replace.is_empty() {
            let (values_clause, params) = build_result_values(replace)?;
            let upsert_sql = format!(
                "INSERT INTO linkage_results ({RESULT_COLUMNS})
                 VALUES {values_clause}
                 ON CONFLICT (primary_id) DO UPDATE SET
                    match_id = EXCLUDED.match_id,
                    primary_name = EXCLUDED.primary_name,
                    primary_credit_code = EXCLUDED.primary_credit_code,
                    primary_address = EXCLUDED.primary_address,
                    primary_legal_representative = EXCLUDED.primary_legal_representative,
                    primary_safety_manager = EXCLUDED.primary_safety_manager,
                    primary_contact_phone = EXCLUDED.primary_contact_phone,
                    primary_building_id = EXCLUDED.primary_building_id,
                    matched_id = EXCLUDED.matched_id,
                    matched_name = EXCLUDED.matched_name,
                    matched_credit_code = EXCLUDED.matched_credit_code,
                    matched_address = EXCLUDED.matched_address,
                    matched_legal_representative = EXCLUDED.matched_legal_representative,
                    matched_safety_manager = EXCLUDED.matched_safety_manager,
                    matched_contact_phone = EXCLUDED.matched_contact_phone,
                    combined_name = EXCLUDED.combined_name,
                    match_type = EXCLUDED.match_type,
                    similarity_score = EXCLUDED.similarity_score,
                    match_confidence = EXCLUDED.match_confidence,
                    match_explanation = EXCLUDED.match_explanation,
                    review_status = linkage_results.review_status,
                    review_notes = linkage_results.review_notes,
                    reviewer = linkage_results.reviewer,
                    review_timestamp = linkage_results.review_timestamp,
                    created_time = linkage_results.created_time,
                    updated_time = EXCLUDED.updated_time
                 RETURNING (xmax = 0) AS was_inserted",
            );
            let params_slice: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            debug!(
                "Flushing {} linkage results ({} parameters)",
                replace.len(),
                params_slice.len()
            );
            let rows = transaction
                .query(upsert_sql.as_str(), params_slice.as_slice())
                .await
                .context("Failed to execute bulk upsert for linkage_results")?;
            let inserted = rows
                .iter()
                .filter(|row| row.get::<_, bool>("was_inserted"))
                .count() as u64;
            let updated = rows.len() as u64 - inserted;
            if rows.len() != replace.len() {
                warn!(
                    "Bulk upsert result count mismatch: expected {}, got {}",
                    replace.len(),
                    rows.len()
                );
            }
            counts.matched += updated;
            counts.modified += updated;
            counts.inserted += inserted;
        }

        if !keep_if_present.is_empty() {
            let (values_clause, params) = build_result_values(keep_if_present)?;
            let insert_sql = format!(
                "INSERT INTO linkage_results ({RESULT_COLUMNS})
                 VALUES {values_clause}
                 ON CONFLICT (primary_id) DO NOTHING",
            );
            let params_slice: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            let inserted = transaction
                .execute(insert_sql.as_str(), params_slice.as_slice())
                .await
                .context("Failed to insert errored placeholders")?;
            counts.inserted += inserted;
            counts.matched += keep_if_present.len() as u64 - inserted;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit page flush transaction")?;
        Ok(counts)
    }

    pub async fn get(&self, primary_id: &str) -> Result<Option<LinkageResult>> {
        let conn = self.pool.get().await.context("get: pool get failed")?;
        let sql = format!("SELECT {RESULT_COLUMNS} FROM linkage_results WHERE primary_id = $1");
        let row = conn
            .query_opt(sql.as_str(), &[&primary_id])
            .await
            .context("Failed to read linkage result by primary_id")?;
        row.as_ref().map(row_to_result).transpose()
    }

    pub async fn get_by_match_id(&self, match_id: &str) -> Result<Option<LinkageResult>> {
        let conn = self
            .pool
            .get()
            .await
            .context("get_by_match_id: pool get failed")?;
        let sql = format!("SELECT {RESULT_COLUMNS} FROM linkage_results WHERE match_id = $1 LIMIT 1");
        let row = conn
            .query_opt(sql.as_str(), &[&match_id])
            .await
            .context("Failed to read linkage result by match_id")?;
        row.as_ref().map(row_to_result).transpose()
    }

    /// Validated review transition with a compare-and-set on updated_time.
    /// A concurrent writer (task flush or another reviewer) between the
    /// read and the write surfaces as `StaleReview`; the caller re-reads
    /// and retries.
    pub async fn set_review(
        &self,
        match_id: &str,
        status: ReviewStatus,
        notes: Option<&str>,
        reviewer: &str,
        expected_updated_time: DateTime<Utc>,
        current_status: ReviewStatus,
    ) -> Result<LinkageResult, LinkageError> {
        if !current_status.can_transition_to(status) {
            return Err(LinkageError::InvalidReviewTransition {
                from: current_status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        let conn = self
            .pool
            .get()
            .await
            .context("set_review: pool get failed")?;
        let sql = format!(
            "UPDATE linkage_results
             SET review_status = $1, review_notes = $2, reviewer = $3,
                 review_timestamp = now(), updated_time = now()
             WHERE match_id = $4 AND updated_time = $5
             RETURNING {RESULT_COLUMNS}"
        );
        let row = conn
            .query_opt(
                sql.as_str(),
                &[
                    &status.as_str(),
                    &notes,
                    &reviewer,
                    &match_id,
                    &expected_updated_time,
                ],
            )
            .await
            .context("Failed to update review status")?;
        match row {
            Some(row) => Ok(row_to_result(&row)?),
            None => Err(LinkageError::StaleReview(match_id.to_string())),
        }
    }

    /// Used only by full-mode tasks.
    pub async fn clear_all(&self) -> Result<u64> {
        let conn = self.pool.get().await.context("clear_all: pool get failed")?;
        let deleted = conn
            .execute("DELETE FROM linkage_results", &[])
            .await
            .context("Failed to clear linkage_results")?;
        info!("Cleared {} linkage results", deleted);
        Ok(deleted)
    }

    /// Paginated listing with optional filters; page is 1-based. Returns
    /// (items, total matching rows).
    pub async fn list(
        &self,
        filter: &ResultFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<LinkageResult>, i64)> {
        let conn = self.pool.get().await.context("list: pool get failed")?;

        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = Vec::new();
        if let Some(match_type) = filter.match_type {
            params.push(Box::new(match_type.as_str().to_string()));
            clauses.push(format!("match_type = ${}", params.len()));
        }
        if let Some(review_status) = filter.review_status {
            params.push(Box::new(review_status.as_str().to_string()));
            clauses.push(format!("review_status = ${}", params.len()));
        }
        if let Some(query) = filter.name_query.as_deref().filter(|q| !q.is_empty()) {
            params.push(Box::new(format!("%{query}%")));
            let idx = params.len();
            clauses.push(format!(
                "(primary_name ILIKE ${idx} OR matched_name ILIKE ${idx} OR combined_name ILIKE ${idx})"
            ));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let params_slice: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let count_sql = format!("SELECT COUNT(*) FROM linkage_results {where_clause}");
        let total: i64 = conn
            .query_one(count_sql.as_str(), params_slice.as_slice())
            .await
            .context("Failed to count filtered results")?
            .get(0);

        let offset = (page.max(1) - 1) * page_size;
        let list_sql = format!(
            "SELECT {RESULT_COLUMNS} FROM linkage_results {where_clause}
             ORDER BY created_time DESC, primary_id ASC
             LIMIT {} OFFSET {}",
            page_size, offset
        );
        let rows = conn
            .query(list_sql.as_str(), params_slice.as_slice())
            .await
            .context("Failed to list linkage results")?;
        let items = rows.iter().map(row_to_result).collect::<Result<Vec<_>>>()?;
        Ok((items, total))
    }

    /// Counts grouped by match type, confidence and review status.
    pub async fn statistics(&self) -> Result<LinkageStatistics> {
        let conn = self
            .pool
            .get()
            .await
            .context("statistics: pool get failed")?;

        let mut stats = LinkageStatistics::default();
        let totals = conn
            .query_one(
                "SELECT COUNT(*) AS total,
                        COUNT(*) FILTER (WHERE match_type <> 'none') AS matched
                 FROM linkage_results",
                &[],
            )
            .await
            .context("Failed to compute result totals")?;
        stats.total_results = totals.get("total");
        stats.matched_results = totals.get("matched");
        stats.match_rate =
            LinkageStatistics::compute_match_rate(stats.matched_results, stats.total_results);

        for row in conn
            .query(
                "SELECT match_type, COUNT(*) FROM linkage_results GROUP BY match_type",
                &[],
            )
            .await
            .context("Failed to group by match_type")?
        {
            stats.by_match_type.insert(row.get(0), row.get(1));
        }
        for row in conn
            .query(
                "SELECT match_confidence, COUNT(*) FROM linkage_results GROUP BY match_confidence",
                &[],
            )
            .await
            .context("Failed to group by match_confidence")?
        {
            stats.by_confidence.insert(row.get(0), row.get(1));
        }
        for row in conn
            .query(
                "SELECT review_status, COUNT(*) FROM linkage_results GROUP BY review_status",
                &[],
            )
            .await
            .context("Failed to group by review_status")?
        {
            stats.by_review_status.insert(row.get(0), row.get(1));
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::Unit;

    fn sample(primary_id: &str) -> LinkageResult {
        LinkageResult::unmatched(
            &Unit {
                id: primary_id.into(),
                name: "某单位".into(),
                ..Unit::default()
            },
            MatchExplanation::default(),
            Utc::now(),
        )
    }

    #[test]
    fn values_builder_emits_one_placeholder_per_column() {
        let results = vec![sample("P1"), sample("P2")];
        let (clause, params) = build_result_values(&results).unwrap();
        assert_eq!(params.len(), 2 * COLUMNS_PER_ROW);
        assert_eq!(clause.matches('(').count(), 2);
        assert!(clause.contains("$1"));
        assert!(clause.contains(&format!("${}", 2 * COLUMNS_PER_ROW)));
    }

    #[test]
    fn result_columns_match_placeholder_count() {
        assert_eq!(RESULT_COLUMNS.split(',').count(), COLUMNS_PER_ROW);
    }
}
