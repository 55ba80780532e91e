//! Table and index declarations for the linkage store.
//!
//! Every query in this crate relies only on indexes declared here, and
//! `verify_indexes` refuses to let a task run against a store that is
//! missing one: a missing index is a persistent store error, not a
//! performance problem, because the prefilter's candidate generation is
//! correctness-bounded by its caps.

use anyhow::{Context, Result};
use log::info;

use crate::error::LinkageError;
use crate::store::PgPool;

/// Unit registries share one column shape; the normalized columns back the
/// prefilter indexes.
const UNIT_TABLE_COLUMNS: &str = "
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    credit_code TEXT,
    address TEXT,
    legal_representative TEXT,
    safety_manager TEXT,
    contact_phone TEXT,
    building_id TEXT,
    inspected_at TIMESTAMPTZ,
    name_canonical TEXT NOT NULL DEFAULT '',
    name_core TEXT NOT NULL DEFAULT '',
    name_slices TEXT[] NOT NULL DEFAULT '{}',
    address_keywords TEXT[] NOT NULL DEFAULT '{}',
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
";

fn create_table_statements() -> Vec<String> {
    vec![
        "CREATE EXTENSION IF NOT EXISTS pg_trgm".to_string(),
        // digest() backs the server-side association_id derivation.
        "CREATE EXTENSION IF NOT EXISTS pgcrypto".to_string(),
        format!("CREATE TABLE IF NOT EXISTS inspection_units ({UNIT_TABLE_COLUMNS})"),
        format!("CREATE TABLE IF NOT EXISTS supervision_units ({UNIT_TABLE_COLUMNS})"),
        "CREATE TABLE IF NOT EXISTS linkage_results (
            match_id TEXT NOT NULL,
            primary_id TEXT PRIMARY KEY,
            primary_name TEXT NOT NULL DEFAULT '',
            primary_credit_code TEXT,
            primary_address TEXT,
            primary_legal_representative TEXT,
            primary_safety_manager TEXT,
            primary_contact_phone TEXT,
            primary_building_id TEXT,
            matched_id TEXT,
            matched_name TEXT,
            matched_credit_code TEXT,
            matched_address TEXT,
            matched_legal_representative TEXT,
            matched_safety_manager TEXT,
            matched_contact_phone TEXT,
            combined_name TEXT NOT NULL DEFAULT '',
            match_type TEXT NOT NULL,
            similarity_score DOUBLE PRECISION NOT NULL DEFAULT 0,
            match_confidence TEXT NOT NULL,
            match_explanation JSONB NOT NULL DEFAULT '{}'::jsonb,
            review_status TEXT NOT NULL DEFAULT 'pending',
            review_notes TEXT,
            reviewer TEXT,
            review_timestamp TIMESTAMPTZ,
            created_time TIMESTAMPTZ NOT NULL,
            updated_time TIMESTAMPTZ NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS enhanced_associations (
            association_id TEXT PRIMARY KEY,
            primary_id TEXT NOT NULL UNIQUE,
            primary_name TEXT NOT NULL DEFAULT '',
            primary_address TEXT,
            primary_building_id TEXT,
            primary_legal_representative TEXT,
            primary_safety_manager TEXT,
            primary_contact_phone TEXT,
            primary_credit_code TEXT,
            associated_records JSONB NOT NULL DEFAULT '[]'::jsonb,
            association_strategy TEXT NOT NULL,
            association_confidence DOUBLE PRECISION NOT NULL DEFAULT 0,
            data_quality_score DOUBLE PRECISION NOT NULL DEFAULT 0,
            generated_time TIMESTAMPTZ NOT NULL
        )"
        .to_string(),
        "CREATE TABLE IF NOT EXISTS match_tasks (
            task_id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            total BIGINT NOT NULL DEFAULT 0,
            processed BIGINT NOT NULL DEFAULT 0,
            matched BIGINT NOT NULL DEFAULT 0,
            updated BIGINT NOT NULL DEFAULT 0,
            skipped BIGINT NOT NULL DEFAULT 0,
            errored BIGINT NOT NULL DEFAULT 0,
            current_batch_index BIGINT NOT NULL DEFAULT 0,
            last_processed_primary_id TEXT,
            error_message TEXT,
            started_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ
        )"
        .to_string(),
    ]
}

/// (index name, create statement). Names are what `verify_indexes` checks.
fn index_statements() -> Vec<(String, String)> {
    let mut statements = Vec::new();
    for table in ["inspection_units", "supervision_units"] {
        statements.push((
            format!("idx_{table}_credit_code"),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_credit_code ON {table} (credit_code)"),
        ));
        statements.push((
            format!("idx_{table}_name_canonical"),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_name_canonical ON {table} (name_canonical)"
            ),
        ));
        statements.push((
            format!("idx_{table}_name_slices"),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_name_slices ON {table} USING GIN (name_slices)"
            ),
        ));
        statements.push((
            format!("idx_{table}_address_keywords"),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_address_keywords ON {table} USING GIN (address_keywords)"
            ),
        ));
        statements.push((
            format!("idx_{table}_name_trgm"),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_name_trgm ON {table} USING GIN (name_canonical gin_trgm_ops)"
            ),
        ));
    }
    for (name, definition) in [
        (
            "idx_linkage_results_matched_id",
            "ON linkage_results (matched_id)",
        ),
        (
            "idx_linkage_results_match_type",
            "ON linkage_results (match_type)",
        ),
        (
            "idx_linkage_results_similarity",
            "ON linkage_results (similarity_score DESC)",
        ),
        (
            "idx_linkage_results_created",
            "ON linkage_results (created_time DESC)",
        ),
        (
            "idx_linkage_results_primary_type",
            "ON linkage_results (primary_id, match_type)",
        ),
        (
            "idx_linkage_results_matched_similarity",
            "ON linkage_results (matched_id, similarity_score DESC)",
        ),
    ] {
        statements.push((
            name.to_string(),
            format!("CREATE INDEX IF NOT EXISTS {name} {definition}"),
        ));
    }
    statements
}

/// Create tables and declared indexes. Idempotent.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for ensure_schema")?;
    for statement in create_table_statements() {
        conn.execute(statement.as_str(), &[])
            .await
            .with_context(|| format!("Failed to run DDL: {}", &statement[..60.min(statement.len())]))?;
    }
    for (_, statement) in index_statements() {
        conn.execute(statement.as_str(), &[])
            .await
            .with_context(|| format!("Failed to create index: {statement}"))?;
    }
    info!("Schema and indexes ensured");
    Ok(())
}

/// Verify every declared index is present. A missing one is fatal for any
/// task; queries here never run against undeclared indexes.
pub async fn verify_indexes(pool: &PgPool) -> Result<(), LinkageError> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for verify_indexes")?;
    let rows = conn
        .query(
            "SELECT indexname FROM pg_indexes WHERE schemaname = current_schema()",
            &[],
        )
        .await
        .context("Failed to read pg_indexes")?;
    let present: std::collections::HashSet<String> =
        rows.iter().map(|r| r.get::<_, String>(0)).collect();
    for (name, _) in index_statements() {
        if !present.contains(&name) {
            return Err(LinkageError::MissingIndex(name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_indexes_cover_result_store_contract() {
        let statements = index_statements();
        let names: Vec<&str> = statements.iter().map(|(n, _)| n.as_str()).collect();
        for required in [
            "idx_linkage_results_matched_id",
            "idx_linkage_results_match_type",
            "idx_linkage_results_similarity",
            "idx_linkage_results_created",
            "idx_linkage_results_primary_type",
            "idx_linkage_results_matched_similarity",
            "idx_supervision_units_credit_code",
            "idx_supervision_units_name_canonical",
            "idx_supervision_units_name_slices",
            "idx_supervision_units_address_keywords",
            "idx_supervision_units_name_trgm",
        ] {
            assert!(names.contains(&required), "missing {required}");
        }
    }

    #[test]
    fn ddl_mentions_every_linkage_column_once() {
        let ddl = create_table_statements().join("\n");
        for column in [
            "match_id",
            "similarity_score",
            "match_explanation",
            "review_status",
            "review_timestamp",
            "last_processed_primary_id",
            "associated_records",
        ] {
            assert!(ddl.contains(column), "missing column {column}");
        }
    }
}
