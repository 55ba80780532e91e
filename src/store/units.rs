//! Readers over the two unit registries.
//!
//! PRIMARY iteration is a keyset cursor ordered by id ascending: pages are
//! fetched with `id > last`, so a page can be reissued after a transient
//! connection error without skipping or duplicating records. Identifier
//! columns are only ever read as TEXT.

use anyhow::{Context, Result};
use tokio_postgres::Row;

use crate::models::Unit;
use crate::normalize::{self, address};
use crate::store::PgPool;

const UNIT_COLUMNS: &str =
    "id, name, credit_code, address, legal_representative, safety_manager, contact_phone, \
     building_id, inspected_at";

pub fn row_to_unit(row: &Row) -> Unit {
    Unit {
        id: row.get("id"),
        name: row.get("name"),
        credit_code: row.get("credit_code"),
        address: row.get("address"),
        legal_representative: row.get("legal_representative"),
        safety_manager: row.get("safety_manager"),
        contact_phone: row.get("contact_phone"),
        building_id: row.get("building_id"),
        inspected_at: row.get("inspected_at"),
    }
}

pub async fn count_primary(pool: &PgPool) -> Result<i64> {
    let conn = pool.get().await.context("count_primary: pool get failed")?;
    let row = conn
        .query_one("SELECT COUNT(*) FROM inspection_units", &[])
        .await
        .context("Failed to count inspection_units")?;
    Ok(row.get(0))
}

/// Primaries with no linkage result yet; the input set of incremental mode.
pub async fn count_unmatched_primary(pool: &PgPool) -> Result<i64> {
    let conn = pool
        .get()
        .await
        .context("count_unmatched_primary: pool get failed")?;
    let row = conn
        .query_one(
            "SELECT COUNT(*)
             FROM inspection_units iu
             LEFT JOIN linkage_results lr ON lr.primary_id = iu.id
             WHERE lr.primary_id IS NULL",
            &[],
        )
        .await
        .context("Failed to count unmatched inspection_units")?;
    Ok(row.get(0))
}

/// One page of primaries after the cursor, id ascending.
pub async fn fetch_primary_page(
    pool: &PgPool,
    after: Option<&str>,
    limit: i64,
    unmatched_only: bool,
) -> Result<Vec<Unit>> {
    let conn = pool
        .get()
        .await
        .context("fetch_primary_page: pool get failed")?;
    let cursor = after.unwrap_or("");
    let sql = if unmatched_only {
        format!(
            "SELECT {UNIT_COLUMNS}
             FROM inspection_units iu
             LEFT JOIN linkage_results lr ON lr.primary_id = iu.id
             WHERE iu.id > $1 AND lr.primary_id IS NULL
             ORDER BY iu.id ASC
             LIMIT $2"
        )
    } else {
        format!(
            "SELECT {UNIT_COLUMNS}
             FROM inspection_units
             WHERE id > $1
             ORDER BY id ASC
             LIMIT $2"
        )
    };
    let rows = conn
        .query(sql.as_str(), &[&cursor, &limit])
        .await
        .context("Failed to fetch primary page")?;
    Ok(rows.iter().map(row_to_unit).collect())
}

/// Most-recent SECONDARY records for the attribute graph, bounded by the
/// configured budget.
pub async fn fetch_recent_secondary(pool: &PgPool, limit: i64) -> Result<Vec<Unit>> {
    let conn = pool
        .get()
        .await
        .context("fetch_recent_secondary: pool get failed")?;
    let sql = format!(
        "SELECT {UNIT_COLUMNS}
         FROM supervision_units
         ORDER BY inspected_at DESC NULLS LAST, id ASC
         LIMIT $1"
    );
    let rows = conn
        .query(sql.as_str(), &[&limit])
        .await
        .context("Failed to fetch recent supervision_units")?;
    Ok(rows.iter().map(row_to_unit).collect())
}

/// Refresh the cached normalized columns for one registry table. Run by
/// ingestion after loading raw rows; the prefilter indexes depend on them.
pub async fn refresh_normalized_columns(pool: &PgPool, table: &str) -> Result<u64> {
    assert!(
        table == "inspection_units" || table == "supervision_units",
        "unknown unit table",
    );
    let conn = pool
        .get()
        .await
        .context("refresh_normalized_columns: pool get failed")?;
    let sql = format!("SELECT {UNIT_COLUMNS} FROM {table} WHERE name_canonical = ''");
    let rows = conn.query(sql.as_str(), &[]).await.context("scan failed")?;

    let update_sql = format!(
        "UPDATE {table}
         SET name_canonical = $2, name_core = $3, name_slices = $4,
             address_keywords = $5, updated_at = now()
         WHERE id = $1"
    );
    let statement = conn
        .prepare(update_sql.as_str())
        .await
        .context("prepare normalized update failed")?;
    let mut updated = 0u64;
    for row in &rows {
        let unit = row_to_unit(row);
        let (canonical, core) = normalize::normalize_name(&unit.name);
        let slices = normalize::name_slices(&canonical);
        let keywords = address::normalize_address(unit.address.as_deref().unwrap_or("")).keywords;
        updated += conn
            .execute(&statement, &[&unit.id, &canonical, &core, &slices, &keywords])
            .await
            .context("normalized column update failed")?;
    }
    Ok(updated)
}
