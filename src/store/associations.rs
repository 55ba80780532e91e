//! The enhanced-association store and its server-side aggregation.
//!
//! The 1:N view is regenerated wholesale by one SQL statement that groups,
//! projects and writes inside the database. Member rows never reach the
//! application: shipping them out and looping client-side is what used to
//! exhaust memory on production volumes, so the statement shape is a
//! correctness requirement here, not an optimization.

use anyhow::{anyhow, Context, Result};
use log::info;
use tokio_postgres::Row;

use crate::models::association::{derive_association_id, AssociationStrategy, EnhancedAssociation};
use crate::store::PgPool;

const ASSOCIATION_COLUMNS: &str = "association_id, primary_id, primary_name, primary_address, \
    primary_building_id, primary_legal_representative, primary_safety_manager, \
    primary_contact_phone, primary_credit_code, associated_records, association_strategy, \
    association_confidence, data_quality_score, generated_time";

/// Member-producing joins, one per strategy ingredient. `rank_group` keeps
/// building members ahead of unit members in the hybrid ordering.
fn member_branches(strategy: AssociationStrategy) -> Vec<&'static str> {
    let building = "SELECT p.id AS primary_id, s.id AS secondary_id, 'building' AS basis,
            1.0::float8 AS similarity, 0 AS rank_group
         FROM inspection_units p
         JOIN supervision_units s ON s.building_id = p.building_id
         WHERE p.building_id IS NOT NULL AND p.building_id <> ''";
    let linkage = "SELECT lr.primary_id, lr.matched_id AS secondary_id, lr.match_type AS basis,
            lr.similarity_score AS similarity, 1 AS rank_group
         FROM linkage_results lr
         WHERE lr.matched_id IS NOT NULL AND lr.match_type <> 'none'";
    let credit = "SELECT p.id, s.id, 'exact_credit_code', 1.0::float8, 1
         FROM inspection_units p
         JOIN supervision_units s ON s.credit_code = p.credit_code
         WHERE p.credit_code IS NOT NULL AND p.credit_code <> ''";
    let name = "SELECT p.id, s.id, 'exact_name_canonical', 1.0::float8, 1
         FROM inspection_units p
         JOIN supervision_units s ON s.name_canonical = p.name_canonical
         WHERE p.name_canonical <> ''";
    match strategy {
        AssociationStrategy::BuildingBased => vec![building],
        AssociationStrategy::UnitBased => vec![linkage, credit, name],
        AssociationStrategy::Hybrid => vec![building, linkage, credit, name],
    }
}

/// The whole pipeline: member discovery, per-primary de-dup (best basis
/// wins), ordered jsonb aggregation, confidence and quality scoring, and
/// the upsert into the association collection.
fn aggregation_sql(strategy: AssociationStrategy) -> String {
    let branches = member_branches(strategy).join("\n         UNION ALL\n         ");
    format!(
        "WITH members AS (
             {branches}
         ),
         deduped AS (
             SELECT DISTINCT ON (primary_id, secondary_id)
                    primary_id, secondary_id, basis, similarity, rank_group
             FROM members
             ORDER BY primary_id, secondary_id, rank_group ASC, similarity DESC
         ),
         grouped AS (
             SELECT p.id AS primary_id,
                    jsonb_agg(
                        jsonb_build_object(
                            'secondary_id', s.id,
                            'name', s.name,
                            'address', s.address,
                            'legal_representative', s.legal_representative,
                            'safety_manager', s.safety_manager,
                            'contact_phone', s.contact_phone,
                            'credit_code', s.credit_code,
                            'match_type', d.basis,
                            'similarity_score', d.similarity,
                            'inspected_at', s.inspected_at
                        )
                        ORDER BY d.rank_group ASC, d.similarity DESC,
                                 s.inspected_at DESC NULLS LAST, s.id ASC
                    ) AS records,
                    COALESCE(AVG(d.similarity) FILTER (WHERE d.similarity >= 0.70), 0.0)
                        AS confidence,
                    ((p.name <> '')::int
                       + (COALESCE(p.credit_code, '') <> '')::int
                       + (COALESCE(p.address, '') <> '')::int
                       + (COALESCE(p.legal_representative, '') <> '')::int
                       + (COALESCE(p.safety_manager, '') <> '')::int
                       + (COALESCE(p.contact_phone, '') <> '')::int
                       + 1) / 7.0 AS completeness,
                    ((CASE WHEN p.name_canonical <> ''
                           THEN COALESCE(bool_and(s.name_canonical = p.name_canonical), false)::int
                           ELSE 0 END)
                       + (CASE WHEN COALESCE(p.credit_code, '') <> ''
                           THEN COALESCE(bool_and(UPPER(s.credit_code) = UPPER(p.credit_code)), false)::int
                           ELSE 0 END)
                       + (CASE WHEN COALESCE(p.address, '') <> ''
                           THEN COALESCE(bool_and(BTRIM(s.address) = BTRIM(p.address)), false)::int
                           ELSE 0 END)
                       + (CASE WHEN COALESCE(p.legal_representative, '') <> ''
                           THEN COALESCE(bool_and(BTRIM(s.legal_representative) = BTRIM(p.legal_representative)), false)::int
                           ELSE 0 END)
                       + (CASE WHEN COALESCE(p.safety_manager, '') <> ''
                           THEN COALESCE(bool_and(BTRIM(s.safety_manager) = BTRIM(p.safety_manager)), false)::int
                           ELSE 0 END)
                       + (CASE WHEN COALESCE(p.contact_phone, '') <> ''
                           THEN COALESCE(bool_and(BTRIM(s.contact_phone) = BTRIM(p.contact_phone)), false)::int
                           ELSE 0 END))
                    AS agree_count,
                    ((p.name <> '')::int
                       + (COALESCE(p.credit_code, '') <> '')::int
                       + (COALESCE(p.address, '') <> '')::int
                       + (COALESCE(p.legal_representative, '') <> '')::int
                       + (COALESCE(p.safety_manager, '') <> '')::int
                       + (COALESCE(p.contact_phone, '') <> '')::int)
                    AS populated_count
             FROM deduped d
             JOIN inspection_units p ON p.id = d.primary_id
             JOIN supervision_units s ON s.id = d.secondary_id
             GROUP BY p.id
         )
         INSERT INTO enhanced_associations ({ASSOCIATION_COLUMNS})
         SELECT SUBSTR(ENCODE(DIGEST(g.primary_id || ':' || $1, 'sha256'), 'hex'), 1, 16),
                g.primary_id,
                p.name, p.address, p.building_id, p.legal_representative,
                p.safety_manager, p.contact_phone, p.credit_code,
                g.records,
                $1,
                ROUND(g.confidence::numeric, 4)::float8,
                ROUND((0.6 * g.completeness
                       + 0.4 * (CASE WHEN g.populated_count = 0 THEN 0.0
                                     ELSE g.agree_count::float8 / g.populated_count END))::numeric,
                      4)::float8,
                now()
         FROM grouped g
         JOIN inspection_units p ON p.id = g.primary_id
         ON CONFLICT (primary_id) DO UPDATE SET
             association_id = EXCLUDED.association_id,
             primary_name = EXCLUDED.primary_name,
             primary_address = EXCLUDED.primary_address,
             primary_building_id = EXCLUDED.primary_building_id,
             primary_legal_representative = EXCLUDED.primary_legal_representative,
             primary_safety_manager = EXCLUDED.primary_safety_manager,
             primary_contact_phone = EXCLUDED.primary_contact_phone,
             primary_credit_code = EXCLUDED.primary_credit_code,
             associated_records = EXCLUDED.associated_records,
             association_strategy = EXCLUDED.association_strategy,
             association_confidence = EXCLUDED.association_confidence,
             data_quality_score = EXCLUDED.data_quality_score,
             generated_time = EXCLUDED.generated_time"
    )
}

fn row_to_association(row: &Row) -> Result<EnhancedAssociation> {
    let strategy_raw: String = row.get("association_strategy");
    let association_strategy = AssociationStrategy::parse(&strategy_raw)
        .ok_or_else(|| anyhow!("unknown association_strategy in store: {strategy_raw}"))?;
    let records: serde_json::Value = row.get("associated_records");
    Ok(EnhancedAssociation {
        association_id: row.get("association_id"),
        primary_id: row.get("primary_id"),
        primary_name: row.get("primary_name"),
        primary_address: row.get("primary_address"),
        primary_building_id: row.get("primary_building_id"),
        primary_legal_representative: row.get("primary_legal_representative"),
        primary_safety_manager: row.get("primary_safety_manager"),
        primary_contact_phone: row.get("primary_contact_phone"),
        primary_credit_code: row.get("primary_credit_code"),
        associated_records: serde_json::from_value(records)
            .context("associated_records column is not a valid member list")?,
        association_strategy,
        association_confidence: row.get("association_confidence"),
        data_quality_score: row.get("data_quality_score"),
        generated_time: row.get("generated_time"),
    })
}

pub struct AssociationStore {
    pool: PgPool,
}

impl AssociationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Regenerate the 1:N collection for one strategy. Returns the number
    /// of association groups written.
    pub async fn regenerate(
        &self,
        strategy: AssociationStrategy,
        clear_existing: bool,
    ) -> Result<u64> {
        let conn = self
            .pool
            .get()
            .await
            .context("regenerate: pool get failed")?;
        if clear_existing {
            let cleared = conn
                .execute("DELETE FROM enhanced_associations", &[])
                .await
                .context("Failed to clear enhanced_associations")?;
            info!("Cleared {} enhanced associations", cleared);
        }
        let sql = aggregation_sql(strategy);
        let written = conn
            .execute(sql.as_str(), &[&strategy.as_str()])
            .await
            .context("Enhanced association aggregation pipeline failed")?;
        info!(
            "Enhanced association aggregation ({}) wrote {} groups",
            strategy.as_str(),
            written
        );
        Ok(written)
    }

    pub async fn get(&self, primary_id: &str) -> Result<Option<EnhancedAssociation>> {
        let conn = self.pool.get().await.context("get: pool get failed")?;
        let sql = format!(
            "SELECT {ASSOCIATION_COLUMNS} FROM enhanced_associations WHERE primary_id = $1"
        );
        let row = conn
            .query_opt(sql.as_str(), &[&primary_id])
            .await
            .context("Failed to read enhanced association")?;
        row.as_ref().map(row_to_association).transpose()
    }

    /// (group count, average data quality).
    pub async fn statistics(&self) -> Result<(i64, f64)> {
        let conn = self
            .pool
            .get()
            .await
            .context("statistics: pool get failed")?;
        let row = conn
            .query_one(
                "SELECT COUNT(*), COALESCE(AVG(data_quality_score), 0.0)
                 FROM enhanced_associations",
                &[],
            )
            .await
            .context("Failed to compute association statistics")?;
        Ok((row.get(0), row.get(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_pipeline_includes_all_member_sources() {
        let sql = aggregation_sql(AssociationStrategy::Hybrid);
        assert!(sql.contains("'building'"));
        assert!(sql.contains("linkage_results"));
        assert!(sql.contains("'exact_credit_code'"));
        assert!(sql.contains("'exact_name_canonical'"));
        assert!(sql.contains("ON CONFLICT (primary_id)"));
    }

    #[test]
    fn building_pipeline_is_building_only() {
        let sql = aggregation_sql(AssociationStrategy::BuildingBased);
        assert!(sql.contains("'building'"));
        assert!(!sql.contains("linkage_results"));
    }

    #[test]
    fn sql_side_id_matches_rust_derivation() {
        // SUBSTR(ENCODE(DIGEST(id || ':' || strategy, 'sha256'), 'hex'), 1, 16)
        // must agree with derive_association_id; both hash the same text.
        let id = derive_association_id("P1", AssociationStrategy::Hybrid);
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update("P1:hybrid".as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(id, hex[..16]);
    }

    #[test]
    fn members_order_building_first_in_hybrid() {
        let sql = aggregation_sql(AssociationStrategy::Hybrid);
        assert!(sql.contains("ORDER BY d.rank_group ASC, d.similarity DESC"));
    }
}
