//! Candidate generation for one PRIMARY record.
//!
//! Five indexed lookups over the SECONDARY registry, ordered from highest
//! precision to broadest recall, short-circuiting once the candidate cap is
//! reached. The output is de-duplicated by secondary id preserving stage
//! order, so deterministic signals rank first. The prefilter is a pure
//! reader and never raises: a store failure degrades to an empty candidate
//! list flagged for retry on the next run.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::warn;
use lru::LruCache;

use crate::config::MatchingConfig;
use crate::matching::Candidate;
use crate::models::{NormalizedUnit, Unit};
use crate::normalize::normalize_unit;
use crate::store::units::row_to_unit;
use crate::store::PgPool;

const UNIT_COLUMNS: &str =
    "id, name, credit_code, address, legal_representative, safety_manager, contact_phone, \
     building_id, inspected_at";

/// Candidates plus the degraded-store marker the matcher turns into
/// negative evidence.
#[derive(Debug, Default)]
pub struct PrefilterOutput {
    pub candidates: Vec<Candidate>,
    pub store_failed: bool,
}

pub struct Prefilter {
    pool: PgPool,
    candidate_cap: usize,
    text_search_limit: i64,
    address_keyword_limit: i64,
    /// Normalization cache keyed by secondary id; candidates recur across
    /// nearby primaries within a task.
    cache: Mutex<LruCache<String, NormalizedUnit>>,
}

impl Prefilter {
    pub fn new(pool: PgPool, config: &MatchingConfig) -> Self {
        Self {
            pool,
            candidate_cap: config.candidate_cap,
            text_search_limit: config.text_search_limit as i64,
            address_keyword_limit: config.address_keyword_limit as i64,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(8192).expect("cache size is non-zero"),
            )),
        }
    }

    fn to_candidate(&self, unit: Unit) -> Candidate {
        let normalized = {
            let mut cache = self.cache.lock().expect("prefilter cache poisoned");
            cache.get(&unit.id).cloned()
        };
        let normalized = normalized.unwrap_or_else(|| {
            let derived = normalize_unit(&unit);
            let mut cache = self.cache.lock().expect("prefilter cache poisoned");
            cache.put(unit.id.clone(), derived.clone());
            derived
        });
        Candidate { unit, normalized }
    }

    /// Generate at most K candidates for one primary record.
    pub async fn candidates(&self, primary: &Unit, normalized: &NormalizedUnit) -> PrefilterOutput {
        match self.run_stages(primary, normalized).await {
            Ok(candidates) => PrefilterOutput {
                candidates,
                store_failed: false,
            },
            Err(e) => {
                warn!("Prefilter degraded for primary {}: {:#}", primary.id, e);
                PrefilterOutput {
                    candidates: Vec::new(),
                    store_failed: true,
                }
            }
        }
    }

    async fn run_stages(
        &self,
        primary: &Unit,
        normalized: &NormalizedUnit,
    ) -> Result<Vec<Candidate>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Prefilter: failed to get DB connection")?;

        let mut ordered: Vec<Unit> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut push_rows = |rows: Vec<tokio_postgres::Row>, ordered: &mut Vec<Unit>| {
            for row in rows {
                let unit = row_to_unit(&row);
                if seen.insert(unit.id.clone()) {
                    ordered.push(unit);
                }
            }
        };

        // 1. Exact credit-code lookup.
        if let Some(code) = primary.canonical_credit_code() {
            let sql =
                format!("SELECT {UNIT_COLUMNS} FROM supervision_units WHERE credit_code = $1");
            let rows = conn
                .query(sql.as_str(), &[&code])
                .await
                .context("Prefilter: credit_code lookup failed")?;
            push_rows(rows, &mut ordered);
        }

        // 2. Exact canonical-name lookup.
        if ordered.len() < self.candidate_cap && !normalized.name_canonical.is_empty() {
            let sql = format!(
                "SELECT {UNIT_COLUMNS} FROM supervision_units WHERE name_canonical = $1"
            );
            let rows = conn
                .query(sql.as_str(), &[&normalized.name_canonical])
                .await
                .context("Prefilter: name_canonical lookup failed")?;
            push_rows(rows, &mut ordered);
        }

        // 3. Name-slice blocking.
        if ordered.len() < self.candidate_cap && !normalized.name_slices.is_empty() {
            let sql = format!(
                "SELECT {UNIT_COLUMNS} FROM supervision_units
                 WHERE name_slices && $1::text[]
                 ORDER BY id ASC
                 LIMIT $2"
            );
            let limit = self.candidate_cap as i64;
            let rows = conn
                .query(sql.as_str(), &[&normalized.name_slices, &limit])
                .await
                .context("Prefilter: name_slices lookup failed")?;
            push_rows(rows, &mut ordered);
        }

        // 4. Trigram text search on the canonical name.
        if ordered.len() < self.candidate_cap
            && self.text_search_limit > 0
            && !normalized.name_canonical.is_empty()
        {
            let sql = format!(
                "SELECT {UNIT_COLUMNS} FROM supervision_units
                 WHERE name_canonical % $1
                 ORDER BY similarity(name_canonical, $1) DESC, id ASC
                 LIMIT $2"
            );
            let rows = conn
                .query(sql.as_str(), &[&normalized.name_canonical, &self.text_search_limit])
                .await
                .context("Prefilter: trigram search failed")?;
            push_rows(rows, &mut ordered);
        }

        // 5. Address-keyword blocking, only when name signals were thin.
        if ordered.len() < self.candidate_cap / 2 && !normalized.address_keywords.is_empty() {
            let sql = format!(
                "SELECT {UNIT_COLUMNS} FROM supervision_units
                 WHERE address_keywords && $1::text[]
                 ORDER BY id ASC
                 LIMIT $2"
            );
            let rows = conn
                .query(
                    sql.as_str(),
                    &[&normalized.address_keywords, &self.address_keyword_limit],
                )
                .await
                .context("Prefilter: address_keywords lookup failed")?;
            push_rows(rows, &mut ordered);
        }

        ordered.truncate(self.candidate_cap);
        Ok(ordered.into_iter().map(|u| self.to_candidate(u)).collect())
    }
}
