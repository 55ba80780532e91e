//! Orchestration of the enhanced-association regeneration.
//!
//! The heavy lifting is one server-side aggregation statement
//! (`store::associations`); this layer parses the strategy, applies the
//! clear flag and translates failures into the domain error the operation
//! surface reports.

use log::info;

use crate::error::LinkageError;
use crate::models::AssociationStrategy;
use crate::store::associations::AssociationStore;
use crate::store::PgPool;

/// Regenerate the 1:N association collection. Returns the number of
/// groups written.
pub async fn run_enhanced_association(
    pool: &PgPool,
    strategy: AssociationStrategy,
    clear_existing: bool,
) -> Result<u64, LinkageError> {
    let store = AssociationStore::new(pool.clone());
    let written = store
        .regenerate(strategy, clear_existing)
        .await
        .map_err(|e| LinkageError::AggregationFailed(format!("{e:#}")))?;
    info!(
        "Enhanced association run complete: strategy={}, groups={}",
        strategy.as_str(),
        written
    );
    Ok(written)
}

/// Parse a caller-supplied strategy name, defaulting to hybrid.
pub fn parse_strategy(raw: Option<&str>) -> Result<AssociationStrategy, LinkageError> {
    match raw {
        None => Ok(AssociationStrategy::default()),
        Some(name) => AssociationStrategy::parse(name)
            .ok_or_else(|| LinkageError::InvalidStrategy(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parsing_defaults_to_hybrid() {
        assert_eq!(parse_strategy(None).unwrap(), AssociationStrategy::Hybrid);
        assert_eq!(
            parse_strategy(Some("building_based")).unwrap(),
            AssociationStrategy::BuildingBased
        );
        assert!(matches!(
            parse_strategy(Some("nearest_neighbor")),
            Err(LinkageError::InvalidStrategy(_))
        ));
    }
}
