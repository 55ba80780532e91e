use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How the 1:N group was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationStrategy {
    BuildingBased,
    UnitBased,
    Hybrid,
}

impl AssociationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssociationStrategy::BuildingBased => "building_based",
            AssociationStrategy::UnitBased => "unit_based",
            AssociationStrategy::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "building_based" => Some(AssociationStrategy::BuildingBased),
            "unit_based" => Some(AssociationStrategy::UnitBased),
            "hybrid" => Some(AssociationStrategy::Hybrid),
            _ => None,
        }
    }
}

impl Default for AssociationStrategy {
    fn default() -> Self {
        AssociationStrategy::Hybrid
    }
}

/// Stable identity of an association group: 16 hex chars of SHA-256 over
/// `"{primary_id}:{strategy}"`.
pub fn derive_association_id(primary_id: &str, strategy: AssociationStrategy) -> String {
    let mut hasher = Sha256::new();
    hasher.update(primary_id.as_bytes());
    hasher.update(b":");
    hasher.update(strategy.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// One SECONDARY member of an association group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociatedRecord {
    pub secondary_id: String,
    pub name: String,
    pub address: Option<String>,
    pub legal_representative: Option<String>,
    pub safety_manager: Option<String>,
    pub contact_phone: Option<String>,
    pub credit_code: Option<String>,
    /// Why this member joined the group: a linkage match type, or
    /// `"building"` / `"exact_credit_code"` / `"exact_name_canonical"`
    /// for members pulled in by the strategy joins.
    pub match_type: String,
    pub similarity_score: f64,
    pub inspected_at: Option<DateTime<Utc>>,
}

/// The 1:N view for one PRIMARY unit: every SECONDARY plausibly referring
/// to it, ordered by descending similarity (ties broken by most recent
/// inspection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedAssociation {
    pub association_id: String,

    pub primary_id: String,
    pub primary_name: String,
    pub primary_address: Option<String>,
    pub primary_building_id: Option<String>,
    pub primary_legal_representative: Option<String>,
    pub primary_safety_manager: Option<String>,
    pub primary_contact_phone: Option<String>,
    pub primary_credit_code: Option<String>,

    pub associated_records: Vec<AssociatedRecord>,
    pub association_strategy: AssociationStrategy,
    /// Mean similarity over members scoring at least 0.70; 0 when no member
    /// clears the bar.
    pub association_confidence: f64,
    /// 0.6 * field completeness + 0.4 * cross-member consistency.
    pub data_quality_score: f64,

    pub generated_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn association_id_varies_by_strategy() {
        let a = derive_association_id("P1", AssociationStrategy::Hybrid);
        let b = derive_association_id("P1", AssociationStrategy::UnitBased);
        let c = derive_association_id("P1", AssociationStrategy::Hybrid);
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn strategy_round_trips() {
        for s in [
            AssociationStrategy::BuildingBased,
            AssociationStrategy::UnitBased,
            AssociationStrategy::Hybrid,
        ] {
            assert_eq!(AssociationStrategy::parse(s.as_str()), Some(s));
        }
        assert_eq!(AssociationStrategy::parse("nearest"), None);
    }
}
