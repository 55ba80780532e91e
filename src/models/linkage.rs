use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::core::Unit;

/// How a linkage result was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    ExactCreditCode,
    ExactNameCanonical,
    FuzzyPrefiltered,
    /// Fuzzy decision made without the indexed prefilter. Historical
    /// results carry this value; the current cascade does not produce it.
    FuzzyGlobal,
    GraphAssisted,
    None,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::ExactCreditCode => "exact_credit_code",
            MatchType::ExactNameCanonical => "exact_name_canonical",
            MatchType::FuzzyPrefiltered => "fuzzy_prefiltered",
            MatchType::FuzzyGlobal => "fuzzy_global",
            MatchType::GraphAssisted => "graph_assisted",
            MatchType::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact_credit_code" => Some(MatchType::ExactCreditCode),
            "exact_name_canonical" => Some(MatchType::ExactNameCanonical),
            "fuzzy_prefiltered" => Some(MatchType::FuzzyPrefiltered),
            "fuzzy_global" => Some(MatchType::FuzzyGlobal),
            "graph_assisted" => Some(MatchType::GraphAssisted),
            "none" => Some(MatchType::None),
            _ => None,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(self, MatchType::ExactCreditCode | MatchType::ExactNameCanonical)
    }

    pub fn is_match(&self) -> bool {
        !matches!(self, MatchType::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    High,
    Medium,
    Low,
    None,
}

impl MatchConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchConfidence::High => "high",
            MatchConfidence::Medium => "medium",
            MatchConfidence::Low => "low",
            MatchConfidence::None => "none",
        }
    }

    /// Derived from type + score. Both deterministic types are high by
    /// construction (their score is pinned to 1.0).
    pub fn derive(match_type: MatchType, score: f64) -> Self {
        match match_type {
            MatchType::None => MatchConfidence::None,
            t if t.is_deterministic() => MatchConfidence::High,
            _ if score >= 0.85 => MatchConfidence::High,
            _ if score >= 0.75 => MatchConfidence::Medium,
            _ => MatchConfidence::Low,
        }
    }
}

/// Review lifecycle of a linkage result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReviewStatus::Pending),
            "approved" => Some(ReviewStatus::Approved),
            "rejected" => Some(ReviewStatus::Rejected),
            _ => None,
        }
    }

    /// Pending may go to either terminal state; a terminal state may only
    /// return to pending by explicit request.
    pub fn can_transition_to(&self, to: ReviewStatus) -> bool {
        matches!(
            (self, to),
            (ReviewStatus::Pending, ReviewStatus::Approved)
                | (ReviewStatus::Pending, ReviewStatus::Rejected)
                | (ReviewStatus::Approved, ReviewStatus::Pending)
                | (ReviewStatus::Rejected, ReviewStatus::Pending)
        )
    }
}

/// Structured evidence for one match decision.
///
/// `field_scores` is a BTreeMap so that serialized explanations are
/// byte-stable across re-runs with identical inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchExplanation {
    pub positive: Vec<String>,
    pub negative: Vec<String>,
    pub field_scores: BTreeMap<String, f64>,
}

impl MatchExplanation {
    pub fn positive(mut self, reason: impl Into<String>) -> Self {
        self.positive.push(reason.into());
        self
    }

    pub fn negative(mut self, reason: impl Into<String>) -> Self {
        self.negative.push(reason.into());
        self
    }

    pub fn score(mut self, field: impl Into<String>, value: f64) -> Self {
        self.field_scores.insert(field.into(), value);
        self
    }
}

/// Stable identity of a linkage result: 16 hex chars of
/// SHA-256 over `"{primary_id}:{matched_id | NONE}"`.
pub fn derive_match_id(primary_id: &str, matched_id: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(primary_id.as_bytes());
    hasher.update(b":");
    hasher.update(matched_id.unwrap_or("NONE").as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// One linkage decision per PRIMARY record, snapshot included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkageResult {
    pub match_id: String,

    pub primary_id: String,
    pub primary_name: String,
    pub primary_credit_code: Option<String>,
    pub primary_address: Option<String>,
    pub primary_legal_representative: Option<String>,
    pub primary_safety_manager: Option<String>,
    pub primary_contact_phone: Option<String>,
    pub primary_building_id: Option<String>,

    pub matched_id: Option<String>,
    pub matched_name: Option<String>,
    pub matched_credit_code: Option<String>,
    pub matched_address: Option<String>,
    pub matched_legal_representative: Option<String>,
    pub matched_safety_manager: Option<String>,
    pub matched_contact_phone: Option<String>,

    /// Display name combining both sides when they differ.
    pub combined_name: String,

    pub match_type: MatchType,
    pub similarity_score: f64,
    pub match_confidence: MatchConfidence,
    pub match_explanation: MatchExplanation,

    pub review_status: ReviewStatus,
    pub review_notes: Option<String>,
    pub reviewer: Option<String>,
    pub review_timestamp: Option<DateTime<Utc>>,

    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl LinkageResult {
    /// Build a result from a primary snapshot and an optional matched
    /// secondary snapshot.
    pub fn new(
        primary: &Unit,
        matched: Option<&Unit>,
        match_type: MatchType,
        similarity_score: f64,
        explanation: MatchExplanation,
        now: DateTime<Utc>,
    ) -> Self {
        let matched_id = matched.map(|u| u.id.clone());
        let combined_name = match matched {
            Some(m) if !m.name.is_empty() && m.name != primary.name => {
                format!("{}（{}）", m.name, primary.name)
            }
            Some(m) if primary.name.is_empty() => m.name.clone(),
            _ => primary.name.clone(),
        };
        Self {
            match_id: derive_match_id(&primary.id, matched_id.as_deref()),
            primary_id: primary.id.clone(),
            primary_name: primary.name.clone(),
            primary_credit_code: primary.credit_code.clone(),
            primary_address: primary.address.clone(),
            primary_legal_representative: primary.legal_representative.clone(),
            primary_safety_manager: primary.safety_manager.clone(),
            primary_contact_phone: primary.contact_phone.clone(),
            primary_building_id: primary.building_id.clone(),
            matched_id,
            matched_name: matched.map(|u| u.name.clone()),
            matched_credit_code: matched.and_then(|u| u.credit_code.clone()),
            matched_address: matched.and_then(|u| u.address.clone()),
            matched_legal_representative: matched.and_then(|u| u.legal_representative.clone()),
            matched_safety_manager: matched.and_then(|u| u.safety_manager.clone()),
            matched_contact_phone: matched.and_then(|u| u.contact_phone.clone()),
            combined_name,
            match_type,
            similarity_score,
            match_confidence: MatchConfidence::derive(match_type, similarity_score),
            match_explanation: explanation,
            review_status: ReviewStatus::Pending,
            review_notes: None,
            reviewer: None,
            review_timestamp: None,
            created_time: now,
            updated_time: now,
        }
    }

    /// A no-match result still gets persisted, with an empty matched
    /// snapshot and review_status pending.
    pub fn unmatched(primary: &Unit, explanation: MatchExplanation, now: DateTime<Utc>) -> Self {
        Self::new(primary, None, MatchType::None, 0.0, explanation, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, name: &str) -> Unit {
        Unit {
            id: id.into(),
            name: name.into(),
            ..Unit::default()
        }
    }

    #[test]
    fn match_id_is_stable_and_distinguishes_none() {
        let a = derive_match_id("P1", Some("S7"));
        let b = derive_match_id("P1", Some("S7"));
        let c = derive_match_id("P1", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn confidence_derivation() {
        assert_eq!(
            MatchConfidence::derive(MatchType::ExactCreditCode, 1.0),
            MatchConfidence::High
        );
        assert_eq!(
            MatchConfidence::derive(MatchType::FuzzyPrefiltered, 0.82),
            MatchConfidence::Medium
        );
        assert_eq!(
            MatchConfidence::derive(MatchType::GraphAssisted, 0.90),
            MatchConfidence::High
        );
        assert_eq!(
            MatchConfidence::derive(MatchType::FuzzyPrefiltered, 0.71),
            MatchConfidence::Low
        );
        assert_eq!(MatchConfidence::derive(MatchType::None, 0.0), MatchConfidence::None);
    }

    #[test]
    fn review_transitions() {
        use ReviewStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Pending));
        assert!(Rejected.can_transition_to(Pending));
        assert!(!Approved.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn unmatched_result_has_empty_snapshot() {
        let now = Utc::now();
        let r = LinkageResult::unmatched(&unit("P9", "某某单位"), MatchExplanation::default(), now);
        assert_eq!(r.match_type, MatchType::None);
        assert_eq!(r.similarity_score, 0.0);
        assert!(r.matched_id.is_none());
        assert!(r.matched_name.is_none());
        assert_eq!(r.review_status, ReviewStatus::Pending);
        assert_eq!(r.combined_name, "某某单位");
    }

    #[test]
    fn combined_name_joins_differing_names() {
        let now = Utc::now();
        let r = LinkageResult::new(
            &unit("P1", "排查名称"),
            Some(&unit("S1", "监管名称")),
            MatchType::ExactCreditCode,
            1.0,
            MatchExplanation::default(),
            now,
        );
        assert_eq!(r.combined_name, "监管名称（排查名称）");

        let same = LinkageResult::new(
            &unit("P2", "同名"),
            Some(&unit("S2", "同名")),
            MatchType::ExactNameCanonical,
            1.0,
            MatchExplanation::default(),
            now,
        );
        assert_eq!(same.combined_name, "同名");
    }
}
