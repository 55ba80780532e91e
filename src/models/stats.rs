use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Store-wide counts, grouped the way reviewers slice them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkageStatistics {
    pub total_results: i64,
    pub matched_results: i64,
    /// matched / total, 0 when the store is empty.
    pub match_rate: f64,
    pub by_match_type: BTreeMap<String, i64>,
    pub by_confidence: BTreeMap<String, i64>,
    pub by_review_status: BTreeMap<String, i64>,
    pub association_groups: i64,
    pub association_avg_quality: f64,
}

impl LinkageStatistics {
    pub fn compute_match_rate(matched: i64, total: i64) -> f64 {
        if total <= 0 {
            0.0
        } else {
            matched as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_rate_handles_empty_store() {
        assert_eq!(LinkageStatistics::compute_match_rate(0, 0), 0.0);
        assert_eq!(LinkageStatistics::compute_match_rate(3, 4), 0.75);
    }
}
