//! Pure similarity kernels over normalized values.
//!
//! Every kernel is total: defined on empty inputs (returning 0.0) and
//! always lands in [0.0, 1.0]. Scores are rounded to 4 decimals before
//! storage or comparison so that decisions are stable across runs and
//! floating-point environments.

use std::collections::HashSet;

use strsim::normalized_levenshtein;

use crate::models::NormalizedUnit;

/// Round half-away-from-zero to 4 decimals. All persisted scores and all
/// threshold comparisons go through this.
pub fn round4(score: f64) -> f64 {
    (score * 10_000.0).round() / 10_000.0
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn common_prefix_len(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Shared-affix ratio on the core name: (common prefix + common suffix)
/// over the longer length, capped at 1.0.
fn affix_ratio(a: &str, b: &str) -> f64 {
    let chars_a: Vec<char> = a.chars().collect();
    let chars_b: Vec<char> = b.chars().collect();
    if chars_a.is_empty() || chars_b.is_empty() {
        return 0.0;
    }
    let prefix = common_prefix_len(&chars_a, &chars_b);
    let rev_a: Vec<char> = chars_a.iter().rev().copied().collect();
    let rev_b: Vec<char> = chars_b.iter().rev().copied().collect();
    let suffix = common_prefix_len(&rev_a, &rev_b);
    let max_len = chars_a.len().max(chars_b.len());
    ((prefix + suffix) as f64 / max_len as f64).min(1.0)
}

/// Name similarity: 0.5 edit-distance on the canonical form, 0.3 token-set
/// Jaccard, 0.2 shared-affix ratio on the core form.
pub fn name_similarity(a: &NormalizedUnit, b: &NormalizedUnit) -> f64 {
    if a.name_canonical.is_empty() || b.name_canonical.is_empty() {
        return 0.0;
    }
    let edit = normalized_levenshtein(&a.name_canonical, &b.name_canonical);
    let tokens = jaccard(&a.name_tokens, &b.name_tokens);
    let affix = affix_ratio(&a.name_core, &b.name_core);
    round4(0.5 * edit + 0.3 * tokens + 0.2 * affix)
}

/// Similarity of the core names alone; the hard-gate signal for the fuzzy
/// layers.
pub fn name_core_similarity(a: &NormalizedUnit, b: &NormalizedUnit) -> f64 {
    if a.name_core.is_empty() || b.name_core.is_empty() {
        return 0.0;
    }
    round4(normalized_levenshtein(&a.name_core, &b.name_core))
}

fn overlap_ratio(a: &[String], b: &[String]) -> f64 {
    jaccard(a, b)
}

/// Address similarity: weighted token overlap per tagged component,
/// renormalized over components populated on both sides. No shared
/// populated component means no evidence: 0.0.
pub fn address_similarity(a: &NormalizedUnit, b: &NormalizedUnit) -> f64 {
    let components: [(&[String], &[String], f64); 4] = [
        (&a.address_province, &b.address_province, 0.2),
        (&a.address_city, &b.address_city, 0.3),
        (&a.address_district, &b.address_district, 0.3),
        (&a.address_detail, &b.address_detail, 0.2),
    ];
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    for (lhs, rhs, weight) in components {
        if lhs.is_empty() || rhs.is_empty() {
            continue;
        }
        weighted += weight * overlap_ratio(lhs, rhs);
        weight_sum += weight;
    }
    if weight_sum == 0.0 {
        0.0
    } else {
        round4(weighted / weight_sum)
    }
}

/// Person-name similarity: exact 1.0; proper prefix with both sides at
/// least two chars 0.5; otherwise 0.0.
pub fn person_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let len_a = a.chars().count();
    let len_b = b.chars().count();
    if len_a >= 2 && len_b >= 2 && (a.starts_with(b) || b.starts_with(a)) {
        return 0.5;
    }
    0.0
}

/// Phone similarity: equality of the canonicalized numbers.
pub fn phone_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Unit;
    use crate::normalize::normalize_unit;

    fn unit(name: &str, address: &str) -> NormalizedUnit {
        normalize_unit(&Unit {
            id: "x".into(),
            name: name.into(),
            address: if address.is_empty() {
                None
            } else {
                Some(address.into())
            },
            ..Unit::default()
        })
    }

    #[test]
    fn round4_policy() {
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round4(0.99999), 1.0);
        assert_eq!(round4(0.0), 0.0);
    }

    #[test]
    fn identical_names_score_one() {
        let a = unit("宏发建设工程有限公司", "");
        let b = unit("宏发建设工程有限公司", "");
        assert_eq!(name_similarity(&a, &b), 1.0);
        assert_eq!(name_core_similarity(&a, &b), 1.0);
    }

    #[test]
    fn kernels_are_total_on_empty_inputs() {
        let empty = unit("", "");
        let named = unit("天宇科技", "");
        assert_eq!(name_similarity(&empty, &named), 0.0);
        assert_eq!(name_core_similarity(&empty, &empty), 0.0);
        assert_eq!(address_similarity(&empty, &named), 0.0);
        assert_eq!(person_similarity("", "张三"), 0.0);
        assert_eq!(phone_similarity("", ""), 0.0);
    }

    #[test]
    fn name_similarity_in_range_and_symmetric() {
        let a = unit("福州仓山诚信商贸有限公司", "");
        let b = unit("福州诚信商贸城", "");
        let s = name_similarity(&a, &b);
        assert!(s > 0.0 && s < 1.0, "score was {s}");
        assert_eq!(s, name_similarity(&b, &a));
    }

    #[test]
    fn unrelated_names_score_low() {
        let a = unit("仓山消防器材厂", "");
        let b = unit("虹口织造印染有限公司", "");
        assert!(name_similarity(&a, &b) < 0.3);
    }

    #[test]
    fn address_component_weighting() {
        let a = unit("x", "福建省福州市仓山区金山大道618号");
        let b = unit("x", "福建省福州市仓山区金山大道618号");
        assert_eq!(address_similarity(&a, &b), 1.0);

        let c = unit("x", "福建省福州市鼓楼区五一路9号");
        let partial = address_similarity(&a, &c);
        assert!(partial > 0.0 && partial < 1.0, "score was {partial}");
    }

    #[test]
    fn address_without_shared_components_is_zero() {
        let a = unit("x", "金山大道618号");
        let b = unit("x", "");
        assert_eq!(address_similarity(&a, &b), 0.0);
    }

    #[test]
    fn person_prefix_rule() {
        assert_eq!(person_similarity("张三", "张三"), 1.0);
        assert_eq!(person_similarity("张三丰", "张三"), 0.5);
        assert_eq!(person_similarity("张", "张三"), 0.0);
        assert_eq!(person_similarity("李四", "张三"), 0.0);
    }

    #[test]
    fn phone_equality_rule() {
        assert_eq!(phone_similarity("13900001111", "13900001111"), 1.0);
        assert_eq!(phone_similarity("13900001111", "13900001112"), 0.0);
    }
}
