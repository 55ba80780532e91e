//! The layered decision pipeline: four strategies applied in order, first
//! conclusive answer wins.
//!
//! L1 credit-code equality and L2 canonical-name equality are
//! deterministic and score 1.0. L3 scores the prefiltered candidates with
//! a weighted composite; L4 rescues near-misses whose link is corroborated
//! by shared attributes in the graph. Every outcome, including no-match,
//! carries a structured explanation.

use crate::config::MatchingConfig;
use crate::matching::graph::{graph_boost, AttributeGraph};
use crate::matching::kernels;
use crate::models::{MatchExplanation, MatchType, NormalizedUnit, SourceKind, Unit};

/// Which layers a task runs. Defaults to all four.
#[derive(Debug, Clone, Copy)]
pub struct MatchStrategySet {
    pub exact_credit_code: bool,
    pub exact_name: bool,
    pub fuzzy: bool,
    pub graph_assisted: bool,
}

impl Default for MatchStrategySet {
    fn default() -> Self {
        Self {
            exact_credit_code: true,
            exact_name: true,
            fuzzy: true,
            graph_assisted: true,
        }
    }
}

impl MatchStrategySet {
    /// Parse the strategy names accepted by the task-start operation.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let mut set = Self {
            exact_credit_code: false,
            exact_name: false,
            fuzzy: false,
            graph_assisted: false,
        };
        for name in names {
            match name.as_ref() {
                "exact_credit_code" => set.exact_credit_code = true,
                "exact_name_canonical" => set.exact_name = true,
                "fuzzy_prefiltered" => set.fuzzy = true,
                "graph_assisted" => set.graph_assisted = true,
                other => return Err(other.to_string()),
            }
        }
        Ok(set)
    }
}

/// One prefiltered SECONDARY record with its derived view.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub unit: Unit,
    pub normalized: NormalizedUnit,
}

/// Outcome of one record's cascade.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub match_type: MatchType,
    pub similarity_score: f64,
    pub explanation: MatchExplanation,
    /// Index into the candidate slice, when a match was found.
    pub matched: Option<usize>,
}

impl MatchOutcome {
    fn unmatched(explanation: MatchExplanation) -> Self {
        Self {
            match_type: MatchType::None,
            similarity_score: 0.0,
            explanation,
            matched: None,
        }
    }
}

struct FuzzyScore {
    index: usize,
    name: f64,
    name_core: f64,
    address: f64,
    legal_rep: f64,
    phone: f64,
    composite: f64,
}

fn fuzzy_score(primary: &NormalizedUnit, index: usize, candidate: &Candidate) -> FuzzyScore {
    let name = kernels::name_similarity(primary, &candidate.normalized);
    let name_core = kernels::name_core_similarity(primary, &candidate.normalized);
    let address = kernels::address_similarity(primary, &candidate.normalized);
    let legal_rep = kernels::person_similarity(
        &primary.legal_representative,
        &candidate.normalized.legal_representative,
    );
    let phone = kernels::phone_similarity(&primary.contact_phone, &candidate.normalized.contact_phone);
    let composite =
        kernels::round4(0.55 * name + 0.25 * address + 0.10 * legal_rep + 0.10 * phone);
    FuzzyScore {
        index,
        name,
        name_core,
        address,
        legal_rep,
        phone,
        composite,
    }
}

fn fuzzy_explanation(
    primary: &NormalizedUnit,
    candidate: &Candidate,
    score: &FuzzyScore,
) -> MatchExplanation {
    let mut explanation = MatchExplanation::default()
        .positive(format!("name_core similarity {:.2}", score.name_core))
        .score("name", score.name)
        .score("name_core", score.name_core)
        .score("address", score.address)
        .score("legal_representative", score.legal_rep)
        .score("phone", score.phone)
        .score("composite", score.composite);

    let district_exact = !primary.address_district.is_empty()
        && primary.address_district == candidate.normalized.address_district;
    if district_exact {
        explanation = explanation.positive("address district exact");
    }
    if score.legal_rep >= 1.0 {
        explanation = explanation.positive("legal representative matches");
    } else if !primary.legal_representative.is_empty()
        && !candidate.normalized.legal_representative.is_empty()
        && score.legal_rep == 0.0
    {
        explanation = explanation.negative("legal representative differs");
    }
    if score.phone >= 1.0 {
        explanation = explanation.positive("phone numbers equal");
    } else if !primary.contact_phone.is_empty() && !candidate.normalized.contact_phone.is_empty() {
        explanation = explanation.negative("phone mismatch");
    }
    explanation
}

/// Run the cascade for one PRIMARY record over its prefiltered candidates.
///
/// Pure: all I/O (prefilter reads, graph construction) happens before this
/// call. `prefilter_failed` marks a transiently unavailable candidate
/// store, which turns into recorded negative evidence rather than an
/// error; such records are retried on the next run.
pub fn decide(
    primary: &Unit,
    primary_norm: &NormalizedUnit,
    candidates: &[Candidate],
    graph: Option<&AttributeGraph>,
    strategies: MatchStrategySet,
    config: &MatchingConfig,
    prefilter_failed: bool,
) -> MatchOutcome {
    if !primary.has_identifying_fields() {
        return MatchOutcome::unmatched(
            MatchExplanation::default().negative("primary record has no identifying fields"),
        );
    }
    if prefilter_failed {
        return MatchOutcome::unmatched(
            MatchExplanation::default().negative("candidate store unavailable"),
        );
    }

    // L1: deterministic by credit code.
    if strategies.exact_credit_code {
        if let Some(code) = primary.canonical_credit_code() {
            let mut hits: Vec<usize> = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.unit.canonical_credit_code().as_deref() == Some(code.as_str()))
                .map(|(i, _)| i)
                .collect();
            // Collisions resolve to the lexicographically smallest id.
            hits.sort_by(|a, b| candidates[*a].unit.id.cmp(&candidates[*b].unit.id));
            if let Some(&index) = hits.first() {
                return MatchOutcome {
                    match_type: MatchType::ExactCreditCode,
                    similarity_score: 1.0,
                    explanation: MatchExplanation::default()
                        .positive("credit codes equal")
                        .score("credit_code", 1.0),
                    matched: Some(index),
                };
            }
        }
    }

    // L2: deterministic by canonical name.
    if strategies.exact_name && primary_norm.is_name_matchable() {
        let mut hits: Vec<(usize, f64)> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.normalized.name_canonical == primary_norm.name_canonical)
            .map(|(i, c)| (i, kernels::address_similarity(primary_norm, &c.normalized)))
            .collect();
        // Collisions: best address agreement first, then smallest id.
        hits.sort_by(|(ai, ascore), (bi, bscore)| {
            bscore
                .partial_cmp(ascore)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| candidates[*ai].unit.id.cmp(&candidates[*bi].unit.id))
        });
        if let Some(&(index, address)) = hits.first() {
            let mut explanation = MatchExplanation::default()
                .positive("canonical names equal")
                .score("name", 1.0)
                .score("address", address);
            if !primary_norm.address_district.is_empty()
                && primary_norm.address_district == candidates[index].normalized.address_district
            {
                explanation = explanation.positive("address district exact");
            }
            return MatchOutcome {
                match_type: MatchType::ExactNameCanonical,
                similarity_score: 1.0,
                explanation,
                matched: Some(index),
            };
        }
    }

    if !primary_norm.is_name_matchable() || candidates.is_empty() {
        let mut explanation = MatchExplanation::default();
        explanation = if candidates.is_empty() {
            explanation.negative("no candidates from prefilter")
        } else {
            explanation.negative("primary name normalizes to empty")
        };
        return MatchOutcome::unmatched(explanation);
    }

    let scores: Vec<FuzzyScore> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| fuzzy_score(primary_norm, i, c))
        .collect();

    // L3: prefiltered fuzzy, hard-gated on core-name similarity.
    let mut gate_rejected_best: Option<&FuzzyScore> = None;
    if strategies.fuzzy {
        let mut eligible: Vec<&FuzzyScore> = Vec::new();
        for score in &scores {
            if score.name_core < config.name_core_hard_gate {
                let beats = gate_rejected_best
                    .map(|best| score.composite > best.composite)
                    .unwrap_or(true);
                if beats {
                    gate_rejected_best = Some(score);
                }
            } else {
                eligible.push(score);
            }
        }
        eligible.sort_by(|a, b| {
            b.composite
                .partial_cmp(&a.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| candidates[a.index].unit.id.cmp(&candidates[b.index].unit.id))
        });
        if let Some(best) = eligible.first() {
            if best.composite >= config.theta1 {
                return MatchOutcome {
                    match_type: MatchType::FuzzyPrefiltered,
                    similarity_score: best.composite,
                    explanation: fuzzy_explanation(primary_norm, &candidates[best.index], best),
                    matched: Some(best.index),
                };
            }
        }
    }

    // L4: graph-assisted rescue of near misses.
    if strategies.graph_assisted {
        if let Some(graph) = graph {
            let mut best: Option<(f64, usize, &FuzzyScore)> = None;
            for score in &scores {
                if score.name_core < config.l4_name_core_floor {
                    continue;
                }
                let shared = graph.shared_attribute_count(
                    (SourceKind::Primary, &primary.id),
                    (SourceKind::Secondary, &candidates[score.index].unit.id),
                );
                let combined = kernels::round4(score.composite.max(graph_boost(shared)));
                let replace = match &best {
                    None => true,
                    Some((current, current_index, _)) => {
                        combined > *current
                            || (combined == *current
                                && candidates[score.index].unit.id
                                    < candidates[*current_index].unit.id)
                    }
                };
                if replace {
                    best = Some((combined, score.index, score));
                }
            }
            if let Some((combined, index, score)) = best {
                if combined >= config.theta2 {
                    let shared = graph.shared_attribute_count(
                        (SourceKind::Primary, &primary.id),
                        (SourceKind::Secondary, &candidates[index].unit.id),
                    );
                    let explanation = fuzzy_explanation(primary_norm, &candidates[index], score)
                        .positive(format!("{} shared attributes in graph", shared))
                        .score("graph_boost", graph_boost(shared));
                    return MatchOutcome {
                        match_type: MatchType::GraphAssisted,
                        similarity_score: combined,
                        explanation,
                        matched: Some(index),
                    };
                }
            }
        }
    }

    // No layer concluded; explain the nearest miss.
    let mut explanation = MatchExplanation::default();
    if let Some(rejected) = gate_rejected_best {
        explanation = explanation
            .negative(format!(
                "name_core below hard gate {:.2}",
                config.name_core_hard_gate
            ))
            .score("name_core", rejected.name_core)
            .score("composite", rejected.composite);
    } else if let Some(best) = scores.iter().max_by(|a, b| {
        a.composite
            .partial_cmp(&b.composite)
            .unwrap_or(std::cmp::Ordering::Equal)
    }) {
        explanation = explanation
            .negative("no candidate reached acceptance thresholds")
            .score("name", best.name)
            .score("name_core", best.name_core)
            .score("address", best.address)
            .score("composite", best.composite);
    } else {
        explanation = explanation.negative("no candidates from prefilter");
    }
    MatchOutcome::unmatched(explanation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_unit;

    fn primary(id: &str, name: &str) -> Unit {
        Unit {
            id: id.into(),
            name: name.into(),
            ..Unit::default()
        }
    }

    fn candidate(unit: Unit) -> Candidate {
        let normalized = normalize_unit(&unit);
        Candidate { unit, normalized }
    }

    fn run(
        primary_unit: &Unit,
        candidates: &[Candidate],
        graph: Option<&AttributeGraph>,
    ) -> MatchOutcome {
        let normalized = normalize_unit(primary_unit);
        decide(
            primary_unit,
            &normalized,
            candidates,
            graph,
            MatchStrategySet::default(),
            &MatchingConfig::default(),
            false,
        )
    }

    #[test]
    fn s1_credit_code_exact() {
        let p = Unit {
            id: "P1".into(),
            name: "Foo Trading Co., Ltd.".into(),
            credit_code: Some("91000000MA1ABCDE0X".into()),
            ..Unit::default()
        };
        let cands = vec![candidate(Unit {
            id: "S7".into(),
            name: "FOO TRADING".into(),
            credit_code: Some("91000000ma1abcde0x".into()),
            ..Unit::default()
        })];
        let outcome = run(&p, &cands, None);
        assert_eq!(outcome.match_type, MatchType::ExactCreditCode);
        assert_eq!(outcome.similarity_score, 1.0);
        assert_eq!(outcome.explanation.positive, vec!["credit codes equal"]);
        assert_eq!(outcome.matched, Some(0));
    }

    #[test]
    fn credit_code_collision_takes_smallest_id() {
        let p = Unit {
            id: "P1".into(),
            name: "甲公司".into(),
            credit_code: Some("91000000MA1ABCDE0X".into()),
            ..Unit::default()
        };
        let mk = |id: &str| {
            candidate(Unit {
                id: id.into(),
                name: "乙公司".into(),
                credit_code: Some("91000000MA1ABCDE0X".into()),
                ..Unit::default()
            })
        };
        let outcome = run(&p, &[mk("S9"), mk("S2")], None);
        assert_eq!(outcome.matched, Some(1));
    }

    #[test]
    fn s2_canonical_name_exact() {
        let p = primary("P2", "Shanghai Acme Technology Co., Ltd.");
        let cands = vec![candidate(primary("S9", "ACME TECHNOLOGY"))];
        let outcome = run(&p, &cands, None);
        assert_eq!(outcome.match_type, MatchType::ExactNameCanonical);
        assert_eq!(outcome.similarity_score, 1.0);
        assert!(outcome
            .explanation
            .positive
            .contains(&"canonical names equal".to_string()));
    }

    #[test]
    fn name_collision_prefers_address_agreement() {
        let p = Unit {
            id: "P3".into(),
            name: "仓山消防器材厂".into(),
            address: Some("福建省福州市仓山区金山大道618号".into()),
            ..Unit::default()
        };
        let far = candidate(Unit {
            id: "S1".into(),
            name: "仓山消防器材厂".into(),
            address: Some("福建省泉州市丰泽区刺桐路1号".into()),
            ..Unit::default()
        });
        let near = candidate(Unit {
            id: "S5".into(),
            name: "仓山消防器材厂".into(),
            address: Some("福建省福州市仓山区金山大道618号".into()),
            ..Unit::default()
        });
        let outcome = run(&p, &[far, near], None);
        assert_eq!(outcome.match_type, MatchType::ExactNameCanonical);
        assert_eq!(outcome.matched, Some(1));
    }

    #[test]
    fn s3_fuzzy_accept_with_phone_mismatch_evidence() {
        let p = Unit {
            id: "P4".into(),
            name: "福州仓山诚信商贸有限公司".into(),
            address: Some("福建省福州市仓山区金山大道618号".into()),
            legal_representative: Some("陈建国".into()),
            contact_phone: Some("13900001111".into()),
            ..Unit::default()
        };
        let close = candidate(Unit {
            id: "S3".into(),
            name: "福州仓山诚信商贸城有限公司".into(),
            address: Some("福建省福州市仓山区金山大道618号".into()),
            legal_representative: Some("陈建国".into()),
            contact_phone: Some("13900002222".into()),
            ..Unit::default()
        });
        let noise = candidate(Unit {
            id: "S4".into(),
            name: "泉州天马物流有限公司".into(),
            address: Some("福建省泉州市丰泽区".into()),
            ..Unit::default()
        });
        let outcome = run(&p, &[close, noise], None);
        assert_eq!(outcome.match_type, MatchType::FuzzyPrefiltered);
        assert!(outcome.similarity_score >= 0.75, "score {}", outcome.similarity_score);
        assert!(outcome
            .explanation
            .negative
            .contains(&"phone mismatch".to_string()));
        assert!(outcome
            .explanation
            .positive
            .iter()
            .any(|r| r.starts_with("name_core similarity")));
        assert_eq!(outcome.matched, Some(0));
    }

    #[test]
    fn s4_hard_gate_rejects_despite_attribute_agreement() {
        let p = Unit {
            id: "P5".into(),
            name: "仓山消防器材厂".into(),
            address: Some("福建省福州市仓山区金山大道618号".into()),
            contact_phone: Some("13900001111".into()),
            ..Unit::default()
        };
        let wrong = candidate(Unit {
            id: "S6".into(),
            name: "虹口织造印染有限公司".into(),
            address: Some("福建省福州市仓山区金山大道618号".into()),
            contact_phone: Some("13900001111".into()),
            ..Unit::default()
        });
        let outcome = run(&p, &[wrong], None);
        assert_eq!(outcome.match_type, MatchType::None);
        assert_eq!(outcome.similarity_score, 0.0);
        assert!(outcome
            .explanation
            .negative
            .iter()
            .any(|r| r.starts_with("name_core below hard gate")));
    }

    #[test]
    fn s5_graph_rescues_weak_composite() {
        let p = Unit {
            id: "P6".into(),
            name: "福州仓山wanda百货".into(),
            legal_representative: Some("林芳".into()),
            contact_phone: Some("13900003333".into()),
            ..Unit::default()
        };
        let near_miss = Unit {
            id: "S8".into(),
            // Similar core name but little else in common textually.
            name: "仓山wanda百货商行".into(),
            legal_representative: Some("林芳".into()),
            contact_phone: Some("13900003333".into()),
            ..Unit::default()
        };

        let mut graph = AttributeGraph::new();
        graph.add_unit(
            SourceKind::Secondary,
            "S8",
            &normalize_unit(&near_miss),
        );
        graph.add_unit(SourceKind::Primary, "P6", &normalize_unit(&p));

        // Disable L3 so the composite cannot win first; the rescue path
        // must still clear theta2 on the strength of the boost.
        let normalized = normalize_unit(&p);
        let strategies = MatchStrategySet {
            fuzzy: false,
            ..MatchStrategySet::default()
        };
        let outcome = decide(
            &p,
            &normalized,
            &[candidate(near_miss)],
            Some(&graph),
            strategies,
            &MatchingConfig::default(),
            false,
        );
        assert_eq!(outcome.match_type, MatchType::GraphAssisted);
        assert!(outcome.similarity_score >= 0.9, "score {}", outcome.similarity_score);
        assert!(outcome
            .explanation
            .positive
            .contains(&"2 shared attributes in graph".to_string()));
    }

    #[test]
    fn l4_floor_blocks_unrelated_names_with_shared_attributes() {
        let p = Unit {
            id: "P7".into(),
            name: "仓山消防器材厂".into(),
            contact_phone: Some("13900004444".into()),
            legal_representative: Some("王强".into()),
            ..Unit::default()
        };
        let unrelated = Unit {
            id: "S10".into(),
            name: "虹口织造印染有限公司".into(),
            contact_phone: Some("13900004444".into()),
            legal_representative: Some("王强".into()),
            ..Unit::default()
        };
        let mut graph = AttributeGraph::new();
        graph.add_unit(SourceKind::Secondary, "S10", &normalize_unit(&unrelated));
        graph.add_unit(SourceKind::Primary, "P7", &normalize_unit(&p));

        let normalized = normalize_unit(&p);
        let outcome = decide(
            &p,
            &normalized,
            &[candidate(unrelated)],
            Some(&graph),
            MatchStrategySet::default(),
            &MatchingConfig::default(),
            false,
        );
        assert_eq!(outcome.match_type, MatchType::None);
    }

    #[test]
    fn no_identifying_fields_short_circuits() {
        let p = Unit {
            id: "P8".into(),
            name: "".into(),
            ..Unit::default()
        };
        let outcome = run(&p, &[], None);
        assert_eq!(outcome.match_type, MatchType::None);
        assert_eq!(
            outcome.explanation.negative,
            vec!["primary record has no identifying fields"]
        );
    }

    #[test]
    fn prefilter_failure_is_recorded_not_raised() {
        let p = primary("P9", "某某单位");
        let normalized = normalize_unit(&p);
        let outcome = decide(
            &p,
            &normalized,
            &[],
            None,
            MatchStrategySet::default(),
            &MatchingConfig::default(),
            true,
        );
        assert_eq!(outcome.match_type, MatchType::None);
        assert_eq!(
            outcome.explanation.negative,
            vec!["candidate store unavailable"]
        );
    }
}
