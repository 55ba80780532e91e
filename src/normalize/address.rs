//! Address normalization and component tagging.
//!
//! Addresses from both registries are free text. Matching compares them
//! component-wise (province / city / district / detail), so the normalizer
//! carves the leading administrative segments off by their marker
//! characters and tokenizes the remainder.

use once_cell::sync::Lazy;

use super::{normalize_text, tokenize, STOP_WORDS};

/// Municipalities double as province and city; either spelling appears.
static MUNICIPALITIES: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["北京市", "上海市", "天津市", "重庆市", "北京", "上海", "天津", "重庆"]);

/// Filler segments that carry no location signal and confuse the marker
/// scan ("市辖区" contains a district marker).
const FILLER_SEGMENTS: [&str; 3] = ["市辖区", "县辖区", "地区"];

/// Tagged components of one normalized address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressParts {
    pub province: Vec<String>,
    pub city: Vec<String>,
    pub district: Vec<String>,
    pub detail: Vec<String>,
    /// Informative tokens (length >= 2, non-stopword) over the whole
    /// address, used as a prefilter blocking signal.
    pub keywords: Vec<String>,
}

impl AddressParts {
    pub fn is_empty(&self) -> bool {
        self.province.is_empty()
            && self.city.is_empty()
            && self.district.is_empty()
            && self.detail.is_empty()
    }
}

/// Find the first occurrence of any marker char within the leading
/// `window` chars; returns (segment_without_marker, rest).
fn take_segment(chars: &[char], markers: &[char], window: usize) -> (Option<String>, usize) {
    let limit = window.min(chars.len());
    for i in 1..limit {
        if markers.contains(&chars[i]) {
            let segment: String = chars[..i].iter().collect();
            return (Some(segment), i + 1);
        }
    }
    (None, 0)
}

/// Normalize an address and tag its components. Total: malformed input
/// produces an empty or detail-only value, never an error.
pub fn normalize_address(raw: &str) -> AddressParts {
    let spaced = normalize_text(raw);
    if spaced.is_empty() {
        return AddressParts::default();
    }

    let mut compact = spaced.replace(' ', "");
    for filler in FILLER_SEGMENTS {
        compact = compact.replace(filler, "");
    }

    let mut parts = AddressParts::default();
    let chars: Vec<char> = compact.chars().collect();
    let mut pos = 0usize;

    // Municipalities are their own province and city.
    if let Some(muni) = MUNICIPALITIES.iter().find(|m| compact.starts_with(**m)) {
        let bare = muni.trim_end_matches('市').to_string();
        parts.province.push(bare.clone());
        parts.city.push(bare);
        pos = muni.chars().count();
    } else {
        let (province, consumed) = take_segment(&chars, &['省'], 5);
        if let Some(p) = province {
            parts.province.push(p);
            pos = consumed;
        }
        let (city, consumed) = take_segment(&chars[pos..], &['市'], 6);
        if let Some(c) = city {
            parts.city.push(c);
            pos += consumed;
        }
    }

    let (district, consumed) = take_segment(&chars[pos..], &['区', '县'], 7);
    if let Some(d) = district {
        parts.district.push(d);
        pos += consumed;
    }

    let detail: String = chars[pos..].iter().collect();
    parts.detail = tokenize(&detail);

    parts.keywords = tokenize(&spaced)
        .into_iter()
        .filter(|t| t.chars().count() >= 2 && !STOP_WORDS.contains(&t.as_str()))
        .collect();
    parts.keywords.dedup();

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_full_administrative_chain() {
        let parts = normalize_address("福建省福州市仓山区建新镇金山大道618号");
        assert_eq!(parts.province, vec!["福建"]);
        assert_eq!(parts.city, vec!["福州"]);
        assert_eq!(parts.district, vec!["仓山"]);
        assert!(!parts.detail.is_empty());
    }

    #[test]
    fn municipality_counts_as_province_and_city() {
        let parts = normalize_address("上海市虹口区四川北路1234号");
        assert_eq!(parts.province, vec!["上海"]);
        assert_eq!(parts.city, vec!["上海"]);
        assert_eq!(parts.district, vec!["虹口"]);
    }

    #[test]
    fn filler_segments_do_not_become_districts() {
        let parts = normalize_address("上海市市辖区黄浦区中山东一路1号");
        assert_eq!(parts.district, vec!["黄浦"]);
    }

    #[test]
    fn detail_only_address() {
        let parts = normalize_address("金山大道618号");
        assert!(parts.province.is_empty());
        assert!(parts.city.is_empty());
        assert!(!parts.detail.is_empty());
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(normalize_address("").is_empty());
        assert!(normalize_address("  ，。 ").is_empty());
    }

    #[test]
    fn keywords_drop_short_and_stopword_tokens() {
        let parts = normalize_address("福建省福州市的仓山区");
        assert!(parts.keywords.iter().all(|k| k.chars().count() >= 2));
        assert!(!parts.keywords.iter().any(|k| k == "的"));
    }

    #[test]
    fn tagging_is_deterministic() {
        let a = normalize_address("福建省福州市仓山区金山大道618号");
        let b = normalize_address("福建省福州市仓山区金山大道618号");
        assert_eq!(a, b);
    }
}
