use serde::{Deserialize, Serialize};

/// Which registry a unit record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Hazard-inspection registry; the point of view of every linkage result.
    Primary,
    /// Supervisory registry; the candidate side.
    Secondary,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Primary => "primary",
            SourceKind::Secondary => "secondary",
        }
    }
}

/// One business-unit record in the logical shape shared by both sources.
///
/// Identifier-bearing fields (`id`, `credit_code`) are opaque strings
/// end-to-end. The source systems hand out numeric-looking ids with leading
/// zeros; coercing them through numeric types has destroyed them before, so
/// nothing in this crate ever parses them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub name: String,
    pub credit_code: Option<String>,
    pub address: Option<String>,
    pub legal_representative: Option<String>,
    pub safety_manager: Option<String>,
    pub contact_phone: Option<String>,
    /// Building identifier carried by inspection records; drives the
    /// building-based association strategy.
    pub building_id: Option<String>,
    /// Most recent inspection timestamp, when the source records one.
    pub inspected_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Unit {
    /// Uppercased credit code, or None when absent/blank.
    pub fn canonical_credit_code(&self) -> Option<String> {
        self.credit_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| c.to_ascii_uppercase())
    }

    /// True when the record carries neither a usable name nor a credit code.
    pub fn has_identifying_fields(&self) -> bool {
        !self.name.trim().is_empty() || self.canonical_credit_code().is_some()
    }

    /// The seven logical fields used for completeness scoring.
    pub fn field_completeness(&self) -> f64 {
        let present = [
            Some(self.id.as_str()),
            Some(self.name.as_str()),
            self.credit_code.as_deref(),
            self.address.as_deref(),
            self.legal_representative.as_deref(),
            self.safety_manager.as_deref(),
            self.contact_phone.as_deref(),
        ]
        .iter()
        .filter(|f| f.map(|v| !v.trim().is_empty()).unwrap_or(false))
        .count();
        present as f64 / 7.0
    }
}

/// Derived, comparable view of a unit. Computed by the normalizer; cached
/// alongside secondary rows and recomputed for primaries per record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedUnit {
    pub name_canonical: String,
    pub name_core: String,
    /// Prefix slices of `name_canonical` used as blocking keys.
    pub name_slices: Vec<String>,
    /// Ordered tokens of `name_canonical`.
    pub name_tokens: Vec<String>,
    pub address_province: Vec<String>,
    pub address_city: Vec<String>,
    pub address_district: Vec<String>,
    pub address_detail: Vec<String>,
    /// Informative address tokens (length >= 2, non-stopword).
    pub address_keywords: Vec<String>,
    pub legal_representative: String,
    pub safety_manager: String,
    pub contact_phone: String,
    pub credit_code: String,
}

impl NormalizedUnit {
    /// A unit with an empty canonical name cannot be matched by any layer
    /// except L1.
    pub fn is_name_matchable(&self) -> bool {
        !self.name_canonical.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_code_canonicalizes_to_uppercase() {
        let unit = Unit {
            credit_code: Some(" 91000000ma1abcde0x ".into()),
            ..Unit::default()
        };
        assert_eq!(
            unit.canonical_credit_code().as_deref(),
            Some("91000000MA1ABCDE0X")
        );
    }

    #[test]
    fn blank_credit_code_is_absent() {
        let unit = Unit {
            credit_code: Some("   ".into()),
            ..Unit::default()
        };
        assert!(unit.canonical_credit_code().is_none());
    }

    #[test]
    fn identifying_fields_detection() {
        let empty = Unit::default();
        assert!(!empty.has_identifying_fields());

        let named = Unit {
            name: "测试单位".into(),
            ..Unit::default()
        };
        assert!(named.has_identifying_fields());

        let coded = Unit {
            credit_code: Some("91000000MA1ABCDE0X".into()),
            ..Unit::default()
        };
        assert!(coded.has_identifying_fields());
    }

    #[test]
    fn completeness_counts_seven_fields() {
        let unit = Unit {
            id: "P1".into(),
            name: "单位".into(),
            credit_code: Some("91X".into()),
            address: None,
            legal_representative: Some("".into()),
            safety_manager: None,
            contact_phone: Some("123".into()),
            ..Unit::default()
        };
        // id, name, credit_code, contact_phone present => 4/7
        assert!((unit.field_completeness() - 4.0 / 7.0).abs() < 1e-9);
    }
}
