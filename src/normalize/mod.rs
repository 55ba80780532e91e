//! Deterministic text normalization for unit names and addresses.
//!
//! The goal is comparability without losing discriminating signal: two
//! references to the same business unit should normalize to the same
//! canonical form, while unrelated units stay apart. The pipeline never
//! fails; pathological input yields an empty canonical name, which
//! downstream layers treat as un-matchable.

pub mod address;

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::models::{NormalizedUnit, Unit};

/// Administrative-region prefixes stripped from the left of a name,
/// longest match first. Carries both bare and suffixed municipality forms
/// plus romanized spellings so either rendering strips cleanly.
pub static REGION_PREFIXES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let mut prefixes = vec![
        "上海市", "北京市", "天津市", "重庆市", "广州市", "深圳市", "杭州市", "南京市",
        "武汉市", "成都市", "西安市", "沈阳市", "大连市", "青岛市", "厦门市", "苏州市",
        "无锡市", "宁波市", "温州市", "佛山市", "东莞市", "中山市", "珠海市", "惠州市",
        "江门市", "湛江市", "茂名市", "肇庆市", "梅州市", "汕头市", "福州市",
        "上海", "北京", "天津", "重庆", "广州", "深圳", "杭州", "南京", "武汉", "成都",
        "西安", "沈阳", "大连", "青岛", "厦门", "苏州", "无锡", "宁波", "温州", "佛山",
        "东莞", "中山", "珠海", "惠州", "江门", "湛江", "茂名", "肇庆", "梅州", "汕头",
        "福州", "长三角", "珠三角", "京津冀", "华东", "华南", "华北", "华中", "西南",
        "东北", "西北", "中国", "全国", "国际", "亚洲", "世界",
        "SHANGHAI", "BEIJING", "TIANJIN", "CHONGQING", "GUANGZHOU", "SHENZHEN",
        "HANGZHOU", "NANJING", "WUHAN", "CHENGDU", "CHINA",
    ];
    prefixes.sort_by_key(|p| std::cmp::Reverse(p.chars().count()));
    prefixes
});

/// Organizational suffixes stripped from the right, longest match first.
/// English forms are matched against the space-free canonical rendering.
pub static LEGAL_SUFFIXES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let mut suffixes = vec![
        "股份有限公司", "有限责任公司", "集团有限公司", "科技有限公司", "贸易有限公司",
        "投资有限公司", "发展有限公司", "实业有限公司", "建设有限公司", "工程有限公司",
        "咨询有限公司", "服务有限公司", "有限公司", "股份公司", "集团公司", "集团",
        "公司", "厂", "店", "院", "中心", "所", "部", "局", "委", "会", "社", "团",
        "协会", "基金会",
        "CORPORATION", "INCORPORATED", "COMPANY", "HOLDINGS", "LIMITED", "GROUP",
        "COLTD", "CORP", "LTD", "INC",
    ];
    suffixes.sort_by_key(|s| std::cmp::Reverse(s.chars().count()));
    suffixes
});

/// Industry-generic vocabulary removed from the canonical name to expose
/// the core business words the hard similarity gate compares.
pub static INDUSTRY_WORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let mut words = vec![
        "进出口", "国际贸易", "房地产", "科技", "技术", "信息", "网络", "软件", "电子",
        "智能", "贸易", "商贸", "商务", "营销", "销售", "投资", "资本", "基金", "证券",
        "保险", "金融", "财务", "建设", "建筑", "工程", "装饰", "设计", "规划", "咨询",
        "制造", "生产", "加工", "机械", "设备", "工业", "实业", "服务", "管理", "顾问",
        "代理", "中介", "物流", "医疗", "健康", "生物", "制药", "化工", "材料", "能源",
        "教育", "培训", "文化", "传媒", "广告", "出版", "娱乐", "物业", "酒店", "餐饮",
        "旅游", "运输", "航空",
        "TECHNOLOGY", "TRADING", "SERVICES", "SERVICE", "CONSULTING", "INDUSTRIAL",
        "INTERNATIONAL", "LOGISTICS", "INVESTMENT",
    ];
    words.sort_by_key(|w| std::cmp::Reverse(w.chars().count()));
    words
});

/// Tokens carrying no discriminating signal in address details.
pub static STOP_WORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "的", "和", "与", "及", "或", "等", "为", "是", "在", "有", "无", "不", "了",
        "市辖区", "县辖区", "地区",
    ]
});

static BRACKET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[（(][^（()）]*[)）]").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn is_cjk(ch: char) -> bool {
    matches!(ch, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

/// Shared front of the pipeline: compatibility fold (full-width digits and
/// letters to ASCII), uppercase, bracket-group removal, punctuation strip,
/// whitespace collapse.
pub fn normalize_text(raw: &str) -> String {
    let folded: String = raw.nfkc().collect::<String>().to_uppercase();
    let without_brackets = BRACKET_RE.replace_all(&folded, "");
    let kept: String = without_brackets
        .chars()
        .map(|ch| {
            if is_cjk(ch) || ch.is_ascii_alphanumeric() {
                ch
            } else {
                ' '
            }
        })
        .collect();
    WHITESPACE_RE.replace_all(kept.trim(), " ").to_string()
}

/// Remove administrative-region prefixes greedily from the left. Never
/// consumes the whole name.
fn strip_region_prefix(name: &str) -> String {
    let mut current = name.to_string();
    loop {
        let Some(prefix) = REGION_PREFIXES
            .iter()
            .find(|p| current.starts_with(**p) && current.len() > p.len())
        else {
            break;
        };
        current = current[prefix.len()..].to_string();
    }
    current
}

/// Remove organizational suffixes from the right, longest match first.
/// Never consumes the whole name.
fn strip_legal_suffix(name: &str) -> String {
    let mut current = name.to_string();
    loop {
        let Some(suffix) = LEGAL_SUFFIXES
            .iter()
            .find(|s| current.ends_with(**s) && current.len() > s.len())
        else {
            break;
        };
        current = current[..current.len() - suffix.len()].to_string();
    }
    current
}

/// Remove industry-generic words anywhere in the name, to a fixpoint.
/// Falls back to the input when removal would erase everything: a name made
/// purely of generic vocabulary still has to compare as itself.
fn strip_industry_words(name: &str) -> String {
    let mut current = name.to_string();
    loop {
        let mut next = current.clone();
        for word in INDUSTRY_WORDS.iter() {
            next = next.replace(word, "");
        }
        if next == current {
            break;
        }
        if next.is_empty() {
            return current;
        }
        current = next;
    }
    current
}

/// Full name pipeline.
///
/// `name_canonical` is the comparison form: folded, uppercased, bracket and
/// punctuation free, space free, with administrative prefix and
/// organizational suffix stripped. `name_core` further drops
/// industry-generic vocabulary; it is the basis for the hard similarity
/// gate in the fuzzy layers.
pub fn normalize_name(raw: &str) -> (String, String) {
    let base = normalize_text(raw).replace(' ', "");
    let canonical = strip_legal_suffix(&strip_region_prefix(&base));
    let core = strip_industry_words(&canonical);
    (canonical, core)
}

/// Script-aware tokenization: maximal ASCII alphanumeric runs become single
/// tokens, CJK runs yield overlapping character bigrams (a lone ideograph
/// yields itself). No lexicon needed, deterministic across runs.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut ascii_run = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    fn flush_ascii(run: &mut String, tokens: &mut Vec<String>) {
        if !run.is_empty() {
            tokens.push(std::mem::take(run));
        }
    }
    fn flush_cjk(run: &mut Vec<char>, tokens: &mut Vec<String>) {
        match run.len() {
            0 => {}
            1 => tokens.push(run[0].to_string()),
            _ => {
                for pair in run.windows(2) {
                    tokens.push(pair.iter().collect());
                }
            }
        }
        run.clear();
    }

    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut tokens);
            ascii_run.push(ch);
        } else if is_cjk(ch) {
            flush_ascii(&mut ascii_run, &mut tokens);
            cjk_run.push(ch);
        } else {
            flush_ascii(&mut ascii_run, &mut tokens);
            flush_cjk(&mut cjk_run, &mut tokens);
        }
    }
    flush_ascii(&mut ascii_run, &mut tokens);
    flush_cjk(&mut cjk_run, &mut tokens);
    tokens
}

/// Blocking keys: prefixes of the canonical name, k in {2, 3, 4} chars.
/// A single-character name contributes itself so it still blocks.
pub fn name_slices(canonical: &str) -> Vec<String> {
    let chars: Vec<char> = canonical.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() == 1 {
        return vec![canonical.to_string()];
    }
    (2..=4usize)
        .filter(|k| *k <= chars.len())
        .map(|k| chars[..k].iter().collect())
        .collect()
}

/// Light person-name normalization: fold, strip punctuation, drop spaces.
pub fn normalize_person(raw: &str) -> String {
    normalize_text(raw).replace(' ', "")
}

/// Phone canonicalization: digits only, leading trunk zero or country code
/// 86 removed.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if let Some(rest) = digits.strip_prefix("86").filter(|r| r.len() >= 7) {
        return rest.to_string();
    }
    if let Some(rest) = digits.strip_prefix('0').filter(|r| !r.is_empty()) {
        return rest.to_string();
    }
    digits
}

/// Full derived view of a unit. Total: any input produces a value.
pub fn normalize_unit(unit: &Unit) -> NormalizedUnit {
    let (name_canonical, name_core) = normalize_name(&unit.name);
    let parts = address::normalize_address(unit.address.as_deref().unwrap_or(""));
    NormalizedUnit {
        name_slices: name_slices(&name_canonical),
        name_tokens: tokenize(&name_canonical),
        name_canonical,
        name_core,
        address_province: parts.province,
        address_city: parts.city,
        address_district: parts.district,
        address_detail: parts.detail,
        address_keywords: parts.keywords,
        legal_representative: normalize_person(unit.legal_representative.as_deref().unwrap_or("")),
        safety_manager: normalize_person(unit.safety_manager.as_deref().unwrap_or("")),
        contact_phone: normalize_phone(unit.contact_phone.as_deref().unwrap_or("")),
        credit_code: unit.canonical_credit_code().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_full_width_and_uppercases() {
        assert_eq!(normalize_text("ＡＢＣ１２３"), "ABC123");
        assert_eq!(normalize_text("abc"), "ABC");
    }

    #[test]
    fn strips_brackets_and_punctuation() {
        assert_eq!(normalize_text("福州（仓山）文体中心"), "福州文体中心");
        assert_eq!(normalize_text("诚信·商贸，城"), "诚信 商贸 城");
    }

    #[test]
    fn canonical_strips_region_and_suffix() {
        // "科技有限公司" is a compound suffix entry, so it strips whole.
        let (canonical, _) = normalize_name("上海市闵行区某某科技有限公司");
        assert_eq!(canonical, "闵行区某某");
        let (canonical, _) = normalize_name("北京天宇股份有限公司");
        assert_eq!(canonical, "天宇");
    }

    #[test]
    fn english_names_converge_like_s2() {
        let (primary, _) = normalize_name("Shanghai Acme Technology Co., Ltd.");
        let (secondary, _) = normalize_name("ACME TECHNOLOGY");
        assert_eq!(primary, "ACMETECHNOLOGY");
        assert_eq!(primary, secondary);
    }

    #[test]
    fn core_drops_industry_vocabulary() {
        let (canonical, core) = normalize_name("宏发建设工程有限公司");
        assert_eq!(canonical, "宏发建设");
        assert_eq!(core, "宏发");
        let (canonical, core) = normalize_name("天宇实业发展有限公司");
        assert_eq!(canonical, "天宇实业");
        assert_eq!(core, "天宇");
    }

    #[test]
    fn core_falls_back_when_name_is_all_generic() {
        let (canonical, core) = normalize_name("建设工程有限公司");
        assert_eq!(canonical, "建设");
        // Dropping the industry word would erase the name entirely, so the
        // canonical form is kept as the core.
        assert_eq!(core, "建设");
    }

    #[test]
    fn stripping_never_empties_a_name() {
        let (canonical, core) = normalize_name("有限公司");
        assert_eq!(canonical, "有限公司");
        assert_eq!(core, "有限公司");
        let (canonical, _) = normalize_name("上海");
        assert_eq!(canonical, "上海");
    }

    #[test]
    fn empty_and_pathological_inputs_yield_empty_canonical() {
        assert_eq!(normalize_name("").0, "");
        assert_eq!(normalize_name("  ···  ").0, "");
        assert_eq!(normalize_name("（内部注记）").0, "");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "上海市闵行区某某科技（集团）有限公司",
            "Shanghai Acme Technology Co., Ltd.",
            "ＦＯＯ Ｔｒａｄｉｎｇ",
            "福州仓山万达广场A座1202",
            "",
        ] {
            let once = normalize_text(raw);
            assert_eq!(normalize_text(&once), once);
            let (c1, k1) = normalize_name(raw);
            let (c2, k2) = normalize_name(&c1);
            assert_eq!(c1, c2);
            assert_eq!(k2, strip_industry_words(&c2));
            let _ = k1;
        }
    }

    #[test]
    fn tokenize_mixes_scripts() {
        assert_eq!(tokenize("ABC商贸城"), vec!["ABC", "商贸", "贸城"]);
        assert_eq!(tokenize("华"), vec!["华"]);
        assert_eq!(tokenize("华为"), vec!["华为"]);
        assert_eq!(tokenize(""), Vec::<String>::new());
        assert_eq!(tokenize("A1 B2"), vec!["A1", "B2"]);
    }

    #[test]
    fn slices_are_short_prefixes() {
        assert_eq!(name_slices("天宇科技"), vec!["天宇", "天宇科", "天宇科技"]);
        assert_eq!(name_slices("天宇"), vec!["天宇"]);
        assert_eq!(name_slices("天"), vec!["天"]);
        assert!(name_slices("").is_empty());
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("+86 139-0000-1111"), "13900001111");
        assert_eq!(normalize_phone("021-6555 0000"), "2165550000");
        assert_eq!(normalize_phone("(0591)83061234"), "59183061234");
        assert_eq!(normalize_phone(""), "");
        // A bare "86" is too short to be a country-code form.
        assert_eq!(normalize_phone("86"), "86");
    }

    #[test]
    fn normalize_unit_is_total() {
        let derived = normalize_unit(&Unit::default());
        assert!(!derived.is_name_matchable());
        assert!(derived.name_slices.is_empty());
        assert!(derived.contact_phone.is_empty());
    }
}
