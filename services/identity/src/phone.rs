//! Phone number line-type detection.
use crate::model::PhoneType;

pub trait PhoneTypeDetector: Send + Sync {
    /// Classify `number` (E.164 or national format for `region`).
    fn detect(&self, number: &str, region: &str) -> PhoneType;
}

#[derive(Debug, Clone, Copy)]
struct Region {
    code: &'static str,
    calling_code: &'static str,
}

const REGIONS: &[Region] = &[
    Region { code: "FR", calling_code: "33" },
    Region { code: "GB", calling_code: "44" },
    Region { code: "DE", calling_code: "49" },
    Region { code: "ES", calling_code: "34" },
    Region { code: "BE", calling_code: "32" },
    Region { code: "US", calling_code: "1" },
];

/// E.164 prefixes, digits only. Longest match wins.
const PREFIXES: &[(&str, PhoneType)] = &[
    ("336", PhoneType::Mobile),
    ("337", PhoneType::Mobile),
    ("331", PhoneType::Landline),
    ("332", PhoneType::Landline),
    ("333", PhoneType::Landline),
    ("334", PhoneType::Landline),
    ("335", PhoneType::Landline),
    ("339", PhoneType::Landline),
    ("447", PhoneType::Mobile),
    ("441", PhoneType::Landline),
    ("442", PhoneType::Landline),
    ("4915", PhoneType::Mobile),
    ("4916", PhoneType::Mobile),
    ("4917", PhoneType::Mobile),
    ("492", PhoneType::Landline),
    ("493", PhoneType::Landline),
    ("494", PhoneType::Landline),
    ("495", PhoneType::Landline),
    ("496", PhoneType::Landline),
    ("497", PhoneType::Landline),
    ("498", PhoneType::Landline),
    ("499", PhoneType::Landline),
    ("346", PhoneType::Mobile),
    ("347", PhoneType::Mobile),
    ("348", PhoneType::Landline),
    ("349", PhoneType::Landline),
    ("324", PhoneType::Mobile),
    ("321", PhoneType::Landline),
    ("322", PhoneType::Landline),
    ("323", PhoneType::Landline),
];

/// Prefix-table detector. Numbers it cannot place are `unknown`.
#[derive(Debug, Clone, Default)]
pub struct PrefixTableDetector;

impl PrefixTableDetector {
    pub fn new() -> Self {
        Self
    }
}

/// Digits of the number in international form, without the leading `+`.
fn international_digits(number: &str, region: &str) -> Option<String> {
    let trimmed = number.trim();
    let plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if plus {
        return Some(digits);
    }
    if let Some(rest) = digits.strip_prefix("00") {
        return Some(rest.to_string());
    }
    let region = REGIONS
        .iter()
        .find(|r| r.code.eq_ignore_ascii_case(region.trim()))?;
    let national = digits.strip_prefix('0').unwrap_or(&digits);
    Some(format!("{}{national}", region.calling_code))
}

impl PhoneTypeDetector for PrefixTableDetector {
    fn detect(&self, number: &str, region: &str) -> PhoneType {
        let Some(digits) = international_digits(number, region) else {
            return PhoneType::Unknown;
        };
        PREFIXES
            .iter()
            .filter(|(prefix, _)| digits.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, phone_type)| *phone_type)
            .unwrap_or(PhoneType::Unknown)
    }
}
