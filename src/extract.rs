use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reader::RawRecord;
use crate::schema::SchemaMapping;

/// Five-digit CPT code, the common case.
static CPT_NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{5}\b").expect("static regex"));
/// HCPCS level II shape: one letter then four digits.
static CPT_ALPHA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]\d{4}\b").expect("static regex"));

/// Substrings that fold messy payer spellings onto one canonical name.
/// Checked in order against the lowercased source value.
const PAYER_ALIASES: &[(&str, &str)] = &[
    ("bcbs", "Blue Cross Blue Shield"),
    ("blue cross", "Blue Cross Blue Shield"),
    ("united healthcare", "UnitedHealthcare"),
    ("united health", "UnitedHealthcare"),
    ("aetna inc", "Aetna"),
    ("cigna corporation", "Cigna"),
    ("humana inc", "Humana"),
];

/// One normalized price row in the standard schema. `confidence` and
/// `issues` start empty and are filled in by validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub cpt_code: Option<String>,
    pub procedure_description: Option<String>,
    pub provider_name: Option<String>,
    pub provider_npi: Option<String>,
    pub provider_city: Option<String>,
    pub provider_state: Option<String>,
    pub provider_zip: Option<String>,
    pub payer_name: Option<String>,
    pub negotiated_rate: Option<f64>,
    pub min_negotiated_rate: Option<f64>,
    pub max_negotiated_rate: Option<f64>,
    pub standard_charge: Option<f64>,
    pub cash_price: Option<f64>,
    pub provenance: String,
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
}

pub fn extract_batch(rows: &[RawRecord], mapping: &SchemaMapping, source: &str) -> Vec<PriceRecord> {
    rows.iter()
        .map(|row| extract_record(row, mapping, source))
        .collect()
}

/// Apply a schema mapping to one raw row. Field-level conversions are
/// total: a value that will not parse becomes `None` rather than failing
/// the row, so one bad cell never aborts a chunk.
pub fn extract_record(row: &RawRecord, mapping: &SchemaMapping, source: &str) -> PriceRecord {
    let text = |mapped: &Option<String>| -> Option<String> {
        mapped
            .as_deref()
            .and_then(|field| row.get(field))
            .and_then(value_to_string)
    };
    let money = |mapped: &Option<String>| -> Option<f64> {
        mapped
            .as_deref()
            .and_then(|field| row.get(field))
            .and_then(value_to_money)
    };

    let procedure_description = text(&mapping.procedure_description);
    let mut cpt_code = text(&mapping.cpt_code);
    if cpt_code.is_none() {
        // Some files bury the code inside the description text.
        if let Some(desc) = procedure_description.as_deref() {
            cpt_code = extract_cpt(desc);
        }
    }

    PriceRecord {
        cpt_code,
        procedure_description,
        provider_name: text(&mapping.provider_name),
        provider_npi: text(&mapping.provider_npi),
        provider_city: text(&mapping.provider_city),
        provider_state: text(&mapping.provider_state).map(|s| s.to_uppercase()),
        provider_zip: text(&mapping.provider_zip).and_then(|z| normalize_zip5(&z)),
        payer_name: text(&mapping.payer_name).map(|p| normalize_payer_name(&p)),
        negotiated_rate: money(&mapping.negotiated_rate),
        min_negotiated_rate: money(&mapping.min_negotiated_rate),
        max_negotiated_rate: money(&mapping.max_negotiated_rate),
        standard_charge: money(&mapping.standard_charge),
        cash_price: money(&mapping.cash_price),
        provenance: source.to_string(),
        confidence: 0.0,
        issues: Vec::new(),
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_to_money(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_money(s),
        _ => None,
    }
}

/// Parse a dollar amount as written in transparency files: currency
/// symbols and thousands separators stripped, anything else unparseable
/// treated as absent.
pub fn parse_money(raw: &str) -> Option<f64> {
    let cleaned = raw.replace(['$', ','], "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Pull a CPT or HCPCS code out of free text, numeric form preferred.
pub fn extract_cpt(text: &str) -> Option<String> {
    if let Some(m) = CPT_NUMERIC.find(text) {
        return Some(m.as_str().to_string());
    }
    CPT_ALPHA.find(text).map(|m| m.as_str().to_string())
}

pub fn normalize_payer_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    for (pattern, canonical) in PAYER_ALIASES {
        if lowered.contains(pattern) {
            return (*canonical).to_string();
        }
    }
    raw.replace(" Inc.", "")
        .replace(" LLC", "")
        .replace(" Corp", "")
        .trim()
        .to_string()
}

/// First five digits of a postal value, if it has at least that many.
pub fn normalize_zip5(raw: &str) -> Option<String> {
    let mut digits = String::with_capacity(5);
    for c in raw.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            if digits.len() == 5 {
                return Some(digits);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::heuristic_mapping;
    use serde_json::json;

    #[test]
    fn money_parsing_handles_transparency_formats() {
        assert_eq!(parse_money("$1,250.00"), Some(1250.0));
        assert_eq!(parse_money(" 423.00 "), Some(423.0));
        assert_eq!(parse_money("1,000,000"), Some(1_000_000.0));
        assert_eq!(parse_money("-42.5"), Some(-42.5));
        assert_eq!(parse_money(""), None);
        assert_eq!(parse_money("N/A"), None);
        assert_eq!(parse_money("$"), None);
    }

    #[test]
    fn payer_aliases_collapse_spelling_variants() {
        assert_eq!(normalize_payer_name("Anthem Blue Cross of CA"), "Blue Cross Blue Shield");
        assert_eq!(normalize_payer_name("BCBS of Texas"), "Blue Cross Blue Shield");
        assert_eq!(normalize_payer_name("United Healthcare West"), "UnitedHealthcare");
        assert_eq!(normalize_payer_name("AETNA INC."), "Aetna");
        assert_eq!(normalize_payer_name("Aetna"), "Aetna");
        assert_eq!(normalize_payer_name("Acme Health LLC"), "Acme Health");
    }

    #[test]
    fn cpt_extraction_prefers_numeric_codes() {
        assert_eq!(extract_cpt("MRI brain 70553 w/ contrast"), Some("70553".into()));
        assert_eq!(extract_cpt("Injection J1100 dexamethasone"), Some("J1100".into()));
        assert_eq!(extract_cpt("no code here"), None);
        // Six digits are not a CPT code.
        assert_eq!(extract_cpt("claim 123456"), None);
    }

    #[test]
    fn zip_codes_truncate_to_five_digits() {
        assert_eq!(normalize_zip5("02115-3301"), Some("02115".into()));
        assert_eq!(normalize_zip5("  90210  "), Some("90210".into()));
        assert_eq!(normalize_zip5("1234"), None);
        assert_eq!(normalize_zip5("none"), None);
    }

    #[test]
    fn record_extraction_applies_the_mapping() {
        let mapping = heuristic_mapping(&[
            "Hospital".to_string(),
            "CPT Code".to_string(),
            "Payer".to_string(),
            "Negotiated Rate".to_string(),
            "Gross Charge".to_string(),
            "State".to_string(),
        ]);
        let mut row = RawRecord::new();
        row.insert("Hospital".into(), json!("General Hospital"));
        row.insert("CPT Code".into(), json!("70553"));
        row.insert("Payer".into(), json!("Anthem Blue Cross"));
        row.insert("Negotiated Rate".into(), json!("$1,250.00"));
        row.insert("Gross Charge".into(), json!(2100.5));
        row.insert("State".into(), json!("ma"));

        let record = extract_record(&row, &mapping, "general.csv");
        assert_eq!(record.cpt_code.as_deref(), Some("70553"));
        assert_eq!(record.provider_name.as_deref(), Some("General Hospital"));
        assert_eq!(record.payer_name.as_deref(), Some("Blue Cross Blue Shield"));
        assert_eq!(record.negotiated_rate, Some(1250.0));
        assert_eq!(record.standard_charge, Some(2100.5));
        assert_eq!(record.provider_state.as_deref(), Some("MA"));
        assert_eq!(record.provenance, "general.csv");
        assert!(record.issues.is_empty());
    }

    #[test]
    fn missing_code_falls_back_to_description_text() {
        let mapping = heuristic_mapping(&["Description".to_string(), "Price".to_string()]);
        let mut row = RawRecord::new();
        row.insert("Description".into(), json!("CT Abdomen 74178 with dye"));
        row.insert("Price".into(), json!("980"));

        let record = extract_record(&row, &mapping, "x.csv");
        assert_eq!(record.cpt_code.as_deref(), Some("74178"));
        assert_eq!(record.negotiated_rate, Some(980.0));
    }

    #[test]
    fn empty_and_unparseable_cells_become_none() {
        let mapping = heuristic_mapping(&["CPT Code".to_string(), "Negotiated Rate".to_string()]);
        let mut row = RawRecord::new();
        row.insert("CPT Code".into(), json!("   "));
        row.insert("Negotiated Rate".into(), json!("call for pricing"));

        let record = extract_record(&row, &mapping, "x.csv");
        assert_eq!(record.cpt_code, None);
        assert_eq!(record.negotiated_rate, None);
    }
}
