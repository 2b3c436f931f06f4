use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{self, KvCache};
use crate::clients::TextCompleter;
use crate::reader::{RawRecord, Sample};

/// Standard schema the extractor maps every source file onto.
pub const STANDARD_FIELDS: [&str; 13] = [
    "provider_name",
    "provider_npi",
    "provider_city",
    "provider_state",
    "provider_zip",
    "cpt_code",
    "procedure_description",
    "payer_name",
    "negotiated_rate",
    "min_negotiated_rate",
    "max_negotiated_rate",
    "standard_charge",
    "cash_price",
];

/// Substring patterns tried per standard field when mapping heuristically.
/// Both sides are compared lowercased with underscores and spaces removed,
/// and the first source field matching any pattern wins.
const FIELD_PATTERNS: &[(&str, &[&str])] = &[
    ("provider_name", &["hospital", "facility", "provider", "name"]),
    ("provider_npi", &["npi", "provider_id", "national_provider"]),
    ("provider_city", &["city"]),
    ("provider_state", &["state"]),
    ("provider_zip", &["zip", "postal"]),
    ("cpt_code", &["cpt", "code", "procedure_code", "hcpcs"]),
    ("procedure_description", &["description", "procedure", "service"]),
    ("payer_name", &["payer", "insurance", "carrier", "plan"]),
    ("negotiated_rate", &["negotiated", "rate", "amount", "price"]),
    ("min_negotiated_rate", &["min", "minimum"]),
    ("max_negotiated_rate", &["max", "maximum"]),
    ("standard_charge", &["standard", "gross", "charge", "list_price"]),
    ("cash_price", &["cash", "self_pay", "discounted"]),
];

/// Records shown verbatim in the inference prompt.
const PROMPT_RECORDS: usize = 3;
const MAPPING_TEMPERATURE: f32 = 0.1;
const MAPPING_MAX_TOKENS: u32 = 500;

/// Standard field -> source field, `None` where the file has no match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMapping {
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub provider_npi: Option<String>,
    #[serde(default)]
    pub provider_city: Option<String>,
    #[serde(default)]
    pub provider_state: Option<String>,
    #[serde(default)]
    pub provider_zip: Option<String>,
    #[serde(default)]
    pub cpt_code: Option<String>,
    #[serde(default)]
    pub procedure_description: Option<String>,
    #[serde(default)]
    pub payer_name: Option<String>,
    #[serde(default)]
    pub negotiated_rate: Option<String>,
    #[serde(default)]
    pub min_negotiated_rate: Option<String>,
    #[serde(default)]
    pub max_negotiated_rate: Option<String>,
    #[serde(default)]
    pub standard_charge: Option<String>,
    #[serde(default)]
    pub cash_price: Option<String>,
}

impl SchemaMapping {
    fn set(&mut self, standard: &str, source: String) {
        let slot = match standard {
            "provider_name" => &mut self.provider_name,
            "provider_npi" => &mut self.provider_npi,
            "provider_city" => &mut self.provider_city,
            "provider_state" => &mut self.provider_state,
            "provider_zip" => &mut self.provider_zip,
            "cpt_code" => &mut self.cpt_code,
            "procedure_description" => &mut self.procedure_description,
            "payer_name" => &mut self.payer_name,
            "negotiated_rate" => &mut self.negotiated_rate,
            "min_negotiated_rate" => &mut self.min_negotiated_rate,
            "max_negotiated_rate" => &mut self.max_negotiated_rate,
            "standard_charge" => &mut self.standard_charge,
            "cash_price" => &mut self.cash_price,
            _ => return,
        };
        *slot = Some(source);
    }

    pub fn mapped_count(&self) -> usize {
        [
            &self.provider_name,
            &self.provider_npi,
            &self.provider_city,
            &self.provider_state,
            &self.provider_zip,
            &self.cpt_code,
            &self.procedure_description,
            &self.payer_name,
            &self.negotiated_rate,
            &self.min_negotiated_rate,
            &self.max_negotiated_rate,
            &self.standard_charge,
            &self.cash_price,
        ]
        .iter()
        .filter(|slot| slot.is_some())
        .count()
    }
}

/// Resolve the mapping for a file, cheapest source first: cache by
/// fingerprint, then the language model, then field-name heuristics.
/// The winner is cached before being returned.
pub async fn infer_mapping(
    cache: &KvCache,
    completer: Option<&dyn TextCompleter>,
    fingerprint: &str,
    sample: &Sample,
) -> Result<SchemaMapping> {
    if let Some(raw) = cache.get(cache::NS_SCHEMA, fingerprint)? {
        if let Ok(mapping) = serde_json::from_str::<SchemaMapping>(&raw) {
            tracing::debug!(fingerprint, "Schema mapping served from cache");
            return Ok(mapping);
        }
    }

    let mapping = match completer {
        Some(model) => {
            let prompt = inference_prompt(sample);
            match model
                .complete(&prompt, MAPPING_TEMPERATURE, MAPPING_MAX_TOKENS)
                .await
            {
                Ok(reply) => match parse_model_mapping(&reply) {
                    Some(mapping) => {
                        tracing::info!(mapped = mapping.mapped_count(), "Schema mapped by model");
                        mapping
                    }
                    None => {
                        tracing::warn!("Model reply was not a usable mapping, falling back to heuristics");
                        heuristic_mapping(&sample.fields)
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "Completion failed, falling back to heuristics");
                    heuristic_mapping(&sample.fields)
                }
            }
        }
        None => heuristic_mapping(&sample.fields),
    };

    let encoded = serde_json::to_string(&mapping)?;
    cache.put(cache::NS_SCHEMA, fingerprint, &encoded)?;
    Ok(mapping)
}

/// Map by field-name similarity alone. Source fields are scanned in file
/// order, so the earliest plausible column claims each standard field.
pub fn heuristic_mapping(fields: &[String]) -> SchemaMapping {
    let cleaned: Vec<(String, &String)> =
        fields.iter().map(|f| (clean_field_name(f), f)).collect();
    let mut mapping = SchemaMapping::default();
    for (standard, patterns) in FIELD_PATTERNS {
        let hit = cleaned.iter().find(|(clean, _)| {
            patterns
                .iter()
                .any(|pattern| clean.contains(&clean_field_name(pattern)))
        });
        if let Some((_, source)) = hit {
            mapping.set(standard, (*source).clone());
        }
    }
    mapping
}

fn clean_field_name(name: &str) -> String {
    name.to_lowercase().replace(['_', ' '], "")
}

pub fn inference_prompt(sample: &Sample) -> String {
    let shown: Vec<&RawRecord> = sample.records.iter().take(PROMPT_RECORDS).collect();
    let rows = serde_json::to_string_pretty(&shown).unwrap_or_else(|_| "[]".to_string());
    format!(
        "Map the columns of a hospital price transparency file onto a standard schema.\n\n\
         Source fields (in file order): {:?}\n\n\
         Sample rows:\n{}\n\n\
         Standard fields: {}\n\n\
         Respond with ONLY a JSON object keyed by standard field name, where each value \
         is the matching source field name or null when nothing fits.",
        sample.fields,
        rows,
        STANDARD_FIELDS.join(", "),
    )
}

/// Parse a model reply into a mapping. Markdown fencing is tolerated;
/// anything that is not a JSON object is rejected.
pub fn parse_model_mapping(reply: &str) -> Option<SchemaMapping> {
    let cleaned = clean_model_json(reply);
    let value: Value = serde_json::from_str(&cleaned).ok()?;
    let object = value.as_object()?;
    let mut mapping = SchemaMapping::default();
    for standard in STANDARD_FIELDS {
        let source = object
            .get(standard)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(source) = source {
            mapping.set(standard, source.to_string());
        }
    }
    Some(mapping)
}

/// Strip a surrounding markdown fence and a stray leading "json" tag.
pub fn clean_model_json(reply: &str) -> String {
    let mut text = reply.trim().to_string();
    if text.starts_with("```") {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() >= 2 {
            text = lines[1..lines.len() - 1].join("\n");
        }
    }
    let trimmed = text.trim();
    match trimmed.strip_prefix("json") {
        Some(rest) => rest.trim().to_string(),
        None => trimmed.to_string(),
    }
}
