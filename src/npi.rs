//! NPPES NPI registry client. Looks up provider organizations by city and
//! state so the resolver can derive regional rates when the local store has
//! no rows for a code.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::clients::{ProviderRegistry, RegistryProvider};
use crate::extract::normalize_zip5;

const NPPES_URL: &str = "https://npiregistry.cms.hhs.gov/api/";
const NPPES_VERSION: &str = "2.1";
/// NPPES rejects page sizes above 200.
const NPPES_MAX_LIMIT: usize = 200;
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NpiRegistryClient {
    client: reqwest::Client,
}

impl NpiRegistryClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()
            .context("Failed to build NPPES HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProviderRegistry for NpiRegistryClient {
    async fn find_organizations(
        &self,
        city: &str,
        state: &str,
        limit: usize,
    ) -> Result<Vec<RegistryProvider>> {
        let limit = limit.clamp(1, NPPES_MAX_LIMIT);
        let response = self
            .client
            .get(NPPES_URL)
            .query(&[
                ("version", NPPES_VERSION),
                ("city", city),
                ("state", state),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await
            .context("NPPES request failed")?
            .error_for_status()
            .context("NPPES returned an error status")?;
        let body: Value = response
            .json()
            .await
            .context("NPPES returned invalid JSON")?;
        Ok(extract_organizations(&body))
    }
}

/// Pull organizational providers (NPI-2) out of an NPPES response body.
/// Individual providers and records without an organization name are skipped.
fn extract_organizations(body: &Value) -> Vec<RegistryProvider> {
    body.get("results")
        .and_then(Value::as_array)
        .map(|results| results.iter().filter_map(extract_organization).collect())
        .unwrap_or_default()
}

fn extract_organization(entry: &Value) -> Option<RegistryProvider> {
    if entry.get("enumeration_type").and_then(Value::as_str) != Some("NPI-2") {
        return None;
    }
    let name = entry
        .pointer("/basic/organization_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();
    let npi = match entry.get("number") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    // Prefer the practice location over the mailing address.
    let addresses = entry.get("addresses").and_then(Value::as_array);
    let location = addresses.and_then(|addrs| {
        addrs
            .iter()
            .find(|a| a.get("address_purpose").and_then(Value::as_str) == Some("LOCATION"))
            .or_else(|| addrs.first())
    });
    let field = |key: &str| {
        location
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Some(RegistryProvider {
        npi,
        name,
        city: field("city"),
        state: field("state"),
        zip: field("postal_code").and_then(|z| normalize_zip5(&z)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_body() -> Value {
        json!({
            "result_count": 3,
            "results": [
                {
                    "enumeration_type": "NPI-2",
                    "number": "1234567890",
                    "basic": { "organization_name": "Boston General Hospital" },
                    "addresses": [
                        {
                            "address_purpose": "MAILING",
                            "city": "SOMERVILLE",
                            "state": "MA",
                            "postal_code": "02144"
                        },
                        {
                            "address_purpose": "LOCATION",
                            "city": "BOSTON",
                            "state": "MA",
                            "postal_code": "021150001"
                        }
                    ]
                },
                {
                    "enumeration_type": "NPI-1",
                    "number": "1111111111",
                    "basic": { "first_name": "Jane", "last_name": "Doe" }
                },
                {
                    "enumeration_type": "NPI-2",
                    "number": 1987654321u64,
                    "basic": { "organization_name": "  " }
                }
            ]
        })
    }

    #[test]
    fn keeps_only_named_organizations() {
        let providers = extract_organizations(&sample_body());
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name, "Boston General Hospital");
        assert_eq!(providers[0].npi.as_deref(), Some("1234567890"));
    }

    #[test]
    fn prefers_location_address_and_trims_zip() {
        let providers = extract_organizations(&sample_body());
        assert_eq!(providers[0].city.as_deref(), Some("BOSTON"));
        assert_eq!(providers[0].state.as_deref(), Some("MA"));
        assert_eq!(providers[0].zip.as_deref(), Some("02115"));
    }

    #[test]
    fn numeric_npi_is_stringified() {
        let body = json!({
            "results": [{
                "enumeration_type": "NPI-2",
                "number": 1222333444u64,
                "basic": { "organization_name": "Valley Clinic" }
            }]
        });
        let providers = extract_organizations(&body);
        assert_eq!(providers[0].npi.as_deref(), Some("1222333444"));
        assert!(providers[0].city.is_none());
    }

    #[test]
    fn malformed_body_yields_nothing() {
        assert!(extract_organizations(&json!({"error": "rate limited"})).is_empty());
        assert!(extract_organizations(&json!({"results": "not-an-array"})).is_empty());
    }
}
