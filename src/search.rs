//! Google Programmable Search client. Supplies the web evidence behind
//! search-derived estimates and code-match consensus rounds.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::clients::{SearchHit, SearchProvider};

const CSE_URL: &str = "https://www.googleapis.com/customsearch/v1";
/// The CSE API returns at most 10 results per request.
const CSE_MAX_RESULTS: usize = 10;
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GoogleSearchClient {
    client: reqwest::Client,
    api_key: String,
    cse_id: String,
}

impl GoogleSearchClient {
    pub fn new(api_key: String, cse_id: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .context("Failed to build search HTTP client")?;
        Ok(Self {
            client,
            api_key,
            cse_id,
        })
    }

    /// Build from `GOOGLE_API_KEY` and `GOOGLE_CSE_ID`. Returns `None` when
    /// either is unset, in which case search-backed tiers stay disabled.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY").ok()?;
        let cse_id = std::env::var("GOOGLE_CSE_ID").ok()?;
        Self::new(api_key, cse_id).ok()
    }
}

#[async_trait]
impl SearchProvider for GoogleSearchClient {
    fn engine_name(&self) -> &str {
        "Google Programmable Search"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let num = limit.clamp(1, CSE_MAX_RESULTS);
        let response = self
            .client
            .get(CSE_URL)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cse_id.as_str()),
                ("q", query),
                ("num", &num.to_string()),
            ])
            .send()
            .await
            .context("Search request failed")?;
        // Quota exhaustion and bad CSE configs come back as 4xx. Treat them
        // as "no results" so the resolver can fall through to the next tier.
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "Search API returned an error status");
            return Ok(Vec::new());
        }
        let body: SearchResponse = response
            .json()
            .await
            .context("Search API returned invalid JSON")?;
        Ok(body
            .items
            .into_iter()
            .map(|item| SearchHit {
                title: item.title,
                url: item.link,
                snippet: item.snippet,
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
}
