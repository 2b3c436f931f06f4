//! Free-text to CPT code matching. Known procedure descriptions are tried
//! first with keyword-overlap scoring; when the local table cannot answer,
//! several independent search rounds vote and only codes seen in multiple
//! rounds survive. Results are cached per normalized query so identical
//! lookups stay reproducible even though the searches underneath are not.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::{KvCache, NS_MATCHES};
use crate::clients::SearchProvider;
use crate::store::PriceStore;

static CODE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{5}\b").expect("static regex"));

pub const DEFAULT_MATCH_LIMIT: usize = 5;
pub const MAX_MATCH_LIMIT: usize = 25;

/// Local matches below this similarity are noise, not candidates.
const FUZZY_SCORE_FLOOR: f64 = 0.3;
/// Local matches needed to skip the search rounds entirely.
const FUZZY_FAST_PATH_MIN: usize = 3;
/// Rounds a code must appear in before it is believed.
const CONSENSUS_ROUNDS_REQUIRED: usize = 2;
const SEARCH_RESULTS_PER_ROUND: usize = 10;

/// Codes confirmed by the procedure table outrank ones we only saw in
/// search results.
const KNOWN_CODE_SCORE: f64 = 0.7;
const UNKNOWN_CODE_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeMatch {
    pub cpt_code: String,
    pub description: String,
    pub score: f64,
}

pub struct CodeMatcher {
    store: Arc<PriceStore>,
    cache: Arc<KvCache>,
    search: Option<Arc<dyn SearchProvider>>,
}

impl CodeMatcher {
    pub fn new(store: Arc<PriceStore>, cache: Arc<KvCache>) -> Self {
        Self {
            store,
            cache,
            search: None,
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    pub async fn match_codes(&self, query: &str, limit: usize) -> Result<Vec<CodeMatch>> {
        let limit = limit.clamp(1, MAX_MATCH_LIMIT);
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }

        let cache_key = format!("{normalized}|{limit}");
        if let Some(raw) = self.cache.get(NS_MATCHES, &cache_key)? {
            if let Ok(matches) = serde_json::from_str::<Vec<CodeMatch>>(&raw) {
                tracing::debug!(query = %normalized, "Code match served from cache");
                return Ok(matches);
            }
        }

        let local = self.local_matches(&normalized)?;
        if local.len() >= FUZZY_FAST_PATH_MIN {
            let mut matches = local;
            matches.truncate(limit);
            self.cache
                .put(NS_MATCHES, &cache_key, &serde_json::to_string(&matches)?)?;
            return Ok(matches);
        }

        let consensus = self.consensus_matches(&normalized).await;
        let mut matches = local;
        let mut seen: HashSet<String> =
            matches.iter().map(|m| m.cpt_code.clone()).collect();
        for candidate in consensus {
            if seen.insert(candidate.cpt_code.clone()) {
                matches.push(candidate);
            }
        }
        matches.truncate(limit);

        // An empty answer may just be a search outage; caching it would pin
        // emptiness for the query forever.
        if !matches.is_empty() {
            self.cache
                .put(NS_MATCHES, &cache_key, &serde_json::to_string(&matches)?)?;
        }
        Ok(matches)
    }

    /// Score every known procedure description against the query and keep
    /// plausible matches, best first.
    fn local_matches(&self, query: &str) -> Result<Vec<CodeMatch>> {
        let mut matches = Vec::new();
        for procedure in self.store.all_procedures()? {
            let score = description_similarity(query, &procedure.description);
            if score >= FUZZY_SCORE_FLOOR {
                matches.push(CodeMatch {
                    cpt_code: procedure.cpt_code,
                    description: procedure.description,
                    score,
                });
            }
        }
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.cpt_code.cmp(&b.cpt_code))
        });
        Ok(matches)
    }

    /// Three differently phrased searches vote on candidate codes. A code
    /// counts once per round no matter how often the round mentions it.
    async fn consensus_matches(&self, query: &str) -> Vec<CodeMatch> {
        let Some(search) = &self.search else {
            return Vec::new();
        };

        let phrasings = [
            format!("{query} CPT code"),
            format!("CPT code for {query}"),
            format!("{query} procedure billing code"),
        ];
        let rounds = join_all(
            phrasings
                .iter()
                .map(|phrasing| search.search(phrasing, SEARCH_RESULTS_PER_ROUND)),
        )
        .await;

        let mut rounds_seen: HashMap<String, usize> = HashMap::new();
        let mut descriptions: HashMap<String, String> = HashMap::new();
        for round in rounds {
            let hits = match round {
                Ok(hits) => hits,
                Err(err) => {
                    tracing::warn!(error = %err, "Search round failed during code match");
                    continue;
                }
            };
            let mut codes_this_round = BTreeSet::new();
            for hit in &hits {
                let text = format!("{} {}", hit.title, hit.snippet);
                for token in CODE_TOKEN.find_iter(&text) {
                    let code = token.as_str().to_string();
                    if codes_this_round.insert(code.clone()) {
                        descriptions.entry(code).or_insert_with(|| hit.title.clone());
                    }
                }
            }
            for code in codes_this_round {
                *rounds_seen.entry(code).or_insert(0) += 1;
            }
        }

        let mut matches = Vec::new();
        for (code, seen) in rounds_seen {
            if seen < CONSENSUS_ROUNDS_REQUIRED {
                continue;
            }
            let candidate = match self.store.procedure(&code) {
                Ok(Some(procedure)) => CodeMatch {
                    cpt_code: code,
                    description: procedure.description,
                    score: KNOWN_CODE_SCORE,
                },
                Ok(None) => {
                    let description = descriptions
                        .get(&code)
                        .cloned()
                        .unwrap_or_else(|| format!("Procedure {code}"));
                    CodeMatch {
                        cpt_code: code,
                        description,
                        score: UNKNOWN_CODE_SCORE,
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, code, "Procedure lookup failed during code match");
                    continue;
                }
            };
            matches.push(candidate);
        }
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.cpt_code.cmp(&b.cpt_code))
        });
        matches
    }
}

/// Trimmed, lowercased, inner whitespace collapsed. The cache key must not
/// distinguish "MRI  brain" from "mri brain".
pub fn normalize_query(query: &str) -> String {
    query
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keyword overlap over the query words plus a bonus when the whole query
/// appears verbatim in the description, capped at 1.0. Tokens split on
/// punctuation so "MRI, Brain" still matches a query for "mri".
pub fn description_similarity(query: &str, description: &str) -> f64 {
    let query_lower = query.to_lowercase();
    let query_words = words(&query_lower);
    if query_words.is_empty() {
        return 0.0;
    }
    let description_lower = description.to_lowercase();
    let description_words = words(&description_lower);

    let overlap = query_words.intersection(&description_words).count();
    let mut score = overlap as f64 / query_words.len() as f64;
    if description_lower.contains(&query_lower) {
        score = (score + 0.3).min(1.0);
    }
    score
}

fn words(text: &str) -> HashSet<&str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{SearchHit, StubSearch};

    fn hit(title: &str, snippet: &str) -> SearchHit {
        SearchHit {
            title: title.to_string(),
            url: "https://example.com".to_string(),
            snippet: snippet.to_string(),
        }
    }

    fn matcher_with(search: Option<Arc<StubSearch>>) -> (CodeMatcher, Arc<PriceStore>) {
        let store = Arc::new(PriceStore::open_in_memory().unwrap());
        let cache = Arc::new(KvCache::open_in_memory().unwrap());
        let mut matcher = CodeMatcher::new(store.clone(), cache);
        if let Some(search) = search {
            matcher = matcher.with_search(search);
        }
        (matcher, store)
    }

    #[test]
    fn similarity_rewards_overlap_and_exact_phrase() {
        assert_eq!(description_similarity("mri", "MRI, Brain with and without Contrast"), 1.0);
        // One of two words overlaps, no phrase bonus.
        assert_eq!(description_similarity("cardiac stress", "Cardiovascular Stress Test"), 0.5);
        assert_eq!(description_similarity("colonoscopy", "Colonoscopy"), 1.0);
        assert_eq!(description_similarity("dialysis", "Colonoscopy"), 0.0);
        assert_eq!(description_similarity("", "anything"), 0.0);
    }

    #[test]
    fn query_normalization_collapses_case_and_whitespace() {
        assert_eq!(normalize_query("  MRI   Brain  "), "mri brain");
        assert_eq!(normalize_query("mri brain"), "mri brain");
        assert_eq!(normalize_query("   "), "");
    }

    #[tokio::test]
    async fn seeded_descriptions_answer_without_searching() {
        let search = Arc::new(StubSearch::fixed(vec![hit("CPT 99999", "99999")]));
        let (matcher, _) = matcher_with(Some(search.clone()));

        let matches = matcher.match_codes("MRI", 3).await.unwrap();
        assert_eq!(matches.len(), 3);
        // Four seeded MRI procedures all score 1.0; ties break by code.
        assert_eq!(matches[0].cpt_code, "70553");
        assert_eq!(matches[1].cpt_code, "72148");
        assert_eq!(matches[2].cpt_code, "73221");
        assert!(matches.iter().all(|m| m.score == 1.0));
        assert_eq!(search.calls(), 0);
    }

    #[tokio::test]
    async fn consensus_keeps_codes_seen_in_two_of_three_rounds() {
        let search = Arc::new(StubSearch::scripted(vec![
            vec![
                hit("Sleep study CPT 95810 explained", "Polysomnography is billed as 95810."),
                hit("Unrelated billing page", "Code 11111 appears only this once."),
            ],
            vec![hit("CPT code 95810", "Overnight sleep study 95810 pricing.")],
            vec![hit("Hospital billing", "No codes quoted here.")],
        ]));
        let (matcher, _) = matcher_with(Some(search.clone()));

        let matches = matcher.match_codes("sleep study overnight", 5).await.unwrap();
        assert_eq!(search.calls(), 3);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].cpt_code, "95810");
        // Not in the procedure table, so the description comes from the hit.
        assert_eq!(matches[0].score, UNKNOWN_CODE_SCORE);
        assert_eq!(matches[0].description, "Sleep study CPT 95810 explained");
    }

    #[tokio::test]
    async fn known_codes_outrank_unknown_consensus_codes() {
        // 93000 is seeded (Electrocardiogram); 12345 is not.
        let round = vec![hit("EKG codes", "Use 93000 or sometimes 12345.")];
        let search = Arc::new(StubSearch::scripted(vec![
            round.clone(),
            round.clone(),
            Vec::new(),
        ]));
        let (matcher, _) = matcher_with(Some(search));

        let matches = matcher.match_codes("electrocardiograph tracing", 5).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].cpt_code, "93000");
        assert_eq!(matches[0].score, KNOWN_CODE_SCORE);
        assert_eq!(matches[0].description, "Electrocardiogram (ECG/EKG)");
        assert_eq!(matches[1].cpt_code, "12345");
        assert_eq!(matches[1].score, UNKNOWN_CODE_SCORE);
    }

    #[tokio::test]
    async fn local_partial_matches_lead_and_consensus_fills_behind() {
        // "cardiac stress" matches exactly two seeded rows, one short of the
        // fast path, so the search rounds still run and append new codes.
        let round = vec![hit("Stress testing", "Often billed with 93000.")];
        let search = Arc::new(StubSearch::scripted(vec![
            round.clone(),
            round.clone(),
            Vec::new(),
        ]));
        let (matcher, _) = matcher_with(Some(search.clone()));

        let matches = matcher.match_codes("cardiac stress", 5).await.unwrap();
        assert_eq!(search.calls(), 3);
        let codes: Vec<&str> = matches.iter().map(|m| m.cpt_code.as_str()).collect();
        // Local fuzzy matches stay in front of consensus additions.
        assert_eq!(codes, vec!["93015", "93454", "93000"]);
        assert_eq!(matches[0].score, 0.5);
        assert_eq!(matches[2].score, KNOWN_CODE_SCORE);
    }

    #[tokio::test]
    async fn repeat_queries_come_from_the_cache() {
        let search = Arc::new(StubSearch::fixed(vec![hit(
            "Sleep study CPT 95810",
            "Overnight polysomnography 95810.",
        )]));
        let (matcher, _) = matcher_with(Some(search.clone()));

        let first = matcher.match_codes("sleep study", 5).await.unwrap();
        assert_eq!(search.calls(), 3);

        // Same query, normalized differently: no further search calls.
        let second = matcher.match_codes("  Sleep   STUDY ", 5).await.unwrap();
        assert_eq!(search.calls(), 3);
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].cpt_code, second[0].cpt_code);

        // A different limit is a different cache entry.
        let third = matcher.match_codes("sleep study", 1).await.unwrap();
        assert_eq!(search.calls(), 6);
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let search = Arc::new(StubSearch::scripted(Vec::new()));
        let (matcher, _) = matcher_with(Some(search.clone()));

        let matches = matcher.match_codes("qq zz xx", 5).await.unwrap();
        assert!(matches.is_empty());
        assert_eq!(search.calls(), 3);

        // The outage is not pinned: the next identical query searches again.
        let matches = matcher.match_codes("qq zz xx", 5).await.unwrap();
        assert!(matches.is_empty());
        assert_eq!(search.calls(), 6);
    }

    #[tokio::test]
    async fn no_search_provider_still_answers_locally() {
        let (matcher, _) = matcher_with(None);
        let matches = matcher.match_codes("colonoscopy", 5).await.unwrap();
        assert!(!matches.is_empty());
        assert!(matches.iter().any(|m| m.cpt_code == "45378"));

        let nothing = matcher.match_codes("xyzzy", 5).await.unwrap();
        assert!(nothing.is_empty());
    }

    #[tokio::test]
    async fn blank_queries_short_circuit() {
        let (matcher, _) = matcher_with(None);
        assert!(matcher.match_codes("   ", 5).await.unwrap().is_empty());
    }
}
