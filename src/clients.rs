use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Language-model completion endpoint.
#[async_trait]
pub trait TextCompleter: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String>;
}

/// One web search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Web search endpoint. `engine_name` feeds provenance strings.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn engine_name(&self) -> &str;
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

/// An organization returned by a provider registry lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryProvider {
    pub npi: Option<String>,
    pub name: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

/// Provider registry lookup by location.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn find_organizations(
        &self,
        city: &str,
        state: &str,
        limit: usize,
    ) -> Result<Vec<RegistryProvider>>;
}

// Deterministic in-memory collaborators. Used by tests throughout, and
// handy for running the pipeline offline. Each counts its calls so tests
// can assert which tiers actually reached the network seam.

pub struct StubCompleter {
    replies: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl StubCompleter {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextCompleter for StubCompleter {
    async fn complete(&self, _prompt: &str, _temperature: f32, _max_tokens: u32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut replies = self
            .replies
            .lock()
            .map_err(|_| anyhow!("stub completer poisoned"))?;
        replies
            .pop_front()
            .ok_or_else(|| anyhow!("stub completer has no replies left"))
    }
}

pub struct StubSearch {
    rounds: Mutex<VecDeque<Vec<SearchHit>>>,
    fallback: Vec<SearchHit>,
    calls: AtomicUsize,
}

impl StubSearch {
    /// Same hits on every call.
    pub fn fixed(hits: Vec<SearchHit>) -> Self {
        Self {
            rounds: Mutex::new(VecDeque::new()),
            fallback: hits,
            calls: AtomicUsize::new(0),
        }
    }

    /// One hit set per call, in order, then empty results.
    pub fn scripted(rounds: Vec<Vec<SearchHit>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            fallback: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for StubSearch {
    fn engine_name(&self) -> &str {
        "Stub Search"
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut rounds = self
            .rounds
            .lock()
            .map_err(|_| anyhow!("stub search poisoned"))?;
        Ok(rounds.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
}

pub struct StubRegistry {
    providers: Vec<RegistryProvider>,
    fail: bool,
    calls: AtomicUsize,
}

impl StubRegistry {
    pub fn new(providers: Vec<RegistryProvider>) -> Self {
        Self {
            providers,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// A registry whose lookups always error.
    pub fn failing() -> Self {
        Self {
            providers: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderRegistry for StubRegistry {
    async fn find_organizations(
        &self,
        _city: &str,
        _state: &str,
        limit: usize,
    ) -> Result<Vec<RegistryProvider>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("stub registry unavailable"));
        }
        Ok(self.providers.iter().take(limit).cloned().collect())
    }
}
