//! HTTP surface over the price store: health, stats, price resolution and
//! code matching. Collaborators come from the environment; whatever is
//! missing just disables its tier.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::KvCache;
use crate::cli::ServeArgs;
use crate::clients::SearchProvider;
use crate::llm::OpenRouterClient;
use crate::matcher::{CodeMatcher, DEFAULT_MATCH_LIMIT};
use crate::npi::NpiRegistryClient;
use crate::resolve::{DEFAULT_RESULT_LIMIT, PriceQuery, Resolver};
use crate::search::GoogleSearchClient;
use crate::storage::StoragePaths;
use crate::store::PriceStore;

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub matcher: Arc<CodeMatcher>,
    pub store: Arc<PriceStore>,
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    paths.ensure_dirs()?;
    let store = Arc::new(
        PriceStore::open(&paths.store_path)
            .with_context(|| format!("open price store at {}", paths.store_path.display()))?,
    );
    let cache = Arc::new(KvCache::open(&paths.cache_path)?);

    let mut resolver =
        Resolver::new(store.clone()).with_registry(Arc::new(NpiRegistryClient::new()?));
    let mut matcher = CodeMatcher::new(store.clone(), cache);
    match GoogleSearchClient::from_env() {
        Some(search) => {
            let search: Arc<dyn SearchProvider> = Arc::new(search);
            resolver = resolver.with_search(search.clone());
            matcher = matcher.with_search(search);
        }
        None => {
            tracing::info!("GOOGLE_API_KEY/GOOGLE_CSE_ID not set; search tier disabled");
        }
    }
    match OpenRouterClient::from_env() {
        Some(completer) => resolver = resolver.with_completer(Arc::new(completer)),
        None => tracing::info!("OPENROUTER_API_KEY not set; estimate refinement disabled"),
    }

    let state = AppState {
        resolver: Arc::new(resolver),
        matcher: Arc::new(matcher),
        store,
    };
    serve(state, &opts.addr).await
}

pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("parse listen address {addr}"))?;
    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/stats", get(api_stats))
        .route("/api/price", get(api_price))
        .route("/api/codes/match", get(api_match_codes))
        .layer(cors)
        .with_state(state)
}

async fn api_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn api_stats(State(st): State<AppState>) -> impl IntoResponse {
    match st.store.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PriceParams {
    code: String,
    payer: Option<String>,
    state: Option<String>,
    city: Option<String>,
    zip: Option<String>,
    limit: Option<usize>,
}

async fn api_price(
    State(st): State<AppState>,
    Query(p): Query<PriceParams>,
) -> impl IntoResponse {
    if p.code.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "code must not be empty".to_string()).into_response();
    }
    let mut query = PriceQuery::new(p.code.trim());
    query.payer_name = p.payer;
    query.state = p.state;
    query.city = p.city;
    query.zip = p.zip;
    query.limit = p.limit.unwrap_or(DEFAULT_RESULT_LIMIT);

    match st.resolver.resolve(&query).await {
        Ok(resolution) => Json(resolution).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MatchParams {
    q: String,
    limit: Option<usize>,
}

async fn api_match_codes(
    State(st): State<AppState>,
    Query(p): Query<MatchParams>,
) -> impl IntoResponse {
    if p.q.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "q must not be empty".to_string()).into_response();
    }
    match st
        .matcher
        .match_codes(&p.q, p.limit.unwrap_or(DEFAULT_MATCH_LIMIT))
        .await
    {
        Ok(matches) => Json(matches).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
