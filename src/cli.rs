use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use crate::cache::KvCache;
use crate::clients::TextCompleter;
use crate::ingest::{DEFAULT_CHUNK_SIZE, IngestOptions, ingest_file};
use crate::llm::OpenRouterClient;
use crate::matcher::{CodeMatcher, DEFAULT_MATCH_LIMIT};
use crate::npi::NpiRegistryClient;
use crate::resolve::{
    DEFAULT_RESULT_LIMIT, PriceQuery, Resolution, ResolutionTier, Resolver,
};
use crate::search::GoogleSearchClient;
use crate::storage::{StoragePaths, file_present_nonempty};
use crate::store::PriceStore;

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

#[derive(Parser, Debug)]
#[command(name = "chargemaster")]
#[command(about = "Hospital price transparency ingestion and price lookup", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest a transparency file (JSON, CSV or ZIP) into the price store.
    Ingest(IngestArgs),
    /// Resolve the best available price for a CPT code.
    Query(QueryArgs),
    /// Map a free-text procedure description to CPT codes.
    MatchCodes(MatchCodesArgs),
    /// Export every stored price record to CSV.
    Export(ExportArgs),
    /// Serve the HTTP API.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct IngestArgs {
    /// Transparency file to ingest.
    #[arg(long)]
    pub input: PathBuf,

    /// Data directory (price store, caches, scratch space).
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    /// Rows per extraction batch.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
}

#[derive(clap::Args, Debug, Clone)]
pub struct QueryArgs {
    /// CPT code to price.
    #[arg(long)]
    pub code: String,

    /// Payer name filter (substring match).
    #[arg(long)]
    pub payer: Option<String>,

    /// Two-letter state filter.
    #[arg(long)]
    pub state: Option<String>,

    /// City filter (prefix match).
    #[arg(long)]
    pub city: Option<String>,

    /// ZIP code filter (exact match).
    #[arg(long)]
    pub zip: Option<String>,

    /// Maximum price records to return.
    #[arg(long, default_value_t = DEFAULT_RESULT_LIMIT)]
    pub limit: usize,

    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct MatchCodesArgs {
    /// Free-text procedure description, e.g. "mri brain".
    #[arg(long)]
    pub query: String,

    /// Maximum matches to return.
    #[arg(long, default_value_t = DEFAULT_MATCH_LIMIT)]
    pub limit: usize,

    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ExportArgs {
    /// Output CSV path.
    #[arg(long)]
    pub output: PathBuf,

    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8787")]
    pub addr: String,

    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,
}

pub async fn run_ingest(opts: IngestArgs) -> Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    paths.ensure_dirs()?;
    let store = PriceStore::open(&paths.store_path)?;
    let cache = KvCache::open(&paths.cache_path)?;

    let completer = OpenRouterClient::from_env();
    if completer.is_none() {
        tracing::info!("OPENROUTER_API_KEY not set; schema inference uses heuristics only");
    }

    let options = IngestOptions {
        chunk_size: opts.chunk_size,
        show_progress: true,
        ..IngestOptions::default()
    };
    let outcome = ingest_file(
        &store,
        &cache,
        completer.as_ref().map(|c| c as &dyn TextCompleter),
        &paths,
        &opts.input,
        &options,
    )
    .await?;

    let report = &outcome.report;
    println!("Ingested {} ({})", outcome.file_name, outcome.format.as_str());
    println!("  fingerprint: {}", outcome.fingerprint);
    println!("  mapped fields: {}", outcome.mapping.mapped_count());
    println!(
        "  records: {} total, {} valid, {} flagged ({:.1}% valid)",
        report.total_records,
        report.valid_count,
        report.flagged_count,
        report.valid_rate * 100.0
    );
    println!("  distinct codes: {}", report.distinct_codes);
    if !report.common_issues.is_empty() {
        println!("  issues:");
        for (issue, count) in &report.common_issues {
            println!("    {count:>6}  {issue}");
        }
    }
    Ok(())
}

pub async fn run_query(opts: QueryArgs) -> Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    paths.ensure_dirs()?;
    let store = Arc::new(PriceStore::open(&paths.store_path)?);
    let resolver = build_resolver(store)?;

    let mut query = PriceQuery::new(opts.code.trim());
    query.payer_name = opts.payer;
    query.state = opts.state;
    query.city = opts.city;
    query.zip = opts.zip;
    query.limit = opts.limit;

    let resolution = resolver.resolve(&query).await?;
    print_resolution(&resolution);
    Ok(())
}

pub async fn run_match_codes(opts: MatchCodesArgs) -> Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    paths.ensure_dirs()?;
    let store = Arc::new(PriceStore::open(&paths.store_path)?);
    let cache = Arc::new(KvCache::open(&paths.cache_path)?);

    let mut matcher = CodeMatcher::new(store, cache);
    match GoogleSearchClient::from_env() {
        Some(search) => matcher = matcher.with_search(Arc::new(search)),
        None => tracing::info!("GOOGLE_API_KEY/GOOGLE_CSE_ID not set; local matching only"),
    }

    let matches = matcher.match_codes(&opts.query, opts.limit).await?;
    if matches.is_empty() {
        println!("No CPT codes matched \"{}\"", opts.query);
        return Ok(());
    }
    println!("Matches for \"{}\":", opts.query);
    for m in &matches {
        println!("  {}  score {:.2}  {}", m.cpt_code, m.score, m.description);
    }
    Ok(())
}

pub async fn run_export(opts: ExportArgs) -> Result<()> {
    let paths = StoragePaths::new(&opts.data_dir);
    if !file_present_nonempty(&paths.store_path) {
        bail!(
            "No price store at {}. Run: chargemaster ingest",
            paths.store_path.display()
        );
    }
    let store = PriceStore::open(&paths.store_path)?;
    let written = store.export_csv(&opts.output)?;
    println!("Exported {written} records to {}", opts.output.display());
    Ok(())
}

fn build_resolver(store: Arc<PriceStore>) -> Result<Resolver> {
    let mut resolver = Resolver::new(store).with_registry(Arc::new(NpiRegistryClient::new()?));
    match GoogleSearchClient::from_env() {
        Some(search) => resolver = resolver.with_search(Arc::new(search)),
        None => tracing::info!("GOOGLE_API_KEY/GOOGLE_CSE_ID not set; search tier disabled"),
    }
    if let Some(completer) = OpenRouterClient::from_env() {
        resolver = resolver.with_completer(Arc::new(completer));
    }
    Ok(resolver)
}

fn print_resolution(resolution: &Resolution) {
    let estimate = &resolution.estimate;
    println!(
        "CPT {}  [{}]",
        resolution.query.cpt_code,
        tier_label(resolution.tier)
    );
    println!("  provenance: {}", estimate.provenance);
    if let Some(rate) = estimate.negotiated_rate {
        println!("  negotiated rate: ${rate:.2}");
    }
    if let (Some(min), Some(max)) = (estimate.min_rate, estimate.max_rate) {
        println!("  expected range: ${min:.2} to ${max:.2}");
    }
    if let Some(cash) = estimate.cash_price {
        println!("  cash price: ${cash:.2}");
    }
    if let Some(standard) = estimate.standard_charge {
        println!("  standard charge: ${standard:.2}");
    }
    println!("  confidence: {:.0}%", estimate.confidence * 100.0);
    if let Some(rationale) = &estimate.rationale {
        println!("  rationale: {rationale}");
    }

    let summary = &resolution.summary;
    if summary.matched > 0 {
        println!(
            "  matched {} records across {} providers",
            summary.matched, summary.providers
        );
    }
    for record in resolution.results.iter().take(10) {
        let rate = record
            .negotiated_rate
            .map(|r| format!("${r:.2}"))
            .unwrap_or_else(|| "-".to_string());
        let payer = record.payer_name.as_deref().unwrap_or("(no payer)");
        let provider = record.provider_name.as_deref().unwrap_or("(unknown provider)");
        println!("    {rate:>12}  {payer}  {provider}");
    }
    if resolution.results.len() > 10 {
        println!("    ... and {} more", resolution.results.len() - 10);
    }
}

fn tier_label(tier: ResolutionTier) -> &'static str {
    match tier {
        ResolutionTier::DatabaseMatch => "database match",
        ResolutionTier::ProviderDerived => "provider estimate",
        ResolutionTier::SearchAggregate => "search aggregate",
        ResolutionTier::AlgorithmicFallback => "algorithmic fallback",
    }
}
