//! Whole-file ingestion: detect the format, unpack archives, infer the
//! schema, then extract, validate and persist in bounded batches. Every run
//! leaves a row in the ingest log, including runs that fail partway.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use indicatif::{ProgressBar, ProgressStyle};

use crate::cache::KvCache;
use crate::clients::TextCompleter;
use crate::detect::{FileFormat, detect_format, fingerprint_file};
use crate::extract::extract_batch;
use crate::reader::{RecordBatches, sample_records};
use crate::schema::{SchemaMapping, infer_mapping};
use crate::storage::{StoragePaths, file_present_nonempty};
use crate::store::{IngestLogEntry, PriceStore};
use crate::validate::{ReportBuilder, ValidationReport, Validator};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_SAMPLE_ROWS: usize = 20;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Rows per extraction batch.
    pub chunk_size: usize,
    /// Leading rows fed to schema inference.
    pub sample_rows: usize,
    /// Draw an interactive progress bar (CLI runs only).
    pub show_progress: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub file_name: String,
    /// Fingerprint of the file records were extracted from. For archives
    /// this is the contained file, so a zipped copy shares its schema
    /// cache entry with the bare one.
    pub fingerprint: String,
    pub format: FileFormat,
    pub mapping: SchemaMapping,
    pub report: ValidationReport,
}

/// Run the pipeline on one transparency file and log the outcome. The
/// returned error already carries file context; callers add intent.
pub async fn ingest_file(
    store: &PriceStore,
    cache: &KvCache,
    completer: Option<&dyn TextCompleter>,
    paths: &StoragePaths,
    input: &Path,
    options: &IngestOptions,
) -> Result<IngestOutcome> {
    match run_pipeline(store, cache, completer, paths, input, options).await {
        Ok(outcome) => {
            store.log_ingest(&IngestLogEntry {
                file_name: outcome.file_name.clone(),
                fingerprint: outcome.fingerprint.clone(),
                format: outcome.format.as_str().to_string(),
                total_records: outcome.report.total_records,
                valid_records: outcome.report.valid_count,
                flagged_records: outcome.report.flagged_count,
                status: "completed".to_string(),
                message: None,
            })?;
            Ok(outcome)
        }
        Err(err) => {
            record_failure(store, input, &err);
            Err(err)
        }
    }
}

async fn run_pipeline(
    store: &PriceStore,
    cache: &KvCache,
    completer: Option<&dyn TextCompleter>,
    paths: &StoragePaths,
    input: &Path,
    options: &IngestOptions,
) -> Result<IngestOutcome> {
    if !file_present_nonempty(input) {
        bail!("Input file {} is missing or empty", input.display());
    }
    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| input.display().to_string());

    let mut format = detect_format(input);
    tracing::info!(file = %file_name, format = format.as_str(), "Starting ingest");

    let mut source_path = input.to_path_buf();
    if format == FileFormat::Zip {
        source_path = unpack_archive(input, &paths.scratch_dir)?;
        format = detect_format(&source_path);
    }
    if format == FileFormat::Xml {
        bail!("XML transparency files are detected but not extracted yet");
    }

    let fingerprint = fingerprint_file(&source_path)?;
    let sample = sample_records(&source_path, format, options.sample_rows)?;
    if sample.records.is_empty() {
        bail!("No records found in {}", source_path.display());
    }
    let mapping = infer_mapping(cache, completer, &fingerprint, &sample).await?;
    tracing::info!(mapped = mapping.mapped_count(), "Schema mapping ready");

    let validator = Validator::new(store.baselines()?);
    let mut batches = RecordBatches::open(&source_path, format, options.chunk_size)?;
    let mut builder = ReportBuilder::default();

    let progress = if options.show_progress {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::hidden()
    };
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.green} [ingest {elapsed_precise}] {pos} records {msg}")
    {
        progress.set_style(style);
    }
    progress.set_message(format!("extracting from {file_name}"));

    while let Some(rows) = batches.next_batch()? {
        let records = extract_batch(&rows, &mapping, &file_name);
        let (valid, flagged) = validator.validate(records);
        builder.add_batch(&valid, &flagged);
        // Flagged records are kept; their issues travel with them.
        store.insert_records(&valid)?;
        store.insert_records(&flagged)?;
        progress.inc(rows.len() as u64);
    }

    let report = builder.finish();
    progress.finish_with_message(format!(
        "done: total={} valid={} flagged={}",
        report.total_records, report.valid_count, report.flagged_count
    ));
    tracing::info!(
        total = report.total_records,
        valid = report.valid_count,
        flagged = report.flagged_count,
        distinct_codes = report.distinct_codes,
        "Ingest finished"
    );

    Ok(IngestOutcome {
        file_name,
        fingerprint,
        format,
        mapping,
        report,
    })
}

/// Failures still leave an ingest_log row. Logging the failure is best
/// effort; the original error is what propagates.
fn record_failure(store: &PriceStore, input: &Path, err: &anyhow::Error) {
    let entry = IngestLogEntry {
        file_name: input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        fingerprint: fingerprint_file(input).unwrap_or_default(),
        format: detect_format(input).as_str().to_string(),
        total_records: 0,
        valid_records: 0,
        flagged_records: 0,
        status: "failed".to_string(),
        message: Some(err.to_string()),
    };
    if let Err(log_err) = store.log_ingest(&entry) {
        tracing::warn!(error = %log_err, "Could not record failed ingest");
    }
}

/// Copy the first supported entry of a zip archive into the scratch
/// directory and hand back its path.
fn unpack_archive(input: &Path, scratch_dir: &Path) -> Result<PathBuf> {
    let file =
        File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read archive {}", input.display()))?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if !entry.is_file() {
            continue;
        }
        let entry_name = entry.name().to_string();
        let supported = Path::new(&entry_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "json" | "csv" | "xml"))
            .unwrap_or(false);
        if !supported {
            continue;
        }

        let target_name = Path::new(&entry_name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "entry".to_string());
        std::fs::create_dir_all(scratch_dir)
            .with_context(|| format!("create {}", scratch_dir.display()))?;
        let target = scratch_dir.join(target_name);
        let mut out = File::create(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        io::copy(&mut entry, &mut out)?;
        tracing::info!(entry = %entry_name, "Unpacked archive entry");
        return Ok(target);
    }

    Err(anyhow!(
        "No supported entry (json/csv/xml) found in {}",
        input.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::StubCompleter;
    use crate::store::PriceFilter;
    use std::io::Write;

    const MESSY_CSV: &str = "procedure_code,description,hospital,insurance,price\n\
         70553,MRI Brain,Mercy General,Anthem Blue Cross,\"$1,250.00\"\n\
         99213,Office Visit,Mercy General,,95.50\n";

    fn paths_in(dir: &tempfile::TempDir) -> StoragePaths {
        StoragePaths::new(dir.path().to_str().unwrap())
    }

    #[tokio::test]
    async fn csv_file_flows_through_to_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("mercy_general.csv");
        std::fs::write(&input, MESSY_CSV).unwrap();

        let store = PriceStore::open_in_memory().unwrap();
        let cache = KvCache::open_in_memory().unwrap();
        let outcome = ingest_file(
            &store,
            &cache,
            None,
            &paths_in(&dir),
            &input,
            &IngestOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.format, FileFormat::Csv);
        assert_eq!(outcome.report.total_records, 2);
        assert_eq!(outcome.report.valid_count, 1);
        assert_eq!(outcome.report.flagged_count, 1);
        assert_eq!(outcome.report.common_issues.get("Missing payer name"), Some(&1));

        // Both rows persisted, money strings parsed, payer canonicalized.
        let mri = store
            .find_prices(&PriceFilter {
                cpt_code: "70553".into(),
                limit: 10,
                ..PriceFilter::default()
            })
            .unwrap();
        assert_eq!(mri.len(), 1);
        assert_eq!(mri[0].record.negotiated_rate, Some(1250.0));
        assert_eq!(mri[0].record.payer_name.as_deref(), Some("Blue Cross Blue Shield"));

        let office = store
            .find_prices(&PriceFilter {
                cpt_code: "99213".into(),
                limit: 10,
                ..PriceFilter::default()
            })
            .unwrap();
        assert_eq!(office.len(), 1);
        assert_eq!(office[0].record.negotiated_rate, Some(95.5));
        assert!(office[0].record.issues.contains(&"Missing payer name".to_string()));

        let stats = store.stats().unwrap();
        assert_eq!(stats.price_records, 2);
        assert_eq!(stats.ingest_runs, 1);
    }

    #[tokio::test]
    async fn model_mapping_is_inferred_once_per_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cryptic.csv");
        std::fs::write(
            &input,
            "svc_px,amt,plan_nm\n70553,1250,Aetna\n99213,95.5,Cigna\n",
        )
        .unwrap();

        let store = PriceStore::open_in_memory().unwrap();
        let cache = KvCache::open_in_memory().unwrap();
        // One reply only: a second completion attempt would error out.
        let completer = StubCompleter::new([
            r#"{"cpt_code": "svc_px", "negotiated_rate": "amt", "payer_name": "plan_nm"}"#,
        ]);
        let paths = paths_in(&dir);
        let options = IngestOptions::default();

        let first = ingest_file(&store, &cache, Some(&completer), &paths, &input, &options)
            .await
            .unwrap();
        assert_eq!(completer.calls(), 1);
        assert_eq!(first.mapping.cpt_code.as_deref(), Some("svc_px"));

        let second = ingest_file(&store, &cache, Some(&completer), &paths, &input, &options)
            .await
            .unwrap();
        assert_eq!(completer.calls(), 1, "cached mapping must skip the model");
        assert_eq!(second.mapping, first.mapping);
        assert_eq!(second.fingerprint, first.fingerprint);

        // Two runs, both logged, four rows total.
        let stats = store.stats().unwrap();
        assert_eq!(stats.ingest_runs, 2);
        assert_eq!(stats.price_records, 4);
    }

    #[tokio::test]
    async fn zip_archive_ingests_like_the_bare_file() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("prices.csv");
        std::fs::write(&bare, MESSY_CSV).unwrap();

        let archive_path = dir.path().join("prices.zip");
        let mut writer = zip::ZipWriter::new(File::create(&archive_path).unwrap());
        writer
            .start_file("prices.csv", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(MESSY_CSV.as_bytes()).unwrap();
        writer.finish().unwrap();

        let paths = paths_in(&dir);
        let options = IngestOptions::default();

        let store_bare = PriceStore::open_in_memory().unwrap();
        let cache = KvCache::open_in_memory().unwrap();
        let from_bare = ingest_file(&store_bare, &cache, None, &paths, &bare, &options)
            .await
            .unwrap();

        let store_zip = PriceStore::open_in_memory().unwrap();
        let from_zip = ingest_file(&store_zip, &cache, None, &paths, &archive_path, &options)
            .await
            .unwrap();

        // Same contained bytes, same fingerprint, same extraction results.
        assert_eq!(from_zip.fingerprint, from_bare.fingerprint);
        assert_eq!(from_zip.format, FileFormat::Csv);
        assert_eq!(from_zip.report.total_records, from_bare.report.total_records);
        assert_eq!(from_zip.report.valid_count, from_bare.report.valid_count);
        assert_eq!(
            store_zip.stats().unwrap().price_records,
            store_bare.stats().unwrap().price_records
        );
    }

    #[tokio::test]
    async fn missing_input_fails_and_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let store = PriceStore::open_in_memory().unwrap();
        let cache = KvCache::open_in_memory().unwrap();

        let err = ingest_file(
            &store,
            &cache,
            None,
            &paths_in(&dir),
            &dir.path().join("absent.csv"),
            &IngestOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("missing or empty"));
        assert_eq!(store.stats().unwrap().ingest_runs, 1);
        assert_eq!(store.stats().unwrap().price_records, 0);
    }

    #[tokio::test]
    async fn xml_is_detected_but_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("prices.xml");
        std::fs::write(&input, "<?xml version=\"1.0\"?><prices></prices>").unwrap();

        let store = PriceStore::open_in_memory().unwrap();
        let cache = KvCache::open_in_memory().unwrap();
        let err = ingest_file(
            &store,
            &cache,
            None,
            &paths_in(&dir),
            &input,
            &IngestOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("XML"));
        assert_eq!(store.stats().unwrap().ingest_runs, 1);
    }

    #[tokio::test]
    async fn archive_without_supported_entries_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("junk.zip");
        let mut writer = zip::ZipWriter::new(File::create(&archive_path).unwrap());
        writer
            .start_file("readme.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"nothing to ingest").unwrap();
        writer.finish().unwrap();

        let store = PriceStore::open_in_memory().unwrap();
        let cache = KvCache::open_in_memory().unwrap();
        let err = ingest_file(
            &store,
            &cache,
            None,
            &paths_in(&dir),
            &archive_path,
            &IngestOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("No supported entry"));
    }
}
