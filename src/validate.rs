use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::extract::PriceRecord;

/// Absolute ceiling above which any single rate is suspect.
pub const DEFAULT_MAX_RATE: f64 = 1_000_000.0;
/// Default z-score cutoff for the cross-record outlier pass.
pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;

const LOW_BASELINE_RATIO: f64 = 0.5;
const HIGH_BASELINE_RATIO: f64 = 10.0;

/// Record-level quality checks against per-code baseline rates.
pub struct Validator {
    baselines: HashMap<String, f64>,
    max_rate: f64,
}

impl Validator {
    pub fn new(baselines: HashMap<String, f64>) -> Self {
        Self {
            baselines,
            max_rate: DEFAULT_MAX_RATE,
        }
    }

    /// All issues found on one record. An empty list means valid.
    pub fn check_record(&self, record: &PriceRecord) -> Vec<String> {
        let mut issues = Vec::new();

        if record.cpt_code.is_none() {
            issues.push("Missing CPT code".to_string());
        }
        if record.negotiated_rate.is_none() && record.standard_charge.is_none() {
            issues.push("Missing both negotiated rate and standard charge".to_string());
        }

        if let Some(rate) = record.negotiated_rate {
            if rate < 0.0 {
                issues.push(format!("Negative price: {rate}"));
            } else if rate == 0.0 {
                issues.push("Zero price".to_string());
            } else {
                if rate > self.max_rate {
                    issues.push(format!("Unusually high price: ${rate:.2}"));
                }
                if let Some(code) = &record.cpt_code {
                    if let Some(baseline) = self.baselines.get(code) {
                        if *baseline > 0.0 {
                            let ratio = rate / baseline;
                            if ratio < LOW_BASELINE_RATIO {
                                issues.push(format!(
                                    "Price suspiciously low vs baseline: {ratio:.1}x"
                                ));
                            } else if ratio > HIGH_BASELINE_RATIO {
                                issues.push(format!("Price very high vs baseline: {ratio:.1}x"));
                            }
                        }
                    }
                }
            }
        }

        if let (Some(min), Some(max)) = (record.min_negotiated_rate, record.max_negotiated_rate) {
            if min > max {
                issues.push(format!("Min rate exceeds max rate: {min} > {max}"));
            }
        }
        if record.payer_name.is_none() {
            issues.push("Missing payer name".to_string());
        }

        issues
    }

    /// Completeness- and plausibility-weighted confidence in [0, 1].
    pub fn score_confidence(&self, record: &PriceRecord) -> f64 {
        let mut score = 0.0;

        let required = [
            record.cpt_code.is_some(),
            record.negotiated_rate.is_some(),
            record.payer_name.is_some(),
        ];
        score += 0.4 * count_true(&required) / required.len() as f64;

        let optional = [
            record.provider_name.is_some(),
            record.procedure_description.is_some(),
            record.standard_charge.is_some(),
        ];
        score += 0.2 * count_true(&optional) / optional.len() as f64;

        if let (Some(rate), Some(standard)) = (record.negotiated_rate, record.standard_charge) {
            if rate <= standard {
                score += 0.2;
            }
        }

        if let (Some(code), Some(rate)) = (&record.cpt_code, record.negotiated_rate) {
            if let Some(baseline) = self.baselines.get(code) {
                if *baseline > 0.0 {
                    let ratio = rate / baseline;
                    if (1.5..=5.0).contains(&ratio) {
                        score += 0.2;
                    } else if (0.5..=10.0).contains(&ratio) {
                        score += 0.1;
                    }
                }
            }
        }

        score.min(1.0)
    }

    /// Fill confidence and issues on each record and split valid from
    /// flagged. Flagged records are kept, not dropped.
    pub fn validate(&self, records: Vec<PriceRecord>) -> (Vec<PriceRecord>, Vec<PriceRecord>) {
        let mut valid = Vec::new();
        let mut flagged = Vec::new();
        for mut record in records {
            record.confidence = self.score_confidence(&record);
            record.issues = self.check_record(&record);
            if record.issues.is_empty() {
                valid.push(record);
            } else {
                flagged.push(record);
            }
        }
        (valid, flagged)
    }

    /// Cross-record audit: records whose negotiated rate sits more than
    /// `z_threshold` standard deviations from the mean for `cpt_code`.
    /// Needs at least three priced records and nonzero spread.
    pub fn detect_outliers(
        &self,
        records: &[PriceRecord],
        cpt_code: &str,
        z_threshold: f64,
    ) -> Vec<Outlier> {
        let priced: Vec<(&PriceRecord, f64)> = records
            .iter()
            .filter(|r| r.cpt_code.as_deref() == Some(cpt_code))
            .filter_map(|r| r.negotiated_rate.map(|rate| (r, rate)))
            .collect();
        if priced.len() < 3 {
            return Vec::new();
        }

        let rates: Vec<f64> = priced.iter().map(|(_, rate)| *rate).collect();
        let average = mean_of(&rates);
        let std_dev = population_std(&rates, average);
        if std_dev == 0.0 {
            return Vec::new();
        }
        let mut sorted = rates;
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = median_sorted(&sorted);

        priced
            .into_iter()
            .filter_map(|(record, rate)| {
                let z_score = (rate - average).abs() / std_dev;
                (z_score > z_threshold).then(|| Outlier {
                    record: record.clone(),
                    z_score,
                    average,
                    median,
                    std_dev,
                })
            })
            .collect()
    }
}

fn count_true(flags: &[bool]) -> f64 {
    flags.iter().filter(|f| **f).count() as f64
}

/// A record far from its peers, with the distribution that judged it.
#[derive(Debug, Clone, Serialize)]
pub struct Outlier {
    pub record: PriceRecord,
    pub z_score: f64,
    pub average: f64,
    pub median: f64,
    pub std_dev: f64,
}

/// File-level QC summary. Issue counts are bucketed by the text before
/// the first ':' so parameterized messages aggregate cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_records: usize,
    pub valid_count: usize,
    pub flagged_count: usize,
    pub valid_rate: f64,
    pub distinct_codes: usize,
    pub avg_confidence: f64,
    pub common_issues: BTreeMap<String, usize>,
}

/// Accumulates a [`ValidationReport`] across batches so whole-file
/// ingestion never needs all records in memory at once.
#[derive(Debug, Default)]
pub struct ReportBuilder {
    total: usize,
    valid: usize,
    flagged: usize,
    issue_counts: BTreeMap<String, usize>,
    codes: HashSet<String>,
    confidence_sum: f64,
}

impl ReportBuilder {
    pub fn add_batch(&mut self, valid: &[PriceRecord], flagged: &[PriceRecord]) {
        self.total += valid.len() + flagged.len();
        self.valid += valid.len();
        self.flagged += flagged.len();
        for record in valid {
            self.confidence_sum += record.confidence;
            if let Some(code) = &record.cpt_code {
                self.codes.insert(code.clone());
            }
        }
        for record in flagged {
            for issue in &record.issues {
                let bucket = issue.split(':').next().unwrap_or(issue).to_string();
                *self.issue_counts.entry(bucket).or_insert(0) += 1;
            }
        }
    }

    pub fn finish(self) -> ValidationReport {
        ValidationReport {
            total_records: self.total,
            valid_count: self.valid,
            flagged_count: self.flagged,
            valid_rate: if self.total > 0 {
                self.valid as f64 / self.total as f64
            } else {
                0.0
            },
            distinct_codes: self.codes.len(),
            avg_confidence: if self.valid > 0 {
                self.confidence_sum / self.valid as f64
            } else {
                0.0
            },
            common_issues: self.issue_counts,
        }
    }
}

pub(crate) fn mean_of(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn population_std(values: &[f64], mean: f64) -> f64 {
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Median of an already sorted, non-empty slice.
pub(crate) fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Drop prices outside 1.5 IQR of the quartiles. Fewer than four values
/// pass through untouched, and if trimming would remove everything the
/// original set is kept instead.
pub fn iqr_trim(prices: &[f64]) -> Vec<f64> {
    if prices.len() < 4 {
        return prices.to_vec();
    }
    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q1 = sorted[sorted.len() / 4];
    let q3 = sorted[(3 * sorted.len()) / 4];
    let iqr = q3 - q1;
    let lower = q1 - 1.5 * iqr;
    let upper = q3 + 1.5 * iqr;
    let kept: Vec<f64> = prices
        .iter()
        .copied()
        .filter(|p| (lower..=upper).contains(p))
        .collect();
    if kept.is_empty() { prices.to_vec() } else { kept }
}
