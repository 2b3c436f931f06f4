use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::extract::PriceRecord;

/// Common procedures seeded on first open so baseline checks and local
/// code matching work before any file has been ingested. Rates are
/// typical Medicare allowables, used only as sanity baselines.
const SEED_PROCEDURES: &[(&str, &str, &str, f64)] = &[
    // Surgical procedures
    ("27447", "Total Knee Replacement (Arthroplasty)", "Orthopedic Surgery", 15000.00),
    ("27130", "Total Hip Replacement (Arthroplasty)", "Orthopedic Surgery", 16000.00),
    ("29827", "Arthroscopy, Shoulder, Surgical", "Orthopedic Surgery", 7500.00),
    ("29881", "Arthroscopy, Knee, with Meniscectomy", "Orthopedic Surgery", 4500.00),
    ("47562", "Laparoscopic Cholecystectomy (Gallbladder Removal)", "General Surgery", 8500.00),
    ("43239", "Upper Endoscopy with Biopsy", "Gastroenterology", 2500.00),
    ("45378", "Colonoscopy", "Gastroenterology", 3200.00),
    ("45380", "Colonoscopy with Biopsy", "Gastroenterology", 3500.00),
    ("45385", "Colonoscopy with Polyp Removal", "Gastroenterology", 4000.00),
    ("58150", "Total Abdominal Hysterectomy", "Gynecology", 9500.00),
    ("58558", "Laparoscopic Hysterectomy", "Gynecology", 10500.00),
    ("19125", "Breast Biopsy", "General Surgery", 2800.00),
    ("19301", "Partial Mastectomy", "General Surgery", 8000.00),
    ("60240", "Thyroidectomy, Total", "Endocrine Surgery", 9000.00),
    ("43644", "Laparoscopic Gastric Bypass", "Bariatric Surgery", 22000.00),
    ("49505", "Hernia Repair, Inguinal", "General Surgery", 5500.00),
    ("49650", "Laparoscopic Hernia Repair", "General Surgery", 6500.00),
    // Imaging and diagnostics
    ("70450", "CT Scan, Head/Brain without Contrast", "Radiology", 800.00),
    ("70486", "CT Scan, Face without Contrast", "Radiology", 750.00),
    ("70553", "MRI, Brain with and without Contrast", "Radiology", 1800.00),
    ("71250", "CT Scan, Chest without Contrast", "Radiology", 850.00),
    ("72148", "MRI, Lumbar Spine without Contrast", "Radiology", 1500.00),
    ("73221", "MRI, Upper Extremity without Contrast", "Radiology", 1400.00),
    ("73721", "MRI, Lower Extremity without Contrast", "Radiology", 1400.00),
    ("74177", "CT Scan, Abdomen and Pelvis with Contrast", "Radiology", 1200.00),
    ("76700", "Ultrasound, Abdominal", "Radiology", 400.00),
    ("76805", "Ultrasound, Obstetric", "Radiology", 350.00),
    ("76856", "Ultrasound, Pelvic", "Radiology", 380.00),
    ("76942", "Ultrasound Guidance for Needle Biopsy", "Radiology", 250.00),
    ("77067", "Screening Mammography", "Radiology", 280.00),
    ("77065", "Diagnostic Mammography", "Radiology", 320.00),
    // Cardiovascular
    ("93000", "Electrocardiogram (ECG/EKG)", "Cardiology", 150.00),
    ("93015", "Cardiovascular Stress Test", "Cardiology", 450.00),
    ("93306", "Echocardiography (Heart Ultrasound)", "Cardiology", 800.00),
    ("93454", "Cardiac Catheterization", "Cardiology", 8500.00),
    ("92928", "Coronary Angioplasty with Stent", "Cardiology", 18000.00),
    ("33533", "Coronary Artery Bypass (CABG), Single Graft", "Cardiac Surgery", 45000.00),
    // Emergency and hospital services
    ("99281", "Emergency Department Visit, Level 1 (Minor)", "Emergency Medicine", 300.00),
    ("99282", "Emergency Department Visit, Level 2 (Low)", "Emergency Medicine", 450.00),
    ("99283", "Emergency Department Visit, Level 3 (Moderate)", "Emergency Medicine", 650.00),
    ("99284", "Emergency Department Visit, Level 4 (High)", "Emergency Medicine", 950.00),
    ("99285", "Emergency Department Visit, Level 5 (Critical)", "Emergency Medicine", 1500.00),
    ("99222", "Initial Hospital Care, Moderate Complexity", "Hospital Medicine", 350.00),
    ("99223", "Initial Hospital Care, High Complexity", "Hospital Medicine", 450.00),
    ("99232", "Subsequent Hospital Care", "Hospital Medicine", 200.00),
    // Office visits
    ("99201", "Office Visit, New Patient, Level 1", "Primary Care", 80.00),
    ("99202", "Office Visit, New Patient, Level 2", "Primary Care", 135.00),
    ("99203", "Office Visit, New Patient, Level 3", "Primary Care", 180.00),
    ("99204", "Office Visit, New Patient, Level 4", "Primary Care", 240.00),
    ("99205", "Office Visit, New Patient, Level 5", "Primary Care", 310.00),
    ("99211", "Office Visit, Established Patient, Level 1", "Primary Care", 45.00),
    ("99212", "Office Visit, Established Patient, Level 2", "Primary Care", 85.00),
    ("99213", "Office Visit, Established Patient, Level 3", "Primary Care", 130.00),
    ("99214", "Office Visit, Established Patient, Level 4", "Primary Care", 185.00),
    ("99215", "Office Visit, Established Patient, Level 5", "Primary Care", 245.00),
    // Lab tests
    ("80053", "Comprehensive Metabolic Panel", "Laboratory", 50.00),
    ("80061", "Lipid Panel", "Laboratory", 45.00),
    ("85025", "Complete Blood Count (CBC) with Differential", "Laboratory", 35.00),
    ("84443", "Thyroid Stimulating Hormone (TSH) Test", "Laboratory", 75.00),
    ("82947", "Glucose Blood Test", "Laboratory", 25.00),
    ("83036", "Hemoglobin A1C Test", "Laboratory", 55.00),
    ("84478", "Triglycerides Test", "Laboratory", 40.00),
    // Physical therapy
    ("97110", "Therapeutic Exercise", "Physical Therapy", 85.00),
    ("97112", "Neuromuscular Re-education", "Physical Therapy", 90.00),
    ("97140", "Manual Therapy", "Physical Therapy", 85.00),
    ("97161", "Physical Therapy Evaluation, Low Complexity", "Physical Therapy", 120.00),
    ("97162", "Physical Therapy Evaluation, Moderate Complexity", "Physical Therapy", 150.00),
    ("97163", "Physical Therapy Evaluation, High Complexity", "Physical Therapy", 180.00),
    // Obstetrics
    ("59400", "Obstetric Care (Vaginal Delivery)", "Obstetrics", 4500.00),
    ("59510", "Cesarean Section Delivery", "Obstetrics", 6500.00),
    ("59610", "Vaginal Birth After Cesarean (VBAC)", "Obstetrics", 5000.00),
    // Oral surgery
    ("21089", "Unlisted Maxillofacial Prosthetic Procedure", "Oral Surgery", 800.00),
    ("41899", "Unlisted Oral/Dentoalveolar Surgery", "Oral Surgery", 600.00),
    // Pain management
    ("64483", "Lumbar/Sacral Epidural Steroid Injection", "Pain Management", 1200.00),
    ("64493", "Facet Joint Injection, Lumbar/Sacral", "Pain Management", 800.00),
    ("20610", "Arthrocentesis (Joint Drainage)", "Orthopedics", 350.00),
    // Ophthalmology
    ("66984", "Cataract Surgery with IOL Insertion", "Ophthalmology", 3500.00),
    ("67228", "Photocoagulation for Diabetic Retinopathy", "Ophthalmology", 1800.00),
    ("92004", "Comprehensive Eye Exam, New Patient", "Ophthalmology", 200.00),
    ("92012", "Comprehensive Eye Exam, Established Patient", "Ophthalmology", 150.00),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureRef {
    pub cpt_code: String,
    pub description: String,
    pub category: Option<String>,
    pub baseline_rate: Option<f64>,
}

/// A persisted price record plus its row id.
#[derive(Debug, Clone, Serialize)]
pub struct StoredPrice {
    pub id: i64,
    #[serde(flatten)]
    pub record: PriceRecord,
}

/// Filters for the database tier of price resolution. Payer matches by
/// substring, city by prefix, state and zip exactly.
#[derive(Debug, Clone, Default)]
pub struct PriceFilter {
    pub cpt_code: String,
    pub payer_name: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct IngestLogEntry {
    pub file_name: String,
    pub fingerprint: String,
    pub format: String,
    pub total_records: usize,
    pub valid_records: usize,
    pub flagged_records: usize,
    pub status: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub price_records: i64,
    pub distinct_codes: i64,
    pub procedures: i64,
    pub ingest_runs: i64,
}

/// SQLite-backed store for procedures, price records and the ingest log.
/// The connection is mutex-guarded so one store can be shared between the
/// CLI pipeline and API handlers.
pub struct PriceStore {
    conn: Mutex<Connection>,
}

impl PriceStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open price store at {}", path.display()))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(mut conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS procedures (
                 cpt_code      TEXT PRIMARY KEY,
                 description   TEXT NOT NULL,
                 category      TEXT,
                 baseline_rate REAL
             );
             CREATE TABLE IF NOT EXISTS price_records (
                 id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                 cpt_code              TEXT,
                 procedure_description TEXT,
                 provider_name         TEXT,
                 provider_npi          TEXT,
                 provider_city         TEXT,
                 provider_state        TEXT,
                 provider_zip          TEXT,
                 payer_name            TEXT,
                 negotiated_rate       REAL,
                 min_negotiated_rate   REAL,
                 max_negotiated_rate   REAL,
                 standard_charge       REAL,
                 cash_price            REAL,
                 provenance            TEXT NOT NULL,
                 confidence            REAL NOT NULL DEFAULT 0,
                 issues                TEXT NOT NULL DEFAULT '[]',
                 ingested_at           TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE INDEX IF NOT EXISTS idx_price_records_code
                 ON price_records (cpt_code);
             CREATE INDEX IF NOT EXISTS idx_price_records_state
                 ON price_records (provider_state);
             CREATE TABLE IF NOT EXISTS ingest_log (
                 id              INTEGER PRIMARY KEY AUTOINCREMENT,
                 file_name       TEXT NOT NULL,
                 fingerprint     TEXT NOT NULL,
                 format          TEXT NOT NULL,
                 total_records   INTEGER NOT NULL,
                 valid_records   INTEGER NOT NULL,
                 flagged_records INTEGER NOT NULL,
                 status          TEXT NOT NULL,
                 message         TEXT,
                 ingested_at     TEXT NOT NULL DEFAULT (datetime('now'))
             );",
        )
        .context("Failed to initialize price store schema")?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM procedures", [], |row| row.get(0))?;
        if count == 0 {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO procedures (cpt_code, description, category, baseline_rate)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (code, description, category, rate) in SEED_PROCEDURES {
                    stmt.execute(params![code, description, category, rate])?;
                }
            }
            tx.commit()?;
            tracing::info!(procedures = SEED_PROCEDURES.len(), "Seeded procedure reference table");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("price store connection poisoned"))
    }

    pub fn procedure(&self, cpt_code: &str) -> Result<Option<ProcedureRef>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT cpt_code, description, category, baseline_rate
             FROM procedures WHERE cpt_code = ?1",
        )?;
        let proc = stmt
            .query_row([cpt_code], |row| {
                Ok(ProcedureRef {
                    cpt_code: row.get(0)?,
                    description: row.get(1)?,
                    category: row.get(2)?,
                    baseline_rate: row.get(3)?,
                })
            })
            .optional()?;
        Ok(proc)
    }

    pub fn baseline_for(&self, cpt_code: &str) -> Result<Option<f64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT baseline_rate FROM procedures WHERE cpt_code = ?1")?;
        let rate: Option<Option<f64>> = stmt
            .query_row([cpt_code], |row| row.get(0))
            .optional()?;
        Ok(rate.flatten())
    }

    /// All known baselines, used to arm the validator once per file.
    pub fn baselines(&self) -> Result<HashMap<String, f64>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT cpt_code, baseline_rate FROM procedures WHERE baseline_rate IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (code, rate) = row?;
            out.insert(code, rate);
        }
        Ok(out)
    }

    pub fn all_procedures(&self) -> Result<Vec<ProcedureRef>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT cpt_code, description, category, baseline_rate
             FROM procedures ORDER BY cpt_code",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProcedureRef {
                cpt_code: row.get(0)?,
                description: row.get(1)?,
                category: row.get(2)?,
                baseline_rate: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn insert_records(&self, records: &[PriceRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO price_records (
                     cpt_code, procedure_description, provider_name, provider_npi,
                     provider_city, provider_state, provider_zip, payer_name,
                     negotiated_rate, min_negotiated_rate, max_negotiated_rate,
                     standard_charge, cash_price, provenance, confidence, issues
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )?;
            for record in records {
                let issues = serde_json::to_string(&record.issues)?;
                stmt.execute(params![
                    record.cpt_code,
                    record.procedure_description,
                    record.provider_name,
                    record.provider_npi,
                    record.provider_city,
                    record.provider_state,
                    record.provider_zip,
                    record.payer_name,
                    record.negotiated_rate,
                    record.min_negotiated_rate,
                    record.max_negotiated_rate,
                    record.standard_charge,
                    record.cash_price,
                    record.provenance,
                    record.confidence,
                    issues,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Database tier of resolution: filtered lookup, cheapest rate first.
    pub fn find_prices(&self, filter: &PriceFilter) -> Result<Vec<StoredPrice>> {
        let mut sql = String::from(
            "SELECT id, cpt_code, procedure_description, provider_name, provider_npi,
                    provider_city, provider_state, provider_zip, payer_name,
                    negotiated_rate, min_negotiated_rate, max_negotiated_rate,
                    standard_charge, cash_price, provenance, confidence, issues
             FROM price_records
             WHERE cpt_code = ? AND negotiated_rate IS NOT NULL",
        );
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(filter.cpt_code.clone())];
        if let Some(payer) = &filter.payer_name {
            sql.push_str(" AND payer_name LIKE ?");
            binds.push(Box::new(format!("%{payer}%")));
        }
        if let Some(state) = &filter.state {
            sql.push_str(" AND UPPER(provider_state) = ?");
            binds.push(Box::new(state.to_uppercase()));
        }
        if let Some(city) = &filter.city {
            sql.push_str(" AND provider_city LIKE ?");
            binds.push(Box::new(format!("{city}%")));
        }
        if let Some(zip) = &filter.zip {
            sql.push_str(" AND provider_zip = ?");
            binds.push(Box::new(zip.clone()));
        }
        sql.push_str(" ORDER BY negotiated_rate ASC LIMIT ?");
        binds.push(Box::new(filter.limit as i64));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds.iter()), row_to_stored)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn log_ingest(&self, entry: &IngestLogEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ingest_log (
                 file_name, fingerprint, format, total_records,
                 valid_records, flagged_records, status, message
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.file_name,
                entry.fingerprint,
                entry.format,
                entry.total_records as i64,
                entry.valid_records as i64,
                entry.flagged_records as i64,
                entry.status,
                entry.message,
            ],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<i64> {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(StoreStats {
            price_records: count("SELECT COUNT(*) FROM price_records")?,
            distinct_codes: count(
                "SELECT COUNT(DISTINCT cpt_code) FROM price_records WHERE cpt_code IS NOT NULL",
            )?,
            procedures: count("SELECT COUNT(*) FROM procedures")?,
            ingest_runs: count("SELECT COUNT(*) FROM ingest_log")?,
        })
    }

    /// Export every price record as CSV. Written to a temp file next to
    /// the target and renamed into place so readers never see a partial
    /// export.
    pub fn export_csv(&self, path: &Path) -> Result<usize> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT cpt_code, procedure_description, provider_name, provider_npi,
                    provider_city, provider_state, provider_zip, payer_name,
                    negotiated_rate, min_negotiated_rate, max_negotiated_rate,
                    standard_charge, cash_price, provenance, confidence, issues, ingested_at
             FROM price_records ORDER BY cpt_code, negotiated_rate",
        )?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "export.csv".to_string());
        let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

        let mut writer = csv::Writer::from_path(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        writer.write_record([
            "cpt_code",
            "procedure_description",
            "provider_name",
            "provider_npi",
            "provider_city",
            "provider_state",
            "provider_zip",
            "payer_name",
            "negotiated_rate",
            "min_negotiated_rate",
            "max_negotiated_rate",
            "standard_charge",
            "cash_price",
            "provenance",
            "confidence",
            "issues",
            "ingested_at",
        ])?;

        let text = |v: Option<String>| v.unwrap_or_default();
        let num = |v: Option<f64>| v.map(|f| f.to_string()).unwrap_or_default();

        let mut rows = stmt.query([])?;
        let mut count = 0usize;
        while let Some(row) = rows.next()? {
            let issues_raw: String = row.get(15)?;
            let issues: Vec<String> = serde_json::from_str(&issues_raw).unwrap_or_default();
            writer.write_record([
                text(row.get(0)?),
                text(row.get(1)?),
                text(row.get(2)?),
                text(row.get(3)?),
                text(row.get(4)?),
                text(row.get(5)?),
                text(row.get(6)?),
                text(row.get(7)?),
                num(row.get(8)?),
                num(row.get(9)?),
                num(row.get(10)?),
                num(row.get(11)?),
                num(row.get(12)?),
                text(row.get(13)?),
                row.get::<_, f64>(14)?.to_string(),
                issues.join("; "),
                text(row.get(16)?),
            ])?;
            count += 1;
        }
        writer.flush()?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move export into place at {}", path.display()))?;
        Ok(count)
    }
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredPrice> {
    let issues_raw: String = row.get(16)?;
    let issues: Vec<String> = serde_json::from_str(&issues_raw).unwrap_or_default();
    Ok(StoredPrice {
        id: row.get(0)?,
        record: PriceRecord {
            cpt_code: row.get(1)?,
            procedure_description: row.get(2)?,
            provider_name: row.get(3)?,
            provider_npi: row.get(4)?,
            provider_city: row.get(5)?,
            provider_state: row.get(6)?,
            provider_zip: row.get(7)?,
            payer_name: row.get(8)?,
            negotiated_rate: row.get(9)?,
            min_negotiated_rate: row.get(10)?,
            max_negotiated_rate: row.get(11)?,
            standard_charge: row.get(12)?,
            cash_price: row.get(13)?,
            provenance: row.get(14)?,
            confidence: row.get(15)?,
            issues,
        },
    })
}
