use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;

use crate::detect::FileFormat;

/// One source row, keyed by source-file field name in document order.
pub type RawRecord = serde_json::Map<String, Value>;

/// Leading slice of a file used for schema inference.
pub struct Sample {
    /// Field names in the order the file presents them.
    pub fields: Vec<String>,
    pub records: Vec<RawRecord>,
}

/// Pulls rows out of a transparency file in bounded batches. Neither the
/// CSV nor the JSON path ever holds more than one batch in memory.
#[derive(Debug)]
pub struct RecordBatches {
    source: BatchSource,
    chunk_size: usize,
}

#[derive(Debug)]
enum BatchSource {
    Csv {
        reader: csv::Reader<File>,
        headers: Vec<String>,
    },
    Json(JsonArrayScanner<BufReader<File>>),
}

impl RecordBatches {
    pub fn open(path: &Path, format: FileFormat, chunk_size: usize) -> Result<Self> {
        let chunk_size = chunk_size.max(1);
        let source = match format {
            FileFormat::Csv => {
                let mut reader = csv::ReaderBuilder::new()
                    .flexible(true)
                    .from_path(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let headers = reader
                    .headers()
                    .with_context(|| {
                        format!("Failed to read CSV header of {}", path.display())
                    })?
                    .iter()
                    .map(|h| h.trim().to_string())
                    .collect();
                BatchSource::Csv { reader, headers }
            }
            FileFormat::Json => {
                let file = File::open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                BatchSource::Json(JsonArrayScanner::new(BufReader::new(file)))
            }
            FileFormat::Xml => {
                bail!("XML transparency files are not supported: {}", path.display())
            }
            FileFormat::Zip => {
                bail!("Archive must be unpacked before reading: {}", path.display())
            }
        };
        Ok(Self { source, chunk_size })
    }

    /// Next batch of up to `chunk_size` rows, or `None` at end of file.
    pub fn next_batch(&mut self) -> Result<Option<Vec<RawRecord>>> {
        let mut batch = Vec::with_capacity(self.chunk_size);
        while batch.len() < self.chunk_size {
            match self.next_record()? {
                Some(record) => batch.push(record),
                None => break,
            }
        }
        Ok(if batch.is_empty() { None } else { Some(batch) })
    }

    fn next_record(&mut self) -> Result<Option<RawRecord>> {
        match &mut self.source {
            BatchSource::Csv { reader, headers } => {
                let mut row = csv::StringRecord::new();
                loop {
                    let more = reader
                        .read_record(&mut row)
                        .context("Failed to read CSV record")?;
                    if !more {
                        return Ok(None);
                    }
                    if row.iter().all(|f| f.trim().is_empty()) {
                        continue;
                    }
                    let mut record = RawRecord::new();
                    for (i, field) in row.iter().enumerate() {
                        let name = headers
                            .get(i)
                            .cloned()
                            .unwrap_or_else(|| format!("column_{i}"));
                        record.insert(name, Value::String(field.to_string()));
                    }
                    return Ok(Some(record));
                }
            }
            BatchSource::Json(scanner) => loop {
                match scanner.next_element()? {
                    None => return Ok(None),
                    Some(Value::Object(map)) => return Ok(Some(map)),
                    Some(_) => {
                        tracing::debug!("Skipping non-object JSON row");
                        continue;
                    }
                }
            },
        }
    }

    fn field_names(&self, records: &[RawRecord]) -> Vec<String> {
        match &self.source {
            BatchSource::Csv { headers, .. } => headers.clone(),
            BatchSource::Json(_) => records
                .first()
                .map(|r| r.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// Read up to `limit` leading rows for schema inference.
pub fn sample_records(path: &Path, format: FileFormat, limit: usize) -> Result<Sample> {
    let mut batches = RecordBatches::open(path, format, limit.max(1))?;
    let records = batches.next_batch()?.unwrap_or_default();
    let fields = batches.field_names(&records);
    Ok(Sample { fields, records })
}

/// Streams elements of the first non-empty top-level array in a JSON
/// document. Transparency dumps are either a bare array of rows or a
/// wrapper object carrying the rows under some key; scanning byte-wise
/// for that array keeps memory flat either way. A wrapper with no array
/// at all is yielded once, whole, as the only record.
#[derive(Debug)]
struct JsonArrayScanner<R: BufRead> {
    reader: R,
    state: ScanState,
    /// Wrapper-object bytes consumed so far. Only grows until a usable
    /// array turns up; becomes the single record if none ever does.
    prefix: Vec<u8>,
    /// Brace depth inside the wrapper object.
    depth: u32,
    in_string: bool,
    escaped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    Start,
    InArray { from_object: bool, seen: bool },
    ScanObject,
    EmitWhole,
    Done,
}

impl<R: BufRead> JsonArrayScanner<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            state: ScanState::Start,
            prefix: Vec::new(),
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    fn next_element(&mut self) -> Result<Option<Value>> {
        loop {
            match self.state {
                ScanState::Start => {
                    self.skip_whitespace()?;
                    match self.next_byte()? {
                        None => bail!("Empty JSON document"),
                        Some(b'[') => {
                            self.state = ScanState::InArray {
                                from_object: false,
                                seen: false,
                            };
                        }
                        Some(b'{') => {
                            self.prefix.push(b'{');
                            self.depth = 1;
                            self.state = ScanState::ScanObject;
                        }
                        Some(_) => bail!("JSON document must start with an object or array"),
                    }
                }
                ScanState::InArray { from_object, seen } => {
                    self.skip_whitespace()?;
                    match self.peek()? {
                        None => bail!("Unexpected EOF inside JSON array"),
                        Some(b']') => {
                            self.bump();
                            if from_object && !seen {
                                // Empty candidate; keep hunting through the
                                // wrapper for a later array.
                                self.prefix.extend_from_slice(b"[]");
                                self.state = ScanState::ScanObject;
                            } else {
                                self.state = ScanState::Done;
                            }
                        }
                        Some(b',') => {
                            self.bump();
                        }
                        Some(_) => {
                            let raw = self.capture_value()?;
                            let value: Value = serde_json::from_slice(&raw)
                                .context("Malformed JSON array element")?;
                            self.state = ScanState::InArray {
                                from_object,
                                seen: true,
                            };
                            return Ok(Some(value));
                        }
                    }
                }
                ScanState::ScanObject => {
                    let b = match self.next_byte()? {
                        Some(b) => b,
                        None => bail!("Unexpected EOF inside JSON object"),
                    };
                    if self.in_string {
                        self.prefix.push(b);
                        if self.escaped {
                            self.escaped = false;
                        } else if b == b'\\' {
                            self.escaped = true;
                        } else if b == b'"' {
                            self.in_string = false;
                        }
                    } else if b == b'[' && self.depth == 1 {
                        // Candidate data array in value position.
                        self.state = ScanState::InArray {
                            from_object: true,
                            seen: false,
                        };
                    } else {
                        self.prefix.push(b);
                        match b {
                            b'"' => self.in_string = true,
                            b'{' | b'[' => self.depth += 1,
                            b'}' | b']' => {
                                self.depth -= 1;
                                if self.depth == 0 {
                                    self.state = ScanState::EmitWhole;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                ScanState::EmitWhole => {
                    self.state = ScanState::Done;
                    let value: Value = serde_json::from_slice(&self.prefix)
                        .context("Malformed JSON object")?;
                    return Ok(Some(value));
                }
                ScanState::Done => return Ok(None),
            }
        }
    }

    /// Captures one complete JSON value, leaving the reader just past it.
    fn capture_value(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let first = self
            .next_byte()?
            .ok_or_else(|| anyhow!("Unexpected EOF in JSON value"))?;
        out.push(first);
        match first {
            b'"' => self.capture_string_tail(&mut out)?,
            b'{' | b'[' => {
                let mut depth = 1u32;
                let mut in_string = false;
                let mut escaped = false;
                while depth > 0 {
                    let b = self
                        .next_byte()?
                        .ok_or_else(|| anyhow!("Unexpected EOF in JSON value"))?;
                    out.push(b);
                    if in_string {
                        if escaped {
                            escaped = false;
                        } else if b == b'\\' {
                            escaped = true;
                        } else if b == b'"' {
                            in_string = false;
                        }
                    } else {
                        match b {
                            b'"' => in_string = true,
                            b'{' | b'[' => depth += 1,
                            b'}' | b']' => depth -= 1,
                            _ => {}
                        }
                    }
                }
            }
            _ => loop {
                // Number or literal: runs until a structural delimiter.
                match self.peek()? {
                    None => break,
                    Some(b) if b == b',' || b == b']' || b == b'}' => break,
                    Some(b) if b.is_ascii_whitespace() => break,
                    Some(b) => {
                        out.push(b);
                        self.bump();
                    }
                }
            },
        }
        Ok(out)
    }

    fn capture_string_tail(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let mut escaped = false;
        loop {
            let b = self
                .next_byte()?
                .ok_or_else(|| anyhow!("Unexpected EOF in JSON string"))?;
            out.push(b);
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                return Ok(());
            }
        }
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        while let Some(b) = self.peek()? {
            if b.is_ascii_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
        Ok(())
    }

    fn peek(&mut self) -> Result<Option<u8>> {
        let buf = self.reader.fill_buf().context("Failed to read JSON input")?;
        Ok(buf.first().copied())
    }

    fn bump(&mut self) {
        self.reader.consume(1);
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        match self.peek()? {
            Some(b) => {
                self.bump();
                Ok(Some(b))
            }
            None => Ok(None),
        }
    }
}
