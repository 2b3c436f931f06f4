use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bytes hashed when fingerprinting a file. Transparency dumps run to
/// gigabytes, so identity is taken from the leading slice only.
const FINGERPRINT_BYTES: u64 = 1024 * 1024;

/// Bytes sniffed when the extension gives no answer.
const SNIFF_BYTES: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Json,
    Csv,
    Xml,
    Zip,
}

impl FileFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "xml" => Some(Self::Xml),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Xml => "xml",
            Self::Zip => "zip",
        }
    }
}

/// Decide a file's format. A recognized extension is authoritative;
/// otherwise the leading bytes are sniffed. Unreadable or ambiguous
/// content falls back to CSV, the most common shape in the wild.
pub fn detect_format(path: &Path) -> FileFormat {
    if let Some(format) = FileFormat::from_extension(path) {
        return format;
    }
    sniff_content(path).unwrap_or(FileFormat::Csv)
}

fn sniff_content(path: &Path) -> std::io::Result<FileFormat> {
    let mut head = Vec::with_capacity(SNIFF_BYTES as usize);
    File::open(path)?.take(SNIFF_BYTES).read_to_end(&mut head)?;
    let text = String::from_utf8_lossy(&head);
    let trimmed = text.trim();
    Ok(if trimmed.starts_with('{') || trimmed.starts_with('[') {
        FileFormat::Json
    } else if trimmed.starts_with('<') {
        FileFormat::Xml
    } else {
        FileFormat::Csv
    })
}

/// Content fingerprint over the first [`FINGERPRINT_BYTES`] of the file,
/// as lowercase hex. Used as the cache key for inferred schema mappings.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut taken = file.take(FINGERPRINT_BYTES);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = taken
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
