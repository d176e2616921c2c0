//! Session manifest
//!
//! The manifest is the on-disk expectation set of one session: a JSON object
//! keyed by file name, each value carrying the content address, recorded size
//! and record id. Entry order follows record enumeration order and survives a
//! write/read cycle. A manifest file is created exclusively and never
//! rewritten.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::catalog::ContentRecord;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Expected state of one file in the working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_name: String,
    #[serde(rename = "file_cid")]
    pub content_address: String,
    #[serde(rename = "file_size")]
    pub size_bytes: u64,
    #[serde(rename = "file_id")]
    pub record_id: u64,
}

impl From<&ContentRecord> for ManifestEntry {
    fn from(record: &ContentRecord) -> Self {
        Self {
            file_name: record.display_name.clone(),
            content_address: record.content_address.clone(),
            size_bytes: record.size_bytes,
            record_id: record.id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build from records. File names must be unique.
    pub fn from_records(records: &[ContentRecord]) -> Result<Self> {
        Self::from_entries(records.iter().map(ManifestEntry::from).collect())
    }

    pub fn from_entries(entries: Vec<ManifestEntry>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.file_name.as_str()) {
                return Err(ManifestError::InvalidManifest(format!(
                    "duplicate file name {}",
                    entry.file_name
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn get(&self, file_name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.file_name == file_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of recorded sizes
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        let mut object = Map::new();
        for entry in &self.entries {
            object.insert(entry.file_name.clone(), serde_json::to_value(entry)?);
        }
        Ok(serde_json::to_string(&Value::Object(object))?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let object: Map<String, Value> = serde_json::from_str(json)?;
        let mut entries = Vec::with_capacity(object.len());

        for (key, value) in object {
            let entry: ManifestEntry = serde_json::from_value(value)?;
            if entry.file_name != key {
                return Err(ManifestError::InvalidManifest(format!(
                    "key {} does not match file_name {}",
                    key, entry.file_name
                )));
            }
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    /// Create the manifest file. Fails if it already exists.
    pub fn write_new(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
