//! Result packager: verified session files -> cached listing payload
//!
//! Wire shape, written into the file-listing cache:
//!
//! ```json
//! { "<owner_id>": [ { "<file_name>": "<base64>", "data": { "id": "<id>", "size": "<size>" } } ] }
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::manifest::Manifest;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("IO error reading {file_name}: {source}")]
    Io {
        file_name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{file_name} changed size after verification: expected {expected}, found {actual}")]
    SizeChanged {
        file_name: String,
        expected: u64,
        actual: u64,
    },
}

/// `{id, size}` metadata paired with each file. Both are strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub id: String,
    pub size: String,
}

/// One staged file: its name, base64 content and metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub file_name: String,
    /// Base64 (standard alphabet, padded) of the file bytes
    pub content: String,
    pub data: EntryMeta,
}

impl ListingEntry {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.content)
    }

    pub fn record_id(&self) -> Option<u64> {
        self.data.id.parse().ok()
    }
}

impl Serialize for ListingEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(&self.file_name, &self.content)?;
        map.serialize_entry("data", &self.data)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ListingEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut object = Map::<String, Value>::deserialize(deserializer)?;

        let data = object
            .remove("data")
            .ok_or_else(|| de::Error::missing_field("data"))?;
        let data: EntryMeta = serde_json::from_value(data).map_err(de::Error::custom)?;

        let mut rest = object.into_iter();
        let (file_name, content) = match (rest.next(), rest.next()) {
            (Some((name, Value::String(content))), None) => (name, content),
            (Some((name, _)), None) => {
                return Err(de::Error::custom(format!("content of {} is not a string", name)))
            }
            _ => return Err(de::Error::custom("listing entry must name exactly one file")),
        };

        Ok(ListingEntry {
            file_name,
            content,
            data,
        })
    }
}

/// The file-listing cache value for one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPayload {
    pub owner_id: String,
    pub entries: Vec<ListingEntry>,
}

impl ListingPayload {
    pub fn empty(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn find(&self, record_id: u64) -> Option<&ListingEntry> {
        self.entries.iter().find(|e| e.record_id() == Some(record_id))
    }

    /// Drop the entry for `record_id`, returning whether one was removed
    pub fn remove_record(&mut self, record_id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.record_id() != Some(record_id));
        self.entries.len() != before
    }
}

impl Serialize for ListingPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.owner_id, &self.entries)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ListingPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Map::<String, Value>::deserialize(deserializer)?;
        let mut fields = object.into_iter();

        match (fields.next(), fields.next()) {
            (Some((owner_id, entries)), None) => {
                let entries = serde_json::from_value(entries).map_err(de::Error::custom)?;
                Ok(ListingPayload { owner_id, entries })
            }
            _ => Err(de::Error::custom("listing payload must have exactly one owner")),
        }
    }
}

/// Encode every manifest entry, in manifest order, into the owner's payload.
/// Files are re-checked against the recorded size while being read.
pub async fn package(session: &Session, manifest: &Manifest) -> Result<ListingPayload, PackageError> {
    let mut entries = Vec::with_capacity(manifest.len());

    for entry in manifest.entries() {
        let path = session.working_dir().join(&entry.file_name);
        let bytes = tokio::fs::read(&path).await.map_err(|source| PackageError::Io {
            file_name: entry.file_name.clone(),
            source,
        })?;

        if bytes.len() as u64 != entry.size_bytes {
            return Err(PackageError::SizeChanged {
                file_name: entry.file_name.clone(),
                expected: entry.size_bytes,
                actual: bytes.len() as u64,
            });
        }

        entries.push(ListingEntry {
            file_name: entry.file_name.clone(),
            content: STANDARD.encode(&bytes),
            data: EntryMeta {
                id: entry.record_id.to_string(),
                size: entry.size_bytes.to_string(),
            },
        });
    }

    debug!(
        session_id = %session.id(),
        owner_id = session.owner_id(),
        files = entries.len(),
        "Packaged session listing"
    );

    Ok(ListingPayload {
        owner_id: session.owner_id().to_string(),
        entries,
    })
}
