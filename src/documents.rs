//! Document store collaborator.
//!
//! Documents are schemaless key/value maps grouped into fixed collections.
//! The refresh pipeline only needs get-by-id, whole-document replace,
//! stream-all and a "field >= timestamp" filter with an optional limit.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    str::FromStr,
    sync::{Arc, RwLock},
    time::Instant,
};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::storage::StorageManager;

pub type Document = serde_json::Map<String, Value>;

/// Field consulted by recency filters on source collections.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    Profiles,
    Items,
    ProfileEmbeddings,
    ItemEmbeddings,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Profiles,
        Collection::Items,
        Collection::ProfileEmbeddings,
        Collection::ItemEmbeddings,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Profiles => "profiles",
            Collection::Items => "items",
            Collection::ProfileEmbeddings => "profileEmbeddings",
            Collection::ItemEmbeddings => "itemEmbeddings",
        }
    }

}

impl Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| DocumentError::UnknownCollection(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed collection file {collection}: {source}")]
    Malformed {
        collection: Collection,
        source: serde_json::Error,
    },

    #[error("failed to encode collection {collection}: {source}")]
    Encode {
        collection: Collection,
        source: serde_json::Error,
    },

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("document id must not be empty")]
    EmptyId,

    #[error("document store lock poisoned")]
    Poisoned,
}

/// Keep documents whose `field` is at or after `at`.
#[derive(Clone, Debug)]
pub struct Since {
    pub field: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct Query {
    pub since: Option<Since>,
    pub limit: Option<usize>,
}

pub trait DocumentStore: Send + Sync {
    fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, DocumentError>;

    /// Replaces the whole document stored under `id`.
    fn set(&self, collection: Collection, id: &str, doc: Document) -> Result<(), DocumentError>;

    /// Every document in the collection, ordered by id.
    fn stream(&self, collection: Collection) -> Result<Vec<(String, Document)>, DocumentError>;

    fn query(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Vec<(String, Document)>, DocumentError> {
        Ok(apply_query(self.stream(collection)?, query))
    }
}

/// Filters then truncates, matching a document database's where+limit.
/// Documents missing the filter field never match.
pub fn apply_query(docs: Vec<(String, Document)>, query: &Query) -> Vec<(String, Document)> {
    let limit = query.limit.unwrap_or(usize::MAX);

    docs.into_iter()
        .filter(|(_, doc)| match &query.since {
            Some(since) => doc
                .get(&since.field)
                .and_then(timestamp_of)
                .map(|ts| ts >= since.at)
                .unwrap_or(false),
            None => true,
        })
        .take(limit)
        .collect()
}

/// Reads a stored timestamp: either a date string or epoch milliseconds.
pub fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Parses RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS[.f]` (taken as UTC), or a
/// plain `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

type Collections = HashMap<Collection, BTreeMap<String, Document>>;

fn snapshot_of(collections: &Collections, collection: Collection) -> Vec<(String, Document)> {
    collections
        .get(&collection)
        .map(|docs| {
            docs.iter()
                .map(|(id, doc)| (id.clone(), doc.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// In-process document store.
#[derive(Debug, Default, Clone)]
pub struct MemoryDocuments {
    collections: Arc<RwLock<Collections>>,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryDocuments {
    fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, DocumentError> {
        let collections = self.collections.read().map_err(|_| DocumentError::Poisoned)?;
        Ok(collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn set(&self, collection: Collection, id: &str, doc: Document) -> Result<(), DocumentError> {
        let mut collections = self.collections.write().map_err(|_| DocumentError::Poisoned)?;
        collections
            .entry(collection)
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    fn stream(&self, collection: Collection) -> Result<Vec<(String, Document)>, DocumentError> {
        let collections = self.collections.read().map_err(|_| DocumentError::Poisoned)?;
        Ok(snapshot_of(&collections, collection))
    }
}

/// File name for a document id. Bytes outside `[A-Za-z0-9_-]` are
/// written as `%XX`, so any id maps to a single safe file name.
fn encode_id(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn decode_id(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

fn document_ident(collection: Collection, id: &str) -> String {
    format!("{collection}/{}.json", encode_id(id))
}

/// Document store persisted as one `<collection>/<id>.json` file per
/// document.
///
/// All collections are loaded on open and served from memory. A `set`
/// writes only the affected document file; memory is updated after the
/// write succeeded, so readers never see a document that is not on disk.
pub struct JsonDocuments {
    collections: RwLock<Collections>,
    storage: Arc<dyn StorageManager>,
}

impl JsonDocuments {
    pub fn load(storage: Arc<dyn StorageManager>) -> Result<Self, DocumentError> {
        let now = Instant::now();
        let mut collections = Collections::new();

        for collection in Collection::ALL {
            let mut docs = BTreeMap::new();

            for file_name in storage.list(collection.name())? {
                let Some(id) = file_name.strip_suffix(".json").and_then(decode_id) else {
                    log::warn!("skipping unexpected file {collection}/{file_name}");
                    continue;
                };

                let data = storage.read(&format!("{collection}/{file_name}"))?;
                let doc: Document = serde_json::from_slice(&data)
                    .map_err(|source| DocumentError::Malformed { collection, source })?;
                docs.insert(id, doc);
            }

            log::debug!("loaded {} documents from {collection}", docs.len());
            collections.insert(collection, docs);
        }

        log::debug!(
            "took {}ms to load documents",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        Ok(Self {
            collections: RwLock::new(collections),
            storage,
        })
    }
}

impl DocumentStore for JsonDocuments {
    fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, DocumentError> {
        let collections = self.collections.read().map_err(|_| DocumentError::Poisoned)?;
        Ok(collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn set(&self, collection: Collection, id: &str, doc: Document) -> Result<(), DocumentError> {
        if id.is_empty() {
            return Err(DocumentError::EmptyId);
        }

        let data = serde_json::to_vec_pretty(&doc)
            .map_err(|source| DocumentError::Encode { collection, source })?;

        // held across the write so concurrent sets of one id land on disk
        // in the same order as in memory
        let mut collections = self.collections.write().map_err(|_| DocumentError::Poisoned)?;
        self.storage.write(&document_ident(collection, id), &data)?;
        collections
            .entry(collection)
            .or_default()
            .insert(id.to_string(), doc);

        Ok(())
    }

    fn stream(&self, collection: Collection) -> Result<Vec<(String, Document)>, DocumentError> {
        let collections = self.collections.read().map_err(|_| DocumentError::Poisoned)?;
        Ok(snapshot_of(&collections, collection))
    }
}
