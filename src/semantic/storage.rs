//! Embedding persistence.
//!
//! One [`EmbeddingRecord`] per entity id, stored as a whole document in the
//! kind's embedding collection (`profileEmbeddings` / `itemEmbeddings`):
//!
//! ```json
//! {
//!   "entityId": "u1",
//!   "vector": [0.12, -0.03, ...],
//!   "generatedAt": "2024-05-01T10:00:00Z",
//!   "model": "text-embedding-3-small",
//!   "snapshot": { "displayName": "Ava", "location": "Lisbon" }
//! }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::documents::{Collection, Document, DocumentError, DocumentStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingRecord {
    pub entity_id: String,
    pub vector: Vec<f32>,
    pub generated_at: DateTime<Utc>,
    /// Provider that produced `vector`
    #[serde(default)]
    pub model: String,
    /// Source fields as they were when `vector` was generated
    #[serde(default)]
    pub snapshot: Document,
}

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("Document store error: {0}")]
    Documents(#[from] DocumentError),

    #[error("Failed to encode embedding record: {0}")]
    Encode(String),

    #[error("Malformed embedding record {id}: {source}")]
    Malformed {
        id: String,
        source: serde_json::Error,
    },
}

pub trait EmbeddingStore: Send + Sync {
    /// Replace the record stored for `entity_id`.
    fn upsert(&self, entity_id: &str, record: EmbeddingRecord) -> Result<(), VectorStorageError>;

    fn get(&self, entity_id: &str) -> Result<Option<EmbeddingRecord>, VectorStorageError>;

    /// Iterate over the records present when this is called.
    ///
    /// Upserts landing after the call are not reflected; call again for a
    /// fresh pass.
    fn get_all(
        &self,
    ) -> Result<Box<dyn Iterator<Item = EmbeddingRecord> + Send>, VectorStorageError>;
}

/// Embedding store backed by a document store collection.
#[derive(Clone)]
pub struct VectorStorage {
    docs: Arc<dyn DocumentStore>,
    collection: Collection,
}

impl VectorStorage {
    pub fn new(docs: Arc<dyn DocumentStore>, collection: Collection) -> Self {
        Self { docs, collection }
    }

    fn encode(record: EmbeddingRecord) -> Result<Document, VectorStorageError> {
        match serde_json::to_value(record) {
            Ok(Value::Object(doc)) => Ok(doc),
            Ok(other) => Err(VectorStorageError::Encode(format!(
                "expected an object, got {other}"
            ))),
            Err(err) => Err(VectorStorageError::Encode(err.to_string())),
        }
    }

    fn decode(id: &str, doc: Document) -> Result<EmbeddingRecord, VectorStorageError> {
        serde_json::from_value(Value::Object(doc)).map_err(|source| VectorStorageError::Malformed {
            id: id.to_string(),
            source,
        })
    }
}

impl EmbeddingStore for VectorStorage {
    fn upsert(&self, entity_id: &str, record: EmbeddingRecord) -> Result<(), VectorStorageError> {
        let doc = Self::encode(record)?;
        self.docs.set(self.collection, entity_id, doc)?;
        Ok(())
    }

    fn get(&self, entity_id: &str) -> Result<Option<EmbeddingRecord>, VectorStorageError> {
        self.docs
            .get(self.collection, entity_id)?
            .map(|doc| Self::decode(entity_id, doc))
            .transpose()
    }

    fn get_all(
        &self,
    ) -> Result<Box<dyn Iterator<Item = EmbeddingRecord> + Send>, VectorStorageError> {
        let collection = self.collection;
        let docs = self.docs.stream(collection)?;

        Ok(Box::new(docs.into_iter().filter_map(move |(id, doc)| {
            match Self::decode(&id, doc) {
                Ok(record) => Some(record),
                Err(err) => {
                    log::warn!("skipping unreadable record in {collection}: {err}");
                    None
                }
            }
        })))
    }
}
