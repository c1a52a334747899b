//! Embedding-based matching between profiles and items.
//!
//! # Architecture
//!
//! - `preprocess`: canonical text built from a record's fields
//! - `embeddings`: providers turning text into vectors
//! - `storage`: embedding records kept in the document store
//! - `index`: exhaustive cosine ranking
//! - `service`: recommendation queries on top of the above
//! - `analysis`: structured reading of free text by a chat model

mod analysis;
pub mod embeddings;
mod index;
mod preprocess;
mod service;
mod storage;

pub use analysis::{
    completer_from_config, CompletionProvider, TextAnalysis, TextAnalyzer,
};
pub use embeddings::{provider_from_config, EmbeddingProvider, ProviderError};
pub use index::{ExhaustiveMatcher, MatchError};
pub use preprocess::{
    build_text, snapshot, FieldSpec, FieldValue, TextFields, ITEM_FIELDS, PROFILE_FIELDS,
};
pub use service::{is_stale, Recommendation, SemanticSearchError, SemanticSearchService};
pub use storage::{EmbeddingRecord, EmbeddingStore, VectorStorage, VectorStorageError};
