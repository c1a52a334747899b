use crate::{
    documents::DocumentError,
    semantic::{MatchError, ProviderError, SemanticSearchError, VectorStorageError},
};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("embedding provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("query vector has zero norm")]
    DegenerateQuery,

    #[error("document store error: {0}")]
    Documents(#[from] DocumentError),

    #[error("embedding store error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("task queue is not running")]
    QueueClosed,

    #[error("text analysis is not configured")]
    AnalysisUnavailable,

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<MatchError> for AppError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::DegenerateQuery => AppError::DegenerateQuery,
        }
    }
}

impl From<SemanticSearchError> for AppError {
    fn from(err: SemanticSearchError) -> Self {
        match err {
            SemanticSearchError::Embedding(err) => err.into(),
            SemanticSearchError::Match(err) => err.into(),
            SemanticSearchError::Storage(err) => err.into(),
        }
    }
}
