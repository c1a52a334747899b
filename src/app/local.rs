use std::sync::Arc;

use crate::{
    config::Config,
    documents::DocumentStore,
    entities::EntityKind,
    semantic::{
        CompletionProvider, EmbeddingProvider, EmbeddingStore, ExhaustiveMatcher,
        Recommendation, SemanticSearchService, TextAnalysis, TextAnalyzer, VectorStorage,
    },
};

use super::{
    batch::{BatchCoordinator, BatchCounts},
    errors::AppError,
    task_runner::{QueueDump, RefreshContext, TaskQueue},
};

/// In-process application: document store, refresh queue and queries.
pub struct AppLocal {
    config: Config,
    queue: Arc<TaskQueue>,
    ctx: RefreshContext,
    coordinator: BatchCoordinator,
    search: SemanticSearchService,
    analyzer: Option<TextAnalyzer>,
}

impl AppLocal {
    pub fn new(
        config: Config,
        docs: Arc<dyn DocumentStore>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let profile_embeddings: Arc<dyn EmbeddingStore> = Arc::new(VectorStorage::new(
            docs.clone(),
            EntityKind::Profile.embedding_collection(),
        ));
        let item_embeddings: Arc<dyn EmbeddingStore> = Arc::new(VectorStorage::new(
            docs.clone(),
            EntityKind::Item.embedding_collection(),
        ));

        let queue = Arc::new(TaskQueue::default());
        let max_snapshot_age = config.max_snapshot_age();

        let coordinator = BatchCoordinator::new(
            docs.clone(),
            queue.clone(),
            profile_embeddings.clone(),
            item_embeddings.clone(),
            max_snapshot_age,
        );

        let search = SemanticSearchService::new(
            provider.clone(),
            profile_embeddings.clone(),
            item_embeddings.clone(),
            Arc::new(ExhaustiveMatcher),
            max_snapshot_age,
        );

        let ctx = RefreshContext {
            docs,
            provider,
            profile_embeddings,
            item_embeddings,
        };

        Self {
            config,
            queue,
            ctx,
            coordinator,
            search,
            analyzer: None,
        }
    }

    /// Enable [`AppLocal::analyze_text`] with `provider`.
    pub fn with_analyzer(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.analyzer = Some(TextAnalyzer::new(provider));
        self
    }

    pub fn run_queue(&self) {
        self.queue
            .start(self.ctx.clone(), self.config.task_queue_max_threads);
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub fn wait_task_queue_finish(&self) {
        self.queue.wait_finish();
    }

    pub fn task_queue(&self) -> QueueDump {
        self.queue.board().dump()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider_name(&self) -> &str {
        self.search.provider_name()
    }

    /// Number of stored (profile, item) embeddings.
    pub fn indexed_counts(&self) -> Result<(usize, usize), AppError> {
        Ok(self.search.indexed_counts()?)
    }

    fn recommendation_limit(&self, limit: Option<usize>) -> usize {
        limit.unwrap_or(self.config.recommendations.default_limit)
    }

    pub fn recommend_for_profile(
        &self,
        profile_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Recommendation>, AppError> {
        let limit = self.recommendation_limit(limit);
        Ok(self.search.recommend_for_profile(profile_id, limit)?)
    }

    pub fn recommend_for_text(
        &self,
        text: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Recommendation>, AppError> {
        let limit = self.recommendation_limit(limit);
        Ok(self.search.recommend_for_text(text, limit)?)
    }

    pub fn similar_profiles(
        &self,
        profile_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Recommendation>, AppError> {
        let limit = self.recommendation_limit(limit);
        Ok(self.search.similar_profiles(profile_id, limit)?)
    }

    pub fn analyze_text(&self, text: &str) -> Result<TextAnalysis, AppError> {
        let analyzer = self.analyzer.as_ref().ok_or(AppError::AnalysisUnavailable)?;
        Ok(analyzer.analyze(text)?)
    }

    pub fn refresh_one(&self, kind: EntityKind, id: &str) -> Result<(), AppError> {
        self.coordinator.refresh_one(kind, id)
    }

    pub fn refresh_all(&self) -> Result<BatchCounts, AppError> {
        self.coordinator.refresh_all()
    }

    /// Falls back to `batch_default_limit` when `limit` is omitted.
    pub fn batch_process(
        &self,
        since: Option<&str>,
        limit: Option<usize>,
    ) -> Result<BatchCounts, AppError> {
        let limit = limit.unwrap_or(self.config.batch_default_limit);
        self.coordinator.batch_process(since, Some(limit))
    }

    pub fn schedule_stale(&self, kind: EntityKind) -> Result<usize, AppError> {
        self.coordinator.schedule_stale(kind)
    }
}
