use crate::{
    app::{AppError, AppLocal, BatchCounts, QueueDump},
    entities::EntityKind,
    semantic::{Recommendation, TextAnalysis},
};
use anyhow::anyhow;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

type SharedState = Arc<AppLocal>;

async fn shutdown_signal(app: SharedState) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    app.shutdown();

    // join on queue thread handle
    log::warn!("waiting for queues to stop");
    if let Err(err) = tokio::task::spawn_blocking(move || app.wait_task_queue_finish()).await {
        log::error!("failed to join task queue: {err}");
    }
}

pub(crate) fn router(app: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/recommendations/items", post(recommend_items))
        .route("/api/recommendations/text", post(recommend_text))
        .route("/api/recommendations/profiles", post(similar_profiles))
        .route("/api/recommendations/analyze", post(analyze_text))
        .route("/api/embeddings/refresh", post(refresh))
        .route("/api/embeddings/refresh_all", post(refresh_all))
        .route("/api/embeddings/batch", post(batch))
        .route("/api/embeddings/refresh_stale", post(refresh_stale))
        .route("/api/task_queue", get(task_queue))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(app)
}

async fn start_app(app: SharedState) -> anyhow::Result<()> {
    let listen_addr = app.config().listen_addr.clone();

    let signal = shutdown_signal(app.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    log::info!("listening on {listen_addr}");
    axum::serve(listener, router(app))
        .with_graceful_shutdown(signal)
        .await?;

    Ok(())
}

pub fn start_daemon(app: AppLocal) -> anyhow::Result<()> {
    // the blocking http client inside must not be dropped on a runtime thread
    let app = Arc::new(app);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(app.clone()))
}

#[derive(Debug)]
pub(crate) struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::DegenerateQuery => StatusCode::BAD_REQUEST,
            AppError::AnalysisUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Provider(_) => {
                log::error!("{self:?}");
                StatusCode::BAD_GATEWAY
            }
            AppError::Documents(_)
            | AppError::Storage(_)
            | AppError::QueueClosed
            | AppError::Other(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

// This enables using `?` on anything convertible to `AppError`.
impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Runs `f` on the blocking pool; provider calls and document writes block.
async fn blocking<T, F>(app: &SharedState, f: F) -> Result<T, HttpError>
where
    F: FnOnce(&AppLocal) -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    let app = app.clone();
    let result = tokio::task::spawn_blocking(move || f(&app))
        .await
        .map_err(|err| anyhow!("blocking task failed: {err}"))?;
    Ok(result?)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    provider: String,
    profile_embeddings: usize,
    item_embeddings: usize,
}

async fn health(State(app): State<SharedState>) -> Result<Json<HealthResponse>, HttpError> {
    let response = blocking(&app, |app| {
        let (profile_embeddings, item_embeddings) = app.indexed_counts()?;
        Ok(HealthResponse {
            status: "ok",
            timestamp: chrono::Utc::now(),
            provider: app.provider_name().to_string(),
            profile_embeddings,
            item_embeddings,
        })
    })
    .await?;

    Ok(Json(response))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileQueryRequest {
    pub profile_id: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextQueryRequest {
    pub text: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecommendationsResponse {
    pub results: Vec<Recommendation>,
}

async fn recommend_items(
    State(app): State<SharedState>,
    Json(payload): Json<ProfileQueryRequest>,
) -> Result<Json<RecommendationsResponse>, HttpError> {
    let results = blocking(&app, move |app| {
        app.recommend_for_profile(&payload.profile_id, payload.limit)
    })
    .await?;

    Ok(Json(RecommendationsResponse { results }))
}

async fn recommend_text(
    State(app): State<SharedState>,
    Json(payload): Json<TextQueryRequest>,
) -> Result<Json<RecommendationsResponse>, HttpError> {
    let results =
        blocking(&app, move |app| app.recommend_for_text(&payload.text, payload.limit)).await?;

    Ok(Json(RecommendationsResponse { results }))
}

async fn similar_profiles(
    State(app): State<SharedState>,
    Json(payload): Json<ProfileQueryRequest>,
) -> Result<Json<RecommendationsResponse>, HttpError> {
    let results = blocking(&app, move |app| {
        app.similar_profiles(&payload.profile_id, payload.limit)
    })
    .await?;

    Ok(Json(RecommendationsResponse { results }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub analysis: TextAnalysis,
}

async fn analyze_text(
    State(app): State<SharedState>,
    Json(payload): Json<AnalyzeRequest>,
) -> Result<Json<AnalysisResponse>, HttpError> {
    let analysis = blocking(&app, move |app| app.analyze_text(&payload.text)).await?;

    Ok(Json(AnalysisResponse { analysis }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub kind: EntityKind,
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BatchRequest {
    pub since: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaleRequest {
    pub kind: EntityKind,
}

#[derive(Debug, Serialize)]
pub struct ScheduledResponse {
    pub scheduled: usize,
}

async fn refresh(
    State(app): State<SharedState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<(StatusCode, Json<ScheduledResponse>), HttpError> {
    blocking(&app, move |app| app.refresh_one(payload.kind, &payload.id)).await?;

    Ok((StatusCode::ACCEPTED, Json(ScheduledResponse { scheduled: 1 })))
}

async fn refresh_all(
    State(app): State<SharedState>,
) -> Result<(StatusCode, Json<BatchCounts>), HttpError> {
    let counts = blocking(&app, |app| app.refresh_all()).await?;

    Ok((StatusCode::ACCEPTED, Json(counts)))
}

async fn batch(
    State(app): State<SharedState>,
    Json(payload): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchCounts>), HttpError> {
    let counts = blocking(&app, move |app| {
        app.batch_process(payload.since.as_deref(), payload.limit)
    })
    .await?;

    Ok((StatusCode::ACCEPTED, Json(counts)))
}

async fn refresh_stale(
    State(app): State<SharedState>,
    Json(payload): Json<StaleRequest>,
) -> Result<(StatusCode, Json<ScheduledResponse>), HttpError> {
    let scheduled = blocking(&app, move |app| app.schedule_stale(payload.kind)).await?;

    Ok((StatusCode::ACCEPTED, Json(ScheduledResponse { scheduled })))
}

async fn task_queue(State(app): State<SharedState>) -> Json<QueueDump> {
    Json(app.task_queue())
}
