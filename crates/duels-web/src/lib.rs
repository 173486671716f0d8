//! HTTP receiver for queued run-end batches.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use duels_ingest::{parse_batch, IngestError};
use duels_pipeline::{BatchResponse, CardReference, PipelineConfig, RunSummaryPipeline};
use duels_storage::PgRunStore;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "duels-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RunSummaryPipeline>,
}

impl AppState {
    pub fn new(pipeline: RunSummaryPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(#[from] IngestError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "batch processing failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/events", post(events_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    let reference = Arc::new(CardReference::load(&config).await?);
    let store = Arc::new(PgRunStore::connect(&config.database_url, config.pg_store_config(1)).await?);
    let pipeline = RunSummaryPipeline::new(store, reference, config.store_timeout());

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening for run-end batches");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn events_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<BatchResponse>, AppError> {
    let batch = parse_batch(&body)?;
    state.pipeline.process_batch(&batch).await?;
    Ok(Json(BatchResponse::ok()))
}
