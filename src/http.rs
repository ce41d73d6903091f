use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::conversation::RequestFlow;
use crate::error::IngestError;
use crate::reconciler::{EventReconciler, IngestOutcome};
use crate::types::{BackendKind, InstanceId, OutboundMessage, UserId};

#[derive(Clone)]
pub struct AppState {
    pub flow: Arc<RequestFlow>,
    pub reconciler: Arc<EventReconciler>,
}

#[derive(Debug, Deserialize)]
pub struct TextIntent {
    pub user_id: UserId,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackIntent {
    pub user_id: UserId,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct FileIntent {
    pub user_id: UserId,
    pub file_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub instance_id: InstanceId,
    pub token: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/intent/text", post(text_intent))
        .route("/intent/callback", post(callback_intent))
        .route("/intent/file", post(file_intent))
        .route("/webhook/{kind}", post(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn text_intent(
    State(state): State<AppState>,
    Json(intent): Json<TextIntent>,
) -> Result<Json<Vec<OutboundMessage>>, (StatusCode, String)> {
    let replies = state
        .flow
        .on_user_text(intent.user_id, &intent.text)
        .await
        .map_err(internal_error)?;
    Ok(Json(replies))
}

async fn callback_intent(
    State(state): State<AppState>,
    Json(intent): Json<CallbackIntent>,
) -> Result<Json<Vec<OutboundMessage>>, (StatusCode, String)> {
    let replies = state
        .flow
        .on_callback(intent.user_id, &intent.data)
        .await
        .map_err(internal_error)?;
    Ok(Json(replies))
}

async fn file_intent(
    State(state): State<AppState>,
    Json(intent): Json<FileIntent>,
) -> Result<Json<Vec<OutboundMessage>>, (StatusCode, String)> {
    let replies = state
        .flow
        .on_file_upload(intent.user_id, &intent.file_ref)
        .await
        .map_err(internal_error)?;
    Ok(Json(replies))
}

async fn webhook(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let Some(kind) = BackendKind::parse(&kind) else {
        return Err((StatusCode::NOT_FOUND, format!("unknown webhook kind `{kind}`")));
    };
    let outcome = state
        .reconciler
        .ingest(kind, query.instance_id, &query.token, &body)
        .await
        .map_err(ingest_error)?;
    // Accepted either way; the caller does not care whether we matched it.
    match outcome {
        IngestOutcome::Matched(_) | IngestOutcome::Unmatched | IngestOutcome::Duplicate => {
            Ok(StatusCode::ACCEPTED)
        }
    }
}

fn ingest_error(error: IngestError) -> (StatusCode, String) {
    let status = match &error {
        IngestError::InvalidToken => StatusCode::UNAUTHORIZED,
        IngestError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        IngestError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        IngestError::KindMismatch { .. } => StatusCode::BAD_REQUEST,
        IngestError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string())
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
