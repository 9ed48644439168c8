use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::Json;

use super::error::AppError;
use super::state::AppState;
use super::types::*;
use crate::annotation::{Annotation, BBox};

/// Create a session: search, sample and suspend for manual annotation.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = StartRequest,
    responses((status = 200, description = "session advanced to a suspend or terminal stage", body = SessionDetail))
)]
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<SessionDetail>, AppError> {
    let session = state.pipeline.start(&request.query).await?;
    let images = state.pipeline.sampled_images(&session.id).await?;
    Ok(Json(SessionDetail::new(session, images)))
}

#[utoipa::path(
    get,
    path = "/sessions",
    responses((status = 200, description = "all sessions", body = Vec<SessionResponse>))
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SessionResponse>>, AppError> {
    let sessions = state.pipeline.sessions().await?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/sessions/{id}",
    params(("id" = String, Path, description = "session id")),
    responses((status = 200, description = "session state", body = SessionDetail))
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, AppError> {
    let session = state
        .pipeline
        .status(&id)
        .await?
        .with_context(|| format!("no such session: {id}"))?;
    let images = state.pipeline.sampled_images(&id).await?;
    Ok(Json(SessionDetail::new(session, images)))
}

/// Submit manual annotations and run the session to a terminal stage.
#[utoipa::path(
    post,
    path = "/sessions/{id}/annotations",
    params(("id" = String, Path, description = "session id")),
    request_body = AnnotateRequest,
    responses((status = 200, description = "terminal session state", body = SessionResponse))
)]
pub async fn submit_annotations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<AnnotateRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let mut annotations = Vec::with_capacity(request.annotations.len());
    for item in request.annotations {
        let bbox = BBox::try_from(item.bbox)?;
        annotations.push(Annotation::manual(item.image_id, item.class_name, bbox));
    }
    let session = state.pipeline.submit_annotations(&id, annotations).await?;
    Ok(Json(session.into()))
}

pub async fn metrics_handler() -> Result<String, AppError> {
    let encoder = prometheus::TextEncoder::new();
    Ok(encoder.encode_to_string(&prometheus::gather())?)
}
