mod api;
mod error;
mod state;
pub mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::state::*;

#[derive(OpenApi)]
#[openapi(
    paths(api::start_session, api::list_sessions, api::get_session, api::submit_annotations),
    components(schemas(
        types::StartRequest,
        types::AnnotateRequest,
        types::AnnotationItem,
        types::SessionResponse,
        types::SessionDetail,
        types::ImageResponse,
        crate::session::Stage,
        crate::session::FailureReason,
    ))
)]
pub struct ApiDoc;

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sessions", post(api::start_session).get(api::list_sessions))
        .route("/sessions/{id}", get(api::get_session))
        .route("/sessions/{id}/annotations", post(api::submit_annotations))
        .route("/metrics", get(api::metrics_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // annotation submissions are small JSON bodies
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .with_state(state)
}
