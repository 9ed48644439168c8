use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::session::{FailureReason, ImageRecord, SessionState, Stage};

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartRequest {
    /// Search query describing the object class to bootstrap
    pub query: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AnnotationItem {
    pub image_id: String,
    pub class_name: String,
    /// `[y_min, x_min, y_max, x_max]`, normalized to `[0, 1]`
    pub bbox: [f32; 4],
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AnnotateRequest {
    pub annotations: Vec<AnnotationItem>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub id: String,
    pub query: String,
    pub stage: Stage,
    pub failure_reason: Option<FailureReason>,
    pub model_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<SessionState> for SessionResponse {
    fn from(session: SessionState) -> Self {
        Self {
            id: session.id,
            query: session.query,
            stage: session.stage,
            failure_reason: session.failure_reason,
            model_path: session.model_path.map(|p| p.to_string_lossy().to_string()),
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ImageResponse {
    pub id: String,
    pub source_url: Option<String>,
    pub local_path: String,
}

impl From<ImageRecord> for ImageResponse {
    fn from(record: ImageRecord) -> Self {
        Self {
            id: record.id,
            source_url: record.source_url,
            local_path: record.local_path.to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionDetail {
    pub session: SessionResponse,
    /// Images handed to the annotator
    pub images: Vec<ImageResponse>,
}

impl SessionDetail {
    pub fn new(session: SessionState, images: Vec<ImageRecord>) -> Self {
        Self {
            session: session.into(),
            images: images.into_iter().map(Into::into).collect(),
        }
    }
}
