use std::path::PathBuf;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::session::{ImageRecord, SessionState, Stage};

#[derive(Debug, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub query: String,
    pub stage: String,
    pub failure_reason: Option<String>,
    pub model_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for SessionState {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(SessionState {
            id: row.id,
            query: row.query,
            stage: row.stage.parse::<Stage>().map_err(|e| anyhow!(e))?,
            failure_reason: row
                .failure_reason
                .map(|r| r.parse().map_err(|e: String| anyhow!(e)))
                .transpose()?,
            model_path: row.model_path.map(PathBuf::from),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct ImageRow {
    pub id: String,
    pub source_url: Option<String>,
    pub local_path: String,
    pub sampled: bool,
}

impl From<ImageRow> for ImageRecord {
    fn from(row: ImageRow) -> Self {
        ImageRecord::new(row.id, row.source_url, PathBuf::from(row.local_path))
    }
}
