use anyhow::Result;
use chrono::{DateTime, Utc};

use super::model::{ImageRow, SessionRow};
use super::Database;
use crate::session::{ImageRecord, SessionState, Stage};

pub async fn insert_session(db: &Database, session: &SessionState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO session (id, query, stage, failure_reason, model_path, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.query)
    .bind(session.stage.as_str())
    .bind(session.failure_reason.map(|r| r.to_string()))
    .bind(session.model_path.as_ref().map(|p| p.to_string_lossy().to_string()))
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn update_session(db: &Database, session: &SessionState) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE session
        SET stage = ?, failure_reason = ?, model_path = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(session.stage.as_str())
    .bind(session.failure_reason.map(|r| r.to_string()))
    .bind(session.model_path.as_ref().map(|p| p.to_string_lossy().to_string()))
    .bind(session.updated_at)
    .bind(&session.id)
    .execute(db)
    .await?;
    Ok(())
}

/// Compare-and-swap the session stage. Returns false when the session is
/// not in `from` anymore, so exactly one of any number of concurrent
/// callers observes the swap.
pub async fn swap_stage(
    db: &Database,
    id: &str,
    from: Stage,
    to: Stage,
    updated_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE session SET stage = ?, updated_at = ? WHERE id = ? AND stage = ?
        "#,
    )
    .bind(to.as_str())
    .bind(updated_at)
    .bind(id)
    .bind(from.as_str())
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_session(db: &Database, id: &str) -> Result<Option<SessionState>> {
    let row = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT id, query, stage, failure_reason, model_path, created_at, updated_at
        FROM session WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    row.map(SessionState::try_from).transpose()
}

pub async fn list_sessions(db: &Database) -> Result<Vec<SessionState>> {
    let rows = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT id, query, stage, failure_reason, model_path, created_at, updated_at
        FROM session ORDER BY created_at
        "#,
    )
    .fetch_all(db)
    .await?;
    rows.into_iter().map(SessionState::try_from).collect()
}

pub async fn insert_images(
    db: &Database,
    session_id: &str,
    images: &[ImageRecord],
    sampled: bool,
) -> Result<()> {
    let mut tx = db.begin().await?;
    for image in images {
        sqlx::query(
            r#"
            INSERT INTO image (id, session_id, source_url, local_path, sampled)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&image.id)
        .bind(session_id)
        .bind(&image.source_url)
        .bind(image.local_path.to_string_lossy().to_string())
        .bind(sampled)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn get_images(
    db: &Database,
    session_id: &str,
    sampled_only: bool,
) -> Result<Vec<ImageRecord>> {
    let query = if sampled_only {
        r#"
        SELECT id, source_url, local_path, sampled FROM image
        WHERE session_id = ? AND sampled = 1 ORDER BY id
        "#
    } else {
        r#"
        SELECT id, source_url, local_path, sampled FROM image
        WHERE session_id = ? ORDER BY id
        "#
    };
    let rows = sqlx::query_as::<_, ImageRow>(query).bind(session_id).fetch_all(db).await?;
    Ok(rows.into_iter().map(ImageRecord::from).collect())
}
