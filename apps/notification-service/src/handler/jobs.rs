//! # ジョブ運用ハンドラ
//!
//! 再試行上限に達したジョブを運用者が確認・再投入するための内部 API。
//!
//! ## エンドポイント
//!
//! - `GET /internal/jobs/failed?limit=N` - 終端失敗したジョブの一覧
//! - `POST /internal/jobs/{job_id}/retry` - 終端失敗したジョブを再投入

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use notifications_domain::job::{Job, JobId};
use notifications_infra::{db::TransactionManager, repository::JobQueue};
use notifications_shared::{event_log::event, log_business_event};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ServiceError;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// ジョブ運用 API の共有状態
pub struct JobState {
    pub queue:      Arc<dyn JobQueue>,
    pub tx_manager: Arc<dyn TransactionManager>,
}

#[derive(Debug, Deserialize)]
pub struct FailedJobsQuery {
    pub limit: Option<i64>,
}

/// 終端失敗ジョブ DTO
#[derive(Debug, Serialize, Deserialize)]
pub struct FailedJobDto {
    pub id:             Uuid,
    pub attempts:       i32,
    pub manual_retries: i32,
    pub last_error:     Option<String>,
    pub payload:        serde_json::Value,
    pub created_at:     String,
    pub updated_at:     String,
}

impl From<Job> for FailedJobDto {
    fn from(job: Job) -> Self {
        Self {
            id:             *job.id.as_uuid(),
            attempts:       job.attempts,
            manual_retries: job.manual_retries,
            last_error:     job.last_error,
            payload:        job.payload,
            created_at:     job.created_at.to_rfc3339(),
            updated_at:     job.updated_at.to_rfc3339(),
        }
    }
}

/// GET /internal/jobs/failed
///
/// `limit` は 1〜500 に丸める（省略時 50）。
pub async fn list_failed_jobs(
    State(state): State<Arc<JobState>>,
    Query(query): Query<FailedJobsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let jobs: Vec<FailedJobDto> = state
        .queue
        .find_failed(limit)
        .await?
        .into_iter()
        .map(FailedJobDto::from)
        .collect();

    Ok((StatusCode::OK, Json(jobs)))
}

/// POST /internal/jobs/{job_id}/retry
///
/// ## レスポンス
///
/// - `204 No Content`: 再投入した（試行回数は残り、`manual_retries` が増える）
/// - `404 Not Found`: ジョブが存在しないか、終端失敗ではない
pub async fn retry_failed_job(
    State(state): State<Arc<JobState>>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let job_id = JobId::from_uuid(job_id);

    let mut tx = state.tx_manager.begin().await?;
    state.queue.retry_failed(&mut tx, &job_id).await?;
    tx.commit().await?;

    log_business_event!(
        event.category = event::category::JOB,
        event.action = event::action::RETRY_REQUESTED,
        event.entity_type = event::entity_type::JOB,
        event.entity_id = %job_id,
        event.result = event::result::SUCCESS,
        "終端失敗したジョブを再投入しました"
    );

    Ok(StatusCode::NO_CONTENT)
}
