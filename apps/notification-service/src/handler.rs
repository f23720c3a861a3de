//! # HTTP リクエストハンドラ
//!
//! axum のルートに対応するハンドラ関数を定義する。
//!
//! ## 設計方針
//!
//! - 各ハンドラはサブモジュールに配置
//! - 親モジュール（この `handler.rs`）で re-export し、フラットな API を提供
//! - ハンドラは薄く保ち、宛先解決とジョブ投入はユースケース層に委譲
//!
//! ## エンドポイント
//!
//! ```text
//! GET  /health
//! POST /users/{guid}
//! POST /spaces/{guid}
//! POST /organizations/{guid}
//! POST /everyone
//! POST /recipients
//! GET  /internal/jobs/failed
//! POST /internal/jobs/{job_id}/retry
//! ```

pub mod health;
pub mod jobs;
pub mod notify;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
pub use health::health_check;
pub use jobs::{FailedJobDto, JobState, list_failed_jobs, retry_failed_job};
pub use notify::{
    HtmlBody,
    NotifyRequest,
    NotifyState,
    notify_everyone,
    notify_organization,
    notify_recipients,
    notify_space,
    notify_user,
};
use tower_http::trace::TraceLayer;

/// アプリケーション全体のルーターを組み立てる
pub fn router(notify_state: Arc<NotifyState>, job_state: Arc<JobState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/users/{guid}", post(notify_user))
        .route("/spaces/{guid}", post(notify_space))
        .route("/organizations/{guid}", post(notify_organization))
        .route("/everyone", post(notify_everyone))
        .route("/recipients", post(notify_recipients))
        .with_state(notify_state)
        .route("/internal/jobs/failed", get(list_failed_jobs))
        .route("/internal/jobs/{job_id}/retry", post(retry_failed_job))
        .with_state(job_state)
        .layer(TraceLayer::new_for_http())
}
