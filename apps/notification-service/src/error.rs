//! # Notification Service エラー定義
//!
//! 配信受付で発生するエラーと、HTTP レスポンスへの変換を定義する。
//!
//! | エラー | ステータス |
//! |--------|-----------|
//! | `Validation` | 422 |
//! | `NotFound` | 404 |
//! | `UpstreamUnavailable` | 502 |
//! | `Database` / `Internal` | 500 |
//!
//! レスポンスボディは `{"errors": ["..."]}` 形式。

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use notifications_infra::{
    InfraError,
    client::{MembershipError, TokenError},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// エラーレスポンス
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<String>,
}

/// Notification Service で発生するエラー
#[derive(Debug, Error)]
pub enum ServiceError {
    /// リクエストの内容が不正（ジョブ作成前に拒否）
    #[error("入力が不正です: {}", .0.join(", "))]
    Validation(Vec<String>),

    /// 配信対象・テンプレート・ジョブが見つからない
    #[error("リソースが見つかりません: {0}")]
    NotFound(String),

    /// メンバーシップ API・認可サーバーが応答しない
    #[error("上流サービスを利用できません: {0}")]
    UpstreamUnavailable(String),

    /// データベースエラー
    #[error("データベースエラー: {0}")]
    Database(InfraError),

    /// 内部エラー
    #[error("内部エラー: {0}")]
    Internal(String),
}

impl ServiceError {
    /// 単一メッセージの Validation エラーを作る
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }
}

impl From<InfraError> for ServiceError {
    fn from(err: InfraError) -> Self {
        if err.is_not_found() {
            Self::NotFound(err.to_string())
        } else {
            Self::Database(err)
        }
    }
}

impl From<MembershipError> for ServiceError {
    fn from(err: MembershipError) -> Self {
        match err {
            MembershipError::NotFound(_) => Self::NotFound(err.to_string()),
            MembershipError::Unavailable(_) => Self::UpstreamUnavailable(err.to_string()),
        }
    }
}

impl From<TokenError> for ServiceError {
    fn from(err: TokenError) -> Self {
        Self::UpstreamUnavailable(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, errors) = match self {
            ServiceError::Validation(messages) => (StatusCode::UNPROCESSABLE_ENTITY, messages),
            ServiceError::NotFound(msg) => (StatusCode::NOT_FOUND, vec![msg]),
            ServiceError::UpstreamUnavailable(msg) => {
                tracing::warn!("上流サービスを利用できません: {}", msg);
                (StatusCode::BAD_GATEWAY, vec![msg])
            }
            ServiceError::Database(e) => {
                tracing::error!("データベースエラー: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    vec!["内部エラーが発生しました".to_string()],
                )
            }
            ServiceError::Internal(msg) => {
                tracing::error!("内部エラー: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    vec!["内部エラーが発生しました".to_string()],
                )
            }
        };

        (status, Json(ErrorResponse { errors })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ServiceError::validation("kind_id は必須です"), StatusCode::UNPROCESSABLE_ENTITY)]
    #[case(ServiceError::NotFound("space".to_string()), StatusCode::NOT_FOUND)]
    #[case(
        ServiceError::UpstreamUnavailable("cc".to_string()),
        StatusCode::BAD_GATEWAY
    )]
    #[case(
        ServiceError::Internal("boom".to_string()),
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    fn test_エラー種別ごとのステータスコード(
        #[case] error: ServiceError,
        #[case] expected: StatusCode,
    ) {
        assert_eq!(error.into_response().status(), expected);
    }

    #[test]
    fn test_メンバーシップのnot_foundは404に分類される() {
        let error = ServiceError::from(MembershipError::NotFound("space-1".to_string()));
        assert!(matches!(error, ServiceError::NotFound(_)));

        let error = ServiceError::from(MembershipError::Unavailable("timeout".to_string()));
        assert!(matches!(error, ServiceError::UpstreamUnavailable(_)));
    }

    #[test]
    fn test_インフラのnot_foundは404に分類される() {
        let error = ServiceError::from(InfraError::not_found("job", "job-1"));
        assert!(matches!(error, ServiceError::NotFound(_)));

        let error = ServiceError::from(InfraError::unexpected("boom"));
        assert!(matches!(error, ServiceError::Database(_)));
    }

    #[tokio::test]
    async fn test_内部エラーの詳細はレスポンスに含めない() {
        let response = ServiceError::Internal("secret detail".to_string()).into_response();

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body.errors, vec!["内部エラーが発生しました".to_string()]);
    }
}
