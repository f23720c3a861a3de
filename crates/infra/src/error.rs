//! # インフラ層エラー定義
//!
//! ジョブキュー・配信記録・テンプレートストアの操作で発生するエラー。
//!
//! [`InfraError`] は種別（[`InfraErrorKind`]）に加えて、生成時点の [`SpanTrace`] を持つ。
//! ワーカーの予約失敗のように呼び出し元から離れた場所でログに出すとき、
//! どのワーカー・どのジョブの処理中だったかをスパンから辿れる。
//!
//! 呼び出し側は「重複」と「不在」を区別する必要がある。
//! 配信記録の厳密作成は重複を、検索と運用者の再投入は不在を返す。
//! ジョブの完了・失敗の記録は、呼び出したワーカーがもうリースを持っていなければ
//! [`InfraErrorKind::LeaseLost`] を返す。

use std::fmt;

use derive_more::Display;
use thiserror::Error;
use tracing_error::SpanTrace;

/// ジョブキュー・配信記録・テンプレートストアの操作エラー
#[derive(Display)]
#[display("{kind}")]
pub struct InfraError {
    kind:       InfraErrorKind,
    span_trace: SpanTrace,
}

#[derive(Debug, Error)]
pub enum InfraErrorKind {
    #[error("データベースエラー: {0}")]
    Database(#[source] sqlx::Error),

    /// ジョブペイロードやテンプレート行を JSON として扱えない
    #[error("ペイロードを変換できません: {0}")]
    Payload(#[source] serde_json::Error),

    /// 厳密な作成で既存のキーとぶつかった
    #[error("既に存在します: {entity}({key})")]
    Duplicate { entity: String, key: String },

    #[error("見つかりません: {entity}({key})")]
    NotFound { entity: String, key: String },

    /// リース切れの後に別のワーカーが予約した、または既に完了・失敗済み
    #[error("ジョブのリースを失っています: {job_id}(worker {worker_id})")]
    LeaseLost { job_id: String, worker_id: i64 },

    /// 行の内容が想定と合わない（未知のジョブ状態など）
    #[error("不整合なデータ: {0}")]
    Unexpected(String),
}

impl InfraError {
    /// 現在のスパンを記録して包む
    fn capture(kind: InfraErrorKind) -> Self {
        Self {
            kind,
            span_trace: SpanTrace::capture(),
        }
    }

    pub fn kind(&self) -> &InfraErrorKind {
        &self.kind
    }

    /// 生成時点のスパン（ワーカー ID やジョブ ID を含む）
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self.kind, InfraErrorKind::Duplicate { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, InfraErrorKind::NotFound { .. })
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self.kind, InfraErrorKind::LeaseLost { .. })
    }

    pub fn duplicate(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::capture(InfraErrorKind::Duplicate {
            entity: entity.into(),
            key:    key.into(),
        })
    }

    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::capture(InfraErrorKind::NotFound {
            entity: entity.into(),
            key:    key.into(),
        })
    }

    pub fn lease_lost(job_id: impl Into<String>, worker_id: i64) -> Self {
        Self::capture(InfraErrorKind::LeaseLost {
            job_id: job_id.into(),
            worker_id,
        })
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::capture(InfraErrorKind::Unexpected(message.into()))
    }

    /// INSERT の失敗を変換する。一意制約違反は Duplicate にする
    pub fn from_insert(source: sqlx::Error, entity: &str, key: impl Into<String>) -> Self {
        match &source {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::duplicate(entity, key)
            }
            _ => source.into(),
        }
    }
}

impl fmt::Debug for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SpanTrace の Debug は複数行になるので Display で 1 行にまとめる
        write!(f, "InfraError({:?}) at [{}]", self.kind, self.span_trace)
    }
}

impl std::error::Error for InfraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

impl From<sqlx::Error> for InfraError {
    fn from(source: sqlx::Error) -> Self {
        Self::capture(InfraErrorKind::Database(source))
    }
}

impl From<serde_json::Error> for InfraError {
    fn from(source: serde_json::Error) -> Self {
        Self::capture(InfraErrorKind::Payload(source))
    }
}
