//! # JobQueue
//!
//! リース付きの配信ジョブキュー。複数インスタンスのワーカーが
//! 同じ `jobs` テーブルを奪い合っても、1 つのジョブを同時に
//! 2 つのワーカーが実行しないことを保証する。
//!
//! ## 設計方針
//!
//! - **行ロックによる排他**: 予約は `SELECT ... FOR UPDATE SKIP LOCKED` で候補行をロックし、
//!   同じトランザクションで `in_flight` に更新する。並行する予約者は互いを待たず、
//!   同じ行を返すこともない
//! - **リース**: 予約には期限があり、期限切れの `in_flight` 行は再び予約できる。
//!   回収は放棄された 1 回の試行として数え、上限に達した行は予約せず `failed` にする
//! - **完了・失敗はリース保持者だけ**: `succeed` / `fail` は `status = 'in_flight'` かつ
//!   `worker_id` が呼び出し元の行だけを更新する。該当しなければ `LeaseLost`
//! - **投入は呼び出し側のトランザクション内**: 戦略が全宛先分を投入してからコミットする
//! - **失敗の記録はキュー内で完結**: 行ロック取得と試行回数の更新を同じトランザクションで行う
//! - **時刻はデータベースの `NOW()`**: インスタンス間の時計のずれに影響されない

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notifications_domain::{
    job::{Job, JobId, JobStatus, RetryPolicy},
    worker::WorkerId,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{db::TxContext, error::InfraError};

/// ジョブキュートレイト
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// ジョブを `pending` で投入する
    ///
    /// 呼び出し側のトランザクション内で実行され、コミットされるまで
    /// ワーカーからは見えない。
    async fn enqueue(&self, tx: &mut TxContext, payload: &serde_json::Value) -> Result<Job, InfraError>;

    /// 予約可能なジョブを 1 件取り出し、`in_flight` にして返す
    ///
    /// 予約可能なジョブがなければ `None`。
    async fn reserve(&self, worker_id: WorkerId) -> Result<Option<Job>, InfraError>;

    /// 配信成功としてジョブを削除する
    ///
    /// 配信記録の更新と同じトランザクションで呼ぶ。
    /// `worker_id` がリースを失っていれば `LeaseLost`。
    async fn succeed(
        &self,
        tx: &mut TxContext,
        job_id: &JobId,
        worker_id: WorkerId,
    ) -> Result<(), InfraError>;

    /// 失敗を記録し、遷移後の状態を返す
    ///
    /// 試行回数を 1 増やし、再試行可能かつ上限未満なら `retrying`、
    /// それ以外は `failed` にする。`worker_id` がリースを失っていれば `LeaseLost`。
    async fn fail(
        &self,
        job_id: &JobId,
        worker_id: WorkerId,
        error: &str,
        retryable: bool,
    ) -> Result<JobStatus, InfraError>;

    /// `failed` のジョブを新しい順に返す
    async fn find_failed(&self, limit: i64) -> Result<Vec<Job>, InfraError>;

    /// `failed` のジョブを `pending` に戻す（運用者操作）
    ///
    /// 試行回数はそのまま残し、`manual_retries` を 1 増やす。
    /// 上限に達していたジョブは、次の失敗で再び `failed` になる。
    async fn retry_failed(&self, tx: &mut TxContext, job_id: &JobId) -> Result<(), InfraError>;
}

/// `jobs` テーブルの行
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id:               Uuid,
    payload:          serde_json::Value,
    status:           String,
    attempts:         i32,
    manual_retries:   i32,
    worker_id:        Option<i64>,
    scheduled_at:     DateTime<Utc>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error:       Option<String>,
    created_at:       DateTime<Utc>,
    updated_at:       DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = InfraError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = parse_status(&row.status)?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            payload: row.payload,
            status,
            attempts: row.attempts,
            manual_retries: row.manual_retries,
            worker_id: row.worker_id,
            scheduled_at: row.scheduled_at,
            lease_expires_at: row.lease_expires_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_status(status: &str) -> Result<JobStatus, InfraError> {
    status
        .parse::<JobStatus>()
        .map_err(|e| InfraError::unexpected(format!("不正なジョブ状態 {status}: {e}")))
}

const JOB_COLUMNS: &str = "id, payload, status, attempts, manual_retries, worker_id, scheduled_at, \
                           lease_expires_at, last_error, created_at, updated_at";

/// リース切れの回収で上限に達したときに残すエラー
pub const LEASE_EXHAUSTED_ERROR: &str = "リースの期限切れが試行回数の上限に達しました";

/// PostgreSQL 実装のジョブキュー
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool:   PgPool,
    policy: RetryPolicy,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[tracing::instrument(skip_all, level = "debug")]
    async fn enqueue(&self, tx: &mut TxContext, payload: &serde_json::Value) -> Result<Job, InfraError> {
        let id = JobId::new();
        let row: JobRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO jobs (id, payload, status, attempts, scheduled_at)
            VALUES ($1, $2, 'pending', 0, NOW())
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(payload)
        .fetch_one(tx.conn())
        .await?;

        row.try_into()
    }

    #[tracing::instrument(skip_all, level = "debug", fields(worker_id = %worker_id))]
    async fn reserve(&self, worker_id: WorkerId) -> Result<Option<Job>, InfraError> {
        // 上限に達した回収対象を failed にしたら、次の候補を探し直す
        loop {
            let mut tx = self.pool.begin().await?;

            // 他の予約者がロック中の行は飛ばす
            let candidate: Option<(Uuid, String, i32, DateTime<Utc>)> = sqlx::query_as(
                r#"
                SELECT id, status, attempts, NOW()
                FROM jobs
                WHERE (status IN ('pending', 'retrying') AND scheduled_at <= NOW())
                   OR (status = 'in_flight' AND lease_expires_at <= NOW())
                ORDER BY scheduled_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .fetch_optional(&mut *tx)
            .await?;

            let Some((id, status, attempts, now)) = candidate else {
                tx.commit().await?;
                return Ok(None);
            };

            let attempts = if parse_status(&status)? == JobStatus::InFlight {
                let decision = self.policy.reclaim(attempts, now);
                if decision.status == JobStatus::Failed {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'failed',
                            attempts = $2,
                            worker_id = NULL,
                            lease_expires_at = NULL,
                            last_error = $3,
                            updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .bind(decision.attempts)
                    .bind(LEASE_EXHAUSTED_ERROR)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;

                    tracing::warn!(
                        job_id = %id,
                        attempts = decision.attempts,
                        "リース切れのジョブが上限に達したため終端失敗にしました"
                    );
                    continue;
                }
                tracing::warn!(job_id = %id, attempts = decision.attempts, "リース切れのジョブを回収します");
                decision.attempts
            } else {
                attempts
            };

            let row: JobRow = sqlx::query_as(&format!(
                r#"
                UPDATE jobs
                SET status = 'in_flight',
                    attempts = $4,
                    worker_id = $2,
                    lease_expires_at = NOW() + ($3::float8 * INTERVAL '1 second'),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(id)
            .bind(worker_id.as_i64())
            .bind(self.policy.lease.as_secs_f64())
            .bind(attempts)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;

            return Ok(Some(row.try_into()?));
        }
    }

    #[tracing::instrument(skip_all, level = "debug", fields(job_id = %job_id, worker_id = %worker_id))]
    async fn succeed(
        &self,
        tx: &mut TxContext,
        job_id: &JobId,
        worker_id: WorkerId,
    ) -> Result<(), InfraError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id = $1 AND status = 'in_flight' AND worker_id = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker_id.as_i64())
        .execute(tx.conn())
        .await?;

        if result.rows_affected() == 0 {
            return Err(InfraError::lease_lost(job_id.to_string(), worker_id.as_i64()));
        }

        Ok(())
    }

    #[tracing::instrument(
        skip_all,
        level = "debug",
        fields(job_id = %job_id, worker_id = %worker_id, retryable = retryable)
    )]
    async fn fail(
        &self,
        job_id: &JobId,
        worker_id: WorkerId,
        error: &str,
        retryable: bool,
    ) -> Result<JobStatus, InfraError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(i32, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT attempts, NOW()
            FROM jobs
            WHERE id = $1 AND status = 'in_flight' AND worker_id = $2
            FOR UPDATE
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(worker_id.as_i64())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, now)) = current else {
            return Err(InfraError::lease_lost(job_id.to_string(), worker_id.as_i64()));
        };

        let decision = self.policy.decide(attempts, retryable, now);
        let status: &str = decision.status.into();

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                attempts = $3,
                scheduled_at = $4,
                worker_id = NULL,
                lease_expires_at = NULL,
                last_error = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(status)
        .bind(decision.attempts)
        .bind(decision.scheduled_at)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(decision.status)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    async fn find_failed(&self, limit: i64) -> Result<Vec<Job>, InfraError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'failed'
            ORDER BY updated_at DESC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    #[tracing::instrument(skip_all, level = "debug", fields(job_id = %job_id))]
    async fn retry_failed(&self, tx: &mut TxContext, job_id: &JobId) -> Result<(), InfraError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                manual_retries = manual_retries + 1,
                scheduled_at = NOW(),
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(tx.conn())
        .await?;

        if result.rows_affected() == 0 {
            return Err(InfraError::not_found("FailedJob", job_id.to_string()));
        }

        Ok(())
    }
}
