//! テスト共通フィクスチャ
//!
//! DB を使用する統合テストで共通利用するヘルパー。

// 各テストファイルが独立したクレートとしてコンパイルされるため、
// 使用しない関数に dead_code 警告が出る。モジュール全体で抑制する。
#![allow(dead_code)]

use notifications_domain::job::JobId;
use notifications_infra::db::{PgTransactionManager, TransactionManager, TxContext};
use sqlx::PgPool;

/// テスト用のトランザクションを開始する
pub async fn begin(pool: &PgPool) -> TxContext {
    PgTransactionManager::new(pool.clone())
        .begin()
        .await
        .unwrap()
}

/// ジョブの予定時刻を過去にずらし、すぐ予約できる状態にする
pub async fn make_due(pool: &PgPool, job_id: &JobId) {
    sqlx::query("UPDATE jobs SET scheduled_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(job_id.as_uuid())
        .execute(pool)
        .await
        .unwrap();
}

/// 予約中ジョブのリースを期限切れにする
pub async fn expire_lease(pool: &PgPool, job_id: &JobId) {
    sqlx::query("UPDATE jobs SET lease_expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(job_id.as_uuid())
        .execute(pool)
        .await
        .unwrap();
}

/// テンプレートを登録する
pub async fn insert_template(pool: &PgPool, id: &str, subject: &str) {
    sqlx::query(
        r#"
        INSERT INTO templates (id, name, subject, text, html)
        VALUES ($1, $1, $2, '{{ text }}', '{{ html }}')
        "#,
    )
    .bind(id)
    .bind(subject)
    .execute(pool)
    .await
    .unwrap();
}
