//! # ReceiptRepository
//!
//! (ユーザー GUID, クライアント ID, 種別 ID) ごとの配信回数を記録する。
//!
//! ## 設計方針
//!
//! - **厳密作成と冪等更新を分ける**: `create` は既存キーで Duplicate を返し、
//!   `upsert` は行がなければ作成、あれば `count` を 1 増やす
//! - **原子的なインクリメント**: `INSERT ... ON CONFLICT DO UPDATE SET count = count + 1`
//!   の 1 文で行うため、同じキーへの並行 upsert でも加算が失われない
//! - **一意制約**: `UNIQUE (user_guid, client_id, kind_id)` が 1 キー 1 行を保証する

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use notifications_domain::receipt::{Receipt, ReceiptKey};
use sqlx::PgPool;

use crate::{db::TxContext, error::InfraError};

/// 配信記録リポジトリトレイト
#[async_trait]
pub trait ReceiptRepository: Send + Sync {
    /// 配信記録を新規作成する
    ///
    /// 既に同じキーの行があれば Duplicate エラーを返す。
    async fn create(&self, tx: &mut TxContext, key: &ReceiptKey) -> Result<Receipt, InfraError>;

    /// 配信記録を作成、または `count` を 1 増やす
    async fn upsert(&self, tx: &mut TxContext, key: &ReceiptKey) -> Result<Receipt, InfraError>;

    /// 同じクライアント・種別の複数ユーザー分をまとめて upsert する
    async fn create_receipts(
        &self,
        tx: &mut TxContext,
        user_guids: &[String],
        client_id: &str,
        kind_id: &str,
    ) -> Result<(), InfraError>;

    /// キーで検索する
    ///
    /// 見つからなければ NotFound エラーを返す。
    async fn find(&self, key: &ReceiptKey) -> Result<Receipt, InfraError>;
}

/// `receipts` テーブルの行
#[derive(Debug, sqlx::FromRow)]
struct ReceiptRow {
    id:         i64,
    user_guid:  String,
    client_id:  String,
    kind_id:    String,
    count:      i32,
    created_at: DateTime<Utc>,
}

impl From<ReceiptRow> for Receipt {
    fn from(row: ReceiptRow) -> Self {
        Self {
            id:         row.id,
            user_guid:  row.user_guid,
            client_id:  row.client_id,
            kind_id:    row.kind_id,
            count:      row.count,
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL 実装の配信記録リポジトリ
#[derive(Debug, Clone)]
pub struct PostgresReceiptRepository {
    pool: PgPool,
}

impl PostgresReceiptRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiptRepository for PostgresReceiptRepository {
    #[tracing::instrument(skip_all, level = "debug", fields(key = %key))]
    async fn create(&self, tx: &mut TxContext, key: &ReceiptKey) -> Result<Receipt, InfraError> {
        let row: ReceiptRow = sqlx::query_as(
            r#"
            INSERT INTO receipts (user_guid, client_id, kind_id, count)
            VALUES ($1, $2, $3, 1)
            RETURNING id, user_guid, client_id, kind_id, count, created_at
            "#,
        )
        .bind(&key.user_guid)
        .bind(&key.client_id)
        .bind(&key.kind_id)
        .fetch_one(tx.conn())
        .await
        .map_err(|e| InfraError::from_insert(e, "Receipt", key.to_string()))?;

        Ok(row.into())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(key = %key))]
    async fn upsert(&self, tx: &mut TxContext, key: &ReceiptKey) -> Result<Receipt, InfraError> {
        let row: ReceiptRow = sqlx::query_as(
            r#"
            INSERT INTO receipts (user_guid, client_id, kind_id, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (user_guid, client_id, kind_id)
            DO UPDATE SET count = receipts.count + 1
            RETURNING id, user_guid, client_id, kind_id, count, created_at
            "#,
        )
        .bind(&key.user_guid)
        .bind(&key.client_id)
        .bind(&key.kind_id)
        .fetch_one(tx.conn())
        .await?;

        Ok(row.into())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(count = user_guids.len()))]
    async fn create_receipts(
        &self,
        tx: &mut TxContext,
        user_guids: &[String],
        client_id: &str,
        kind_id: &str,
    ) -> Result<(), InfraError> {
        // 1 文の ON CONFLICT DO UPDATE は同じ行を 2 回更新できない
        let user_guids: Vec<&str> = user_guids.iter().map(String::as_str).unique().collect();
        if user_guids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO receipts (user_guid, client_id, kind_id, count)
            SELECT user_guid, $2, $3, 1
            FROM UNNEST($1::text[]) AS t(user_guid)
            ON CONFLICT (user_guid, client_id, kind_id)
            DO UPDATE SET count = receipts.count + 1
            "#,
        )
        .bind(&user_guids)
        .bind(client_id)
        .bind(kind_id)
        .execute(tx.conn())
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip_all, level = "debug", fields(key = %key))]
    async fn find(&self, key: &ReceiptKey) -> Result<Receipt, InfraError> {
        let row: Option<ReceiptRow> = sqlx::query_as(
            r#"
            SELECT id, user_guid, client_id, kind_id, count, created_at
            FROM receipts
            WHERE user_guid = $1 AND client_id = $2 AND kind_id = $3
            "#,
        )
        .bind(&key.user_guid)
        .bind(&key.client_id)
        .bind(&key.kind_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Receipt::from)
            .ok_or_else(|| InfraError::not_found("Receipt", key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn トレイトはsendとsyncを実装している() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PostgresReceiptRepository>();
    }
}
