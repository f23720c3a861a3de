//! # TemplateLoader
//!
//! 配信に使うテンプレートの組を選ぶ。
//!
//! ## 選択順
//!
//! 1. リクエストで明示されたテンプレート ID（存在しなければ NotFound）
//! 2. クライアント × 種別に割り当てられたテンプレート
//! 3. クライアントに割り当てられたテンプレート
//! 4. バイナリに埋め込んだ既定テンプレート
//!
//! テンプレートの CRUD はこのサービスの責務外で、ここでは読み取りのみ行う。

use async_trait::async_trait;
use notifications_domain::template::{DEFAULT_TEMPLATE_ID, Templates};
use sqlx::PgPool;

use crate::error::InfraError;

/// 既定テンプレートを返す
pub fn default_templates() -> Templates {
    Templates {
        name:    DEFAULT_TEMPLATE_ID.to_string(),
        subject: include_str!("../../templates/default/subject.txt").to_string(),
        text:    include_str!("../../templates/default/text.txt").to_string(),
        html:    include_str!("../../templates/default/body.html").to_string(),
    }
}

/// テンプレート読み込みトレイト
#[async_trait]
pub trait TemplateLoader: Send + Sync {
    /// クライアント・種別・明示指定からテンプレートの組を選ぶ
    async fn load_templates(
        &self,
        client_id: &str,
        kind_id: &str,
        template_id: Option<&str>,
    ) -> Result<Templates, InfraError>;
}

#[derive(Debug, sqlx::FromRow)]
struct TemplateRow {
    name:    String,
    subject: String,
    text:    String,
    html:    String,
}

impl From<TemplateRow> for Templates {
    fn from(row: TemplateRow) -> Self {
        Self {
            name:    row.name,
            subject: row.subject,
            text:    row.text,
            html:    row.html,
        }
    }
}

/// PostgreSQL 実装のテンプレートローダー
#[derive(Debug, Clone)]
pub struct PostgresTemplateLoader {
    pool: PgPool,
}

impl PostgresTemplateLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_id(&self, template_id: &str) -> Result<Option<Templates>, InfraError> {
        let row: Option<TemplateRow> = sqlx::query_as(
            r#"
            SELECT name, subject, text, html
            FROM templates
            WHERE id = $1
            "#,
        )
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Templates::from))
    }

    async fn find_assigned(&self, client_id: &str, kind_id: &str) -> Result<Option<Templates>, InfraError> {
        // 種別単位の割り当てをクライアント単位より優先する
        let row: Option<TemplateRow> = sqlx::query_as(
            r#"
            SELECT t.name, t.subject, t.text, t.html
            FROM templates t
            JOIN (
                SELECT template_id, 0 AS priority
                FROM kind_template_assignments
                WHERE client_id = $1 AND kind_id = $2
                UNION ALL
                SELECT template_id, 1 AS priority
                FROM client_template_assignments
                WHERE client_id = $1
            ) a ON a.template_id = t.id
            ORDER BY a.priority
            LIMIT 1
            "#,
        )
        .bind(client_id)
        .bind(kind_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Templates::from))
    }
}

#[async_trait]
impl TemplateLoader for PostgresTemplateLoader {
    #[tracing::instrument(skip_all, level = "debug", fields(client_id = %client_id, kind_id = %kind_id))]
    async fn load_templates(
        &self,
        client_id: &str,
        kind_id: &str,
        template_id: Option<&str>,
    ) -> Result<Templates, InfraError> {
        if let Some(template_id) = template_id {
            if template_id == DEFAULT_TEMPLATE_ID {
                return Ok(default_templates());
            }
            return self
                .find_by_id(template_id)
                .await?
                .ok_or_else(|| InfraError::not_found("Template", template_id));
        }

        Ok(self
            .find_assigned(client_id, kind_id)
            .await?
            .unwrap_or_else(default_templates))
    }
}
