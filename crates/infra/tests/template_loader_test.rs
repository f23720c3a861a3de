//! TemplateLoader 統合テスト
//!
//! 実行方法:
//! ```bash
//! cargo test -p notifications-infra --features db-tests --test template_loader_test
//! ```

#![cfg(feature = "db-tests")]

mod common;

use notifications_infra::repository::{PostgresTemplateLoader, TemplateLoader, default_templates};
use pretty_assertions::assert_eq;
use sqlx::PgPool;

async fn assign_client(pool: &PgPool, client_id: &str, template_id: &str) {
    sqlx::query("INSERT INTO client_template_assignments (client_id, template_id) VALUES ($1, $2)")
        .bind(client_id)
        .bind(template_id)
        .execute(pool)
        .await
        .unwrap();
}

async fn assign_kind(pool: &PgPool, client_id: &str, kind_id: &str, template_id: &str) {
    sqlx::query(
        "INSERT INTO kind_template_assignments (client_id, kind_id, template_id) VALUES ($1, $2, $3)",
    )
    .bind(client_id)
    .bind(kind_id)
    .bind(template_id)
    .execute(pool)
    .await
    .unwrap();
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_割り当てがなければ既定テンプレートを返す(pool: PgPool) {
    let loader = PostgresTemplateLoader::new(pool);

    let templates = loader.load_templates("client", "kind", None).await.unwrap();

    assert_eq!(templates, default_templates());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_種別の割り当てはクライアントの割り当てより優先される(pool: PgPool) {
    common::insert_template(&pool, "client-template", "client subject").await;
    common::insert_template(&pool, "kind-template", "kind subject").await;
    assign_client(&pool, "client", "client-template").await;
    assign_kind(&pool, "client", "kind", "kind-template").await;
    let loader = PostgresTemplateLoader::new(pool);

    let for_kind = loader.load_templates("client", "kind", None).await.unwrap();
    let for_other_kind = loader
        .load_templates("client", "other-kind", None)
        .await
        .unwrap();

    assert_eq!(for_kind.subject, "kind subject");
    assert_eq!(for_other_kind.subject, "client subject");
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_明示したテンプレートが割り当てより優先される(pool: PgPool) {
    common::insert_template(&pool, "client-template", "client subject").await;
    common::insert_template(&pool, "explicit", "explicit subject").await;
    assign_client(&pool, "client", "client-template").await;
    let loader = PostgresTemplateLoader::new(pool);

    let templates = loader
        .load_templates("client", "kind", Some("explicit"))
        .await
        .unwrap();

    assert_eq!(templates.subject, "explicit subject");
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_明示したテンプレートが存在しなければnot_foundを返す(pool: PgPool) {
    let loader = PostgresTemplateLoader::new(pool);

    let err = loader
        .load_templates("client", "kind", Some("missing"))
        .await
        .unwrap_err();

    assert!(err.is_not_found(), "{err}");
}
