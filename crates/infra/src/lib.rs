//! # 通知配信インフラ層
//!
//! 外部システムとの接続・通信を担当する。
//!
//! ## 責務
//!
//! - **データベース接続**: PostgreSQL の接続プール、マイグレーション、トランザクション
//! - **リポジトリ実装**: ジョブキュー、配信記録、テンプレートストア
//! - **メール送信**: SMTP / Noop
//! - **外部 API クライアント**: UAA（トークン・ユーザー）、Cloud Controller（メンバーシップ）
//! - **配信停止トークン**: 認証付き暗号による Cloak
//!
//! ## 依存関係
//!
//! ```text
//! notification-service → infra → domain
//! ```
//!
//! ## モジュール構成
//!
//! - [`db`] - PostgreSQL データベース接続管理
//! - [`error`] - インフラ層エラー定義
//! - [`repository`] - リポジトリ実装
//! - [`mail`] - メール送信
//! - [`client`] - UAA / Cloud Controller クライアント
//! - [`cloak`] - 配信停止トークンの暗号化
//!
//! ## 使用例
//!
//! ```rust,ignore
//! use notifications_infra::{db, repository::PostgresJobQueue};
//!
//! async fn setup() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = db::create_pool("postgres://localhost/notifications", 10).await?;
//!     db::run_migrations(&pool).await?;
//!     let queue = PostgresJobQueue::new(pool.clone(), Default::default());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod cloak;
pub mod db;
pub mod error;
pub mod mail;
pub mod repository;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use cloak::{Cloak, CloakError};
pub use error::{InfraError, InfraErrorKind};
