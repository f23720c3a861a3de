//! # リポジトリ実装
//!
//! - **ジョブキュー**: リース付きの配信ジョブ
//! - **配信記録**: (ユーザー, クライアント, 種別) ごとの配信回数
//! - **テンプレート**: 配信に使うテンプレートの読み込み

pub mod job_queue;
pub mod receipt_repository;
pub mod template_repository;

pub use job_queue::{JobQueue, PostgresJobQueue};
pub use receipt_repository::{PostgresReceiptRepository, ReceiptRepository};
pub use template_repository::{PostgresTemplateLoader, TemplateLoader, default_templates};
