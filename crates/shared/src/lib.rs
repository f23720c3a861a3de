//! # 共有ユーティリティ
//!
//! ドメイン・インフラ・サービスのいずれからも使われる、
//! ビジネスロジックを含まないユーティリティ。

pub mod event_log;
pub mod health;
pub mod observability;

pub use health::HealthResponse;
