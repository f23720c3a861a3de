//! # メール送信
//!
//! 組み立て済みのメッセージを外部のメール配送に渡す。
//!
//! ## 設計方針
//!
//! - **trait による抽象化**: `MailTransport` trait で送信手段を抽象化
//! - **2 つの実装**: SMTP（Mailpit / SMTP リレー）、Noop（ログ出力のみ）
//! - **失敗は不透明**: 呼び出し側は成功か失敗かだけを見る。失敗はジョブの再試行対象になる

mod noop;
mod smtp;

use async_trait::async_trait;
pub use noop::NoopMailTransport;
use notifications_domain::message::Message;
pub use smtp::SmtpMailTransport;
use thiserror::Error;

/// メール送信エラー
#[derive(Debug, Error)]
pub enum TransportError {
    /// メール送信に失敗
    #[error("メール送信に失敗: {0}")]
    SendFailed(String),
}

/// メール送信トレイト
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// メッセージを送信する
    async fn send(&self, message: &Message) -> Result<(), TransportError>;
}
