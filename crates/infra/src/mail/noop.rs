//! Noop メール送信実装
//!
//! メールを実際に送信せず、ログ出力のみ行う。

use async_trait::async_trait;
use notifications_domain::message::Message;

use super::{MailTransport, TransportError};

/// Noop メール送信（ログ出力のみ）
#[derive(Debug, Clone)]
pub struct NoopMailTransport;

#[async_trait]
impl MailTransport for NoopMailTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        tracing::info!(
            to = %message.to,
            subject = %message.subject,
            parts = message.parts.len(),
            "Noop: メール送信をスキップ"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use notifications_domain::message::{ContentType, Part};

    use super::*;

    #[tokio::test]
    async fn sendがエラーを返さない() {
        let message = Message {
            from:     "no-reply@example.com".to_string(),
            reply_to: String::new(),
            to:       "user@example.com".to_string(),
            subject:  "件名".to_string(),
            parts:    vec![Part {
                content_type: ContentType::Text,
                content:      "本文".to_string(),
            }],
            headers:  vec![],
        };

        assert!(NoopMailTransport.send(&message).await.is_ok());
    }
}
