//! SMTP メール送信実装
//!
//! lettre の `AsyncSmtpTransport` を使用してメールを送信する。
//! `X-CF-*` ヘッダはそのまま生ヘッダとして付与する。

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport,
    AsyncTransport,
    Message as LettreMessage,
    Tokio1Executor,
    message::{
        MultiPart,
        SinglePart,
        header::{ContentType as LettreContentType, HeaderName, HeaderValue},
    },
};
use notifications_domain::message::{ContentType, Message, Part};

use super::{MailTransport, TransportError};

/// SMTP メール送信
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    /// 新しい SMTP 送信インスタンスを作成
    ///
    /// # 引数
    ///
    /// - `host`: SMTP サーバーのホスト名（例: "localhost"）
    /// - `port`: SMTP サーバーのポート番号（例: 1025 for Mailpit）
    pub fn new(host: &str, port: u16) -> Self {
        // builder_dangerous: TLS なしで接続（ローカル SMTP リレー向け）
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .build();

        Self { transport }
    }
}

fn single_part(part: &Part) -> SinglePart {
    let content_type = match part.content_type {
        ContentType::Text => LettreContentType::TEXT_PLAIN,
        ContentType::Html => LettreContentType::TEXT_HTML,
    };
    SinglePart::builder()
        .header(content_type)
        .body(part.content.clone())
}

/// ドメインのメッセージを lettre のメッセージに変換する
pub(crate) fn build_message(message: &Message) -> Result<LettreMessage, TransportError> {
    let mut builder = LettreMessage::builder()
        .from(
            message
                .from
                .parse()
                .map_err(|e| TransportError::SendFailed(format!("送信元アドレス不正: {e}")))?,
        )
        .to(message
            .to
            .parse()
            .map_err(|e| TransportError::SendFailed(format!("宛先アドレス不正: {e}")))?)
        .subject(&message.subject);

    if !message.reply_to.is_empty() {
        builder = builder.reply_to(
            message
                .reply_to
                .parse()
                .map_err(|e| TransportError::SendFailed(format!("返信先アドレス不正: {e}")))?,
        );
    }

    for header in &message.headers {
        let name = HeaderName::new_from_ascii(header.name.clone())
            .map_err(|e| TransportError::SendFailed(format!("ヘッダ名不正 {}: {e}", header.name)))?;
        builder = builder.raw_header(HeaderValue::new(name, header.value.clone()));
    }

    let built = match message.parts.as_slice() {
        [] => {
            return Err(TransportError::SendFailed(
                "本文パートがありません".to_string(),
            ));
        }
        [only] => builder.singlepart(single_part(only)),
        [first, rest @ ..] => {
            let multipart = rest
                .iter()
                .fold(MultiPart::alternative().singlepart(single_part(first)), |m, part| {
                    m.singlepart(single_part(part))
                });
            builder.multipart(multipart)
        }
    };

    built.map_err(|e| TransportError::SendFailed(format!("メッセージ構築失敗: {e}")))
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    #[tracing::instrument(skip_all, level = "debug", fields(to = %message.to))]
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let email = build_message(message)?;

        self.transport
            .send(email)
            .await
            .map_err(|e| TransportError::SendFailed(format!("SMTP 送信失敗: {e}")))?;

        Ok(())
    }
}
