//! # パッケージャ
//!
//! 配信内容とテンプレートの組から、送信可能な [`Message`] を組み立てる。
//!
//! ## 処理の流れ
//!
//! 1. [`Packager::prepare_context`]: テンプレートを読み込み、配信内容と合成し、
//!    配信停止トークンを Cloak で生成する
//! 2. [`Packager::compile_parts`]: テキスト・HTML の各パートを描画する
//! 3. [`Packager::pack`]: 件名・ヘッダを付けてメッセージにする
//!
//! ## ヘッダ
//!
//! | ヘッダ | 値 |
//! |--------|----|
//! | `X-CF-Client-ID` | 配信を依頼したクライアント |
//! | `X-CF-Notification-ID` | 宛先ごとの通知 ID |
//! | `X-CF-Notification-Request-Received` | 受付時刻（そのまま保持） |
//! | `X-CF-Notification-Timestamp` | 組み立て時刻 |
//!
//! 時刻はいずれも RFC 3339（ナノ秒精度）。

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use notifications_domain::{
    clock::Clock,
    delivery::{Delivery, Html, NotificationId},
    message::{ContentType, Header, Message, Part},
    receipt::ReceiptKey,
    template::Templates,
};
use notifications_infra::{
    Cloak,
    CloakError,
    InfraError,
    cloak::unsubscribe_plaintext,
    repository::TemplateLoader,
};
use thiserror::Error;

use super::template_renderer::{Surface, TemplateError, TemplateRenderer, TemplateVars};

pub const CLIENT_ID_HEADER: &str = "X-CF-Client-ID";
pub const NOTIFICATION_ID_HEADER: &str = "X-CF-Notification-ID";
pub const REQUEST_RECEIVED_HEADER: &str = "X-CF-Notification-Request-Received";
pub const TIMESTAMP_HEADER: &str = "X-CF-Notification-Timestamp";

/// パッケージャのエラー
#[derive(Debug, Error)]
pub enum PackagerError {
    /// テンプレートストアにアクセスできない
    #[error("テンプレートの読み込みに失敗: {0}")]
    TemplateStore(InfraError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("配信停止トークンの生成に失敗: {0}")]
    Cloak(#[from] CloakError),
}

impl PackagerError {
    /// 再試行で解消しうるか
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TemplateStore(_))
    }
}

/// パッケージャの固定設定
#[derive(Debug, Clone)]
pub struct PackagerSettings {
    /// `From:` に使うアドレス
    pub sender:         String,
    /// 配信停止リンクのドメイン
    pub domain:         String,
    /// 既定の件名テンプレートに差し込む接頭辞
    pub subject_prefix: String,
}

/// 1 通分の描画コンテキスト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub from:               String,
    pub reply_to:           String,
    pub to:                 String,
    pub subject:            String,
    pub text:               String,
    pub html:               Html,
    pub kind_id:            String,
    pub kind_description:   String,
    pub source_description: String,
    pub client_id:          String,
    pub user_guid:          String,
    pub notification_id:    NotificationId,
    pub request_received:   DateTime<Utc>,
    /// 推薦文のテンプレート（`{{ space }}` などを含みうる）
    pub endorsement:        String,
    pub space:              String,
    pub organization:       String,
    pub unsubscribe_id:     String,
    pub domain:             String,
    pub subject_prefix:     String,
    pub templates:          Templates,
}

/// パッケージャ
pub struct Packager {
    templates: Arc<dyn TemplateLoader>,
    cloak:     Arc<dyn Cloak>,
    clock:     Arc<dyn Clock>,
    renderer:  TemplateRenderer,
    settings:  PackagerSettings,
}

impl Packager {
    pub fn new(
        templates: Arc<dyn TemplateLoader>,
        cloak: Arc<dyn Cloak>,
        clock: Arc<dyn Clock>,
        settings: PackagerSettings,
    ) -> Self {
        Self {
            templates,
            cloak,
            clock,
            renderer: TemplateRenderer::new(),
            settings,
        }
    }

    /// 配信内容とテンプレートを合成したコンテキストを作る
    ///
    /// 種別・送信元の説明が空なら、それぞれ種別 ID・クライアント ID で補う。
    #[tracing::instrument(skip_all, level = "debug", fields(notification_id = %delivery.notification_id))]
    pub async fn prepare_context(
        &self,
        delivery: &Delivery,
        to: &str,
    ) -> Result<MessageContext, PackagerError> {
        let options = &delivery.options;
        let template_id = options.template_id.as_deref();

        let templates = self
            .templates
            .load_templates(&delivery.client_id, &options.kind_id, template_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    PackagerError::Template(TemplateError::NotFound(
                        template_id.unwrap_or_default().to_string(),
                    ))
                } else {
                    PackagerError::TemplateStore(e)
                }
            })?;

        let key = ReceiptKey::new(&delivery.user_guid, &delivery.client_id, &options.kind_id);
        let unsubscribe_id = self.cloak.veil(unsubscribe_plaintext(&key).as_bytes())?;

        Ok(MessageContext {
            from: self.settings.sender.clone(),
            reply_to: options.reply_to.clone(),
            to: to.to_string(),
            subject: options.subject.clone(),
            text: options.text.clone(),
            html: options.html.clone(),
            kind_id: options.kind_id.clone(),
            kind_description: non_empty_or(&options.kind_description, &options.kind_id),
            source_description: non_empty_or(&options.source_description, &delivery.client_id),
            client_id: delivery.client_id.clone(),
            user_guid: delivery.user_guid.clone(),
            notification_id: delivery.notification_id.clone(),
            request_received: delivery.request_received,
            endorsement: options.endorsement.clone(),
            space: delivery.space.clone().unwrap_or_default(),
            organization: delivery.organization.clone().unwrap_or_default(),
            unsubscribe_id,
            domain: self.settings.domain.clone(),
            subject_prefix: self.settings.subject_prefix.clone(),
            templates,
        })
    }

    /// テキスト・HTML パートを描画する
    ///
    /// 本文または描画結果が空白だけの面はパートを作らない。
    /// 両方が空なら [`TemplateError::Empty`]。
    pub fn compile_parts(&self, context: &MessageContext) -> Result<Vec<Part>, TemplateError> {
        let mut parts = Vec::with_capacity(2);

        if !context.text.trim().is_empty() {
            let vars = self.vars(context, Surface::Text)?;
            let content = self
                .renderer
                .render(&context.templates.text, &vars, Surface::Text)?;
            if !content.trim().is_empty() {
                parts.push(Part {
                    content_type: ContentType::Text,
                    content,
                });
            }
        }

        if !context.html.is_empty() {
            let vars = self.vars(context, Surface::Html)?;
            let rendered = self
                .renderer
                .render(&context.templates.html, &vars, Surface::Html)?;
            if !rendered.trim().is_empty() {
                parts.push(Part {
                    content_type: ContentType::Html,
                    content:      wrap_html(&context.html, &rendered),
                });
            }
        }

        if parts.is_empty() {
            return Err(TemplateError::Empty);
        }
        Ok(parts)
    }

    /// 送信可能なメッセージを組み立てる
    pub fn pack(&self, context: &MessageContext) -> Result<Message, TemplateError> {
        let parts = self.compile_parts(context)?;

        let vars = self.vars(context, Surface::Text)?;
        let subject = self
            .renderer
            .render(&context.templates.subject, &vars, Surface::Text)?
            .trim()
            .to_string();

        let headers = vec![
            Header::new(CLIENT_ID_HEADER, &context.client_id),
            Header::new(NOTIFICATION_ID_HEADER, context.notification_id.to_string()),
            Header::new(
                REQUEST_RECEIVED_HEADER,
                format_timestamp(context.request_received),
            ),
            Header::new(TIMESTAMP_HEADER, format_timestamp(self.clock.now())),
        ];

        Ok(Message {
            from: context.from.clone(),
            reply_to: context.reply_to.clone(),
            to: context.to.clone(),
            subject,
            parts,
            headers,
        })
    }

    /// 面ごとの変数を組み立てる
    ///
    /// 推薦文はスペース名などを面に合わせてエスケープしてから、生の断片として渡す。
    fn vars(&self, context: &MessageContext, surface: Surface) -> Result<TemplateVars, TemplateError> {
        let mut vars = TemplateVars::new();
        vars.insert("subject", &context.subject);
        vars.insert("text", &context.text);
        vars.insert("to", &context.to);
        vars.insert("kind_id", &context.kind_id);
        vars.insert("kind_description", &context.kind_description);
        vars.insert("source_description", &context.source_description);
        vars.insert("client_id", &context.client_id);
        vars.insert("user_guid", &context.user_guid);
        vars.insert("notification_id", context.notification_id.to_string());
        vars.insert("space", &context.space);
        vars.insert("organization", &context.organization);
        vars.insert("unsubscribe_id", &context.unsubscribe_id);
        vars.insert("domain", &context.domain);
        vars.insert("subject_prefix", &context.subject_prefix);

        let endorsement = self.renderer.render(&context.endorsement, &vars, surface)?;
        vars.insert_raw("endorsement", endorsement);
        vars.insert_raw("html", &context.html.body_content);

        Ok(vars)
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// 描画済みの本文を、リクエストで渡された HTML の骨格に戻す
fn wrap_html(html: &Html, rendered: &str) -> String {
    let body_open = if html.body_attributes.trim().is_empty() {
        "<body>".to_string()
    } else {
        format!("<body {}>", html.body_attributes.trim())
    };

    format!(
        "{}\n<head>{}</head>\n<html>\n\t{}\n\t\t{}\n\t</body>\n</html>",
        html.doctype, html.head, body_open, rendered
    )
}
