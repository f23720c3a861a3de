//! # 配信受付ハンドラ
//!
//! 配信リクエストを検証し、宛先の解決とジョブ投入をユースケース層に委譲する。
//!
//! ## エンドポイント
//!
//! - `POST /users/{guid}` - 単一ユーザー
//! - `POST /spaces/{guid}` - スペースのメンバー全員
//! - `POST /organizations/{guid}` - 組織のメンバー全員
//! - `POST /everyone` - 全ユーザー
//! - `POST /recipients` - ボディの `users` で列挙したユーザー
//!
//! ## 処理の流れ
//!
//! 1. `X-Client-ID` ヘッダとボディを検証する（エラーはまとめて 422）
//! 2. トランザクションを開始し、宛先ごとにジョブを投入する
//! 3. 全件投入できたらコミットして、宛先ごとの受付結果を返す
//!
//! 途中でエラーになった場合はコミットせず、ジョブは 1 件も残らない。

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use notifications_domain::{
    audience::{Audience, DispatchResponse},
    clock::Clock,
    delivery::{Html, Options},
};
use notifications_infra::db::TransactionManager;
use serde::Deserialize;

use crate::{
    error::ServiceError,
    usecase::{DispatchRequest, Dispatcher},
};

/// 呼び出し元クライアントの ID（前段の認証層が設定する）
pub const CLIENT_ID_HEADER: &str = "X-Client-ID";

/// リクエストの相関 ID
pub const REQUEST_ID_HEADER: &str = "X-Vcap-Request-Id";

/// 配信受付 API の共有状態
pub struct NotifyState {
    pub dispatcher: Dispatcher,
    pub tx_manager: Arc<dyn TransactionManager>,
    pub clock:      Arc<dyn Clock>,
}

// --- リクエスト型 ---

/// HTML 本文
///
/// 文字列なら本文そのもの、オブジェクトなら骨格ごとの指定として扱う。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HtmlBody {
    Content(String),
    Parts(Html),
}

impl HtmlBody {
    fn is_empty(&self) -> bool {
        match self {
            Self::Content(body_content) => body_content.trim().is_empty(),
            Self::Parts(html) => html.is_empty(),
        }
    }

    fn into_html(self) -> Html {
        match self {
            Self::Content(body_content) => Html {
                body_content,
                ..Default::default()
            },
            Self::Parts(html) => html,
        }
    }
}

/// 配信リクエスト
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifyRequest {
    pub kind_id:            String,
    pub kind_description:   String,
    pub source_description: String,
    pub subject:            String,
    pub text:               String,
    pub html:               Option<HtmlBody>,
    pub reply_to:           String,
    pub template_id:        Option<String>,
    /// `POST /recipients` の宛先
    pub users:              Vec<String>,
}

impl NotifyRequest {
    /// 検証エラーをすべて集める
    fn validate(&self, audience: &Audience) -> Vec<String> {
        let mut errors = Vec::new();

        if self.kind_id.is_empty() {
            errors.push("kind_id は必須です".to_string());
        } else if !is_valid_kind_id(&self.kind_id) {
            errors.push(
                "kind_id に使用できるのは英小文字・数字・'_'・'.'・'-' のみです".to_string(),
            );
        }

        let has_html = self.html.as_ref().is_some_and(|html| !html.is_empty());
        if self.text.trim().is_empty() && !has_html {
            errors.push("text または html のいずれかは必須です".to_string());
        }

        if let Audience::Recipients(users) = audience
            && users.iter().all(|user| user.trim().is_empty())
        {
            errors.push("users は 1 件以上必要です".to_string());
        }

        errors
    }

    fn into_options(self) -> Options {
        Options {
            reply_to: self.reply_to,
            subject: self.subject,
            kind_id: self.kind_id,
            kind_description: self.kind_description,
            source_description: self.source_description,
            text: self.text,
            html: self.html.map(HtmlBody::into_html).unwrap_or_default(),
            template_id: self.template_id.filter(|id| !id.is_empty()),
            ..Default::default()
        }
    }
}

fn is_valid_kind_id(kind_id: &str) -> bool {
    kind_id
        .chars()
        .all(|c| matches!(c, '0'..='9' | 'a'..='z' | '_' | '.' | '-'))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

// --- ハンドラ ---

/// POST /users/{guid}
pub async fn notify_user(
    State(state): State<Arc<NotifyState>>,
    Path(guid): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    accept(&state, &headers, payload, |_| Audience::User(guid)).await
}

/// POST /spaces/{guid}
pub async fn notify_space(
    State(state): State<Arc<NotifyState>>,
    Path(guid): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    accept(&state, &headers, payload, |_| Audience::Space(guid)).await
}

/// POST /organizations/{guid}
pub async fn notify_organization(
    State(state): State<Arc<NotifyState>>,
    Path(guid): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    accept(&state, &headers, payload, |_| Audience::Organization(guid)).await
}

/// POST /everyone
pub async fn notify_everyone(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    accept(&state, &headers, payload, |_| Audience::Everyone).await
}

/// POST /recipients
pub async fn notify_recipients(
    State(state): State<Arc<NotifyState>>,
    headers: HeaderMap,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    accept(&state, &headers, payload, Audience::Recipients).await
}

/// 全エンドポイント共通の受付手続き
///
/// `audience` にはボディの `users` が渡される。
async fn accept(
    state: &NotifyState,
    headers: &HeaderMap,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
    audience: impl FnOnce(Vec<String>) -> Audience,
) -> Result<(StatusCode, Json<Vec<DispatchResponse>>), ServiceError> {
    let mut errors = Vec::new();

    let client_id = header_value(headers, CLIENT_ID_HEADER);
    if client_id.is_none() {
        errors.push(format!("{CLIENT_ID_HEADER} ヘッダは必須です"));
    }

    let mut request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            errors.push(rejection.body_text());
            return Err(ServiceError::Validation(errors));
        }
    };

    let audience = audience(std::mem::take(&mut request.users));
    errors.extend(request.validate(&audience));

    let Some(client_id) = client_id.filter(|_| errors.is_empty()) else {
        return Err(ServiceError::Validation(errors));
    };

    let dispatch_request = DispatchRequest {
        client_id,
        request_id: header_value(headers, REQUEST_ID_HEADER).unwrap_or_default(),
        request_received: state.clock.now(),
        options: request.into_options(),
    };

    let mut tx = state.tx_manager.begin().await?;
    let responses = state
        .dispatcher
        .dispatch(&mut tx, &audience, dispatch_request)
        .await?;
    tx.commit().await?;

    Ok((StatusCode::OK, Json(responses)))
}
