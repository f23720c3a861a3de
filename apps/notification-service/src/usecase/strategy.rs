//! # 配信戦略
//!
//! 配信対象（ユーザー・スペース・組織・全員・明示リスト）を宛先集合に解決する。
//!
//! ## 設計方針
//!
//! - **解決だけが多態**: 戦略ごとに違うのは宛先集合と推薦文の求め方だけで、
//!   ジョブ投入は [`Enqueuer`] が共通で行う
//! - **トークンは必要な戦略だけが取る**: ユーザー・明示リストはメンバーシップ API を呼ばない
//! - **エラーは呼び出し側に返す**: NotFound は 404、Unavailable は 502 として
//!   ハンドラが出し分ける。戦略の中では再試行しない

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notifications_domain::{
    audience::{Audience, DispatchResponse, RecipientSet, endorsement},
    delivery::Options,
};
use notifications_infra::{
    client::{MembershipProvider, TokenProvider},
    db::TxContext,
    repository::JobQueue,
};

use super::enqueuer::Enqueuer;
use crate::error::ServiceError;

/// 受付済みの配信リクエスト
///
/// `options.endorsement` は戦略が上書きする。
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub options:          Options,
    pub client_id:        String,
    pub request_id:       String,
    pub request_received: DateTime<Utc>,
}

/// 戦略による解決結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub recipients:   RecipientSet,
    /// 推薦文のテンプレート
    pub endorsement:  &'static str,
    pub space:        Option<String>,
    pub organization: Option<String>,
}

impl Resolution {
    fn direct(recipients: RecipientSet, endorsement: &'static str) -> Self {
        Self {
            recipients,
            endorsement,
            space: None,
            organization: None,
        }
    }
}

/// 宛先解決戦略
#[async_trait]
pub trait Strategy: Send + Sync {
    /// 解決の入力（GUID、GUID の一覧など）
    type Target: ?Sized + Sync;

    async fn resolve(&self, target: &Self::Target) -> Result<Resolution, ServiceError>;
}

// ===== UserStrategy =====

/// 単一ユーザー宛て
#[derive(Debug, Clone, Copy, Default)]
pub struct UserStrategy;

#[async_trait]
impl Strategy for UserStrategy {
    type Target = str;

    async fn resolve(&self, user_guid: &str) -> Result<Resolution, ServiceError> {
        Ok(Resolution::direct(
            std::iter::once(user_guid).collect(),
            endorsement::USER,
        ))
    }
}

// ===== SpaceStrategy =====

/// スペースのメンバー宛て
pub struct SpaceStrategy {
    tokens:     Arc<dyn TokenProvider>,
    membership: Arc<dyn MembershipProvider>,
}

impl SpaceStrategy {
    pub fn new(tokens: Arc<dyn TokenProvider>, membership: Arc<dyn MembershipProvider>) -> Self {
        Self { tokens, membership }
    }
}

#[async_trait]
impl Strategy for SpaceStrategy {
    type Target = str;

    #[tracing::instrument(skip_all, level = "debug", fields(space_guid = %space_guid))]
    async fn resolve(&self, space_guid: &str) -> Result<Resolution, ServiceError> {
        let token = self.tokens.get_token().await?;

        let space = self.membership.load_space(space_guid, &token).await?;
        let organization = self
            .membership
            .load_organization(&space.organization_guid, &token)
            .await?;
        let members = self
            .membership
            .resolve_space_members(space_guid, &token)
            .await?;

        Ok(Resolution {
            recipients:   members.into_iter().collect(),
            endorsement:  endorsement::SPACE,
            space:        Some(space.name),
            organization: Some(organization.name),
        })
    }
}

// ===== OrganizationStrategy =====

/// 組織のメンバー宛て
pub struct OrganizationStrategy {
    tokens:     Arc<dyn TokenProvider>,
    membership: Arc<dyn MembershipProvider>,
}

impl OrganizationStrategy {
    pub fn new(tokens: Arc<dyn TokenProvider>, membership: Arc<dyn MembershipProvider>) -> Self {
        Self { tokens, membership }
    }
}

#[async_trait]
impl Strategy for OrganizationStrategy {
    type Target = str;

    #[tracing::instrument(skip_all, level = "debug", fields(org_guid = %org_guid))]
    async fn resolve(&self, org_guid: &str) -> Result<Resolution, ServiceError> {
        let token = self.tokens.get_token().await?;

        let organization = self.membership.load_organization(org_guid, &token).await?;
        let members = self
            .membership
            .resolve_org_members(org_guid, &token)
            .await?;

        Ok(Resolution {
            recipients:   members.into_iter().collect(),
            endorsement:  endorsement::ORGANIZATION,
            space:        None,
            organization: Some(organization.name),
        })
    }
}

// ===== EveryoneStrategy =====

/// 全ユーザー宛て
pub struct EveryoneStrategy {
    tokens:     Arc<dyn TokenProvider>,
    membership: Arc<dyn MembershipProvider>,
}

impl EveryoneStrategy {
    pub fn new(tokens: Arc<dyn TokenProvider>, membership: Arc<dyn MembershipProvider>) -> Self {
        Self { tokens, membership }
    }
}

#[async_trait]
impl Strategy for EveryoneStrategy {
    type Target = ();

    #[tracing::instrument(skip_all, level = "debug")]
    async fn resolve(&self, _: &()) -> Result<Resolution, ServiceError> {
        let token = self.tokens.get_token().await?;
        let users = self.membership.resolve_all(&token).await?;

        Ok(Resolution::direct(
            users.into_iter().collect(),
            endorsement::EVERYONE,
        ))
    }
}

// ===== RecipientsStrategy =====

/// 明示された GUID の一覧宛て
#[derive(Debug, Clone, Copy, Default)]
pub struct RecipientsStrategy;

#[async_trait]
impl Strategy for RecipientsStrategy {
    type Target = [String];

    async fn resolve(&self, user_guids: &[String]) -> Result<Resolution, ServiceError> {
        Ok(Resolution::direct(
            user_guids
                .iter()
                .map(String::as_str)
                .filter(|guid| !guid.trim().is_empty())
                .collect(),
            endorsement::RECIPIENTS,
        ))
    }
}

// ===== Dispatcher =====

/// 配信対象に応じて戦略を選び、解決した宛先ごとにジョブを投入する
pub struct Dispatcher {
    user:         UserStrategy,
    space:        SpaceStrategy,
    organization: OrganizationStrategy,
    everyone:     EveryoneStrategy,
    recipients:   RecipientsStrategy,
    enqueuer:     Enqueuer,
}

impl Dispatcher {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        membership: Arc<dyn MembershipProvider>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            user:         UserStrategy,
            space:        SpaceStrategy::new(tokens.clone(), membership.clone()),
            organization: OrganizationStrategy::new(tokens.clone(), membership.clone()),
            everyone:     EveryoneStrategy::new(tokens, membership),
            recipients:   RecipientsStrategy,
            enqueuer:     Enqueuer::new(queue),
        }
    }

    /// 宛先を解決し、1 宛先 1 ジョブを呼び出し側のトランザクションに投入する
    ///
    /// 途中でエラーになった場合、呼び出し側はトランザクションをコミットしない。
    #[tracing::instrument(skip_all, fields(scope = audience.scope(), client_id = %request.client_id))]
    pub async fn dispatch(
        &self,
        tx: &mut TxContext,
        audience: &Audience,
        request: DispatchRequest,
    ) -> Result<Vec<DispatchResponse>, ServiceError> {
        let resolution = match audience {
            Audience::User(guid) => self.user.resolve(guid.as_str()).await?,
            Audience::Space(guid) => self.space.resolve(guid.as_str()).await?,
            Audience::Organization(guid) => self.organization.resolve(guid.as_str()).await?,
            Audience::Everyone => self.everyone.resolve(&()).await?,
            Audience::Recipients(guids) => self.recipients.resolve(guids.as_slice()).await?,
        };

        tracing::debug!(recipients = resolution.recipients.len(), "宛先を解決しました");

        self.enqueuer
            .enqueue(tx, audience.scope(), resolution, &request)
            .await
    }
}
