//! # 外部 API クライアント
//!
//! 配信パイプラインが呼び出す外部サービスとの境界。
//!
//! ## 設計方針
//!
//! - **trait で境界を切る**: ユースケースは [`TokenProvider`] / [`MembershipProvider`] /
//!   [`UserDirectory`] にのみ依存し、テストではインメモリのモックに差し替える
//! - **エラーは 2 分類**: 対象が存在しない（NotFound）か、相手が応答しない（Unavailable）か。
//!   呼び出し側は HTTP 404 / 502 の出し分けだけに使う
//! - **レスポンス処理の共通化**: ステータス判定とデシリアライズは `response` モジュールに集約
//!
//! ## 実装
//!
//! - [`UaaClient`]: クライアントクレデンシャルによるトークン取得、ユーザーのメールアドレス照会
//! - [`CloudControllerClient`]: スペース・組織・全ユーザーのメンバー解決

mod cloud_controller;
mod response;
mod uaa;

use async_trait::async_trait;
pub use cloud_controller::CloudControllerClient;
use notifications_domain::audience::{Organization, Space};
use thiserror::Error;
pub use uaa::UaaClient;

/// メンバーシップ解決エラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    /// スペース・組織などの対象が存在しない（404）
    #[error("対象が見つかりません: {0}")]
    NotFound(String),

    /// メンバーシップ API が利用できない
    #[error("メンバーシップ API を利用できません: {0}")]
    Unavailable(String),
}

/// アクセストークン取得エラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    /// 認証情報が拒否された（401 / 403）
    #[error("トークン発行が拒否されました: {0}")]
    Rejected(String),

    /// 認可サーバーが利用できない
    #[error("認可サーバーを利用できません: {0}")]
    Unavailable(String),
}

/// ユーザー照会エラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// ユーザーが存在しない（404）
    #[error("ユーザーが見つかりません: {0}")]
    NotFound(String),

    /// ユーザー API が利用できない
    #[error("ユーザー API を利用できません: {0}")]
    Unavailable(String),
}

/// アクセストークン提供
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// 有効なアクセストークンを返す
    async fn get_token(&self) -> Result<String, TokenError>;
}

/// メンバーシップ解決
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// スペースの表示名と所属組織を取得する
    async fn load_space(&self, space_guid: &str, token: &str) -> Result<Space, MembershipError>;

    /// 組織の表示名を取得する
    async fn load_organization(
        &self,
        org_guid: &str,
        token: &str,
    ) -> Result<Organization, MembershipError>;

    /// スペースのメンバーの GUID を列挙する
    async fn resolve_space_members(
        &self,
        space_guid: &str,
        token: &str,
    ) -> Result<Vec<String>, MembershipError>;

    /// 組織のメンバーの GUID を列挙する
    async fn resolve_org_members(
        &self,
        org_guid: &str,
        token: &str,
    ) -> Result<Vec<String>, MembershipError>;

    /// 全ユーザーの GUID を列挙する
    async fn resolve_all(&self, token: &str) -> Result<Vec<String>, MembershipError>;
}

/// ユーザー情報の照会
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// ユーザーのメールアドレスを返す。登録されていなければ `None`
    async fn find_email(&self, user_guid: &str, token: &str)
    -> Result<Option<String>, DirectoryError>;
}
