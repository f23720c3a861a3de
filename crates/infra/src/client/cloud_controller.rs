//! Cloud Controller (v2) クライアント
//!
//! スペース・組織の表示名と所属ユーザーを取得する。
//! ユーザー一覧は `next_url` を辿って全ページを読む。
//! 全ユーザーの列挙は UAA に委譲する。

use std::sync::Arc;

use async_trait::async_trait;
use notifications_domain::audience::{Organization, Space};
use serde::{Deserialize, de::DeserializeOwned};

use super::{
    MembershipError,
    MembershipProvider,
    UaaClient,
    response::{ResponseError, handle_response},
};

const RESULTS_PER_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
struct Metadata {
    guid: String,
}

#[derive(Debug, Deserialize)]
struct Resource<E> {
    metadata: Metadata,
    entity:   E,
}

#[derive(Debug, Deserialize)]
struct SpaceEntity {
    name:              String,
    organization_guid: String,
}

#[derive(Debug, Deserialize)]
struct OrganizationEntity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct UserPage {
    #[serde(default)]
    next_url:  Option<String>,
    #[serde(default)]
    resources: Vec<UserResource>,
}

#[derive(Debug, Deserialize)]
struct UserResource {
    metadata: Metadata,
}

/// Cloud Controller クライアント
pub struct CloudControllerClient {
    base_url: String,
    client:   reqwest::Client,
    uaa:      Arc<UaaClient>,
}

impl CloudControllerClient {
    /// 新しい CloudControllerClient を作成する
    ///
    /// # 引数
    ///
    /// - `base_url`: Cloud Controller のベース URL（例: `https://api.example.com`）
    /// - `uaa`: 全ユーザー列挙に使う UAA クライアント
    pub fn new(base_url: &str, uaa: Arc<UaaClient>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            uaa,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
        not_found_key: &str,
    ) -> Result<T, MembershipError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| MembershipError::Unavailable(e.to_string()))?;

        handle_response(response).await.map_err(|e| match e {
            ResponseError::NotFound => MembershipError::NotFound(not_found_key.to_string()),
            other => MembershipError::Unavailable(other.to_string()),
        })
    }

    /// `next_url` が尽きるまでユーザー GUID を集める
    async fn collect_users(
        &self,
        first_path: String,
        token: &str,
        not_found_key: &str,
    ) -> Result<Vec<String>, MembershipError> {
        let mut guids = Vec::new();
        let mut next = Some(first_path);

        while let Some(path) = next {
            let page: UserPage = self.get(&path, token, not_found_key).await?;
            guids.extend(page.resources.into_iter().map(|r| r.metadata.guid));
            next = page.next_url.filter(|url| !url.is_empty());
        }

        Ok(guids)
    }
}

#[async_trait]
impl MembershipProvider for CloudControllerClient {
    #[tracing::instrument(skip_all, level = "debug", fields(space_guid = %space_guid))]
    async fn load_space(&self, space_guid: &str, token: &str) -> Result<Space, MembershipError> {
        let path = format!("/v2/spaces/{}", urlencoding::encode(space_guid));
        let resource: Resource<SpaceEntity> = self.get(&path, token, space_guid).await?;

        Ok(Space {
            guid:              resource.metadata.guid,
            name:              resource.entity.name,
            organization_guid: resource.entity.organization_guid,
        })
    }

    #[tracing::instrument(skip_all, level = "debug", fields(org_guid = %org_guid))]
    async fn load_organization(
        &self,
        org_guid: &str,
        token: &str,
    ) -> Result<Organization, MembershipError> {
        let path = format!("/v2/organizations/{}", urlencoding::encode(org_guid));
        let resource: Resource<OrganizationEntity> = self.get(&path, token, org_guid).await?;

        Ok(Organization {
            guid: resource.metadata.guid,
            name: resource.entity.name,
        })
    }

    #[tracing::instrument(skip_all, level = "debug", fields(space_guid = %space_guid))]
    async fn resolve_space_members(
        &self,
        space_guid: &str,
        token: &str,
    ) -> Result<Vec<String>, MembershipError> {
        let path = format!(
            "/v2/spaces/{}/users?results-per-page={}",
            urlencoding::encode(space_guid),
            RESULTS_PER_PAGE
        );
        self.collect_users(path, token, space_guid).await
    }

    #[tracing::instrument(skip_all, level = "debug", fields(org_guid = %org_guid))]
    async fn resolve_org_members(
        &self,
        org_guid: &str,
        token: &str,
    ) -> Result<Vec<String>, MembershipError> {
        let path = format!(
            "/v2/organizations/{}/users?results-per-page={}",
            urlencoding::encode(org_guid),
            RESULTS_PER_PAGE
        );
        self.collect_users(path, token, org_guid).await
    }

    #[tracing::instrument(skip_all, level = "debug")]
    async fn resolve_all(&self, token: &str) -> Result<Vec<String>, MembershipError> {
        self.uaa.list_user_guids(token).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn トレイトはsendとsyncを実装している() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CloudControllerClient>();
    }

    #[test]
    fn test_スペースのレスポンスをデシリアライズする() {
        let resource: Resource<SpaceEntity> = serde_json::from_str(
            r#"{
                "metadata": {"guid": "space-guid", "url": "/v2/spaces/space-guid"},
                "entity": {"name": "development", "organization_guid": "org-guid"}
            }"#,
        )
        .unwrap();

        assert_eq!(resource.metadata.guid, "space-guid");
        assert_eq!(resource.entity.name, "development");
        assert_eq!(resource.entity.organization_guid, "org-guid");
    }

    #[test]
    fn test_ユーザーページのnext_urlを読み取る() {
        let page: UserPage = serde_json::from_str(
            r#"{
                "total_results": 3,
                "next_url": "/v2/spaces/space-guid/users?page=2&results-per-page=2",
                "resources": [
                    {"metadata": {"guid": "user-1"}, "entity": {}},
                    {"metadata": {"guid": "user-2"}, "entity": {}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(
            page.next_url.as_deref(),
            Some("/v2/spaces/space-guid/users?page=2&results-per-page=2")
        );
        assert_eq!(page.resources.len(), 2);
    }

    #[test]
    fn test_最終ページのnext_urlはnullになる() {
        let page: UserPage = serde_json::from_str(
            r#"{"next_url": null, "resources": [{"metadata": {"guid": "user-3"}}]}"#,
        )
        .unwrap();

        assert_eq!(page.next_url, None);
    }
}
