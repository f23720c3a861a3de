//! UAA クライアント
//!
//! - `POST /oauth/token`（client_credentials）でアクセストークンを取得し、期限の少し前まで再利用する
//! - `GET /Users/{guid}` でユーザーのメールアドレスを照会する
//! - `GET /Users` で全ユーザーを列挙する（everyone 配信用）

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{
    DirectoryError,
    MembershipError,
    TokenError,
    TokenProvider,
    UserDirectory,
    response::{ResponseError, handle_response},
};

/// 期限切れとみなすまでの余裕
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// キャッシュするトークンの最長有効期間（`expires_in` がこれより長くても切り詰める）
const MAX_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// `GET /Users` の 1 ページあたりの件数
const USERS_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in:   u64,
}

#[derive(Debug, Deserialize)]
struct UserEmail {
    value:   String,
    #[serde(default)]
    primary: bool,
}

#[derive(Debug, Deserialize)]
struct UserResource {
    id:     String,
    #[serde(default)]
    emails: Vec<UserEmail>,
}

impl UserResource {
    /// primary のアドレスを優先し、なければ最初のアドレス
    fn email(&self) -> Option<String> {
        self.emails
            .iter()
            .find(|e| e.primary)
            .or_else(|| self.emails.first())
            .map(|e| e.value.clone())
            .filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    resources:     Vec<UserResource>,
    #[serde(rename = "totalResults", default)]
    total_results: usize,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value:      String,
    expires_at: Instant,
}

impl CachedToken {
    fn new(value: String, expires_in: u64, now: Instant) -> Self {
        let ttl = Duration::from_secs(expires_in).min(MAX_TOKEN_TTL);
        Self {
            value,
            // 加算できない場合は期限切れとして扱い、次回に取り直す
            expires_at: now.checked_add(ttl).unwrap_or(now),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now.checked_add(EXPIRY_MARGIN)
            .is_some_and(|threshold| threshold < self.expires_at)
    }
}

/// UAA クライアント
pub struct UaaClient {
    base_url:      String,
    client_id:     String,
    client_secret: String,
    client:        reqwest::Client,
    cached:        Mutex<Option<CachedToken>>,
}

impl UaaClient {
    /// 新しい UaaClient を作成する
    ///
    /// # 引数
    ///
    /// - `base_url`: UAA のベース URL（例: `https://uaa.example.com`）
    /// - `client_id` / `client_secret`: client_credentials グラントの認証情報
    pub fn new(base_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            base_url:      base_url.trim_end_matches('/').to_string(),
            client_id:     client_id.to_string(),
            client_secret: client_secret.to_string(),
            client:        reqwest::Client::new(),
            cached:        Mutex::new(None),
        }
    }

    async fn fetch_token(&self) -> Result<TokenResponse, TokenError> {
        let url = format!("{}/oauth/token", self.base_url);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body("grant_type=client_credentials")
            .send()
            .await
            .map_err(|e| TokenError::Unavailable(e.to_string()))?;

        handle_response(response).await.map_err(|e| match e {
            ResponseError::Unauthorized(msg) => TokenError::Rejected(msg),
            other => TokenError::Unavailable(other.to_string()),
        })
    }

    /// UAA の全ユーザー GUID を列挙する
    ///
    /// `startIndex` は 1 始まり。
    pub(super) async fn list_user_guids(&self, token: &str) -> Result<Vec<String>, MembershipError> {
        let mut guids = Vec::new();
        let mut start_index = 1;

        loop {
            let url = format!(
                "{}/Users?attributes=id&startIndex={}&count={}",
                self.base_url, start_index, USERS_PAGE_SIZE
            );
            let response = self
                .client
                .get(&url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| MembershipError::Unavailable(e.to_string()))?;

            let page: UserList = handle_response(response)
                .await
                .map_err(|e| MembershipError::Unavailable(e.to_string()))?;

            let fetched = page.resources.len();
            guids.extend(page.resources.into_iter().map(|r| r.id));

            if fetched == 0 || guids.len() >= page.total_results {
                break;
            }
            start_index += fetched;
        }

        Ok(guids)
    }
}

#[async_trait]
impl TokenProvider for UaaClient {
    #[tracing::instrument(skip_all, level = "debug")]
    async fn get_token(&self) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref()
            && token.is_fresh(Instant::now())
        {
            return Ok(token.value.clone());
        }

        let fetched = self.fetch_token().await?;
        let token = CachedToken::new(fetched.access_token, fetched.expires_in, Instant::now());
        let value = token.value.clone();
        *cached = Some(token);

        tracing::debug!(expires_in = fetched.expires_in, "アクセストークンを取得しました");
        Ok(value)
    }
}

#[async_trait]
impl UserDirectory for UaaClient {
    #[tracing::instrument(skip_all, level = "debug", fields(user_guid = %user_guid))]
    async fn find_email(
        &self,
        user_guid: &str,
        token: &str,
    ) -> Result<Option<String>, DirectoryError> {
        let url = format!(
            "{}/Users/{}",
            self.base_url,
            urlencoding::encode(user_guid)
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        let user: UserResource = handle_response(response).await.map_err(|e| match e {
            ResponseError::NotFound => DirectoryError::NotFound(user_guid.to_string()),
            other => DirectoryError::Unavailable(other.to_string()),
        })?;

        Ok(user.email())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn トレイトはsendとsyncを実装している() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<UaaClient>();
    }

    #[test]
    fn test_primaryのメールアドレスを優先する() {
        let user: UserResource = serde_json::from_str(
            r#"{
                "id": "user-1",
                "emails": [
                    {"value": "secondary@example.com", "primary": false},
                    {"value": "primary@example.com", "primary": true}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(user.email(), Some("primary@example.com".to_string()));
    }

    #[test]
    fn test_primaryがなければ最初のメールアドレスを使う() {
        let user: UserResource = serde_json::from_str(
            r#"{"id": "user-1", "emails": [{"value": "first@example.com"}]}"#,
        )
        .unwrap();

        assert_eq!(user.email(), Some("first@example.com".to_string()));
    }

    #[test]
    fn test_メールアドレスがなければnoneを返す() {
        let user: UserResource = serde_json::from_str(r#"{"id": "user-1"}"#).unwrap();

        assert_eq!(user.email(), None);
    }

    #[test]
    fn test_ユーザー一覧をデシリアライズする() {
        let list: UserList = serde_json::from_str(
            r#"{
                "resources": [{"id": "user-1"}, {"id": "user-2"}],
                "startIndex": 1,
                "itemsPerPage": 100,
                "totalResults": 2
            }"#,
        )
        .unwrap();

        assert_eq!(list.total_results, 2);
        assert_eq!(
            list.resources.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["user-1", "user-2"]
        );
    }

    #[test]
    fn test_期限の直前のトークンは再取得対象になる() {
        let now = Instant::now();
        let fresh = CachedToken {
            value:      "token".to_string(),
            expires_at: now + Duration::from_secs(3600),
        };
        let stale = CachedToken {
            value:      "token".to_string(),
            expires_at: now + Duration::from_secs(10),
        };

        assert!(fresh.is_fresh(now));
        assert!(!stale.is_fresh(now));
    }

    #[test]
    fn test_過大なexpires_inは最長有効期間に切り詰める() {
        let now = Instant::now();

        let token = CachedToken::new("token".to_string(), u64::MAX, now);

        assert_eq!(token.expires_at, now + MAX_TOKEN_TTL);
        assert!(token.is_fresh(now));
    }

    #[test]
    fn test_expires_inが0のトークンはすぐ再取得対象になる() {
        let now = Instant::now();

        let token = CachedToken::new("token".to_string(), 0, now);

        assert_eq!(token.expires_at, now);
        assert!(!token.is_fresh(now));
    }
}
