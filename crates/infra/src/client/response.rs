//! 外部 API レスポンスの共通ハンドリング

use serde::de::DeserializeOwned;

/// レスポンス処理の失敗
///
/// 各クライアントが自分のエラー型（NotFound / Unavailable）に写像する。
#[derive(Debug)]
pub(super) enum ResponseError {
    /// 404
    NotFound,
    /// 401 / 403
    Unauthorized(String),
    /// それ以外の非 2xx
    Status(String),
    /// 2xx だがボディを解釈できない、または通信に失敗
    Network(String),
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "404 Not Found"),
            Self::Unauthorized(msg) | Self::Status(msg) | Self::Network(msg) => {
                write!(f, "{msg}")
            }
        }
    }
}

impl From<reqwest::Error> for ResponseError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// 外部 API レスポンスの共通ハンドリング
///
/// 成功時はボディを `T` にデシリアライズし、失敗時はステータスコードで分類する。
pub(super) async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ResponseError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ResponseError::NotFound);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("予期しないステータス {}: {}", status, body);

    match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            Err(ResponseError::Unauthorized(message))
        }
        _ => Err(ResponseError::Status(message)),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestData {
        value: String,
    }

    fn make_response(status: u16, body: &str) -> reqwest::Response {
        let http_resp = http::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(body.to_string())
            .unwrap();
        reqwest::Response::from(http_resp)
    }

    #[tokio::test]
    async fn test_成功レスポンスをデシリアライズする() {
        let response = make_response(200, r#"{"value": "hello"}"#);

        let result: Result<TestData, _> = handle_response(response).await;

        assert_eq!(
            result.unwrap(),
            TestData {
                value: "hello".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_404でnot_foundを返す() {
        let response = make_response(404, "");

        let result: Result<TestData, _> = handle_response(response).await;

        assert!(matches!(result, Err(ResponseError::NotFound)));
    }

    #[tokio::test]
    async fn test_401でunauthorizedを返す() {
        let response = make_response(401, "bad credentials");

        let result: Result<TestData, _> = handle_response(response).await;

        assert!(matches!(
            result,
            Err(ResponseError::Unauthorized(msg)) if msg.contains("bad credentials")
        ));
    }

    #[tokio::test]
    async fn test_503でステータスとボディを含むエラーを返す() {
        let response = make_response(503, "maintenance");

        let result: Result<TestData, _> = handle_response(response).await;

        match result {
            Err(ResponseError::Status(msg)) => {
                assert!(msg.contains("503"), "{msg}");
                assert!(msg.contains("maintenance"), "{msg}");
            }
            other => panic!("Status を期待したが {other:?} を受け取った"),
        }
    }

    #[tokio::test]
    async fn test_成功だが不正なjsonでnetworkエラーを返す() {
        let response = make_response(200, "not json");

        let result: Result<TestData, _> = handle_response(response).await;

        assert!(matches!(result, Err(ResponseError::Network(_))));
    }
}
