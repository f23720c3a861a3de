//! # 配信内容
//!
//! 戦略が組み立て、ジョブのペイロードとして永続化される値。
//! ワーカーはこれをデコードして配信手続きを実行する。
//!
//! ペイロードは JSON で保存されるため、フィールドの追加は
//! `#[serde(default)]` を付けて後方互換を保つ。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

define_uuid_id! {
    /// 通知 ID
    ///
    /// 宛先 1 件ごとに採番され、`X-CF-Notification-ID` ヘッダと
    /// 配信受付レスポンスの `notification_id` に使われる相関 ID。
    pub struct NotificationId;
}

/// HTML 本文の構成要素
///
/// `body_content` のみがエスケープ対象外の生 HTML 断片として挿入される。
/// `head` / `doctype` / `body_attributes` はテンプレート作成者が用意した骨格。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Html {
    pub body_content:    String,
    pub body_attributes: String,
    pub head:            String,
    pub doctype:         String,
}

impl Html {
    /// 本文が空かどうか
    pub fn is_empty(&self) -> bool {
        self.body_content.trim().is_empty()
    }
}

/// 配信オプション
///
/// リクエストのメッセージ内容に、種別・送信元の説明と推薦文を合成したもの。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub reply_to:           String,
    pub subject:            String,
    /// 宛先メールアドレス。空ならワーカーがユーザーディレクトリから引く
    pub to:                 String,
    pub kind_id:            String,
    pub kind_description:   String,
    pub source_description: String,
    pub text:               String,
    pub html:               Html,
    pub endorsement:        String,
    /// 明示的に指定されたテンプレート ID
    pub template_id:        Option<String>,
}

/// ジョブペイロード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub notification_id:  NotificationId,
    pub user_guid:        String,
    pub options:          Options,
    pub client_id:        String,
    /// 配信対象の種別（"space", "everyone" など）
    pub scope:            String,
    /// 受付リクエストの相関 ID（`X-Vcap-Request-Id` 相当）
    #[serde(default)]
    pub request_id:       String,
    /// 配信リクエストを受け付けた時刻
    pub request_received: DateTime<Utc>,
    /// スペース・組織の表示名（推薦文の埋め込み用）
    #[serde(default)]
    pub space:            Option<String>,
    #[serde(default)]
    pub organization:     Option<String>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_htmlは本文が空白のみなら空と判定する() {
        let html = Html {
            body_content: "  \n".to_string(),
            head: "<title>x</title>".to_string(),
            ..Default::default()
        };

        assert!(html.is_empty());
    }

    #[test]
    fn test_deliveryは欠けたオプションフィールドを既定値で補う() {
        let json = serde_json::json!({
            "notification_id": "0190a6f4-0000-7000-8000-000000000001",
            "user_guid": "user-123",
            "options": { "kind_id": "acceptance-test", "text": "hello" },
            "client_id": "client-1",
            "scope": "user",
            "request_received": "2024-05-01T12:00:00.123456789Z"
        });

        let delivery: Delivery = serde_json::from_value(json).unwrap();

        assert_eq!(delivery.options.kind_id, "acceptance-test");
        assert_eq!(delivery.options.html, Html::default());
        assert_eq!(delivery.request_id, "");
        assert_eq!(delivery.space, None);
        assert_eq!(
            delivery.request_received,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + chrono::Duration::nanoseconds(123_456_789)
        );
    }
}
