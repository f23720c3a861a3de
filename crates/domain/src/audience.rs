//! # 配信対象（Audience）
//!
//! 配信リクエストの宛先種別と、戦略が解決した宛先集合を定義する。
//!
//! | 型 | 意味 |
//! |---|------|
//! | [`Audience`] | リクエストが指定した配信対象 |
//! | [`Space`] / [`Organization`] | 推薦文（endorsement）に埋め込む表示名 |
//! | [`RecipientSet`] | 重複を除いた宛先ユーザー GUID の集合 |
//! | [`DispatchResponse`] | 宛先ごとのキュー投入結果 |

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

/// 配信対象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// 単一ユーザー
    User(String),
    /// スペースのメンバー全員
    Space(String),
    /// 組織のメンバー全員
    Organization(String),
    /// 全ユーザー
    Everyone,
    /// 明示的に列挙されたユーザー
    Recipients(Vec<String>),
}

impl Audience {
    /// ジョブのペイロードに記録するスコープ名
    pub fn scope(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Space(_) => "space",
            Self::Organization(_) => "organization",
            Self::Everyone => "everyone",
            Self::Recipients(_) => "recipients",
        }
    }
}

/// スペース（Cloud Controller 上の表示名付き）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub guid:              String,
    pub name:              String,
    pub organization_guid: String,
}

/// 組織（Cloud Controller 上の表示名付き）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub guid: String,
    pub name: String,
}

/// 宛先集合
///
/// 挿入順を保ったまま重複を取り除く。
/// メンバーシップ API のページングで同じユーザーが複数回現れても 1 件になる。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSet {
    guids: Vec<String>,
}

impl RecipientSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// GUID を追加する。既に含まれていれば何もしない
    pub fn insert(&mut self, guid: impl Into<String>) {
        let guid = guid.into();
        if !self.guids.contains(&guid) {
            self.guids.push(guid);
        }
    }

    pub fn len(&self) -> usize {
        self.guids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.guids.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for RecipientSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut seen = HashSet::new();
        let guids = iter
            .into_iter()
            .map(Into::into)
            .filter(|guid: &String| seen.insert(guid.clone()))
            .collect();
        Self { guids }
    }
}

impl IntoIterator for RecipientSet {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.guids.into_iter()
    }
}

/// キュー投入結果のステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
pub enum DispatchStatus {
    #[serde(rename = "queued")]
    #[strum(serialize = "queued")]
    Queued,
    #[serde(rename = "failed-to-queue")]
    #[strum(serialize = "failed-to-queue")]
    FailedToQueue,
}

/// 宛先ごとの配信受付結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub recipient:       String,
    pub notification_id: String,
    pub status:          DispatchStatus,
}

/// 配信対象ごとの推薦文テンプレート
///
/// 本文の末尾に付く「なぜこのメールを受け取ったか」の説明。
/// スペース・組織の表示名はテンプレート変数として後から埋め込まれる。
pub mod endorsement {
    pub const USER: &str = "This message was sent directly to you.";
    pub const SPACE: &str = "You received this message because you belong to the {{ space }} space in the {{ organization }} organization.";
    pub const ORGANIZATION: &str =
        "You received this message because you belong to the {{ organization }} organization.";
    pub const EVERYONE: &str = "This message was sent to everyone.";
    pub const RECIPIENTS: &str = "This message was sent directly to you as one of its listed recipients.";
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_recipient_setは重複を除き挿入順を保つ() {
        let set: RecipientSet = ["user-2", "user-1", "user-2", "user-3", "user-1"]
            .into_iter()
            .collect();

        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec!["user-2", "user-1", "user-3"]
        );
    }

    #[test]
    fn test_recipient_setのinsertは既存のguidを無視する() {
        let mut set = RecipientSet::new();
        set.insert("user-1");
        set.insert("user-1");

        assert_eq!(set.len(), 1);
    }

    #[rstest]
    #[case(Audience::User("u".to_string()), "user")]
    #[case(Audience::Space("s".to_string()), "space")]
    #[case(Audience::Organization("o".to_string()), "organization")]
    #[case(Audience::Everyone, "everyone")]
    #[case(Audience::Recipients(vec![]), "recipients")]
    fn test_scopeは配信対象の種別名を返す(#[case] audience: Audience, #[case] expected: &str) {
        assert_eq!(audience.scope(), expected);
    }

    #[test]
    fn test_dispatch_responseはstatusをケバブケースで出力する() {
        let response = DispatchResponse {
            recipient:       "user-1".to_string(),
            notification_id: "0190a6f4-0000-7000-8000-000000000000".to_string(),
            status:          DispatchStatus::FailedToQueue,
        };

        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "recipient": "user-1",
                "notification_id": "0190a6f4-0000-7000-8000-000000000000",
                "status": "failed-to-queue"
            })
        );
    }
}
