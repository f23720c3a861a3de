//! # 配信記録（Receipt）
//!
//! (ユーザー GUID, クライアント ID, 種別 ID) の組ごとに配信回数を数える。
//! 組ごとに行は高々 1 件で、回数は増えるだけで減らない。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 配信記録のキー
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptKey {
    pub user_guid: String,
    pub client_id: String,
    pub kind_id:   String,
}

impl ReceiptKey {
    pub fn new(
        user_guid: impl Into<String>,
        client_id: impl Into<String>,
        kind_id: impl Into<String>,
    ) -> Self {
        Self {
            user_guid: user_guid.into(),
            client_id: client_id.into(),
            kind_id:   kind_id.into(),
        }
    }
}

impl std::fmt::Display for ReceiptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_guid, self.client_id, self.kind_id)
    }
}

/// 配信記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// サロゲートキー
    pub id:         i64,
    pub user_guid:  String,
    pub client_id:  String,
    pub kind_id:    String,
    pub count:      i32,
    pub created_at: DateTime<Utc>,
}

impl Receipt {
    pub fn key(&self) -> ReceiptKey {
        ReceiptKey::new(&self.user_guid, &self.client_id, &self.kind_id)
    }
}
