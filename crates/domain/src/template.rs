//! # テンプレート
//!
//! 件名・plain-text・HTML の 3 つのテンプレートの組。
//! 本文テンプレートは配信オプションの本文を包む外枠で、
//! 推薦文や配信停止リンクを差し込む場所を決める。

use serde::{Deserialize, Serialize};

/// テンプレートの組
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Templates {
    pub name:    String,
    pub subject: String,
    pub text:    String,
    pub html:    String,
}

/// 既定テンプレートの ID
pub const DEFAULT_TEMPLATE_ID: &str = "default";
