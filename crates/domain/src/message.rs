//! # 送信メッセージ
//!
//! パッケージャが組み立て、メール送信層に渡すメッセージ。
//! 永続化されず、配信試行のたびに作り直される。

use std::fmt;

use strum::IntoStaticStr;

/// 本文パートの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum ContentType {
    #[strum(serialize = "text/plain")]
    Text,
    #[strum(serialize = "text/html")]
    Html,
}

/// 本文パート
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub content_type: ContentType,
    pub content:      String,
}

/// 送信ヘッダ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name:  String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name:  name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// 送信可能なメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from:     String,
    pub reply_to: String,
    pub to:       String,
    pub subject:  String,
    /// plain-text → HTML の順
    pub parts:    Vec<Part>,
    pub headers:  Vec<Header>,
}

impl Message {
    /// 指定した種別のパートを探す
    pub fn part(&self, content_type: ContentType) -> Option<&str> {
        self.parts
            .iter()
            .find(|p| p.content_type == content_type)
            .map(|p| p.content.as_str())
    }

    /// 指定した名前のヘッダ値を探す
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_headerは名前とコロン区切りで表示する() {
        let header = Header::new("X-CF-Client-ID", "client-1");
        assert_eq!(header.to_string(), "X-CF-Client-ID: client-1");
    }

    #[test]
    fn test_headerの検索は大文字小文字を区別しない() {
        let message = Message {
            from:     "sender@example.com".to_string(),
            reply_to: String::new(),
            to:       "user@example.com".to_string(),
            subject:  "subject".to_string(),
            parts:    vec![Part {
                content_type: ContentType::Text,
                content:      "body".to_string(),
            }],
            headers:  vec![Header::new("X-CF-Client-ID", "client-1")],
        };

        assert_eq!(message.header("x-cf-client-id"), Some("client-1"));
        assert_eq!(message.part(ContentType::Text), Some("body"));
        assert_eq!(message.part(ContentType::Html), None);
    }
}
