//! # Cloak（配信停止トークン）
//!
//! `ユーザーGUID|クライアントID|種別ID` を認証付き暗号で包み、
//! 配信停止リンクに埋め込める不透明なトークンにする。
//!
//! ## 方式
//!
//! - 鍵: 共有シークレットの SHA-256（32 バイト）を AES-256-GCM の鍵にする
//! - nonce: 暗号化ごとに 12 バイトの乱数
//! - トークン: `base64url(nonce || ciphertext+tag)`（パディングなし）
//!
//! 改ざんされたトークンはタグ検証で必ず失敗し、誤った平文を返すことはない。

use aes_gcm::{
    Aes256Gcm,
    Key,
    Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use notifications_domain::receipt::ReceiptKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SEPARATOR: char = '|';

/// Cloak のエラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CloakError {
    /// トークンの形式が不正（base64 でない、短すぎる、平文の形式が不正）
    #[error("トークンの形式が不正です: {0}")]
    Malformed(String),

    /// 認証タグの検証に失敗（改ざん・別の鍵）
    #[error("トークンの完全性検証に失敗しました")]
    Integrity,

    /// 暗号化に失敗
    #[error("暗号化に失敗しました")]
    Encryption,
}

/// 可逆な認証付き暗号
pub trait Cloak: Send + Sync {
    /// 平文を暗号化してトークンにする
    fn veil(&self, plaintext: &[u8]) -> Result<String, CloakError>;

    /// トークンを復号する
    fn unveil(&self, token: &str) -> Result<Vec<u8>, CloakError>;
}

/// AES-256-GCM による Cloak 実装
#[derive(Clone)]
pub struct AesGcmCloak {
    cipher: Aes256Gcm,
}

impl AesGcmCloak {
    /// 共有シークレットから鍵を導出する
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl std::fmt::Debug for AesGcmCloak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCloak").field("key", &"[REDACTED]").finish()
    }
}

impl Cloak for AesGcmCloak {
    fn veil(&self, plaintext: &[u8]) -> Result<String, CloakError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CloakError::Encryption)?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    fn unveil(&self, token: &str) -> Result<Vec<u8>, CloakError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| CloakError::Malformed(e.to_string()))?;

        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(CloakError::Malformed(format!(
                "{} バイトは短すぎます",
                bytes.len()
            )));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CloakError::Integrity)
    }
}

/// 配信停止トークンの平文を組み立てる
pub fn unsubscribe_plaintext(key: &ReceiptKey) -> String {
    format!(
        "{}{SEPARATOR}{}{SEPARATOR}{}",
        key.user_guid, key.client_id, key.kind_id
    )
}

/// 配信停止トークンを復号し、キーの 3 つ組に戻す
///
/// 区切りは `|` のみ有効で、ちょうど 3 つの空でない要素が必要。
pub fn parse_unsubscribe_token(cloak: &dyn Cloak, token: &str) -> Result<ReceiptKey, CloakError> {
    let plaintext = cloak.unveil(token)?;
    let plaintext =
        String::from_utf8(plaintext).map_err(|e| CloakError::Malformed(e.to_string()))?;

    match plaintext.split(SEPARATOR).collect::<Vec<_>>().as_slice() {
        [user_guid, client_id, kind_id]
            if !user_guid.is_empty() && !client_id.is_empty() && !kind_id.is_empty() =>
        {
            Ok(ReceiptKey::new(*user_guid, *client_id, *kind_id))
        }
        _ => Err(CloakError::Malformed(format!(
            "平文の形式が不正です: {plaintext}"
        ))),
    }
}
