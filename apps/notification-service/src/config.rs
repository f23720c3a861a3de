//! # Notification Service 設定
//!
//! 環境変数から Notification Service の設定を読み込む。
//!
//! 必須の変数が欠けている場合や値を解釈できない場合は [`ConfigError`] を返す。
//! 読み込みは `from_lookup` に集約し、テストでは環境変数の代わりに
//! マップから値を渡す。

use std::{env, fmt, str::FromStr, time::Duration};

use strum::EnumString;
use thiserror::Error;

/// 設定読み込みエラー
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// 必須の環境変数が設定されていない
    #[error("{0} が設定されていません")]
    Missing(&'static str),

    /// 値を解釈できない
    #[error("{name} の値が不正です: {value}")]
    Invalid { name: &'static str, value: String },
}

/// メール送信バックエンド
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MailBackend {
    Smtp,
    Noop,
}

/// Notification Service の設定
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// バインドアドレス
    pub host:     String,
    /// ポート番号
    pub port:     u16,
    pub database: DatabaseConfig,
    pub mail:     MailConfig,
    pub packager: PackagerConfig,
    pub uaa:      UaaConfig,
    /// Cloud Controller のベース URL
    pub cc_host:  String,
    pub worker:   WorkerConfig,
}

/// データベース接続設定
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url:             String,
    pub max_connections: u32,
}

/// メール送信設定
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub backend:   MailBackend,
    pub smtp_host: String,
    pub smtp_port: u16,
}

/// メッセージ組み立て設定
#[derive(Clone)]
pub struct PackagerConfig {
    /// `From:` に使う送信元アドレス
    pub sender:         String,
    /// 配信停止リンクのドメイン
    pub domain:         String,
    /// 既定の件名テンプレートに差し込む接頭辞
    pub subject_prefix: String,
    /// 配信停止トークンの暗号鍵の元になる秘密値
    pub encryption_key: String,
}

impl fmt::Debug for PackagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackagerConfig")
            .field("sender", &self.sender)
            .field("domain", &self.domain)
            .field("subject_prefix", &self.subject_prefix)
            .field("encryption_key", &"[REDACTED]")
            .finish()
    }
}

/// UAA 接続設定
#[derive(Clone)]
pub struct UaaConfig {
    pub host:          String,
    pub client_id:     String,
    pub client_secret: String,
}

impl fmt::Debug for UaaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UaaConfig")
            .field("host", &self.host)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// ワーカープール設定
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// インスタンスあたりのワーカー数
    pub count:          u32,
    /// デプロイ基盤が割り当てるインスタンス番号
    pub instance_index: u32,
    /// キューが空のときの待機時間
    pub poll_interval:  Duration,
    /// 予約のリース期間
    pub lease:          Duration,
    /// 試行回数の上限
    pub max_attempts:   i32,
    /// シャットダウン時に実行中のジョブを待つ上限
    pub shutdown_grace: Duration,
}

impl ServiceConfig {
    /// 環境変数から設定を読み込む
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// 任意の参照関数から設定を読み込む
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let instance_index = match vars.get("INSTANCE_INDEX") {
            Some(_) => vars.parse_or("INSTANCE_INDEX", 0)?,
            None => vars.parse_or("CF_INSTANCE_INDEX", 0)?,
        };

        Ok(Self {
            host:     vars.or("HOST", "0.0.0.0"),
            port:     vars.parse_or("PORT", 3000)?,
            database: DatabaseConfig {
                url:             vars.required("DATABASE_URL")?,
                max_connections: vars.parse_or("DB_MAX_CONNECTIONS", 10)?,
            },
            mail:     MailConfig {
                backend:   vars.parse_or("MAIL_BACKEND", MailBackend::Smtp)?,
                smtp_host: vars.or("SMTP_HOST", "localhost"),
                smtp_port: vars.parse_or("SMTP_PORT", 1025)?,
            },
            packager: PackagerConfig {
                sender:         vars.required("SENDER")?,
                domain:         vars.or("DOMAIN", "example.com"),
                subject_prefix: vars.or("SUBJECT_PREFIX", "CF Notification: "),
                encryption_key: vars.required("ENCRYPTION_KEY")?,
            },
            uaa:      UaaConfig {
                host:          vars.required("UAA_HOST")?,
                client_id:     vars.required("UAA_CLIENT_ID")?,
                client_secret: vars.required("UAA_CLIENT_SECRET")?,
            },
            cc_host:  vars.required("CC_HOST")?,
            worker:   WorkerConfig {
                count: vars.parse_or("WORKER_COUNT", 10)?,
                instance_index,
                poll_interval: Duration::from_millis(vars.parse_or("WORKER_POLL_INTERVAL_MS", 500)?),
                lease: Duration::from_secs(vars.parse_or("JOB_LEASE_SECONDS", 300)?),
                max_attempts: vars.parse_or("JOB_MAX_ATTEMPTS", 10)?,
                shutdown_grace: Duration::from_secs(vars.parse_or("SHUTDOWN_GRACE_SECONDS", 30)?),
            },
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// 空文字列は未設定として扱う
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                name,
                value: value.clone(),
            }),
            None => Ok(default),
        }
    }
}
