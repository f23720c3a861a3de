//! # 配信ジョブ
//!
//! 宛先 1 件分の遅延配信作業と、その状態遷移を定義する。
//!
//! ## 状態遷移
//!
//! ```text
//! pending ──reserve──▶ in_flight ──succeed──▶ (削除)
//!    ▲                     │
//!    │                     ├──fail(再試行可・上限未満)──▶ retrying ──reserve──▶ in_flight
//!    │                     └──fail(再試行不可 or 上限到達)──▶ failed
//!    └──────────── retry_failed（運用者操作）──────────────────┘
//! ```
//!
//! `in_flight` の予約にはリース期限があり、期限切れのジョブは
//! 再び予約可能になる（ワーカーがクラッシュした場合の回収）。
//! 回収は放棄された 1 回の試行として数え、上限に達していれば `failed` にする。
//!
//! 試行回数は減らない。運用者の再投入は `manual_retries` に記録する。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use strum::{EnumString, IntoStaticStr};

define_uuid_id! {
    /// ジョブ ID
    pub struct JobId;
}

/// ジョブの状態
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    IntoStaticStr,
    EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    /// 投入直後
    Pending,
    /// ワーカーが予約中
    InFlight,
    /// 失敗後、バックオフ待ち
    Retrying,
    /// 再試行上限に達した終端状態（運用者が確認するまで残る）
    Failed,
}

/// 配信ジョブ
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id:               JobId,
    pub payload:          serde_json::Value,
    pub status:           JobStatus,
    pub attempts:         i32,
    pub manual_retries:   i32,
    pub worker_id:        Option<i64>,
    pub scheduled_at:     DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error:       Option<String>,
    pub created_at:       DateTime<Utc>,
    pub updated_at:       DateTime<Utc>,
}

impl Job {
    /// 投入直後のジョブを組み立てる
    pub fn new_pending(payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            manual_retries: 0,
            worker_id: None,
            scheduled_at: now,
            lease_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 予約可能かどうか
    ///
    /// - pending / retrying で、予定時刻を過ぎている
    /// - in_flight だが、リース期限を過ぎている
    pub fn is_reservable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending | JobStatus::Retrying => self.scheduled_at <= now,
            JobStatus::InFlight => self.lease_expires_at.is_some_and(|expires| expires <= now),
            JobStatus::Failed => false,
        }
    }

    /// `worker_id` のワーカーがこのジョブのリースを持っているか
    ///
    /// リース期限は見ない。期限切れでも他のワーカーが回収するまでは元のワーカーのもの。
    pub fn is_held_by(&self, worker_id: i64) -> bool {
        self.status == JobStatus::InFlight && self.worker_id == Some(worker_id)
    }

    /// ペイロードをデコードする
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// 失敗時の遷移先
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDecision {
    pub status:       JobStatus,
    pub attempts:     i32,
    pub scheduled_at: DateTime<Utc>,
}

/// リトライポリシー
///
/// 再試行の上限と予約リースの長さを保持する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 試行回数の上限。これに達したジョブは `failed` になる
    pub max_attempts: i32,
    /// 予約リースの長さ
    pub lease:        Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            lease:        Duration::from_secs(300),
        }
    }
}

/// バックオフの上限（1 時間）
const MAX_BACKOFF_SECS: i64 = 3600;

impl RetryPolicy {
    /// `attempts` 回失敗した後の待ち時間
    ///
    /// `2^attempts` 秒。1 時間で頭打ちにする。
    pub fn backoff(attempts: i32) -> chrono::Duration {
        let exponent = attempts.clamp(0, 12) as u32;
        chrono::Duration::seconds((1_i64 << exponent).min(MAX_BACKOFF_SECS))
    }

    /// 失敗を記録した後の遷移先を決める
    ///
    /// 試行回数は必ず 1 増える。再試行可能かつ上限未満なら `retrying`、
    /// それ以外は `failed` になる。
    pub fn decide(&self, attempts: i32, retryable: bool, now: DateTime<Utc>) -> FailureDecision {
        let attempts = attempts.saturating_add(1);

        if retryable && attempts < self.max_attempts {
            FailureDecision {
                status: JobStatus::Retrying,
                attempts,
                scheduled_at: now + Self::backoff(attempts),
            }
        } else {
            FailureDecision {
                status: JobStatus::Failed,
                attempts,
                scheduled_at: now,
            }
        }
    }

    /// リース切れの `in_flight` を回収するときの遷移先を決める
    ///
    /// 放棄された予約を 1 回の失敗として数える。上限未満なら `retrying` が返り、
    /// 回収したワーカーがそのまま予約する。上限に達していれば `failed`。
    pub fn reclaim(&self, attempts: i32, now: DateTime<Utc>) -> FailureDecision {
        self.decide(attempts, true, now)
    }

    /// 予約時点から見たリース期限
    pub fn lease_expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::seconds(300))
    }
}
