//! # 通知配信ドメイン層
//!
//! 通知の宛先解決・ジョブ・配信記録に関するドメインモデルを定義する。
//!
//! ## 設計方針
//!
//! - **I/O を持たない**: DB・SMTP・外部 API には一切依存しない
//! - **状態遷移は純粋関数**: ジョブの再試行判定やワーカー ID の算出は
//!   インフラ層・ユースケース層から共有される
//!
//! ## 依存関係の方向
//!
//! ```text
//! notification-service → infra → domain
//! ```
//!
//! ## モジュール構成
//!
//! - [`audience`] - 配信対象（ユーザー / スペース / 組織 / 全員 / 明示リスト）
//! - [`delivery`] - ジョブのペイロードとなる配信内容
//! - [`job`] - 遅延配信ジョブとリトライポリシー
//! - [`message`] - 送信可能な形に組み立てられたメッセージ
//! - [`receipt`] - 冪等な配信記録
//! - [`template`] - 件名・本文テンプレートの組
//! - [`worker`] - ワーカーのグローバル ID 採番
//! - [`clock`] - 時刻プロバイダ

#[macro_use]
mod macros;

pub mod audience;
pub mod clock;
pub mod delivery;
pub mod job;
pub mod message;
pub mod receipt;
pub mod template;
pub mod worker;
