//! # Notification Service ライブラリ
//!
//! 配信受付のハンドラ、宛先解決からメール送信までのユースケース、
//! 設定読み込みを公開する。バイナリ（`main.rs`）と結合テストの両方から使われる。

pub mod config;
pub mod error;
pub mod handler;
pub mod usecase;
