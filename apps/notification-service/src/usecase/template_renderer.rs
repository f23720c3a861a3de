//! # テンプレートレンダラー
//!
//! tera でクライアント提供のテンプレート文字列を描画する。
//!
//! ## 設計方針
//!
//! - **出力面ごとのエスケープ**: 同じ変数を HTML 面では一度だけエンティティ化し、
//!   プレーンテキスト面では生のまま差し込む。tera の自動エスケープは使わず、
//!   コンテキストに入れる前に [`tera::escape_html`] を適用する
//! - **生の断片**: テンプレート作成者が用意した HTML 断片（本文・推薦文）は
//!   [`TemplateVars::insert_raw`] で登録し、どちらの面でもエスケープしない
//! - **テンプレートは毎回パースする**: テンプレートは配信ごとにストアから読み込まれるため、
//!   エンジンに登録せず `Tera::one_off` で描画する

use std::collections::BTreeMap;

use itertools::Itertools;
use tera::{Context, Tera};
use thiserror::Error;

/// 描画先の面
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Text,
    Html,
}

/// テンプレートエラー
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// 明示指定されたテンプレートが存在しない
    #[error("テンプレートが見つかりません: {0}")]
    NotFound(String),

    /// 構文エラー・未定義変数など
    #[error("テンプレートの描画に失敗: {0}")]
    Render(String),

    /// テキストと HTML の両方が空
    #[error("本文が空です（text と html のどちらも空）")]
    Empty,
}

/// 描画に渡す変数
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    escaped: BTreeMap<String, String>,
    raw:     BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTML 面でエスケープされる変数を登録する
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.escaped.insert(key.into(), value.into());
    }

    /// どちらの面でもエスケープされない変数を登録する
    pub fn insert_raw(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.raw.insert(key.into(), value.into());
    }

    fn context(&self, surface: Surface) -> Context {
        let mut context = Context::new();
        for (key, value) in &self.escaped {
            match surface {
                Surface::Text => context.insert(key.as_str(), value),
                Surface::Html => context.insert(key.as_str(), &tera::escape_html(value)),
            }
        }
        for (key, value) in &self.raw {
            context.insert(key.as_str(), value);
        }
        context
    }
}

/// テンプレートレンダラー
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    /// テンプレート文字列を指定した面で描画する
    pub fn render(
        &self,
        source: &str,
        vars: &TemplateVars,
        surface: Surface,
    ) -> Result<String, TemplateError> {
        Tera::one_off(source, &vars.context(surface), false)
            .map_err(|e| TemplateError::Render(describe(&e)))
    }
}

/// tera のエラーは原因が source に入っているため連結して返す
fn describe(err: &tera::Error) -> String {
    let root: &(dyn std::error::Error + 'static) = err;
    std::iter::successors(Some(root), |e| e.source())
        .map(ToString::to_string)
        .join(": ")
}
