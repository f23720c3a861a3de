//! # ワーカー ID
//!
//! 水平スケールしたインスタンス間で衝突しないワーカー ID を、
//! 調整サービスなしに算出する。
//!
//! `global_id = instance_index × count + local_index + 1`

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// ワーカーのグローバル ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct WorkerId(i64);

impl WorkerId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

/// ワーカー ID の採番器
///
/// `instance_index` はデプロイ基盤が外部から与える（例: `CF_INSTANCE_INDEX`）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerGenerator {
    /// インスタンスあたりのワーカー数
    pub count:          u32,
    /// インスタンス番号（0 始まり）
    pub instance_index: u32,
}

impl WorkerGenerator {
    pub fn new(count: u32, instance_index: u32) -> Self {
        Self {
            count,
            instance_index,
        }
    }

    /// このインスタンスのワーカー ID を昇順で返す
    pub fn ids(&self) -> Vec<WorkerId> {
        let base = i64::from(self.instance_index) * i64::from(self.count);
        (0..i64::from(self.count))
            .map(|local| WorkerId(base + local + 1))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(5, 2, vec![11, 12, 13, 14, 15])]
    #[case(5, 0, vec![1, 2, 3, 4, 5])]
    #[case(1, 3, vec![4])]
    fn test_idsはインスタンス番号から連続したidを返す(
        #[case] count: u32,
        #[case] instance_index: u32,
        #[case] expected: Vec<i64>,
    ) {
        let ids: Vec<i64> = WorkerGenerator::new(count, instance_index)
            .ids()
            .into_iter()
            .map(|id| id.as_i64())
            .collect();

        assert_eq!(ids, expected);
    }

    #[test]
    fn test_複数インスタンスのidは衝突しない() {
        let mut seen = HashSet::new();
        for instance_index in 0..4 {
            for id in WorkerGenerator::new(5, instance_index).ids() {
                assert!(seen.insert(id), "重複した ID: {id}");
            }
        }

        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_countが0ならidを返さない() {
        assert!(WorkerGenerator::new(0, 7).ids().is_empty());
    }
}
