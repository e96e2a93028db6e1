//! ハイパーパラメータ探索
//!
//! 探索空間の定義と、試行を提案する探索戦略（ランダムサーチ）を提供します。

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::ml::ml_model::ClassifierConfig;

/// 1試行分のハイパーパラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub conv1_filters: usize,
    pub conv2_filters: usize,
    pub conv3_filters: usize,
    pub dense_units: usize,
    pub dropout: f64,
    pub learning_rate: f64,
}

impl Default for Hyperparameters {
    /// 固定アーキテクチャ (32/64/128, dense 128, dropout 0.5, lr 1e-3)
    fn default() -> Self {
        Self {
            conv1_filters: 32,
            conv2_filters: 64,
            conv3_filters: 128,
            dense_units: 128,
            dropout: 0.5,
            learning_rate: 1e-3,
        }
    }
}

impl Hyperparameters {
    /// モデル設定へ変換
    pub fn to_model_config(
        &self,
        num_classes: usize,
        input_size: (usize, usize),
        rescale: f64,
    ) -> ClassifierConfig {
        let (height, width) = input_size;
        ClassifierConfig::new(num_classes)
            .with_image_height(height)
            .with_image_width(width)
            .with_conv1_filters(self.conv1_filters)
            .with_conv2_filters(self.conv2_filters)
            .with_conv3_filters(self.conv3_filters)
            .with_dense_units(self.dense_units)
            .with_dropout(self.dropout)
            .with_rescale(rescale)
    }

    /// 重複判定用のキー（浮動小数点はビット列で比較）
    fn key(&self) -> (usize, usize, usize, usize, u64, u64) {
        (
            self.conv1_filters,
            self.conv2_filters,
            self.conv3_filters,
            self.dense_units,
            self.dropout.to_bits(),
            self.learning_rate.to_bits(),
        )
    }
}

impl std::fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "conv={}/{}/{}, dense={}, dropout={}, lr={}",
            self.conv1_filters,
            self.conv2_filters,
            self.conv3_filters,
            self.dense_units,
            self.dropout,
            self.learning_rate
        )
    }
}

/// 探索空間（各ハイパーパラメータの候補値）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub conv1_filters: Vec<usize>,
    pub conv2_filters: Vec<usize>,
    pub conv3_filters: Vec<usize>,
    pub dense_units: Vec<usize>,
    pub dropout: Vec<f64>,
    pub learning_rate: Vec<f64>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            conv1_filters: vec![32, 64],
            conv2_filters: vec![64, 128],
            conv3_filters: vec![128, 256],
            dense_units: vec![64, 128, 256],
            dropout: vec![0.3, 0.4, 0.5],
            learning_rate: vec![1e-2, 1e-3, 1e-4],
        }
    }
}

impl SearchSpace {
    /// 組み合わせの総数
    pub fn cardinality(&self) -> usize {
        self.conv1_filters.len()
            * self.conv2_filters.len()
            * self.conv3_filters.len()
            * self.dense_units.len()
            * self.dropout.len()
            * self.learning_rate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality() == 0
    }

    /// 候補からランダムに1点を選ぶ（空の次元がある場合は None）
    pub fn sample(&self, rng: &mut StdRng) -> Option<Hyperparameters> {
        Some(Hyperparameters {
            conv1_filters: *self.conv1_filters.choose(rng)?,
            conv2_filters: *self.conv2_filters.choose(rng)?,
            conv3_filters: *self.conv3_filters.choose(rng)?,
            dense_units: *self.dense_units.choose(rng)?,
            dropout: *self.dropout.choose(rng)?,
            learning_rate: *self.learning_rate.choose(rng)?,
        })
    }
}

/// 1試行の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial: usize,
    pub hyperparameters: Hyperparameters,
    /// 目的関数（最良の検証精度）
    pub best_val_accuracy: f64,
    pub epochs_trained: usize,
}

/// 試行を提案する探索戦略
pub trait SearchStrategy {
    /// 次の試行を提案（探索終了時は None）
    fn next_trial(&mut self, history: &[TrialResult]) -> Option<Hyperparameters>;
}

/// ランダムサーチ
///
/// シード固定で、同じ組み合わせを二度提案しません。
pub struct RandomSearch {
    space: SearchSpace,
    max_trials: usize,
    rng: StdRng,
    seen: HashSet<(usize, usize, usize, usize, u64, u64)>,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, max_trials: usize, seed: u64) -> Self {
        Self {
            space,
            max_trials,
            rng: StdRng::seed_from_u64(seed),
            seen: HashSet::new(),
        }
    }

    /// 実際に実行される試行数の上限
    pub fn trial_budget(&self) -> usize {
        self.max_trials.min(self.space.cardinality())
    }
}

impl SearchStrategy for RandomSearch {
    fn next_trial(&mut self, history: &[TrialResult]) -> Option<Hyperparameters> {
        if history.len() >= self.max_trials || self.seen.len() >= self.space.cardinality() {
            return None;
        }

        // 未試行の組み合わせが残っている限り引き直す
        loop {
            let candidate = self.space.sample(&mut self.rng)?;
            if self.seen.insert(candidate.key()) {
                return Some(candidate);
            }
        }
    }
}

/// 結果の中から目的関数が最大の試行を選ぶ（同点は先の試行）
pub fn best_trial(results: &[TrialResult]) -> Option<&TrialResult> {
    results.iter().fold(None, |best, r| match best {
        Some(b) if b.best_val_accuracy >= r.best_val_accuracy => Some(b),
        _ => Some(r),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(trial: usize, hp: Hyperparameters, acc: f64) -> TrialResult {
        TrialResult {
            trial,
            hyperparameters: hp,
            best_val_accuracy: acc,
            epochs_trained: 1,
        }
    }

    #[test]
    fn test_default_space() {
        let space = SearchSpace::default();
        assert_eq!(space.cardinality(), 2 * 2 * 2 * 3 * 3 * 3);
        assert!(!space.is_empty());
    }

    #[test]
    fn test_random_search_is_deterministic_and_unique() {
        let run = || {
            let mut search = RandomSearch::new(SearchSpace::default(), 10, 123);
            let mut history = Vec::new();
            while let Some(hp) = search.next_trial(&history) {
                history.push(record(history.len(), hp, 0.0));
            }
            history
        };

        let first = run();
        let second = run();
        assert_eq!(first.len(), 10);
        assert_eq!(first, second);

        let keys: HashSet<_> = first.iter().map(|r| r.hyperparameters.key()).collect();
        assert_eq!(keys.len(), first.len());
    }

    #[test]
    fn test_random_search_exhausts_small_space() {
        let space = SearchSpace {
            conv1_filters: vec![8],
            conv2_filters: vec![8],
            conv3_filters: vec![8],
            dense_units: vec![4, 8],
            dropout: vec![0.5],
            learning_rate: vec![1e-3],
        };
        let mut search = RandomSearch::new(space, 10, 1);
        assert_eq!(search.trial_budget(), 2);

        let mut history = Vec::new();
        while let Some(hp) = search.next_trial(&history) {
            history.push(record(history.len(), hp, 0.0));
        }
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_empty_dimension_yields_nothing() {
        let space = SearchSpace {
            dropout: vec![],
            ..SearchSpace::default()
        };
        let mut search = RandomSearch::new(space, 5, 0);
        assert!(search.next_trial(&[]).is_none());
    }

    #[test]
    fn test_best_trial_prefers_earlier_on_tie() {
        let results = vec![
            record(0, Hyperparameters::default(), 0.7),
            record(1, Hyperparameters { dense_units: 64, ..Hyperparameters::default() }, 0.9),
            record(2, Hyperparameters { dense_units: 256, ..Hyperparameters::default() }, 0.9),
        ];
        assert_eq!(best_trial(&results).unwrap().trial, 1);
        assert!(best_trial(&[]).is_none());
    }

    #[test]
    fn test_to_model_config() {
        let hp = Hyperparameters {
            conv1_filters: 64,
            conv2_filters: 128,
            conv3_filters: 256,
            dense_units: 64,
            dropout: 0.3,
            learning_rate: 1e-4,
        };
        let config = hp.to_model_config(3, (224, 224), 1.0);
        assert_eq!(config.num_classes, 3);
        assert_eq!(config.conv3_filters, 256);
        assert_eq!(config.dense_units, 64);
        assert_eq!(config.flatten_dim(), 256 * 28 * 28);
    }
}
