//! モデルメタデータの定義
//!
//! 学習済みモデルと一緒に保存される情報（クラス名、入力サイズ、
//! ハイパーパラメータ、学習履歴など）を表します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::training::{EpochMetrics, TrainingHistory};
use crate::ml::tuning::{Hyperparameters, TrialResult};

/// 学習モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// 固定アーキテクチャで学習
    Simple,
    /// ハイパーパラメータ探索後に再学習
    Tuned,
}

impl std::fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingMode::Simple => write!(f, "simple"),
            TrainingMode::Tuned => write!(f, "tuned"),
        }
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
///
/// 同じ内容が `<stem>.json` としてアーカイブの隣にも書き出されます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（ラベル順）
    pub class_names: Vec<String>,

    /// モデル入力サイズ（幅）
    pub input_width: u32,

    /// モデル入力サイズ（高さ）
    pub input_height: u32,

    /// ネットワーク先頭の入力係数
    #[serde(default = "default_rescale")]
    pub rescale: f64,

    pub hyperparameters: Hyperparameters,

    pub training_mode: TrainingMode,

    /// 実際に学習したエポック数（Early stopping で打ち切られた場合は途中まで）
    pub epochs_trained: usize,

    /// 採用したエポックの指標
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub val_accuracy: Option<f64>,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default)]
    pub val_loss: Option<f64>,

    /// エポックごとの学習履歴
    #[serde(default)]
    pub history: TrainingHistory,

    /// チューニング試行の記録（simple モードでは空）
    #[serde(default)]
    pub tuning_trials: Vec<TrialResult>,

    /// モデルの学習時刻（RFC 3339形式）
    pub trained_at: String,
}

fn default_rescale() -> f64 {
    1.0
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        input_size: (u32, u32),
        rescale: f64,
        hyperparameters: Hyperparameters,
        training_mode: TrainingMode,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_names,
            input_width: input_size.0,
            input_height: input_size.1,
            rescale,
            hyperparameters,
            training_mode,
            epochs_trained: 0,
            accuracy: None,
            val_accuracy: None,
            loss: None,
            val_loss: None,
            history: TrainingHistory::default(),
            tuning_trials: Vec::new(),
            trained_at,
        }
    }

    /// 学習履歴を設定し、採用エポックの指標を反映
    pub fn with_history(mut self, history: TrainingHistory) -> Self {
        self.epochs_trained = history.epochs.len();
        if let Some(best) = history.best() {
            self.apply_metrics(best);
        }
        self.history = history;
        self
    }

    pub fn with_tuning_trials(mut self, trials: Vec<TrialResult>) -> Self {
        self.tuning_trials = trials;
        self
    }

    fn apply_metrics(&mut self, metrics: &EpochMetrics) {
        self.accuracy = Some(metrics.accuracy);
        self.val_accuracy = Some(metrics.val_accuracy);
        self.loss = Some(metrics.loss);
        self.val_loss = Some(metrics.val_loss);
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// (幅, 高さ)
    pub fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(epoch: usize, val_loss: f64, val_accuracy: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            loss: 1.0 / (epoch as f64 + 1.0),
            accuracy: 0.5,
            val_loss,
            val_accuracy,
        }
    }

    #[test]
    fn test_new_sets_timestamp() {
        let metadata = ModelMetadata::new(
            vec!["eraser".into(), "kertas".into(), "pensil".into()],
            (300, 300),
            1.0,
            Hyperparameters::default(),
            TrainingMode::Simple,
        );
        assert_eq!(metadata.num_classes(), 3);
        assert_eq!(metadata.input_size(), (300, 300));
        assert!(chrono::DateTime::parse_from_rfc3339(&metadata.trained_at).is_ok());
        assert_eq!(metadata.accuracy, None);
    }

    #[test]
    fn test_with_history_uses_best_epoch() {
        let history = TrainingHistory {
            epochs: vec![metrics(1, 0.9, 0.6), metrics(2, 0.4, 0.8), metrics(3, 0.7, 0.9)],
            best_epoch: Some(2),
            stopped_early: false,
        };
        let metadata = ModelMetadata::new(
            vec!["a".into(), "b".into()],
            (224, 224),
            1.0,
            Hyperparameters::default(),
            TrainingMode::Tuned,
        )
        .with_history(history);

        assert_eq!(metadata.epochs_trained, 3);
        assert_eq!(metadata.val_loss, Some(0.4));
        assert_eq!(metadata.val_accuracy, Some(0.8));
    }

    #[test]
    fn test_json_string() {
        let metadata = ModelMetadata::new(
            vec!["a".into(), "b".into()],
            (224, 300),
            1.0,
            Hyperparameters::default(),
            TrainingMode::Simple,
        );
        let json = metadata.to_json_string().unwrap();
        assert!(json.contains("\"training_mode\": \"simple\""));
        assert_eq!(ModelMetadata::from_json_string(&json).unwrap(), metadata);
        assert!(ModelMetadata::from_json_string("{}").is_err());
    }
}
