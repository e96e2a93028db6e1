//! 推論に必要な設定
//!
//! 保存されたモデルメタデータ、または設定ファイルから推論用の情報を組み立てます。

use crate::ml::ml_model::ClassifierConfig;
use crate::ml::tuning::Hyperparameters;
use crate::model::config::ModelSettings;
use crate::model::model_metadata::ModelMetadata;

/// 推論用情報
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// クラス名（ラベル順）
    pub class_names: Vec<String>,

    /// モデル入力サイズ (幅, 高さ)
    pub input_size: (u32, u32),

    pub rescale: f64,

    /// モデル構造の復元に使うハイパーパラメータ
    pub hyperparameters: Hyperparameters,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_names: metadata.class_names.clone(),
            input_size: metadata.input_size(),
            rescale: metadata.rescale,
            hyperparameters: metadata.hyperparameters.clone(),
        }
    }

    /// 設定ファイルの値から作成（学習済みモデルがない場合）
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            class_names: settings.class_names.clone(),
            input_size: settings.input_size,
            rescale: settings.rescale,
            hyperparameters: Hyperparameters::default(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// モデル設定に変換（推論時はドロップアウトを無効化）
    pub fn to_model_config(&self) -> ClassifierConfig {
        let (width, height) = self.input_size;
        self.hyperparameters
            .to_model_config(self.num_classes(), (height as usize, width as usize), self.rescale)
            .with_dropout(0.0)
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(String::as_str)
    }

    /// ラベルからクラスインデックスを取得
    pub fn label_to_index(&self, label: &str) -> Option<usize> {
        self.class_names.iter().position(|l| l == label)
    }
}
