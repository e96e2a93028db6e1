//! アプリケーション設定管理モジュール
//!
//! クラス名・入力サイズ・アップロード制限・推論設定・学習設定・計算デバイスを
//! JSON形式で保存・読み込みします。各コンポーネントはここから設定を受け取ります。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ClassifierError, Result};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    /// 学習済みモデル（tar.gz）のパス
    pub model_path: PathBuf,
    /// 入力画像サイズ (幅, 高さ)
    pub input_size: (u32, u32),
    /// 分類クラス名（ラベル順）
    pub class_names: Vec<String>,
    /// ネットワーク先頭で入力に掛ける係数
    ///
    /// 前処理で既に [0, 1] に正規化している場合は 1.0。
    #[serde(default = "default_rescale")]
    pub rescale: f64,
}

fn default_rescale() -> f64 {
    1.0
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/best_model.tar.gz"),
            input_size: (300, 300),
            class_names: vec![
                "eraser".to_string(),
                "kertas".to_string(),
                "pensil".to_string(),
            ],
            rescale: default_rescale(),
        }
    }
}

impl ModelSettings {
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }
}

/// アップロード設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSettings {
    /// 最大ファイルサイズ（バイト）
    pub max_upload_size: u64,
    /// 許可する拡張子（ドットなし）
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_upload_size: 5 * 1024 * 1024,
            allowed_extensions: ["jpg", "jpeg", "png", "bmp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionSettings {
    /// 上位何件を返すか
    pub top_k: usize,
    /// この値未満の確信度を「低確信度」とみなす
    pub low_confidence_threshold: f32,
    /// デモモードの乱数シード（None の場合は毎回ランダム）
    #[serde(default)]
    pub demo_seed: Option<u64>,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            low_confidence_threshold: 0.5,
            demo_seed: None,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingSettings {
    /// データセットのルートディレクトリ（CLI で省略した場合に使用）
    pub dataset_dir: PathBuf,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 検証データの割合
    pub validation_split: f32,
    /// 学習率
    pub learning_rate: f64,
    /// Early stopping の猶予エポック数
    pub early_stopping_patience: usize,
    /// ランダムシード
    pub seed: u64,
    /// チューニング時の1試行あたりのエポック数
    pub tuning_epochs: usize,
    /// チューニングの最大試行回数
    pub max_trials: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset_alat_tulis"),
            num_epochs: 15,
            batch_size: 15,
            validation_split: 0.1,
            learning_rate: 1e-3,
            early_stopping_patience: 3,
            seed: 123,
            tuning_epochs: 15,
            max_trials: 10,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// アップロード設定
    #[serde(default)]
    pub upload: UploadSettings,
    /// 推論設定
    #[serde(default)]
    pub prediction: PredictionSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 指定パス（省略時はデフォルトパス）から設定を読み込む。
    /// 存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    log::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            log::debug!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定値の整合性チェック
    pub fn validate(&self) -> Result<()> {
        let names = &self.model.class_names;
        if names.is_empty() {
            return Err(ClassifierError::Config("class_names must not be empty".into()));
        }
        let unique: HashSet<&String> = names.iter().collect();
        if unique.len() != names.len() {
            return Err(ClassifierError::Config(format!(
                "class_names contains duplicates: {}",
                names.join(", ")
            )));
        }
        let (w, h) = self.model.input_size;
        if w == 0 || h == 0 {
            return Err(ClassifierError::Config(format!(
                "input_size must be non-zero, got {}x{}",
                w, h
            )));
        }
        let threshold = self.prediction.low_confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ClassifierError::Config(format!(
                "low_confidence_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if self.prediction.top_k == 0 {
            return Err(ClassifierError::Config("top_k must be at least 1".into()));
        }
        let split = self.training.validation_split;
        if !(split > 0.0 && split < 1.0) {
            return Err(ClassifierError::Config(format!(
                "validation_split must be within (0, 1), got {}",
                split
            )));
        }
        let training = &self.training;
        for (name, value) in [
            ("batch_size", training.batch_size),
            ("num_epochs", training.num_epochs),
            ("tuning_epochs", training.tuning_epochs),
            ("max_trials", training.max_trials),
        ] {
            if value == 0 {
                return Err(ClassifierError::Config(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("モデルパス: {}", self.model.model_path.display());
        println!(
            "入力サイズ: {}x{}",
            self.model.input_size.0, self.model.input_size.1
        );
        println!("クラス: {}", self.model.class_names.join(", "));
        println!("\n--- アップロード設定 ---");
        println!(
            "最大サイズ: {:.1} MB",
            self.upload.max_upload_size as f64 / (1024.0 * 1024.0)
        );
        println!("拡張子: {}", self.upload.allowed_extensions.join(", "));
        println!("\n--- 推論設定 ---");
        println!("Top-K: {}", self.prediction.top_k);
        println!(
            "低確信度しきい値: {}",
            self.prediction.low_confidence_threshold
        );
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("検証データ割合: {}", self.training.validation_split);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("========================\n");
    }
}
