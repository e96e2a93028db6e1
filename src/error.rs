//! エラー型の定義
//!
//! 入力検証・データセット・モデル・学習の各エラーを1つの列挙型にまとめます。

use std::path::PathBuf;

use thiserror::Error;

/// 分類器ライブラリのエラー
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// 許可されていない拡張子
    #[error("Invalid file type '{filename}'. Allowed: {}", allowed.join(", "))]
    UnsupportedExtension {
        filename: String,
        allowed: Vec<String>,
    },

    /// ファイルサイズ超過
    #[error("File too large ({size} bytes). Maximum size: {:.1}MB", *max_size as f64 / (1024.0 * 1024.0))]
    FileTooLarge { size: u64, max_size: u64 },

    /// 空の入力
    #[error("Empty image input: {0}")]
    EmptyInput(String),

    /// 画像のデコード失敗
    #[error("Failed to decode image ({source_name}): {message}")]
    Decode {
        source_name: String,
        message: String,
    },

    /// データセットディレクトリが存在しない
    #[error("Dataset directory not found: {0}")]
    DatasetNotFound(PathBuf),

    /// クラス数不足
    #[error("Dataset at {path} has {found} class folder(s); at least 2 are required")]
    TooFewClasses { path: PathBuf, found: usize },

    /// 画像が1枚もない
    #[error("No usable images found in {0}")]
    NoImages(PathBuf),

    /// モデルの読み込み失敗（アーティファクト破損など）
    #[error("Failed to load model from {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    /// 推論時のエラー
    #[error("Inference error: {0}")]
    Inference(String),

    /// 学習時のエラー
    #[error("Training error: {0}")]
    Training(String),

    /// 設定エラー
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClassifierError {
    /// アップロード検証に起因するエラーかどうか
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ClassifierError::UnsupportedExtension { .. } | ClassifierError::FileTooLarge { .. }
        )
    }

    /// データセットに起因するエラーかどうか
    pub fn is_dataset(&self) -> bool {
        matches!(
            self,
            ClassifierError::DatasetNotFound(_)
                | ClassifierError::TooFewClasses { .. }
                | ClassifierError::NoImages(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
