//! ATK（文房具）画像分類ライブラリ
//!
//! アップロード検証、画像前処理、CNNの学習と推論を提供します。

pub mod backend;
pub mod error;
pub mod ml;
pub mod model;
pub mod preprocess;

pub use error::{ClassifierError, Result};
pub use ml::{
    AtkClassifier, AtkTrainer, InferencePipeline, ModelCache, ModelPredictor, PredictionResult,
};
pub use model::{AppConfig, DeviceType};
pub use preprocess::{ImagePreprocessor, ImageSource, ImageTensor, ImageValidator};
