//! 機械学習モデルの共通定義
//!
//! ATK（文房具）画像分類用のCNNモデルと関連する設定を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::error::ClassifierError;
use crate::preprocess::ImageTensor;

/// 3回の 2x2 プーリングで入力が縮小される倍率
const DOWNSAMPLE: usize = 8;

/// モデル設定
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像の高さ
    #[config(default = 300)]
    pub image_height: usize,
    /// 入力画像の幅
    #[config(default = 300)]
    pub image_width: usize,
    #[config(default = 32)]
    pub conv1_filters: usize,
    #[config(default = 64)]
    pub conv2_filters: usize,
    #[config(default = 128)]
    pub conv3_filters: usize,
    /// 全結合（隠れ層）のユニット数
    #[config(default = 128)]
    pub dense_units: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// 入力に掛ける係数（前処理で正規化済みなら 1.0）
    #[config(default = 1.0)]
    pub rescale: f64,
}

impl ClassifierConfig {
    /// 3ブロック通過後の特徴マップサイズ (高さ, 幅)
    ///
    /// same padding の 3x3 Conv はサイズを変えず、各プーリングで半分（切り捨て）になる。
    pub fn feature_map_size(&self) -> (usize, usize) {
        (
            self.image_height / 2 / 2 / 2,
            self.image_width / 2 / 2 / 2,
        )
    }

    /// Flatten 後の特徴次元
    pub fn flatten_dim(&self) -> usize {
        let (h, w) = self.feature_map_size();
        self.conv3_filters * h * w
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<AtkClassifier<B>> {
        if self.num_classes < 2 {
            return Err(ClassifierError::Config(format!(
                "num_classes must be at least 2, got {}",
                self.num_classes
            )));
        }
        if self.image_height < DOWNSAMPLE || self.image_width < DOWNSAMPLE {
            return Err(ClassifierError::Config(format!(
                "input size {}x{} is too small (minimum {}x{})",
                self.image_width, self.image_height, DOWNSAMPLE, DOWNSAMPLE
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ClassifierError::Config(format!(
                "dropout must be within [0, 1), got {}",
                self.dropout
            )));
        }

        let d = self.flatten_dim();
        let (fh, fw) = self.feature_map_size();
        log::debug!(
            "[Model] 入力: {}x{}x3 -> 特徴マップ: {} x {}x{} -> d={} -> {} -> {}",
            self.image_height,
            self.image_width,
            self.conv3_filters,
            fh,
            fw,
            d,
            self.dense_units,
            self.num_classes
        );

        let conv = |in_ch: usize, out_ch: usize| {
            Conv2dConfig::new([in_ch, out_ch], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };
        let pool = || MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        Ok(AtkClassifier {
            conv1: conv(3, self.conv1_filters),
            pool1: pool(),
            conv2: conv(self.conv1_filters, self.conv2_filters),
            pool2: pool(),
            conv3: conv(self.conv2_filters, self.conv3_filters),
            pool3: pool(),
            fc1: LinearConfig::new(d, self.dense_units).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.dense_units, self.num_classes).init(device),
            activation: Relu::new(),
            rescale: self.rescale,
            num_classes: self.num_classes,
        })
    }
}

/// 固定アーキテクチャのモデルを構築
///
/// `input_shape` は (高さ, 幅, チャンネル)。チャンネルは 3 のみ対応。
pub fn build_model<B: Backend>(
    input_shape: (usize, usize, usize),
    num_classes: usize,
    device: &B::Device,
) -> crate::error::Result<AtkClassifier<B>> {
    let (height, width, channels) = input_shape;
    if channels != 3 {
        return Err(ClassifierError::Config(format!(
            "only 3-channel input is supported, got {}",
            channels
        )));
    }
    ClassifierConfig::new(num_classes)
        .with_image_height(height)
        .with_image_width(width)
        .init(device)
}

/// ATK分類用CNNモデル
///
/// # アーキテクチャ
/// - Rescale
/// - {Conv 3x3 (same) + ReLU + MaxPool 2x2} x 3層 (32 / 64 / 128)
/// - Flatten
/// - FC: d -> 128 + ReLU + Dropout(0.5)
/// - FC: 128 -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct AtkClassifier<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    pool3: MaxPool2d,

    // 全結合層
    fc1: Linear<B>,
    dropout: Dropout,
    fc2: Linear<B>,

    activation: Relu,
    rescale: f64,
    num_classes: usize,
}

impl<B: Backend> AtkClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, height, width, 3]（NHWC）
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        // NHWC -> NCHW
        let x = images.swap_dims(1, 3).swap_dims(2, 3);
        let x = if (self.rescale - 1.0).abs() > f64::EPSILON {
            x.mul_scalar(self.rescale)
        } else {
            x
        };

        let x = self.pool1.forward(self.activation.forward(self.conv1.forward(x)));
        let x = self.pool2.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.pool3.forward(self.activation.forward(self.conv3.forward(x)));

        // Flatten
        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.fc2.forward(x)
    }

    /// 確率分布（softmax）を返す
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 前処理済みテンソル1枚分のクラス確率
    pub fn predict_probabilities(
        &self,
        tensor: &ImageTensor,
        device: &B::Device,
    ) -> crate::error::Result<Vec<f32>> {
        let [n, h, w, c] = tensor.shape();
        let input = Tensor::<B, 1>::from_floats(tensor.data(), device).reshape([n, h, w, c]);
        let probs = self.forward_softmax(input);
        let values = probs
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Inference(format!("{:?}", e)))?;
        Ok(values.into_iter().take(self.num_classes).collect())
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// # 戻り値
    /// - ClassificationOutput（損失、出力、ターゲット）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_feature_map_size() {
        let config = ClassifierConfig::new(3);
        assert_eq!(config.feature_map_size(), (37, 37));
        assert_eq!(config.flatten_dim(), 128 * 37 * 37);

        let config = ClassifierConfig::new(3)
            .with_image_height(224)
            .with_image_width(224);
        assert_eq!(config.feature_map_size(), (28, 28));
    }

    #[test]
    fn test_forward_shapes_and_softmax() {
        let device = NdArrayDevice::default();
        let model: AtkClassifier<TestBackend> = ClassifierConfig::new(4)
            .with_image_height(16)
            .with_image_width(24)
            .with_conv1_filters(4)
            .with_conv2_filters(4)
            .with_conv3_filters(8)
            .with_dense_units(8)
            .init(&device)
            .unwrap();

        let input = Tensor::<TestBackend, 4>::ones([2, 16, 24, 3], &device);
        let logits = model.forward(input.clone());
        assert_eq!(logits.dims(), [2, 4]);

        let probs = model.forward_softmax(input).into_data().to_vec::<f32>().unwrap();
        for row in probs.chunks(4) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
            assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn test_predict_probabilities_from_image_tensor() {
        let device = NdArrayDevice::default();
        let model: AtkClassifier<TestBackend> = build_model((8, 8, 3), 3, &device).unwrap();
        let tensor = ImageTensor::new([1, 8, 8, 3], vec![0.5; 8 * 8 * 3]).unwrap();
        let probs = model.predict_probabilities(&tensor, &device).unwrap();
        assert_eq!(probs.len(), 3);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let device = NdArrayDevice::default();
        assert!(ClassifierConfig::new(1).init::<TestBackend>(&device).is_err());
        assert!(ClassifierConfig::new(3)
            .with_image_height(4)
            .init::<TestBackend>(&device)
            .is_err());
        assert!(build_model::<TestBackend>((32, 32, 1), 3, &device).is_err());
    }

    #[test]
    fn test_config_json_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.json");
        let config = ClassifierConfig::new(3)
            .with_image_height(224)
            .with_image_width(224)
            .with_dense_units(64);
        config.save(&path).unwrap();

        let loaded = ClassifierConfig::load(&path).unwrap();
        assert_eq!(loaded.num_classes, 3);
        assert_eq!(loaded.image_height, 224);
        assert_eq!(loaded.dense_units, 64);
        assert_eq!(loaded.dropout, 0.5);
    }
}
