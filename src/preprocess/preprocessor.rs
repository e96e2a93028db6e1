//! CNN入力用の画像前処理
//!
//! 読み込み → リサイズ → RGB変換・正規化 の順に処理し、
//! 形状 (1, H, W, 3) のテンソルを生成します。

use std::io::Cursor;
use std::path::Path;

use image::{imageops::FilterType, DynamicImage, ImageFormat, ImageReader};

use crate::error::{ClassifierError, Result};
use crate::model::config::ModelSettings;

/// 画像の入力元
#[derive(Debug, Clone)]
pub enum ImageSource<'a> {
    /// ファイルパス
    Path(&'a Path),
    /// エンコード済みのバイト列（アップロード・カメラ画像など）
    Bytes(&'a [u8]),
    /// デコード済み画像
    Image(DynamicImage),
}

impl<'a> From<&'a Path> for ImageSource<'a> {
    fn from(path: &'a Path) -> Self {
        ImageSource::Path(path)
    }
}

impl<'a> From<&'a [u8]> for ImageSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        ImageSource::Bytes(bytes)
    }
}

impl From<DynamicImage> for ImageSource<'_> {
    fn from(image: DynamicImage) -> Self {
        ImageSource::Image(image)
    }
}

/// 読み込んだ画像と元ファイルの情報
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub image: DynamicImage,
    pub format: Option<ImageFormat>,
    /// 元データのバイト数（デコード済み画像の場合は 0）
    pub byte_len: u64,
}

/// 前処理済みテンソル
///
/// NHWC 順に平坦化した f32 配列。生成後は変更できません。
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl ImageTensor {
    /// 形状とデータから作成（要素数が一致しない場合はエラー）
    pub fn new(shape: [usize; 4], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ClassifierError::Inference(format!(
                "tensor data has {} values, shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { shape, data })
    }

    /// [batch, height, width, channels]
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// 最小値と最大値
    pub fn value_range(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }
}

/// 画像前処理器
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    /// 目標サイズ (幅, 高さ)
    input_size: (u32, u32),
    /// [0, 1] へ正規化するかどうか
    normalize: bool,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new((300, 300))
    }
}

impl ImagePreprocessor {
    pub fn new(input_size: (u32, u32)) -> Self {
        Self {
            input_size,
            normalize: true,
        }
    }

    /// ネットワーク側で rescale する設定（rescale != 1.0）の場合は正規化しない
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self::for_model(settings.input_size, settings.rescale)
    }

    pub fn for_model(input_size: (u32, u32), rescale: f64) -> Self {
        Self::new(input_size).with_normalize((rescale - 1.0).abs() <= f64::EPSILON)
    }

    /// 正規化の有無を設定（false の場合は 0〜255 のまま出力）
    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    /// 画像を読み込む
    pub fn load_image(&self, source: ImageSource<'_>) -> Result<LoadedImage> {
        match source {
            ImageSource::Image(image) => Ok(LoadedImage {
                image,
                format: None,
                byte_len: 0,
            }),
            ImageSource::Bytes(bytes) => {
                if bytes.is_empty() {
                    return Err(ClassifierError::EmptyInput("zero-byte buffer".to_string()));
                }
                let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
                let format = reader.format();
                let image = reader.decode().map_err(|e| ClassifierError::Decode {
                    source_name: "<bytes>".to_string(),
                    message: e.to_string(),
                })?;
                Ok(LoadedImage {
                    image,
                    format,
                    byte_len: bytes.len() as u64,
                })
            }
            ImageSource::Path(path) => {
                let byte_len = std::fs::metadata(path)?.len();
                if byte_len == 0 {
                    return Err(ClassifierError::EmptyInput(path.display().to_string()));
                }
                let reader = ImageReader::open(path)?.with_guessed_format()?;
                let format = reader.format();
                let image = reader.decode().map_err(|e| ClassifierError::Decode {
                    source_name: path.display().to_string(),
                    message: e.to_string(),
                })?;
                Ok(LoadedImage {
                    image,
                    format,
                    byte_len,
                })
            }
        }
    }

    /// 目標サイズへリサイズ（アスペクト比は保持しない）
    pub fn resize_image(&self, image: &DynamicImage) -> DynamicImage {
        let (width, height) = self.input_size;
        image.resize_exact(width, height, FilterType::Lanczos3)
    }

    /// RGB に変換し、HWC 順の f32 配列に変換（バッチ次元付き）
    ///
    /// グレースケールは3チャンネルに展開し、アルファは捨てます。
    pub fn normalize_image(&self, image: &DynamicImage) -> ImageTensor {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        let scale = if self.normalize { 1.0 / 255.0 } else { 1.0 };

        let data: Vec<f32> = rgb
            .as_raw()
            .iter()
            .map(|&v| (v as f32 * scale).clamp(0.0, 255.0))
            .collect();

        ImageTensor {
            shape: [1, height as usize, width as usize, 3],
            data,
        }
    }

    /// 前処理一式
    pub fn preprocess<'a, S: Into<ImageSource<'a>>>(&self, source: S) -> Result<ImageTensor> {
        let loaded = self.load_image(source.into())?;
        Ok(self.preprocess_image(&loaded.image))
    }

    /// デコード済み画像に対する前処理
    pub fn preprocess_image(&self, image: &DynamicImage) -> ImageTensor {
        let resized = self.resize_image(image);
        self.normalize_image(&resized)
    }
}
