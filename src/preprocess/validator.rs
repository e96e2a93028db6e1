//! アップロード画像の検証
//!
//! ファイルサイズと拡張子のチェック、画像情報の取得を行います。

use image::{ColorType, DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::model::config::UploadSettings;

/// 画像の基本情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// 元ファイルのフォーマット（不明な場合は "Unknown"）
    pub format: String,
    /// 色モード（"L", "RGB", "RGBA" など）
    pub mode: String,
    pub size_kb: f64,
}

/// ファイルサイズが上限以内かどうか
pub fn validate_file_size(file_size: u64, max_size: u64) -> bool {
    file_size <= max_size
}

/// 拡張子が許可リストに含まれるかどうか（大文字小文字を区別しない）
pub fn validate_extension<S: AsRef<str>>(filename: &str, allowed: &[S]) -> bool {
    let Some((_, extension)) = filename.rsplit_once('.') else {
        return false;
    };
    let extension = extension.to_lowercase();
    allowed
        .iter()
        .any(|ext| ext.as_ref().to_lowercase() == extension)
}

/// 画像情報を取得（副作用なし）
pub fn get_image_info(image: &DynamicImage, format: Option<ImageFormat>, file_size: u64) -> ImageInfo {
    ImageInfo {
        width: image.width(),
        height: image.height(),
        format: format_name(format).to_string(),
        mode: color_mode(image.color()).to_string(),
        size_kb: file_size as f64 / 1024.0,
    }
}

/// フォーマット名
pub fn format_name(format: Option<ImageFormat>) -> &'static str {
    match format {
        Some(ImageFormat::Jpeg) => "JPEG",
        Some(ImageFormat::Png) => "PNG",
        Some(ImageFormat::Bmp) => "BMP",
        Some(ImageFormat::Gif) => "GIF",
        Some(ImageFormat::WebP) => "WEBP",
        Some(ImageFormat::Tiff) => "TIFF",
        Some(_) => "Other",
        None => "Unknown",
    }
}

/// 色モード名
pub fn color_mode(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "Unknown",
    }
}

/// アップロード制約に基づく検証器
#[derive(Debug, Clone)]
pub struct ImageValidator {
    max_size: u64,
    allowed_extensions: Vec<String>,
}

impl Default for ImageValidator {
    fn default() -> Self {
        Self::from_settings(&UploadSettings::default())
    }
}

impl ImageValidator {
    pub fn new(max_size: u64, allowed_extensions: Vec<String>) -> Self {
        Self {
            max_size,
            allowed_extensions,
        }
    }

    pub fn from_settings(settings: &UploadSettings) -> Self {
        Self::new(settings.max_upload_size, settings.allowed_extensions.clone())
    }

    /// 拡張子 → サイズの順に検証し、拒否理由をエラーで返す
    pub fn validate(&self, filename: &str, file_size: u64) -> Result<()> {
        if !validate_extension(filename, &self.allowed_extensions) {
            return Err(ClassifierError::UnsupportedExtension {
                filename: filename.to_string(),
                allowed: self.allowed_extensions.clone(),
            });
        }
        if !validate_file_size(file_size, self.max_size) {
            return Err(ClassifierError::FileTooLarge {
                size: file_size,
                max_size: self.max_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgba};

    const MAX: u64 = 5 * 1024 * 1024;

    #[test]
    fn test_file_size_boundary() {
        assert!(validate_file_size(0, MAX));
        assert!(validate_file_size(MAX, MAX));
        assert!(!validate_file_size(MAX + 1, MAX));
        assert!(!validate_file_size(6 * 1024 * 1024, MAX));
    }

    #[test]
    fn test_extension_matrix() {
        let allowed = ["jpg", "jpeg", "png", "bmp"];
        for ext in ["jpg", "jpeg", "png", "bmp", "JPG", "Png", "BMP"] {
            assert!(validate_extension(&format!("photo.{}", ext), &allowed), "{}", ext);
        }
        for ext in ["gif", "tiff", "webp", "pdf", "txt"] {
            assert!(!validate_extension(&format!("photo.{}", ext), &allowed), "{}", ext);
        }
    }

    #[test]
    fn test_extension_edge_cases() {
        let allowed = ["jpg", "png"];
        assert!(!validate_extension("", &allowed));
        assert!(!validate_extension("noextension", &allowed));
        assert!(!validate_extension("archive.png.zip", &allowed));
        assert!(validate_extension("archive.zip.png", &allowed));
        assert!(!validate_extension("trailingdot.", &allowed));
    }

    #[test]
    fn test_validator_rejects_oversized_jpg() {
        let validator = ImageValidator::default();
        let err = validator.validate("desk.jpg", 6 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, ClassifierError::FileTooLarge { .. }));
    }

    #[test]
    fn test_validator_checks_extension_first() {
        let validator = ImageValidator::default();
        let err = validator.validate("desk.gif", 6 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, ClassifierError::UnsupportedExtension { .. }));
        assert!(validator.validate("desk.PNG", 2 * 1024 * 1024).is_ok());
    }

    #[test]
    fn test_image_info() {
        let rgba = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(310, 200, Rgba([1, 2, 3, 4])));
        let info = get_image_info(&rgba, Some(ImageFormat::Png), 2048);
        assert_eq!(info.width, 310);
        assert_eq!(info.height, 200);
        assert_eq!(info.format, "PNG");
        assert_eq!(info.mode, "RGBA");
        assert!((info.size_kb - 2.0).abs() < f64::EPSILON);

        let gray = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(4, 5, Luma([9])));
        let info = get_image_info(&gray, None, 0);
        assert_eq!(info.mode, "L");
        assert_eq!(info.format, "Unknown");
    }
}
