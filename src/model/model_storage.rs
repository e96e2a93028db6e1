//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力サイズ、学習履歴など）
//! - model.bin       - モデルの重み（バイナリ）
//!
//! アーカイブの隣には同じメタデータを `<stem>.json` として保存します。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先パスから (tar.gz パス, サイドカー JSON パス) を決める
///
/// `models/best_model` / `models/best_model.tar.gz` のどちらを渡しても
/// `models/best_model.tar.gz` と `models/best_model.json` になります。
pub fn artifact_paths(output_path: &Path) -> (PathBuf, PathBuf) {
    let file_name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = file_name
        .strip_suffix(".tar.gz")
        .or_else(|| file_name.strip_suffix(".tgz"))
        .or_else(|| file_name.strip_suffix(".gz"))
        .unwrap_or(&file_name)
        .to_string();
    let stem = if stem.is_empty() { "model".to_string() } else { stem };

    let dir = output_path.parent().unwrap_or_else(|| Path::new(""));
    (
        dir.join(format!("{}.tar.gz", stem)),
        dir.join(format!("{}.json", stem)),
    )
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .context(format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 戻り値は実際に書き込んだ tar.gz のパス。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let (tar_gz_path, sidecar_path) = artifact_paths(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let json_str = metadata.to_json_string()?;

    let tar_gz_file = File::create(&tar_gz_path)
        .context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // gzip のフッタまで書き切る
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize tar.gz archive")?;

    std::fs::write(&sidecar_path, &json_str)
        .context(format!("Failed to write metadata sidecar: {:?}", sidecar_path))?;

    log::info!(
        "モデルを保存しました: {} ({} bytes), メタデータ: {}",
        tar_gz_path.display(),
        model_binary.len(),
        sidecar_path.display()
    );

    Ok(tar_gz_path)
}

/// アーカイブ内の1エントリを読み出す
fn read_entry(tar_gz_path: &Path, name: &str) -> Result<Vec<u8>> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(anyhow::anyhow!("{} not found in tar.gz archive", name))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let bytes = read_entry(tar_gz_path, METADATA_ENTRY)?;
    let json_str = String::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json_str)
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    read_entry(tar_gz_path, MODEL_ENTRY)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// サイドカー JSON からメタデータを読み込む
pub fn load_sidecar(path: &Path) -> Result<ModelMetadata> {
    let json_str = std::fs::read_to_string(path)
        .context(format!("Failed to read metadata sidecar: {:?}", path))?;
    ModelMetadata::from_json_string(&json_str)
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    let pct = |v: Option<f64>| {
        v.map(|v| format!("{:.2}%", v * 100.0))
            .unwrap_or_else(|| "-".to_string())
    };
    let num = |v: Option<f64>| v.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string());

    println!("\n=== モデルメタデータ ===");
    println!("クラス: {}", metadata.class_names.join(", "));
    println!("入力サイズ: {}x{}", metadata.input_width, metadata.input_height);
    println!("学習モード: {}", metadata.training_mode);
    println!("ハイパーパラメータ: {}", metadata.hyperparameters);
    println!("学習エポック数: {}", metadata.epochs_trained);
    println!(
        "精度: {} (検証: {})",
        pct(metadata.accuracy),
        pct(metadata.val_accuracy)
    );
    println!("損失: {} (検証: {})", num(metadata.loss), num(metadata.val_loss));
    if !metadata.tuning_trials.is_empty() {
        println!("チューニング試行数: {}", metadata.tuning_trials.len());
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}
