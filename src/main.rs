//! ATK分類器 CLI
//!
//! 学習・推論・モデル情報表示・データセット確認を行うコマンドラインツール。

#![recursion_limit = "256"]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Parser, Subcommand};

use atk_classifier_lib::backend::{
    cpu_device, gpu_device, CpuBackend, CpuTrainingBackend, GpuBackend, GpuTrainingBackend,
};
use atk_classifier_lib::ml::{dataset_info, AtkTrainer, EpochMetrics, InferencePipeline, ModelPredictor, PredictionResult};
use atk_classifier_lib::model::{AppConfig, DeviceType};

/// ATK（文房具）画像分類器
#[derive(Parser, Debug)]
#[command(name = "atk_classifier")]
#[command(version)]
#[command(about = "Office-stationery image classifier (train / predict)", long_about = None)]
struct Cli {
    /// 設定ファイル（省略時は config.json、なければデフォルト設定）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 詳細ログを出力
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// モデルを学習してアーティファクトを保存
    Train {
        /// データセットのルート（クラスごとのサブフォルダ、省略時は設定の dataset_dir）
        dataset: Option<PathBuf>,

        /// ハイパーパラメータ探索を行う
        #[arg(long, default_value = "false")]
        tune: bool,

        /// 最大エポック数
        #[arg(short, long)]
        epochs: Option<usize>,

        /// 探索の最大試行回数
        #[arg(long)]
        trials: Option<usize>,

        /// 入力画像サイズ（正方形）
        #[arg(long, value_parser = parse_img_size)]
        img_size: Option<u32>,

        #[arg(short, long)]
        batch_size: Option<usize>,

        /// 保存先（省略時は設定のモデルパス）
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// 画像を分類
    Predict {
        image: PathBuf,

        /// モデルのパス（省略時は設定のモデルパス）
        #[arg(short, long)]
        model: Option<PathBuf>,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// 結果を JSON で出力
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// モデル情報を表示
    Info {
        #[arg(short, long)]
        model: Option<PathBuf>,
    },

    /// データセットの構成を表示（省略時は設定の dataset_dir）
    Dataset { dir: Option<PathBuf> },

    /// 現在の設定を表示（--save で設定ファイルに書き出す）
    Config {
        #[arg(long, default_value = "false")]
        save: bool,
    },
}

fn parse_img_size(value: &str) -> std::result::Result<u32, String> {
    match value.parse::<u32>() {
        Ok(size @ (224 | 300)) => Ok(size),
        _ => Err(format!("image size must be 224 or 300, got '{}'", value)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = AppConfig::load_or_default(cli.config.as_deref());
    log::debug!("計算デバイス: {}", config.device_type);

    match cli.command {
        Commands::Train {
            dataset,
            tune,
            epochs,
            trials,
            img_size,
            batch_size,
            output,
        } => {
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(trials) = trials {
                config.training.max_trials = trials;
            }
            if let Some(size) = img_size {
                config.model.input_size = (size, size);
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            config.validate().context("invalid training settings")?;
            let dataset = dataset.unwrap_or_else(|| config.training.dataset_dir.clone());
            let output = output.unwrap_or_else(|| config.model.model_path.clone());

            match config.device_type {
                DeviceType::Cpu => run_train::<CpuTrainingBackend>(&config, &dataset, tune, &output, cpu_device()),
                DeviceType::Wgpu => run_train::<GpuTrainingBackend>(&config, &dataset, tune, &output, gpu_device()),
            }
        }
        Commands::Predict {
            image,
            model,
            top_k,
            json,
        } => {
            let model_path = model.unwrap_or_else(|| config.model.model_path.clone());
            let result = match config.device_type {
                DeviceType::Cpu => run_predict::<CpuBackend>(&config, &model_path, &image, top_k, cpu_device()),
                DeviceType::Wgpu => run_predict::<GpuBackend>(&config, &model_path, &image, top_k, gpu_device()),
            }?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_prediction(&result);
            }
            Ok(())
        }
        Commands::Info { model } => {
            let model_path = model.unwrap_or_else(|| config.model.model_path.clone());
            let info = match config.device_type {
                DeviceType::Cpu => ModelPredictor::<CpuBackend>::load(&model_path, &config, cpu_device())?.model_info(),
                DeviceType::Wgpu => ModelPredictor::<GpuBackend>::load(&model_path, &config, gpu_device())?.model_info(),
            };
            info.print();
            Ok(())
        }
        Commands::Dataset { dir } => {
            let dir = dir.unwrap_or_else(|| config.training.dataset_dir.clone());
            dataset_info(&dir, &config.upload.allowed_extensions)?.print();
            Ok(())
        }
        Commands::Config { save } => {
            config.display();
            if save {
                let path = cli.config.unwrap_or_else(AppConfig::default_path);
                config.save(&path)?;
                println!("設定を保存しました: {}", path.display());
            }
            Ok(())
        }
    }
}

fn run_train<B: AutodiffBackend>(
    config: &AppConfig,
    dataset: &Path,
    tune: bool,
    output: &Path,
    device: B::Device,
) -> Result<()> {
    let settings = &config.training;
    let trainer = AtkTrainer::<B>::new(dataset, config, device)
        .with_context(|| format!("failed to prepare dataset {}", dataset.display()))?;

    let progress = |m: &EpochMetrics| {
        println!(
            "  epoch {:>3}: loss {:.4} | acc {:.2}% | val_loss {:.4} | val_acc {:.2}%",
            m.epoch,
            m.loss,
            m.accuracy * 100.0,
            m.val_loss,
            m.val_accuracy * 100.0
        );
    };

    let trained = if tune {
        trainer.train_with_tuning(
            settings.num_epochs,
            settings.tuning_epochs,
            settings.max_trials,
            progress,
        )?
    } else {
        trainer.train_simple(settings.num_epochs, progress)?
    };

    let written = trainer.save_artifact(&trained, output)?;

    println!("\n学習完了 ({})", trained.mode);
    println!("ハイパーパラメータ: {}", trained.hyperparameters);
    if let Some(best) = trained.history.best() {
        println!(
            "採用エポック: {} (val_acc {:.2}%, val_loss {:.4})",
            best.epoch,
            best.val_accuracy * 100.0,
            best.val_loss
        );
    }
    if trained.history.stopped_early {
        println!("Early stopping により打ち切りました");
    }
    println!("保存先: {}", written.display());
    Ok(())
}

fn run_predict<B: Backend>(
    config: &AppConfig,
    model_path: &Path,
    image: &Path,
    top_k: Option<usize>,
    device: B::Device,
) -> Result<PredictionResult> {
    let predictor = ModelPredictor::<B>::load(model_path, config, device)?;
    let pipeline = InferencePipeline::new(config, Arc::new(predictor));

    let filename = image
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    // 読み込む前に拡張子とサイズを検証
    let file_size = std::fs::metadata(image)
        .with_context(|| format!("failed to stat {}", image.display()))?
        .len();
    pipeline.validate_image(&filename, file_size)?;
    let bytes = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;

    Ok(pipeline.predict(bytes.as_slice(), top_k)?)
}

fn print_prediction(result: &PredictionResult) {
    if result.is_demo {
        println!("[デモモード] 学習済みモデルがないため結果はランダムです");
    }
    println!(
        "予測: {} ({:.2}%)",
        result.predicted_class, result.percentage
    );
    if result.is_low_confidence {
        println!("注意: 確信度が低い結果です");
    }
    println!("上位 {} 件:", result.top_predictions.len());
    for (rank, p) in result.top_predictions.iter().enumerate() {
        println!("  {}. {:<10} {:>6.2}%", rank + 1, p.class_name, p.percentage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_img_size() {
        assert_eq!(parse_img_size("224"), Ok(224));
        assert_eq!(parse_img_size("300"), Ok(300));
        assert!(parse_img_size("128").is_err());
        assert!(parse_img_size("abc").is_err());
    }

    #[test]
    fn test_cli_parses_train() {
        let cli = Cli::try_parse_from([
            "atk_classifier",
            "train",
            "dataset_alat_tulis",
            "--tune",
            "--epochs",
            "5",
            "--img-size",
            "224",
        ])
        .unwrap();
        match cli.command {
            Commands::Train {
                tune,
                epochs,
                img_size,
                ..
            } => {
                assert!(tune);
                assert_eq!(epochs, Some(5));
                assert_eq!(img_size, Some(224));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_dataset_is_optional() {
        let cli = Cli::try_parse_from(["atk_classifier", "train", "--epochs", "3"]).unwrap();
        match cli.command {
            Commands::Train { dataset, .. } => assert_eq!(dataset, None),
            other => panic!("unexpected command: {:?}", other),
        }
        let cli = Cli::try_parse_from(["atk_classifier", "dataset"]).unwrap();
        assert!(matches!(cli.command, Commands::Dataset { dir: None }));
    }

    #[test]
    fn test_predict_rejects_oversized_file_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("desk.jpg");
        // 中身のない 6 MB のファイル
        std::fs::File::create(&image)
            .unwrap()
            .set_len(6 * 1024 * 1024)
            .unwrap();

        let mut config = AppConfig::default();
        config.prediction.demo_seed = Some(1);
        let err = run_predict::<CpuBackend>(
            &config,
            &dir.path().join("missing.tar.gz"),
            &image,
            None,
            cpu_device(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<atk_classifier_lib::ClassifierError>(),
            Some(atk_classifier_lib::ClassifierError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn test_cli_rejects_bad_img_size() {
        assert!(Cli::try_parse_from(["atk_classifier", "train", "d", "--img-size", "256"]).is_err());
    }
}
