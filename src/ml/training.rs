//! データセット準備とモデル学習
//!
//! クラスごとのサブフォルダから画像を集めて学習/検証に分割し、
//! Early stopping 付きの学習ループとハイパーパラメータ探索を実行します。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use burn_dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::ClassifierError;
use crate::ml::ml_model::AtkClassifier;
use crate::ml::tuning::{best_trial, Hyperparameters, RandomSearch, SearchSpace, SearchStrategy, TrialResult};
use crate::model::config::{AppConfig, TrainingSettings};
use crate::model::model_metadata::{ModelMetadata, TrainingMode};
use crate::model::model_storage::save_model_with_metadata;
use crate::preprocess::{validate_extension, ImagePreprocessor};

fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| validate_extension(name, extensions))
}

/// データセットのルートを検査し、ソート済みのクラスフォルダ一覧を返す
fn class_directories(root: &Path) -> crate::error::Result<Vec<(String, PathBuf)>> {
    if !root.is_dir() {
        return Err(ClassifierError::DatasetNotFound(root.to_path_buf()));
    }

    let mut classes = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                classes.push((name.to_string(), path.clone()));
            }
        }
    }
    classes.sort_by(|a, b| a.0.cmp(&b.0));

    if classes.len() < 2 {
        return Err(ClassifierError::TooFewClasses {
            path: root.to_path_buf(),
            found: classes.len(),
        });
    }
    Ok(classes)
}

/// クラスフォルダ内の読み込み可能な画像を列挙（ファイル名順）
///
/// 全体をデコードできない画像（途中で切れたファイルなど）は警告を出して除外します。
/// 戻り値の2番目は除外数。
fn scan_class_images(
    class_dir: &Path,
    extensions: &[String],
) -> crate::error::Result<(Vec<PathBuf>, usize)> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(class_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && has_image_extension(path, extensions))
        .collect();
    paths.sort();

    let mut images = Vec::with_capacity(paths.len());
    let mut skipped = 0;
    for path in paths {
        match image::open(&path) {
            Ok(_) => images.push(path),
            Err(e) => {
                log::warn!("読み込めない画像をスキップします: {} ({})", path.display(), e);
                skipped += 1;
            }
        }
    }
    Ok((images, skipped))
}

/// データセットの概要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetInfo {
    pub root: PathBuf,
    /// (クラス名, 枚数)。クラス名のソート順がラベル順
    pub classes: Vec<(String, usize)>,
    pub total_images: usize,
    pub skipped_images: usize,
}

impl DatasetInfo {
    pub fn class_names(&self) -> Vec<String> {
        self.classes.iter().map(|(name, _)| name.clone()).collect()
    }

    /// 概要をコンソールに表示
    pub fn print(&self) {
        println!("\n=== データセット: {} ===", self.root.display());
        for (label, (name, count)) in self.classes.iter().enumerate() {
            println!("  [{}] {}: {} 枚", label, name, count);
        }
        println!("合計: {} 枚", self.total_images);
        if self.skipped_images > 0 {
            println!("スキップ: {} 枚（読み込み不可）", self.skipped_images);
        }
        println!("========================");
    }
}

/// データセットのクラス構成と枚数を取得
///
/// `extensions` は対象とする拡張子（通常は `UploadSettings::allowed_extensions`）。
pub fn dataset_info(dir: &Path, extensions: &[String]) -> crate::error::Result<DatasetInfo> {
    let mut classes = Vec::new();
    let mut total_images = 0;
    let mut skipped_images = 0;

    for (name, path) in class_directories(dir)? {
        let (images, skipped) = scan_class_images(&path, extensions)?;
        total_images += images.len();
        skipped_images += skipped;
        classes.push((name, images.len()));
    }

    Ok(DatasetInfo {
        root: dir.to_path_buf(),
        classes,
        total_images,
        skipped_images,
    })
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug, PartialEq)]
pub struct AtkItem {
    pub path: PathBuf,
    pub label: usize,
}

/// 学習データセット（パスのリストのみ保持）
#[derive(Clone, Debug)]
pub struct AtkDataset {
    samples: Arc<Vec<AtkItem>>,
    class_names: Vec<String>,
    // データセット分割用のインデックス範囲
    start_idx: usize,
    end_idx: usize,
}

impl AtkDataset {
    /// ディレクトリから学習データを読み込む
    ///
    /// サブフォルダ名をソートした順がクラスIDになります。
    pub fn from_directory(data_dir: &Path, extensions: &[String]) -> crate::error::Result<Self> {
        let mut samples = Vec::new();
        let mut class_names = Vec::new();

        for (class_id, (name, path)) in class_directories(data_dir)?.into_iter().enumerate() {
            let (images, _) = scan_class_images(&path, extensions)?;
            log::debug!("クラス {}: {} ({} 枚)", class_id, name, images.len());
            samples.extend(images.into_iter().map(|path| AtkItem { path, label: class_id }));
            class_names.push(name);
        }

        if samples.is_empty() {
            return Err(ClassifierError::NoImages(data_dir.to_path_buf()));
        }

        let len = samples.len();
        Ok(Self {
            samples: Arc::new(samples),
            class_names,
            start_idx: 0,
            end_idx: len,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスごとの枚数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_classes()];
        for item in &self.samples[self.start_idx..self.end_idx] {
            counts[item.label] += 1;
        }
        counts
    }

    /// シード付きでシャッフルし、学習用と検証用に分割
    ///
    /// 検証用は末尾 `validation_split` の割合（最低1枚、学習用も最低1枚）。
    pub fn split(self, validation_split: f32, seed: u64) -> crate::error::Result<(Self, Self)> {
        let mut shuffled: Vec<AtkItem> = self.samples[self.start_idx..self.end_idx].to_vec();
        let total_len = shuffled.len();
        if total_len < 2 {
            return Err(ClassifierError::Training(format!(
                "at least 2 images are required to split, found {}",
                total_len
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        shuffled.shuffle(&mut rng);

        let val_len = ((total_len as f32 * validation_split).round() as usize).clamp(1, total_len - 1);
        let train_len = total_len - val_len;
        let samples = Arc::new(shuffled);

        let train_dataset = Self {
            samples: Arc::clone(&samples),
            class_names: self.class_names.clone(),
            start_idx: 0,
            end_idx: train_len,
        };
        let val_dataset = Self {
            samples,
            class_names: self.class_names,
            start_idx: train_len,
            end_idx: total_len,
        };

        Ok((train_dataset, val_dataset))
    }
}

impl Dataset<AtkItem> for AtkDataset {
    fn get(&self, index: usize) -> Option<AtkItem> {
        // インデックス範囲内のデータのみ返す
        let actual_index = self.start_idx + index;
        if actual_index >= self.end_idx {
            return None;
        }
        self.samples.get(actual_index).cloned()
    }

    fn len(&self) -> usize {
        self.end_idx - self.start_idx
    }
}

/// 学習/検証に分割済みのデータセット
#[derive(Clone, Debug)]
pub struct PreparedDataset {
    pub train: AtkDataset,
    pub valid: AtkDataset,
    pub class_names: Vec<String>,
}

/// データセットを読み込み、シード付きで学習/検証に分割
pub fn prepare_dataset(
    dir: &Path,
    extensions: &[String],
    validation_split: f32,
    seed: u64,
) -> crate::error::Result<PreparedDataset> {
    let dataset = AtkDataset::from_directory(dir, extensions)?;
    let class_names = dataset.class_names().to_vec();
    let (train, valid) = dataset.split(validation_split, seed)?;

    log::info!(
        "データセット: {} クラス ({}), 学習 {} 枚 / 検証 {} 枚",
        class_names.len(),
        class_names.join(", "),
        train.len(),
        valid.len()
    );

    Ok(PreparedDataset {
        train,
        valid,
        class_names,
    })
}

/// バッチデータ（画像は NHWC）
#[derive(Clone, Debug)]
pub struct AtkBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
///
/// 画像はバッチ作成時に読み込み、前処理器で固定サイズのテンソルにします。
#[derive(Clone, Debug)]
pub struct AtkBatcher {
    preprocessor: ImagePreprocessor,
}

impl AtkBatcher {
    pub fn new(preprocessor: ImagePreprocessor) -> Self {
        Self { preprocessor }
    }
}

impl<B: Backend> Batcher<B, AtkItem, AtkBatch<B>> for AtkBatcher {
    fn batch(&self, items: Vec<AtkItem>, device: &B::Device) -> AtkBatch<B> {
        let (width, height) = self.preprocessor.input_size();
        let (width, height) = (width as usize, height as usize);
        let pixels_per_image = height * width * 3;

        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * pixels_per_image);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            match self.preprocessor.preprocess(item.path.as_path()) {
                Ok(tensor) => all_pixels.extend(tensor.into_data()),
                Err(e) => {
                    log::warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    // エラーの場合はゼロで埋める
                    all_pixels.extend(std::iter::repeat(0.0f32).take(pixels_per_image));
                }
            }
            targets_vec.push(item.label as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([batch_size, height, width, 3]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device);

        AtkBatch { images, targets }
    }
}

/// 1エポック分の指標（精度は 0〜1）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1始まりのエポック番号
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// 学習履歴
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
    /// 重みを採用したエポック番号
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
}

impl TrainingHistory {
    /// 採用エポックの指標
    pub fn best(&self) -> Option<&EpochMetrics> {
        let best_epoch = self.best_epoch?;
        self.epochs.iter().find(|m| m.epoch == best_epoch)
    }

    /// 全エポック中の最良検証精度
    pub fn best_val_accuracy(&self) -> f64 {
        self.epochs
            .iter()
            .map(|m| m.val_accuracy)
            .fold(0.0, f64::max)
    }
}

/// Early stopping の監視対象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Monitor {
    /// 検証損失（小さいほど良い）
    #[default]
    ValLoss,
    /// 検証精度（大きいほど良い）
    ValAccuracy,
}

impl Monitor {
    fn value(&self, metrics: &EpochMetrics) -> f64 {
        match self {
            Monitor::ValLoss => metrics.val_loss,
            Monitor::ValAccuracy => metrics.val_accuracy,
        }
    }

    fn improved(&self, current: f64, best: f64) -> bool {
        match self {
            Monitor::ValLoss => current < best,
            Monitor::ValAccuracy => current > best,
        }
    }
}

/// 学習済みモデルと学習の記録
#[derive(Debug, Clone)]
pub struct TrainedModel<B: AutodiffBackend> {
    pub model: AtkClassifier<B>,
    pub history: TrainingHistory,
    pub hyperparameters: Hyperparameters,
    pub mode: TrainingMode,
    /// チューニング試行の記録（simple モードでは空）
    pub trials: Vec<TrialResult>,
}

/// ATK分類モデルのトレーナー
pub struct AtkTrainer<B: AutodiffBackend> {
    device: B::Device,
    dataset: PreparedDataset,
    input_size: (u32, u32),
    rescale: f64,
    settings: TrainingSettings,
    monitor: Monitor,
    search_space: SearchSpace,
    batcher: AtkBatcher,
}

impl<B: AutodiffBackend> AtkTrainer<B> {
    /// データセットを準備してトレーナーを作成
    ///
    /// データセットに問題がある場合は学習開始前にエラーを返します。
    pub fn new(dataset_dir: &Path, config: &AppConfig, device: B::Device) -> crate::error::Result<Self> {
        let settings = config.training.clone();
        let dataset = prepare_dataset(
            dataset_dir,
            &config.upload.allowed_extensions,
            settings.validation_split,
            settings.seed,
        )?;
        let preprocessor = ImagePreprocessor::from_settings(&config.model);

        Ok(Self {
            device,
            dataset,
            input_size: config.model.input_size,
            rescale: config.model.rescale,
            settings,
            monitor: Monitor::default(),
            search_space: SearchSpace::default(),
            batcher: AtkBatcher::new(preprocessor),
        })
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_search_space(mut self, search_space: SearchSpace) -> Self {
        self.search_space = search_space;
        self
    }

    pub fn class_names(&self) -> &[String] {
        &self.dataset.class_names
    }

    /// 固定アーキテクチャで学習
    pub fn train_simple<F>(&self, epochs: usize, mut progress: F) -> Result<TrainedModel<B>>
    where
        F: FnMut(&EpochMetrics),
    {
        let hyperparameters = Hyperparameters {
            learning_rate: self.settings.learning_rate,
            ..Hyperparameters::default()
        };
        log::info!("学習を開始します: {} エポック, {}", epochs, hyperparameters);

        let (model, history) = self.fit(&hyperparameters, epochs, &mut progress)?;
        Ok(TrainedModel {
            model,
            history,
            hyperparameters,
            mode: TrainingMode::Simple,
            trials: Vec::new(),
        })
    }

    /// ハイパーパラメータ探索の後、最良の組み合わせで再学習
    pub fn train_with_tuning<F>(
        &self,
        max_epochs: usize,
        tuning_epochs: usize,
        max_trials: usize,
        mut progress: F,
    ) -> Result<TrainedModel<B>>
    where
        F: FnMut(&EpochMetrics),
    {
        let mut strategy = RandomSearch::new(self.search_space.clone(), max_trials, self.settings.seed);
        log::info!(
            "ハイパーパラメータ探索を開始します: 最大 {} 試行, 各 {} エポック",
            strategy.trial_budget(),
            tuning_epochs
        );

        let mut trials: Vec<TrialResult> = Vec::new();
        while let Some(hyperparameters) = strategy.next_trial(&trials) {
            let trial = trials.len() + 1;
            log::info!("[Trial {}] {}", trial, hyperparameters);

            let (_, history) = self
                .fit(&hyperparameters, tuning_epochs, &mut progress)
                .with_context(|| format!("trial {} failed", trial))?;
            let result = TrialResult {
                trial,
                hyperparameters,
                best_val_accuracy: history.best_val_accuracy(),
                epochs_trained: history.epochs.len(),
            };
            log::info!(
                "[Trial {}] best val_accuracy = {:.4}",
                trial,
                result.best_val_accuracy
            );
            trials.push(result);
        }

        let best = best_trial(&trials)
            .ok_or_else(|| anyhow::anyhow!("search space produced no trials"))?
            .hyperparameters
            .clone();
        log::info!("最良のハイパーパラメータ: {}", best);

        let (model, history) = self.fit(&best, max_epochs, &mut progress)?;
        Ok(TrainedModel {
            model,
            history,
            hyperparameters: best,
            mode: TrainingMode::Tuned,
            trials,
        })
    }

    /// 学習ループ本体
    ///
    /// Adam + 交差エントロピー。監視指標が `early_stopping_patience` エポック
    /// 改善しなければ停止し、最良エポックの重みを返します。
    pub fn fit<F>(
        &self,
        hyperparameters: &Hyperparameters,
        epochs: usize,
        progress: &mut F,
    ) -> Result<(AtkClassifier<B>, TrainingHistory)>
    where
        F: FnMut(&EpochMetrics),
    {
        if epochs == 0 {
            return Err(ClassifierError::Training("epochs must be at least 1".into()).into());
        }

        let (width, height) = self.input_size;
        let config = hyperparameters.to_model_config(
            self.dataset.class_names.len(),
            (height as usize, width as usize),
            self.rescale,
        );
        let mut model: AtkClassifier<B> = config.init(&self.device)?;
        let mut optimizer = AdamConfig::new().init();

        let batch_size = self.settings.batch_size.max(1);
        let patience = self.settings.early_stopping_patience;
        let mut rng = StdRng::seed_from_u64(self.settings.seed);

        let mut history = TrainingHistory::default();
        let mut best: Option<(f64, AtkClassifier<B>)> = None;
        let mut epochs_without_improvement = 0;

        for epoch in 1..=epochs {
            let mut indices: Vec<usize> = (0..self.dataset.train.len()).collect();
            indices.shuffle(&mut rng);

            let mut loss_sum = 0.0f64;
            let mut correct = 0usize;
            let mut seen = 0usize;

            for chunk in indices.chunks(batch_size) {
                let items: Vec<AtkItem> = chunk
                    .iter()
                    .filter_map(|&i| self.dataset.train.get(i))
                    .collect();
                if items.is_empty() {
                    continue;
                }
                let n = items.len();

                let batch: AtkBatch<B> = self.batcher.batch(items, &self.device);
                let output = model.forward_classification(batch.images, batch.targets);

                let loss_value: f64 = output.loss.clone().into_scalar().elem();
                loss_sum += loss_value * n as f64;
                correct += count_correct(output.output, output.targets);
                seen += n;

                let grads = output.loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(hyperparameters.learning_rate, model, grads);
            }

            if seen == 0 {
                return Err(ClassifierError::NoImages(PathBuf::from("<train split>")).into());
            }

            let (val_loss, val_accuracy) = self.evaluate(&model);
            let metrics = EpochMetrics {
                epoch,
                loss: loss_sum / seen as f64,
                accuracy: correct as f64 / seen as f64,
                val_loss,
                val_accuracy,
            };
            log::info!(
                "Epoch {}/{}: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4}",
                epoch,
                epochs,
                metrics.loss,
                metrics.accuracy,
                metrics.val_loss,
                metrics.val_accuracy
            );
            progress(&metrics);

            let current = self.monitor.value(&metrics);
            history.epochs.push(metrics);

            let is_best = best
                .as_ref()
                .map_or(true, |(value, _)| self.monitor.improved(current, *value));
            if is_best {
                best = Some((current, model.clone()));
                history.best_epoch = Some(epoch);
                epochs_without_improvement = 0;
            } else {
                epochs_without_improvement += 1;
                if epochs_without_improvement >= patience {
                    log::info!(
                        "Early stopping: {} エポック改善なし（最良: epoch {}）",
                        patience,
                        history.best_epoch.unwrap_or(0)
                    );
                    history.stopped_early = true;
                    break;
                }
            }
        }

        // 最良エポックの重みを復元
        let model = best.map(|(_, m)| m).unwrap_or(model);
        Ok((model, history))
    }

    /// 検証データでの (平均損失, 精度)
    fn evaluate(&self, model: &AtkClassifier<B>) -> (f64, f64) {
        let model = model.valid();
        let valid = &self.dataset.valid;
        let batch_size = self.settings.batch_size.max(1);

        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut total = 0usize;

        for start in (0..valid.len()).step_by(batch_size) {
            let end = (start + batch_size).min(valid.len());
            let items: Vec<AtkItem> = (start..end).filter_map(|i| valid.get(i)).collect();
            if items.is_empty() {
                continue;
            }
            let n = items.len();

            let batch: AtkBatch<B::InnerBackend> = self.batcher.batch(items, &self.device);
            let output = model.forward_classification(batch.images, batch.targets);
            let loss_value: f64 = output.loss.into_scalar().elem();
            loss_sum += loss_value * n as f64;
            correct += count_correct(output.output, output.targets);
            total += n;
        }

        if total == 0 {
            (0.0, 0.0)
        } else {
            (loss_sum / total as f64, correct as f64 / total as f64)
        }
    }

    /// 学習済みモデルをアーティファクト（tar.gz + JSON）として保存
    pub fn save_artifact(&self, trained: &TrainedModel<B>, output: &Path) -> Result<PathBuf> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let model_binary = recorder
            .record(trained.model.clone().into_record(), ())
            .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;

        let metadata = ModelMetadata::new(
            self.dataset.class_names.clone(),
            self.input_size,
            self.rescale,
            trained.hyperparameters.clone(),
            trained.mode,
        )
        .with_history(trained.history.clone())
        .with_tuning_trials(trained.trials.clone());

        save_model_with_metadata(output, &metadata, &model_binary)
    }
}

/// 正解数を数える
fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}
