//! モデル推論機能
//!
//! 学習済みモデル（またはデモモード）でクラス確率を求め、
//! 上位K件にランク付けした結果を返します。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::{ClassifierError, Result};
use crate::ml::ml_model::AtkClassifier;
use crate::model::config::AppConfig;
use crate::model::{load_model_with_metadata, InferenceConfig, ModelMetadata};
use crate::preprocess::{
    get_image_info, ImageInfo, ImagePreprocessor, ImageSource, ImageTensor, ImageValidator,
};

/// 1クラス分の確率
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassProbability {
    pub class_name: String,
    pub class_index: usize,
    /// 0〜1
    pub probability: f32,
    /// 0〜100
    pub percentage: f32,
}

/// 推論結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub predicted_class: String,
    pub predicted_index: usize,
    pub confidence: f32,
    pub percentage: f32,
    /// 確率の降順
    pub top_predictions: Vec<ClassProbability>,
    pub is_low_confidence: bool,
    /// デモモード（学習済みモデルなし）で生成した結果かどうか
    pub is_demo: bool,
}

/// 確率ベクトルを降順に並べ、上位 `top_k` 件の結果を作る
///
/// 同じ確率のクラスはクラス番号の小さい方が先。
/// `top_k` はクラス数で頭打ち、0 の場合は 1 として扱います。
pub fn rank_predictions(
    probabilities: &[f32],
    class_names: &[String],
    top_k: usize,
    threshold: f32,
    is_demo: bool,
) -> Result<PredictionResult> {
    if probabilities.is_empty() {
        return Err(ClassifierError::Inference("empty probability vector".into()));
    }
    if probabilities.len() != class_names.len() {
        return Err(ClassifierError::Inference(format!(
            "model produced {} probabilities for {} classes",
            probabilities.len(),
            class_names.len()
        )));
    }

    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    // sort_by は安定ソート
    order.sort_by(|&a, &b| probabilities[b].total_cmp(&probabilities[a]));

    let k = top_k.clamp(1, probabilities.len());
    let top_predictions: Vec<ClassProbability> = order
        .into_iter()
        .take(k)
        .map(|index| ClassProbability {
            class_name: class_names[index].clone(),
            class_index: index,
            probability: probabilities[index],
            percentage: probabilities[index] * 100.0,
        })
        .collect();

    let best = &top_predictions[0];
    Ok(PredictionResult {
        predicted_class: best.class_name.clone(),
        predicted_index: best.class_index,
        confidence: best.probability,
        percentage: best.percentage,
        is_low_confidence: best.probability < threshold,
        is_demo,
        top_predictions,
    })
}

/// 一様ディリクレ分布 Dir(1, ..., 1) から確率ベクトルを生成
fn sample_flat_dirichlet(rng: &mut StdRng, n: usize) -> Vec<f32> {
    // Exp(1) を正規化する（1 - u は (0, 1]）
    let draws: Vec<f64> = (0..n).map(|_| -(1.0 - rng.gen::<f64>()).ln()).collect();
    let sum: f64 = draws.iter().sum();
    if sum <= 0.0 {
        return vec![1.0 / n as f32; n];
    }
    draws.into_iter().map(|d| (d / sum) as f32).collect()
}

/// モデル情報
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    /// "trained" または "demo"
    pub mode: String,
    pub model_path: PathBuf,
    pub class_names: Vec<String>,
    pub input_size: (u32, u32),
    pub metadata: Option<ModelMetadata>,
}

impl ModelInfo {
    pub fn print(&self) {
        println!("\n=== モデル情報 ===");
        println!("モード: {}", self.mode);
        println!("モデルパス: {}", self.model_path.display());
        println!("クラス: {}", self.class_names.join(", "));
        println!("入力サイズ: {}x{}", self.input_size.0, self.input_size.1);
        println!("==================");
        if let Some(metadata) = &self.metadata {
            crate::model::print_metadata_info(metadata);
        }
    }
}

/// 予測器
///
/// アーティファクトが見つからない場合はデモモードで動作します。
pub struct ModelPredictor<B: Backend> {
    model: Option<AtkClassifier<B>>,
    config: InferenceConfig,
    metadata: Option<ModelMetadata>,
    model_path: PathBuf,
    device: B::Device,
    threshold: f32,
    demo_rng: Mutex<StdRng>,
}

impl<B: Backend> ModelPredictor<B> {
    /// モデルを読み込んで予測器を初期化
    ///
    /// ファイルがなければデモモード、壊れていれば `ModelLoad` エラー。
    pub fn load(model_path: &Path, settings: &AppConfig, device: B::Device) -> Result<Self> {
        if !model_path.exists() {
            log::warn!(
                "モデルが見つかりません: {}。デモモードで動作します",
                model_path.display()
            );
            return Ok(Self::demo(model_path, settings, device));
        }

        let load_error = |message: String| ClassifierError::ModelLoad {
            path: model_path.to_path_buf(),
            message,
        };

        let (metadata, model_binary) =
            load_model_with_metadata(model_path).map_err(|e| load_error(format!("{:#}", e)))?;
        let config = InferenceConfig::from_metadata(&metadata);

        let model: AtkClassifier<B> = config
            .to_model_config()
            .init(&device)
            .map_err(|e| load_error(e.to_string()))?;

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(model_binary, &device)
            .map_err(|e| load_error(format!("{:?}", e)))?;
        let model = model.load_record(record);

        log::info!(
            "モデルを読み込みました: {} ({} クラス, 入力 {}x{})",
            model_path.display(),
            config.num_classes(),
            config.input_size.0,
            config.input_size.1
        );

        Ok(Self {
            model: Some(model),
            config,
            metadata: Some(metadata),
            model_path: model_path.to_path_buf(),
            device,
            threshold: settings.prediction.low_confidence_threshold,
            demo_rng: Mutex::new(demo_rng(settings.prediction.demo_seed)),
        })
    }

    /// デモモードの予測器
    pub fn demo(model_path: &Path, settings: &AppConfig, device: B::Device) -> Self {
        Self {
            model: None,
            config: InferenceConfig::from_settings(&settings.model),
            metadata: None,
            model_path: model_path.to_path_buf(),
            device,
            threshold: settings.prediction.low_confidence_threshold,
            demo_rng: Mutex::new(demo_rng(settings.prediction.demo_seed)),
        }
    }

    pub fn is_demo_mode(&self) -> bool {
        self.model.is_none()
    }

    pub fn class_names(&self) -> &[String] {
        &self.config.class_names
    }

    pub fn inference_config(&self) -> &InferenceConfig {
        &self.config
    }

    /// 前処理済みテンソルを分類
    pub fn predict(&self, tensor: &ImageTensor, top_k: usize) -> Result<PredictionResult> {
        let (width, height) = self.config.input_size;
        let [batch, h, w, c] = tensor.shape();
        if batch != 1 || h != height as usize || w != width as usize || c != 3 {
            return Err(ClassifierError::Inference(format!(
                "expected tensor shape [1, {}, {}, 3], got {:?}",
                height,
                width,
                tensor.shape()
            )));
        }

        let (probabilities, is_demo) = match &self.model {
            Some(model) => (model.predict_probabilities(tensor, &self.device)?, false),
            None => {
                let mut rng = self
                    .demo_rng
                    .lock()
                    .map_err(|_| ClassifierError::Inference("demo RNG lock poisoned".into()))?;
                (sample_flat_dirichlet(&mut rng, self.config.num_classes()), true)
            }
        };

        rank_predictions(
            &probabilities,
            &self.config.class_names,
            top_k,
            self.threshold,
            is_demo,
        )
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            mode: if self.is_demo_mode() { "demo" } else { "trained" }.to_string(),
            model_path: self.model_path.clone(),
            class_names: self.config.class_names.clone(),
            input_size: self.config.input_size,
            metadata: self.metadata.clone(),
        }
    }
}

fn demo_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// 検証 → 前処理 → 予測 をまとめたパイプライン
pub struct InferencePipeline<B: Backend> {
    validator: ImageValidator,
    preprocessor: ImagePreprocessor,
    predictor: Arc<ModelPredictor<B>>,
    top_k: usize,
}

impl<B: Backend> InferencePipeline<B> {
    /// 入力サイズは予測器（学習済みならメタデータ）に合わせます
    pub fn new(settings: &AppConfig, predictor: Arc<ModelPredictor<B>>) -> Self {
        Self {
            validator: ImageValidator::from_settings(&settings.upload),
            preprocessor: ImagePreprocessor::for_model(
                predictor.inference_config().input_size,
                predictor.inference_config().rescale,
            ),
            predictor,
            top_k: settings.prediction.top_k,
        }
    }

    pub fn validate_image(&self, filename: &str, file_size: u64) -> Result<()> {
        self.validator.validate(filename, file_size)
    }

    /// 画像を分類（`top_k` 省略時は設定値）
    pub fn predict<'a, S: Into<ImageSource<'a>>>(
        &self,
        source: S,
        top_k: Option<usize>,
    ) -> Result<PredictionResult> {
        let tensor = self.preprocessor.preprocess(source)?;
        self.predictor.predict(&tensor, top_k.unwrap_or(self.top_k))
    }

    /// アップロードされたファイルを検証してから分類
    pub fn predict_upload(
        &self,
        filename: &str,
        bytes: &[u8],
        top_k: Option<usize>,
    ) -> Result<PredictionResult> {
        self.validate_image(filename, bytes.len() as u64)?;
        self.predict(bytes, top_k)
    }

    /// 画像情報を取得
    pub fn get_image_info<'a, S: Into<ImageSource<'a>>>(&self, source: S) -> Result<ImageInfo> {
        let loaded = self.preprocessor.load_image(source.into())?;
        Ok(get_image_info(&loaded.image, loaded.format, loaded.byte_len))
    }
}

/// アーティファクトの更新判定に使う (更新時刻, バイト数)
///
/// 更新時刻の分解能が粗いファイルシステムでも、サイズが変われば別物とみなす。
type ArtifactStamp = Option<(SystemTime, u64)>;

/// 予測器のキャッシュ
///
/// 最初の要求時に読み込み、アーティファクトの更新時刻かサイズが変わると読み直します。
pub struct ModelCache<B: Backend> {
    model_path: PathBuf,
    settings: AppConfig,
    device: B::Device,
    state: Mutex<Option<(ArtifactStamp, Arc<ModelPredictor<B>>)>>,
}

impl<B: Backend> ModelCache<B> {
    pub fn new(settings: AppConfig, device: B::Device) -> Self {
        Self {
            model_path: settings.model.model_path.clone(),
            settings,
            device,
            state: Mutex::new(None),
        }
    }

    fn artifact_stamp(&self) -> ArtifactStamp {
        let metadata = std::fs::metadata(&self.model_path).ok()?;
        Some((metadata.modified().ok()?, metadata.len()))
    }

    /// キャッシュ済みの予測器を取得（必要なら読み込む）
    pub fn get(&self) -> Result<Arc<ModelPredictor<B>>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ClassifierError::Inference("model cache lock poisoned".into()))?;

        let stamp = self.artifact_stamp();
        if let Some((cached_stamp, predictor)) = state.as_ref() {
            if *cached_stamp == stamp {
                return Ok(Arc::clone(predictor));
            }
            log::info!("モデルファイルの更新を検知しました。再読み込みします");
        }

        let predictor = Arc::new(ModelPredictor::load(
            &self.model_path,
            &self.settings,
            self.device.clone(),
        )?);
        *state = Some((stamp, Arc::clone(&predictor)));
        Ok(predictor)
    }

    /// キャッシュを破棄（次回の `get` で読み直す）
    pub fn invalidate(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = None;
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::tuning::Hyperparameters;
    use crate::model::{save_model_with_metadata, TrainingMode};
    use burn::record::Recorder;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    type TestBackend = NdArray<f32>;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    fn demo_settings(seed: u64) -> AppConfig {
        let mut settings = AppConfig::default();
        settings.model.input_size = (16, 16);
        settings.prediction.demo_seed = Some(seed);
        settings
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([90, 60, 30])));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    /// 小さなモデルを学習なしで保存する
    fn save_untrained_artifact(path: &Path, class_names: Vec<String>) {
        let device = NdArrayDevice::default();
        let hp = Hyperparameters {
            conv1_filters: 2,
            conv2_filters: 2,
            conv3_filters: 4,
            dense_units: 4,
            ..Hyperparameters::default()
        };
        let model: AtkClassifier<TestBackend> = hp
            .to_model_config(class_names.len(), (16, 16), 1.0)
            .init(&device)
            .unwrap();
        let binary = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(model.into_record(), ())
            .unwrap();
        let metadata = ModelMetadata::new(class_names, (16, 16), 1.0, hp, TrainingMode::Simple);
        save_model_with_metadata(path, &metadata, &binary).unwrap();
    }

    #[test]
    fn test_rank_predictions_orders_and_caps() {
        let classes = names(&["eraser", "kertas", "pensil"]);
        let result = rank_predictions(&[0.2, 0.5, 0.3], &classes, 10, 0.5, false).unwrap();
        assert_eq!(result.predicted_class, "kertas");
        assert_eq!(result.top_predictions.len(), 3);
        let order: Vec<_> = result.top_predictions.iter().map(|p| p.class_index).collect();
        assert_eq!(order, vec![1, 2, 0]);
        // しきい値ちょうどは低確信度ではない
        assert!(!result.is_low_confidence);
        assert!((result.percentage - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_rank_predictions_ties_and_threshold() {
        let classes = names(&["a", "b", "c"]);
        let result = rank_predictions(&[0.4, 0.4, 0.2], &classes, 2, 0.5, true).unwrap();
        assert_eq!(result.predicted_class, "a");
        assert_eq!(result.top_predictions[1].class_name, "b");
        assert!(result.is_low_confidence);
        assert!(result.is_demo);

        let result = rank_predictions(&[0.1, 0.9, 0.0], &classes, 0, 0.5, false).unwrap();
        assert_eq!(result.top_predictions.len(), 1);
    }

    #[test]
    fn test_rank_predictions_rejects_mismatch() {
        let classes = names(&["a", "b"]);
        assert!(rank_predictions(&[1.0], &classes, 1, 0.5, false).is_err());
        assert!(rank_predictions(&[], &[], 1, 0.5, false).is_err());
    }

    #[test]
    fn test_dirichlet_sums_to_one() {
        let mut rng = StdRng::seed_from_u64(5);
        for n in [2, 3, 10] {
            let probs = sample_flat_dirichlet(&mut rng, n);
            assert_eq!(probs.len(), n);
            assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
            assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_missing_model_uses_seeded_demo_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.tar.gz");

        let run = || {
            let predictor =
                ModelPredictor::<TestBackend>::load(&path, &demo_settings(42), NdArrayDevice::default())
                    .unwrap();
            assert!(predictor.is_demo_mode());
            let tensor = ImageTensor::new([1, 16, 16, 3], vec![0.0; 16 * 16 * 3]).unwrap();
            predictor.predict(&tensor, 3).unwrap()
        };

        let first = run();
        assert!(first.is_demo);
        assert_eq!(first.top_predictions.len(), 3);
        let total: f32 = first.top_predictions.iter().map(|p| p.probability).sum();
        assert!(total <= 1.0 + 1e-5);
        assert_eq!(first, run());
    }

    #[test]
    fn test_predict_rejects_wrong_shape() {
        let predictor = ModelPredictor::<TestBackend>::demo(
            Path::new("none"),
            &demo_settings(1),
            NdArrayDevice::default(),
        );
        let tensor = ImageTensor::new([1, 8, 8, 3], vec![0.0; 8 * 8 * 3]).unwrap();
        assert!(matches!(
            predictor.predict(&tensor, 3),
            Err(ClassifierError::Inference(_))
        ));
    }

    #[test]
    fn test_corrupt_model_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_model.tar.gz");
        std::fs::write(&path, b"corrupted").unwrap();
        let result = ModelPredictor::<TestBackend>::load(&path, &demo_settings(1), NdArrayDevice::default());
        assert!(matches!(result, Err(ClassifierError::ModelLoad { .. })));
    }

    #[test]
    fn test_trained_model_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_model.tar.gz");
        save_untrained_artifact(&path, names(&["eraser", "pensil"]));

        let predictor =
            ModelPredictor::<TestBackend>::load(&path, &AppConfig::default(), NdArrayDevice::default())
                .unwrap();
        assert!(!predictor.is_demo_mode());
        // メタデータのクラス名が設定より優先される
        assert_eq!(predictor.class_names(), &names(&["eraser", "pensil"])[..]);

        let info = predictor.model_info();
        assert_eq!(info.mode, "trained");
        assert_eq!(info.input_size, (16, 16));
        assert!(info.metadata.is_some());

        let pipeline = InferencePipeline::new(&AppConfig::default(), Arc::new(predictor));
        let result = pipeline.predict(png_bytes(40, 30).as_slice(), Some(5)).unwrap();
        assert!(!result.is_demo);
        assert_eq!(result.top_predictions.len(), 2);
        let total: f32 = result.top_predictions.iter().map(|p| p.probability).sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_pipeline_upload_validation() {
        let settings = demo_settings(3);
        let predictor =
            ModelPredictor::<TestBackend>::demo(Path::new("none"), &settings, NdArrayDevice::default());
        let pipeline = InferencePipeline::new(&settings, Arc::new(predictor));

        let bytes = png_bytes(20, 10);
        let result = pipeline.predict_upload("desk.png", &bytes, None).unwrap();
        assert_eq!(result.top_predictions.len(), 3);

        let err = pipeline.predict_upload("desk.gif", &bytes, None).unwrap_err();
        assert!(err.is_validation());

        let oversized = vec![0u8; 6 * 1024 * 1024];
        let err = pipeline.predict_upload("desk.jpg", &oversized, None).unwrap_err();
        assert!(matches!(err, ClassifierError::FileTooLarge { .. }));

        let info = pipeline.get_image_info(bytes.as_slice()).unwrap();
        assert_eq!((info.width, info.height), (20, 10));
        assert_eq!(info.format, "PNG");
    }

    #[test]
    fn test_model_cache_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_model.tar.gz");
        let mut settings = demo_settings(9);
        settings.model.model_path = path.clone();

        let cache = ModelCache::<TestBackend>::new(settings, NdArrayDevice::default());
        assert!(!cache.is_loaded());

        let first = cache.get().unwrap();
        assert!(first.is_demo_mode());
        let again = cache.get().unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        // 学習済みアーティファクトが現れたら読み直す
        save_untrained_artifact(&path, names(&["eraser", "kertas", "pensil"]));
        let reloaded = cache.get().unwrap();
        assert!(!reloaded.is_demo_mode());

        cache.invalidate();
        assert!(!cache.is_loaded());
        let after = cache.get().unwrap();
        assert!(!Arc::ptr_eq(&reloaded, &after));
    }

    #[test]
    fn test_model_cache_reloads_when_size_changes_within_same_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_model.tar.gz");
        let mut settings = demo_settings(9);
        settings.model.model_path = path.clone();

        save_untrained_artifact(&path, names(&["eraser", "pensil"]));
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let cache = ModelCache::<TestBackend>::new(settings, NdArrayDevice::default());
        assert_eq!(cache.get().unwrap().class_names().len(), 2);

        // 同じ更新時刻のまま別のアーティファクトで上書き
        let first_len = std::fs::metadata(&path).unwrap().len();
        save_untrained_artifact(&path, names(&["eraser", "kertas", "pensil"]));
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), mtime);
        assert_ne!(std::fs::metadata(&path).unwrap().len(), first_len);

        assert_eq!(cache.get().unwrap().class_names().len(), 3);
    }
}
