pub mod ml_model;
pub mod tuning;
pub mod training;
pub mod inference;

pub use ml_model::{build_model, AtkClassifier, ClassifierConfig};
pub use tuning::{Hyperparameters, RandomSearch, SearchSpace, SearchStrategy, TrialResult};
pub use training::{
    dataset_info, prepare_dataset, AtkBatch, AtkBatcher, AtkDataset, AtkItem, AtkTrainer,
    DatasetInfo, EpochMetrics, Monitor, PreparedDataset, TrainedModel, TrainingHistory,
};
pub use inference::{
    rank_predictions, ClassProbability, InferencePipeline, ModelCache, ModelInfo, ModelPredictor,
    PredictionResult,
};
