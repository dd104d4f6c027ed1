pub mod ml_model;
pub mod transform;
pub mod bundle;
pub mod dataset;
pub mod training;
pub mod inference;

pub use ml_model::{
    BirdModel, ModelConfig, NUM_CLASSES, IMAGE_SIZE, load_and_normalize_image_with_size,
};
pub use dataset::{
    BirdDataset, BirdDatasetSmall, BirdItem, LabeledDataset, Subset, random_split, split_lengths,
};
pub use training::{Accuracy, BirdBatch, BirdBatcher, evaluate, train, train_model};
pub use inference::InferenceEngine;
