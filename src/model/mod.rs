pub mod model_metadata;
pub mod model_storage;
pub mod config;

pub use model_metadata::ModelMetadata;
pub use model_storage::{
    save_model, load_model, save_model_with_metadata, load_metadata, load_model_binary,
    print_metadata_info, weights_path,
};
pub use config::{
    AppConfig, DeviceType, ModelSettings, TrainingSettings, AugmentationSettings, PathSettings,
};
