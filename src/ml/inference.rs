//! モデル推論機能

use anyhow::Result;
use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use std::path::Path;

use crate::ml::{load_and_normalize_image_with_size, BirdModel};
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::load_model;

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: BirdModel<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// 重みファイルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (model, metadata) = load_model::<B>(model_path.as_ref(), &device)?;

        tracing::info!(
            model = %metadata.model_name,
            classes = metadata.num_classes(),
            "loaded model for inference"
        );

        Ok(Self::new(model, metadata, device))
    }

    pub fn new(model: BirdModel<B>, metadata: ModelMetadata, device: B::Device) -> Self {
        Self {
            model,
            metadata,
            device,
        }
    }

    /// 単一画像のラベル（0 <= label < num_classes）を予測
    pub fn predict<P: AsRef<Path>>(&self, image_path: P) -> Result<usize> {
        let size = self.metadata.image_size;
        let image_data = load_and_normalize_image_with_size(image_path.as_ref(), size)?;

        // バッチ次元を追加 [1, 3, size, size]
        let tensor = Tensor::<B, 1>::from_floats(image_data.as_slice(), &self.device)
            .reshape([1, 3, size, size]);

        let (predictions, _) = self.model.predict(tensor);
        let label = predictions.into_scalar().elem::<i64>();

        usize::try_from(label)
            .map_err(|_| anyhow::anyhow!("negative prediction: {}", label))
    }

    /// 単一画像を分類してクラス名を返す
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<String> {
        let label = self.predict(image_path)?;

        self.metadata
            .classes
            .get(label)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", label))
    }

    /// 複数画像のラベルを予測
    pub fn predict_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<usize>> {
        image_paths.iter().map(|path| self.predict(path)).collect()
    }

    pub fn model(&self) -> &BirdModel<B> {
        &self.model
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::fixture_dir;
    use crate::ml::ModelConfig;
    use crate::model::model_storage::save_model;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray;

    fn saved_engine(name: &str) -> (InferenceEngine<TestBackend>, std::path::PathBuf) {
        let dir = fixture_dir(name);
        let device = NdArrayDevice::Cpu;
        let config = ModelConfig::new(3).with_image_size(96).with_hidden_size(8);
        let classes = vec![
            "BALTIMORE ORIOLE".to_string(),
            "MYNA".to_string(),
            "BARN OWL".to_string(),
        ];
        let metadata = ModelMetadata::new("Tiny".to_string(), classes, &config, 1, None);

        let model = config.init::<TestBackend>(&device);
        let path = save_model(model, &metadata, &dir.join("tiny")).unwrap();
        let engine = InferenceEngine::<TestBackend>::load(&path, device).unwrap();
        (engine, dir)
    }

    #[test]
    fn test_predict_label_in_range() {
        let (engine, dir) = saved_engine("inference_predict");
        let image_path = dir.join("0_35.png");
        RgbImage::from_pixel(120, 80, Rgb([200, 120, 30]))
            .save(&image_path)
            .unwrap();

        let label = engine.predict(&image_path).unwrap();
        assert!(label < engine.metadata().num_classes());

        let class_name = engine.classify_image(&image_path).unwrap();
        assert_eq!(class_name, engine.metadata().classes[label]);
    }

    #[test]
    fn test_predict_batch() {
        let (engine, dir) = saved_engine("inference_batch");
        let paths: Vec<_> = (0..3)
            .map(|i| {
                let path = dir.join(format!("{}.png", i));
                RgbImage::from_pixel(96, 96, Rgb([i * 80, 0, 255 - i * 80]))
                    .save(&path)
                    .unwrap();
                path
            })
            .collect();

        let labels = engine.predict_batch(&paths).unwrap();
        assert_eq!(labels.len(), 3);
        assert!(labels.iter().all(|&label| label < 3));
    }

    #[test]
    fn test_predict_missing_image() {
        let (engine, dir) = saved_engine("inference_missing");
        assert!(engine.predict(dir.join("missing.jpg")).is_err());
    }
}
