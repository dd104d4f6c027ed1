//! モデル学習と精度評価
//!
//! Adam + クロスエントロピーの学習ループを手書きで回し、
//! エポックごとに学習用・検証用データの精度を表示します。

use anyhow::{Context, Result};
use burn::{
    data::dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
    data::dataset::Dataset,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::ml::dataset::{random_split, split_lengths, BirdDataset, BirdItem, LabeledDataset};
use crate::ml::transform::{
    to_tensor_data, Compose, ImageTransform, RandomHorizontalFlip, RandomPerspective, Resize,
};
use crate::ml::BirdModel;
use crate::model::config::{AppConfig, AugmentationSettings, TrainingSettings};
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::{save_model, weights_path};

/// バッチャー
///
/// 画像を入力サイズに揃え、`augmentation` があれば適用してからテンソルにまとめる。
#[derive(Clone)]
pub struct BirdBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augmentation: Option<Arc<Compose>>,
}

impl<B: Backend> BirdBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self {
            device,
            image_size,
            augmentation: None,
        }
    }

    /// 学習バッチ用のデータ拡張を設定
    pub fn with_augmentation(mut self, augmentation: Compose) -> Self {
        if !augmentation.is_empty() {
            self.augmentation = Some(Arc::new(augmentation));
        }
        self
    }
}

impl<B: Backend> Batcher<B, BirdItem, BirdBatch<B>> for BirdBatcher<B> {
    fn batch(&self, items: Vec<BirdItem>, _device: &B::Device) -> BirdBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut rng = rand::thread_rng();

        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            let mut image = item.image;
            if image.dimensions() != (size as u32, size as u32) {
                image = Resize::new(size as u32).apply(image, &mut rng);
            }
            if let Some(augmentation) = &self.augmentation {
                image = augmentation.apply(image, &mut rng);
            }

            all_pixels.extend(to_tensor_data(&image));
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        BirdBatch { images, targets }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct BirdBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// 正解数と総数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accuracy {
    pub correct: usize,
    pub total: usize,
}

impl Accuracy {
    /// 正解率（%）、空の場合は 0
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.correct as f64 / self.total as f64
    }
}

/// 1エポック分の記録
#[derive(Debug, Clone)]
pub struct EpochStats {
    pub epoch: usize,
    /// バッチごとの `loss / batch_len` の合計
    pub loss: f64,
    pub train_accuracy: Accuracy,
    pub val_accuracy: Accuracy,
}

/// データ拡張の設定から変換列を作る（無効なら空）
pub fn augmentation_from_settings(settings: &AugmentationSettings) -> Compose {
    if !settings.enabled {
        return Compose::new();
    }
    Compose::new()
        .with(RandomHorizontalFlip::new(settings.horizontal_flip_p))
        .with(RandomPerspective::new(
            settings.perspective_distortion,
            settings.perspective_p,
        ))
}

/// データローダー上の精度を計算して表示（勾配は計算しない）
pub fn evaluate<B: Backend>(
    model: &BirdModel<B>,
    data_loader: &Arc<dyn DataLoader<B, BirdBatch<B>>>,
    name: &str,
) -> Accuracy {
    let mut accuracy = Accuracy::default();

    for batch in data_loader.iter() {
        let [batch_size] = batch.targets.dims();
        let (predictions, _) = model.predict(batch.images);
        let correct = predictions
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        accuracy.total += batch_size;
        accuracy.correct += correct as usize;
    }

    println!(
        "Accuracy of the network on the {} {} images: {}%",
        accuracy.total,
        name,
        accuracy.percent()
    );

    accuracy
}

/// 学習結果
pub struct TrainingOutput<B: AutodiffBackend> {
    pub model: BirdModel<B>,
    pub history: Vec<EpochStats>,
}

impl<B: AutodiffBackend> TrainingOutput<B> {
    /// 最終エポックの検証精度（%）
    pub fn final_val_accuracy(&self) -> Option<f64> {
        self.history.last().map(|stats| stats.val_accuracy.percent())
    }
}

/// 学習ループ
///
/// 学習用ローダーはシャッフルとデータ拡張あり、検証用ローダーはどちらもなし。
/// エポックの終わりに学習用（拡張なし）と検証用の精度を表示する。
pub fn train<B, D>(
    model: BirdModel<B>,
    train_dataset: D,
    val_dataset: D,
    settings: &TrainingSettings,
    augmentation: Compose,
    image_size: usize,
    device: &B::Device,
) -> TrainingOutput<B>
where
    B: AutodiffBackend,
    D: Dataset<BirdItem> + Clone + 'static,
{
    let mut model = model;
    let mut optim = AdamConfig::new().init::<B, BirdModel<B>>();

    let batcher_train =
        BirdBatcher::<B>::new(device.clone(), image_size).with_augmentation(augmentation);
    let batcher_eval = BirdBatcher::<B::InnerBackend>::new(device.clone(), image_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(train_dataset.clone());

    let dataloader_train_eval = DataLoaderBuilder::new(batcher_eval.clone())
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(train_dataset);

    let dataloader_val = DataLoaderBuilder::new(batcher_eval)
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(val_dataset);

    tracing::info!(
        train = dataloader_train.num_items(),
        val = dataloader_val.num_items(),
        epochs = settings.num_epochs,
        batch_size = settings.batch_size,
        lr = settings.learning_rate,
        "starting training"
    );

    let log_interval = settings.log_interval.max(1);
    let mut history = Vec::with_capacity(settings.num_epochs);
    let start_time = Instant::now();

    for epoch in 0..settings.num_epochs {
        let _span = tracing::info_span!("epoch", epoch).entered();
        let mut epoch_loss = 0.0;

        for (batch_idx, batch) in dataloader_train.iter().enumerate() {
            let [batch_len] = batch.targets.dims();
            let output = model.forward_classification(batch.images, batch.targets);
            let loss_value = output.loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optim.step(settings.learning_rate, model, grads);

            epoch_loss += loss_value / batch_len as f64;
            if batch_idx % log_interval == 0 {
                println!("Epoch {}, batch {}: {}", epoch, batch_idx, loss_value);
            }
        }

        let valid_model = model.valid();
        let train_accuracy = evaluate(&valid_model, &dataloader_train_eval, "train");
        let val_accuracy = evaluate(&valid_model, &dataloader_val, "val");

        tracing::info!(
            loss = epoch_loss,
            train_accuracy = train_accuracy.percent(),
            val_accuracy = val_accuracy.percent(),
            "epoch finished"
        );

        history.push(EpochStats {
            epoch,
            loss: epoch_loss,
            train_accuracy,
            val_accuracy,
        });
    }

    println!(
        "Total training time: {} sec",
        start_time.elapsed().as_secs_f64()
    );

    TrainingOutput { model, history }
}

/// バンドルを読み込んで分割・学習し、重みファイルを保存する
///
/// 戻り値は保存した重みファイルのパス。
pub fn train_model<B: AutodiffBackend>(
    config: &AppConfig,
    bundle_path: &Path,
    output_dir: &Path,
    device: &B::Device,
) -> Result<PathBuf> {
    config.validate().context("Invalid configuration")?;
    let image_size = config.model.image_size;

    let dataset = BirdDataset::from_bundle(
        bundle_path,
        Compose::new().with(Resize::new(image_size as u32)),
    )
    .context("Failed to load training data")?;

    let classes = dataset.classes().to_vec();
    if classes.len() != config.model.num_classes {
        tracing::warn!(
            configured = config.model.num_classes,
            found = classes.len(),
            "class count in bundle differs from config, using bundle classes"
        );
    }

    let model_config = config.model.to_model_config(classes.len());
    anyhow::ensure!(
        model_config.flattened_size().is_some(),
        "image size {} is too small for the model",
        image_size
    );

    let lengths = split_lengths(dataset.len(), config.training.train_ratio);
    anyhow::ensure!(
        lengths[0] > 0 && lengths[1] > 0,
        "cannot split {} samples with train ratio {}",
        dataset.len(),
        config.training.train_ratio
    );
    let mut splits = random_split(Arc::new(dataset), &lengths, config.training.seed)?.into_iter();
    let (Some(train_set), Some(val_set)) = (splits.next(), splits.next()) else {
        anyhow::bail!("random split returned fewer than two subsets");
    };

    println!("Training samples: {}", train_set.len());
    println!("Validation samples: {}", val_set.len());

    let model = model_config.init::<B>(device);
    let output = train(
        model,
        train_set,
        val_set,
        &config.training,
        augmentation_from_settings(&config.augmentation),
        image_size,
        device,
    );

    let metadata = ModelMetadata::new(
        config.model.model_name.clone(),
        classes,
        &model_config,
        config.training.num_epochs,
        output.final_val_accuracy(),
    );

    let path = save_model(
        output.model,
        &metadata,
        &weights_path(output_dir, &config.model.model_name),
    )?;
    println!("Model weights saved as {}", path.display());

    Ok(path)
}
