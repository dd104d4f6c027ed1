//! 鳥の種類を分類するCNNモデルの定義
//!
//! 入力は [batch_size, 3, 224, 224] のRGB画像、出力はクラスごとのロジットです。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use std::path::Path;

use crate::ml::transform::{to_tensor_data, ImageTransform, Resize};

/// デフォルトのクラス数
pub const NUM_CLASSES: usize = 20;

/// デフォルトの入力画像サイズ
pub const IMAGE_SIZE: usize = 224;

const CONV1_CHANNELS: usize = 96;
const CONV2_CHANNELS: usize = 256;
const CONV3_CHANNELS: usize = 384;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.3)]
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// 全結合層の中間次元
    #[config(default = 4096)]
    pub hidden_size: usize,
}

fn conv_output_size(size: usize, kernel: usize, stride: usize) -> Option<usize> {
    Some(size.checked_sub(kernel)? / stride + 1)
}

impl ModelConfig {
    /// 最後のプーリング後の特徴マップの一辺
    ///
    /// - Conv1 (5x5, stride 2)
    /// - Conv2 (5x5, stride 2) + Pool (3x3, stride 2)
    /// - Conv3 (3x3) → Conv4 (3x3) → Conv4 (3x3) + Pool (3x3, stride 2)
    ///
    /// 224 の場合は 110 → 53 → 26 → 24 → 22 → 20 → 9。
    pub fn feature_map_size(&self) -> Option<usize> {
        let size = conv_output_size(self.image_size, 5, 2)?;
        let size = conv_output_size(size, 5, 2)?;
        let size = conv_output_size(size, 3, 2)?;
        let size = conv_output_size(size, 3, 1)?;
        let size = conv_output_size(size, 3, 1)?;
        let size = conv_output_size(size, 3, 1)?;
        conv_output_size(size, 3, 2)
    }

    /// Flatten後の特徴次元
    pub fn flattened_size(&self) -> Option<usize> {
        self.feature_map_size()
            .map(|size| CONV3_CHANNELS * size * size)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> BirdModel<B> {
        let Some(d) = self.flattened_size() else {
            panic!("input size is too small: {}x{}", self.image_size, self.image_size);
        };

        tracing::debug!(
            image_size = self.image_size,
            flattened = d,
            hidden = self.hidden_size,
            num_classes = self.num_classes,
            "initializing bird model"
        );

        BirdModel {
            conv1: Conv2dConfig::new([3, CONV1_CHANNELS], [5, 5])
                .with_stride([2, 2])
                .init(device),
            batchnorm1: BatchNormConfig::new(CONV1_CHANNELS).init(device),
            pool: MaxPool2dConfig::new([3, 3]).with_strides([2, 2]).init(),

            conv2: Conv2dConfig::new([CONV1_CHANNELS, CONV2_CHANNELS], [5, 5])
                .with_stride([2, 2])
                .init(device),
            batchnorm2: BatchNormConfig::new(CONV2_CHANNELS).init(device),

            conv3: Conv2dConfig::new([CONV2_CHANNELS, CONV3_CHANNELS], [3, 3]).init(device),
            conv4: Conv2dConfig::new([CONV3_CHANNELS, CONV3_CHANNELS], [3, 3]).init(device),
            batchnorm3: BatchNormConfig::new(CONV3_CHANNELS).init(device),

            fc1: LinearConfig::new(d, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),

            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        }
    }
}

/// 鳥の種類分類用CNNモデル
///
/// # アーキテクチャ
/// - Conv 5x5/2 (3 -> 96) + ReLU + BatchNorm
/// - Conv 5x5/2 (96 -> 256) + ReLU + MaxPool + Dropout + BatchNorm
/// - Conv 3x3 (256 -> 384) + ReLU + BatchNorm
/// - Conv 3x3 (384 -> 384) + ReLU、同じ層をもう一度 + ReLU + MaxPool + BatchNorm
/// - Flatten → FC (d -> hidden) + ReLU → FC (hidden -> num_classes)
///
/// conv4 と batchnorm3 は2回ずつ使われ、重みを共有する。
#[derive(Module, Debug)]
pub struct BirdModel<B: Backend> {
    conv1: Conv2d<B>,
    batchnorm1: BatchNorm<B>,
    pool: MaxPool2d,
    conv2: Conv2d<B>,
    batchnorm2: BatchNorm<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    batchnorm3: BatchNorm<B>,

    fc1: Linear<B>,
    fc2: Linear<B>,

    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> BirdModel<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.activation.forward(self.conv1.forward(images));
        let x = self.batchnorm1.forward(x);

        let x = self.activation.forward(self.conv2.forward(x));
        let x = self.pool.forward(x);
        let x = self.dropout.forward(x);
        let x = self.batchnorm2.forward(x);

        let x = self.activation.forward(self.conv3.forward(x));
        let x = self.batchnorm3.forward(x);
        let x = self.activation.forward(self.conv4.forward(x));
        let x = self.activation.forward(self.conv4.forward(x));
        let x = self.pool.forward(x);
        let x = self.batchnorm3.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測ラベル [batch_size], ロジット [batch_size, num_classes])
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 1, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let predictions = output.clone().argmax(1).flatten::<1>(0, 1);
        (predictions, output)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 画像を読み込み、指定サイズにリサイズして (C, H, W) 順の [0, 1] の値に変換
pub fn load_and_normalize_image_with_size(path: &Path, size: usize) -> Result<Vec<f32>> {
    let image = image::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?
        .to_rgb8();
    let image = Resize::new(size as u32).apply(image, &mut rand::thread_rng());

    Ok(to_tensor_data(&image))
}
