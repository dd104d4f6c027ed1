//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデル構成、ハイパーパラメータなどをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::{ModelConfig, IMAGE_SIZE, NUM_CLASSES};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 重みファイル名に使うモデルの説明（例: "2022_11_28_MultiLayerCNN" の後半）
    pub model_name: String,
    /// 分類クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// 全結合層の中間次元
    pub hidden_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_name: "MultiLayerCNN".to_string(),
            num_classes: NUM_CLASSES,
            dropout: 0.3,
            image_size: IMAGE_SIZE,
            hidden_size: 4096,
        }
    }
}

impl ModelSettings {
    /// クラス数を指定して burn のモデル設定に変換
    pub fn to_model_config(&self, num_classes: usize) -> ModelConfig {
        ModelConfig::new(num_classes)
            .with_dropout(self.dropout)
            .with_image_size(self.image_size)
            .with_hidden_size(self.hidden_size)
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f64,
    /// 損失を表示するバッチ間隔
    pub log_interval: usize,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 30,
            batch_size: 64,
            num_workers: 1,
            learning_rate: 1e-4,
            seed: 42,
            train_ratio: 0.8,
            log_interval: 100,
        }
    }
}

/// データ拡張設定（学習バッチのみに適用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationSettings {
    pub enabled: bool,
    /// 左右反転の確率
    pub horizontal_flip_p: f64,
    /// 射影変換の歪みの大きさ
    pub perspective_distortion: f64,
    /// 射影変換の確率
    pub perspective_p: f64,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            horizontal_flip_p: 0.5,
            perspective_distortion: 0.5,
            perspective_p: 0.5,
        }
    }
}

/// データと出力先のパス
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// 学習用画像バンドル (tar.gz)
    pub bundle_path: PathBuf,
    /// 重みファイルの出力先ディレクトリ
    pub output_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            bundle_path: PathBuf::from("bird_data.tar.gz"),
            output_dir: PathBuf::from("models"),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ拡張設定
    #[serde(default)]
    pub augmentation: AugmentationSettings,
    /// パス設定
    #[serde(default)]
    pub paths: PathSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合や読めない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded config");
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to load config, using defaults"
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 値の範囲を検証する
    ///
    /// 確率とドロップアウト率は [0, 1]、学習データの割合は (0, 1)。
    pub fn validate(&self) -> anyhow::Result<()> {
        check_probability("model.dropout", self.model.dropout)?;
        check_probability("augmentation.horizontal_flip_p", self.augmentation.horizontal_flip_p)?;
        check_probability("augmentation.perspective_p", self.augmentation.perspective_p)?;
        check_probability(
            "augmentation.perspective_distortion",
            self.augmentation.perspective_distortion,
        )?;

        anyhow::ensure!(self.training.batch_size > 0, "training.batch_size must be greater than 0");
        anyhow::ensure!(self.training.num_epochs > 0, "training.num_epochs must be greater than 0");
        anyhow::ensure!(
            self.training.train_ratio > 0.0 && self.training.train_ratio < 1.0,
            "training.train_ratio must be between 0 and 1 (exclusive), got {}",
            self.training.train_ratio
        );
        anyhow::ensure!(
            self.training.learning_rate.is_finite() && self.training.learning_rate > 0.0,
            "training.learning_rate must be positive, got {}",
            self.training.learning_rate
        );
        anyhow::ensure!(self.model.hidden_size > 0, "model.hidden_size must be greater than 0");
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== Configuration ===");
        println!("Device: {}", self.device_type);
        println!("Model: {} ({} classes, {}x{} input, hidden {}, dropout {})",
            self.model.model_name,
            self.model.num_classes,
            self.model.image_size,
            self.model.image_size,
            self.model.hidden_size,
            self.model.dropout);
        println!("Epochs: {}, batch size: {}, learning rate: {}",
            self.training.num_epochs, self.training.batch_size, self.training.learning_rate);
        println!("Seed: {}, train ratio: {}", self.training.seed, self.training.train_ratio);
        println!("Bundle: {}", self.paths.bundle_path.display());
        println!("Output: {}", self.paths.output_dir.display());
        println!("=====================");
    }
}

fn check_probability(name: &str, value: f64) -> anyhow::Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&value),
        "{} must be between 0 and 1, got {}",
        name,
        value
    );
    Ok(())
}
