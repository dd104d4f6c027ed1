//! モデルメタデータの定義
//!
//! 重みファイル(tar.gz)の中に metadata.json として保存されます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::ModelConfig;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// モデルの説明（例: "MultiLayerCNN"）
    pub model_name: String,

    /// クラス名（classes[label] がそのラベルの鳥の名前）
    pub classes: Vec<String>,

    /// モデル入力サイズ
    pub image_size: usize,

    /// 全結合層の中間次元
    pub hidden_size: usize,

    /// ドロップアウト率
    pub dropout: f64,

    /// 学習エポック数
    pub num_epochs: usize,

    /// 最終エポックの検証精度（%）
    #[serde(default)]
    pub val_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        model_name: String,
        classes: Vec<String>,
        model_config: &ModelConfig,
        num_epochs: usize,
        val_accuracy: Option<f64>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            model_name,
            classes,
            image_size: model_config.image_size,
            hidden_size: model_config.hidden_size,
            dropout: model_config.dropout,
            num_epochs,
            val_accuracy,
            trained_at,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// 保存時と同じ構成のモデル設定
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.num_classes())
            .with_dropout(self.dropout)
            .with_image_size(self.image_size)
            .with_hidden_size(self.hidden_size)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_from_metadata() {
        let config = ModelConfig::new(3).with_image_size(96).with_hidden_size(32);
        let metadata = ModelMetadata::new(
            "Tiny".to_string(),
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            &config,
            2,
            Some(50.0),
        );

        let restored = metadata.model_config();
        assert_eq!(restored.num_classes, 3);
        assert_eq!(restored.image_size, 96);
        assert_eq!(restored.hidden_size, 32);

        let json = metadata.to_json_string().unwrap();
        assert_eq!(ModelMetadata::from_json_string(&json).unwrap(), metadata);
    }
}
