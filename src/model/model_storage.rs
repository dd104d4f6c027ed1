//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//! ファイル名は "{日付}_{モデルの説明}.tar.gz"（例: `2022_11_28_MultiLayerCNN.tar.gz`）。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、モデル構成など）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::ml::BirdModel;
use crate::model::model_metadata::ModelMetadata;

/// 重みファイル名（拡張子なし）: "YYYY_MM_DD_{model_name}"
pub fn weights_file_stem(date: NaiveDate, model_name: &str) -> String {
    format!("{}_{}", date.format("%Y_%m_%d"), model_name)
}

/// 今日の日付で重みファイルのパスを作る
pub fn weights_path(output_dir: &Path, model_name: &str) -> PathBuf {
    let today = chrono::Local::now().date_naive();
    output_dir.join(format!("{}.tar.gz", weights_file_stem(today, model_name)))
}

fn append_file<W: std::io::Write>(
    builder: &mut Builder<W>,
    name: &str,
    bytes: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .context(format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 1つのtar.gzファイルに以下を含む：
/// - metadata.json : メタデータ
/// - model.bin : モデルの重み
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    // output_pathがすでに.tar.gzで終わっている場合はそのまま、そうでなければ拡張子を追加
    let tar_gz_path = if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    };

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_file(&mut tar_builder, "metadata.json", metadata.to_json_string()?.as_bytes())?;
    append_file(&mut tar_builder, "model.bin", model_binary)?;

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;

    Ok(tar_gz_path)
}

/// Tar.gzから指定した名前のエントリを読み込む
fn read_entry(tar_gz_path: &Path, name: &str) -> Result<Vec<u8>> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        if path.to_str() == Some(name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(anyhow::anyhow!("{} not found in tar.gz archive", name))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let bytes = read_entry(tar_gz_path, "metadata.json")?;
    let json = String::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json)
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    read_entry(tar_gz_path, "model.bin")
}

/// 学習済みモデルを重みファイルとして保存
pub fn save_model<B: Backend>(
    model: BirdModel<B>,
    metadata: &ModelMetadata,
    output_path: &Path,
) -> Result<PathBuf> {
    // f32精度のまま保存する
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("Failed to serialize model weights: {:?}", e))?;

    let path = save_model_with_metadata(output_path, metadata, &model_binary)?;
    tracing::info!(path = %path.display(), bytes = model_binary.len(), "saved model weights");
    Ok(path)
}

/// 重みファイルからモデルを復元
pub fn load_model<B: Backend>(
    tar_gz_path: &Path,
    device: &B::Device,
) -> Result<(BirdModel<B>, ModelMetadata)> {
    let metadata = load_metadata(tar_gz_path)?;
    let model_binary = load_model_binary(tar_gz_path)?;

    let model_config = metadata.model_config();
    anyhow::ensure!(
        model_config.flattened_size().is_some(),
        "image size {} in metadata is too small for the model",
        metadata.image_size
    );

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| anyhow::anyhow!("Failed to load model weights: {:?}", e))?;

    let model = model_config.init::<B>(device).load_record(record);

    Ok((model, metadata))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== Model metadata ===");
    println!("Model: {}", metadata.model_name);
    println!("Classes ({}):", metadata.num_classes());
    for (label, class_name) in metadata.classes.iter().enumerate() {
        println!("  {:>3}: {}", label, class_name);
    }
    println!("Input size: {}x{}", metadata.image_size, metadata.image_size);
    println!("Hidden size: {}", metadata.hidden_size);
    println!("Epochs: {}", metadata.num_epochs);
    if let Some(accuracy) = metadata.val_accuracy {
        println!("Validation accuracy: {:.2}%", accuracy);
    }
    println!("Trained at: {}", metadata.trained_at);
    println!("======================");
}
