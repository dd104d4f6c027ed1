//! 小規模データセット（small_data.csv）の読み込み確認用バイナリ

use bird_classifier_lib::ml::{BirdDatasetSmall, LabeledDataset};
use bird_classifier_lib::model::{load_metadata, print_metadata_info};
use burn::data::dataset::Dataset;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

const EXPECTED_LEN: usize = 45;
const LABEL_CHECK_IDX: usize = 17;
const EXPECTED_LABEL: usize = 1;
const SAMPLE_INDICES: [usize; 3] = [13, 29, 43];

fn test_case<T: PartialEq + Debug>(message: &str, value: T, expected_value: T) -> bool {
    println!("{}", message);
    if value == expected_value {
        println!("  PASSED");
        true
    } else {
        println!("  EXPECTED: {:?}", expected_value);
        println!("  GOT: {:?}", value);
        false
    }
}

fn main() {
    println!("=== Bird dataset check ===\n");

    // 引数: [CSVパス] [重みファイル]
    let args: Vec<String> = std::env::args().collect();
    let csv_path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("small_data.csv"));

    println!("Test 1: BirdDatasetSmall ({})", csv_path.display());
    let passed = test_small_dataset(&csv_path);

    if let Some(model_path) = args.get(2) {
        println!("\n{}\n", "=".repeat(50));
        println!("Test 2: モデルメタデータ読み込み");
        test_model_metadata(Path::new(model_path));
    }

    if !passed {
        std::process::exit(1);
    }
}

fn test_small_dataset(csv_path: &Path) -> bool {
    let dataset = match BirdDatasetSmall::from_csv(csv_path) {
        Ok(dataset) => dataset,
        Err(e) => {
            eprintln!("✗ エラー: {:#}", e);
            return false;
        }
    };

    let mut passed = test_case("Length of the dataset", dataset.len(), EXPECTED_LEN);
    passed &= test_case(
        &format!("Label of idx={}", LABEL_CHECK_IDX),
        dataset.get_label(LABEL_CHECK_IDX),
        Some(EXPECTED_LABEL),
    );

    println!("\nSample classes:");
    for idx in SAMPLE_INDICES {
        let class_name = dataset.get_label(idx).and_then(|label| dataset.get_class(label));
        match (class_name, dataset.get_image(idx)) {
            (Some(class_name), Some(image)) => {
                println!("  [{}] {} ({}x{})", idx, class_name, image.width(), image.height())
            }
            _ => println!("  [{}] out of range", idx),
        }
    }

    passed
}

fn test_model_metadata(model_path: &Path) {
    match load_metadata(model_path) {
        Ok(metadata) => {
            println!("✓ モデルメタデータ読み込み成功:");
            print_metadata_info(&metadata);
        }
        Err(e) => {
            eprintln!("✗ エラー: {:#}", e);
        }
    }
}
