//! 鳥画像データセット
//!
//! - `BirdDatasetSmall`: CSVの各行から画像を1枚ずつ読み込む小規模データセット
//! - `BirdDataset`: 画像バンドル(tar.gz)から一括で読み込み、取得時に変換を適用するデータセット

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use image::RgbImage;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;

use crate::csv_loader::load_csv;
use crate::ml::bundle;
use crate::ml::transform::{Compose, ImageTransform};
use crate::types::{BirdRecord, ClassTable};

/// データセットアイテム
#[derive(Clone, Debug)]
pub struct BirdItem {
    pub image: RgbImage,
    pub label: usize,
}

/// 画像・ラベル・クラス名を保持するデータセットの共通操作
pub trait LabeledDataset {
    fn images(&self) -> &[RgbImage];
    fn labels(&self) -> &[usize];
    fn classes(&self) -> &[String];

    /// クラス数
    fn num_classes(&self) -> usize {
        self.classes().len()
    }

    /// ラベルに対応する鳥の名前
    fn get_class(&self, label: usize) -> Option<&str> {
        self.classes().get(label).map(String::as_str)
    }

    /// idx番目の画像
    fn get_image(&self, idx: usize) -> Option<&RgbImage> {
        self.images().get(idx)
    }

    /// idx番目のラベル
    fn get_label(&self, idx: usize) -> Option<usize> {
        self.labels().get(idx).copied()
    }
}

fn check_consistency(images: &[RgbImage], labels: &[usize], classes: &[String]) -> Result<()> {
    anyhow::ensure!(
        images.len() == labels.len(),
        "image count ({}) does not match label count ({})",
        images.len(),
        labels.len()
    );
    if let Some(label) = labels.iter().find(|&&label| label >= classes.len()) {
        anyhow::bail!("label {} is out of range for {} classes", label, classes.len());
    }
    Ok(())
}

/// CSVから1枚ずつ画像を読み込むデータセット
pub struct BirdDatasetSmall {
    images: Vec<RgbImage>,
    labels: Vec<usize>,
    classes: Vec<String>,
}

impl BirdDatasetSmall {
    /// CSV (filepath,label,class) から読み込む
    ///
    /// 相対パスはCSVファイルのあるディレクトリを基準に解決する。
    pub fn from_csv(csv_path: &Path) -> Result<Self> {
        let records = load_csv(csv_path)?;
        let base_dir = csv_path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_records(&records, base_dir)
    }

    pub fn from_records(records: &[BirdRecord], base_dir: &Path) -> Result<Self> {
        let mut images = Vec::with_capacity(records.len());
        let mut labels = Vec::with_capacity(records.len());
        let mut class_table = ClassTable::new();

        for record in records {
            let path = base_dir.join(&record.filepath);
            let image = image::open(&path)
                .with_context(|| format!("Failed to open image: {}", path.display()))?
                .to_rgb8();

            images.push(image);
            labels.push(record.label);
            class_table.register(record.label, &record.class_name)?;
        }

        let classes = class_table.into_classes()?;
        check_consistency(&images, &labels, &classes)?;

        tracing::info!(samples = images.len(), classes = classes.len(), "loaded csv dataset");

        Ok(Self {
            images,
            labels,
            classes,
        })
    }
}

impl LabeledDataset for BirdDatasetSmall {
    fn images(&self) -> &[RgbImage] {
        &self.images
    }

    fn labels(&self) -> &[usize] {
        &self.labels
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }
}

impl Dataset<BirdItem> for BirdDatasetSmall {
    fn get(&self, index: usize) -> Option<BirdItem> {
        Some(BirdItem {
            image: self.images.get(index)?.clone(),
            label: *self.labels.get(index)?,
        })
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

/// 画像バンドルから読み込むデータセット
///
/// `get` で取り出すたびに `transform` を適用する。
pub struct BirdDataset {
    images: Vec<RgbImage>,
    labels: Vec<usize>,
    classes: Vec<String>,
    transform: Compose,
}

impl BirdDataset {
    pub fn new(
        images: Vec<RgbImage>,
        labels: Vec<usize>,
        classes: Vec<String>,
        transform: Compose,
    ) -> Result<Self> {
        check_consistency(&images, &labels, &classes)?;

        Ok(Self {
            images,
            labels,
            classes,
            transform,
        })
    }

    /// tar.gz バンドルから読み込む
    pub fn from_bundle(bundle_path: &Path, transform: Compose) -> Result<Self> {
        let data = bundle::load_data(bundle_path)?;
        tracing::info!(
            samples = data.images.len(),
            classes = data.classes.len(),
            bundle = %bundle_path.display(),
            "loaded bundle dataset"
        );
        Self::new(data.images, data.labels, data.classes, transform)
    }
}

impl LabeledDataset for BirdDataset {
    fn images(&self) -> &[RgbImage] {
        &self.images
    }

    fn labels(&self) -> &[usize] {
        &self.labels
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }
}

impl Dataset<BirdItem> for BirdDataset {
    fn get(&self, index: usize) -> Option<BirdItem> {
        let image = self.images.get(index)?.clone();
        Some(BirdItem {
            image: self.transform.apply(image, &mut rand::thread_rng()),
            label: *self.labels.get(index)?,
        })
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

/// 元データセットの一部（インデックスのリスト）
pub struct Subset<D> {
    dataset: Arc<D>,
    indices: Vec<usize>,
}

impl<D> Clone for Subset<D> {
    fn clone(&self) -> Self {
        Self {
            dataset: Arc::clone(&self.dataset),
            indices: self.indices.clone(),
        }
    }
}

impl<D> Subset<D> {
    pub fn new(dataset: Arc<D>, indices: Vec<usize>) -> Self {
        Self { dataset, indices }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<D, I> Dataset<I> for Subset<D>
where
    D: Dataset<I>,
{
    fn get(&self, index: usize) -> Option<I> {
        self.dataset.get(*self.indices.get(index)?)
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// `train_ratio` に従って [学習用, 検証用] の件数を計算（学習用は切り捨て）
///
/// 0.7 * 100 のように積が整数になる場合に丸め誤差で1件減らないよう、微小量を足してから切り捨てる。
pub fn split_lengths(total: usize, train_ratio: f64) -> [usize; 2] {
    let train_len = ((total as f64 * train_ratio + 1e-6).floor() as usize).min(total);
    [train_len, total - train_len]
}

/// シード付きでインデックスをシャッフルし、指定した件数ごとに分割する
///
/// `lengths` の合計はデータセットの件数と一致しなければならない。
pub fn random_split<D: LabeledDataset>(
    dataset: Arc<D>,
    lengths: &[usize],
    seed: u64,
) -> Result<Vec<Subset<D>>> {
    let total = dataset.labels().len();
    let requested: usize = lengths.iter().sum();
    anyhow::ensure!(
        requested == total,
        "sum of split lengths ({}) does not equal dataset length ({})",
        requested,
        total
    );

    let mut indices: Vec<usize> = (0..total).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let mut subsets = Vec::with_capacity(lengths.len());
    let mut offset = 0;
    for &length in lengths {
        subsets.push(Subset::new(
            Arc::clone(&dataset),
            indices[offset..offset + length].to_vec(),
        ));
        offset += length;
    }

    Ok(subsets)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;
    use std::path::PathBuf;

    pub(crate) fn fixture_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("bird_dataset_{}_{}", name, std::process::id()));
        if dir.exists() {
            std::fs::remove_dir_all(&dir).unwrap();
        }
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// ラベルごとに色の違う画像を書き出し、CSVのパスを返す
    fn write_small_dataset(dir: &Path, rows: &[(usize, &str)]) -> PathBuf {
        let mut csv = String::from("filepath,label,class\n");
        for (i, (label, class_name)) in rows.iter().enumerate() {
            let class_dir = format!("small_data/{} - {}", label, class_name);
            std::fs::create_dir_all(dir.join(&class_dir)).unwrap();

            let file = format!("{}/{}_{}.png", class_dir, label, i);
            RgbImage::from_pixel(4 + i as u32, 4, Rgb([(*label * 40) as u8, i as u8, 0]))
                .save(dir.join(&file))
                .unwrap();
            csv.push_str(&format!("{},{},{}\n", file, label, class_name));
        }
        let path = dir.join("small_data.csv");
        std::fs::write(&path, csv).unwrap();
        path
    }

    const ROWS: [(usize, &str); 5] = [
        (0, "GREAT XENOPS"),
        (0, "GREAT XENOPS"),
        (1, "OSPREY"),
        (2, "BARN OWL"),
        (1, "OSPREY"),
    ];

    #[test]
    fn test_small_dataset_matches_csv_rows() {
        let dir = fixture_dir("small");
        let csv_path = write_small_dataset(&dir, &ROWS);
        let dataset = BirdDatasetSmall::from_csv(&csv_path).unwrap();

        assert_eq!(dataset.len(), ROWS.len());
        assert_eq!(dataset.num_classes(), 3);

        for (i, (label, class_name)) in ROWS.iter().enumerate() {
            let item = dataset.get(i).unwrap();
            assert_eq!(item.label, *label);
            assert_eq!(dataset.get_label(i), Some(*label));
            // 画像の幅で行を識別できる
            assert_eq!(item.image.width(), 4 + i as u32);
            assert_eq!(dataset.get_image(i).unwrap().get_pixel(0, 0)[1], i as u8);
            assert_eq!(dataset.get_class(dataset.get_label(i).unwrap()), Some(*class_name));
        }

        assert!(dataset.get(ROWS.len()).is_none());
        assert_eq!(dataset.get_class(3), None);
    }

    #[test]
    fn test_small_dataset_rejects_conflicting_classes() {
        let dir = fixture_dir("conflict");
        let csv_path = write_small_dataset(&dir, &[(0, "GREAT XENOPS"), (0, "OSPREY")]);
        assert!(BirdDatasetSmall::from_csv(&csv_path).is_err());
    }

    #[test]
    fn test_bird_dataset_checks_lengths() {
        let images = vec![RgbImage::new(2, 2)];
        let result =
            BirdDataset::new(images, vec![0, 0], vec!["OSPREY".to_string()], Compose::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_bird_dataset_checks_label_range() {
        let images = vec![RgbImage::new(2, 2)];
        let result = BirdDataset::new(images, vec![1], vec!["OSPREY".to_string()], Compose::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_bird_dataset_applies_transform() {
        use crate::ml::transform::Resize;

        let images = vec![RgbImage::new(10, 6), RgbImage::new(3, 3)];
        let dataset = BirdDataset::new(
            images,
            vec![0, 1],
            vec!["OSPREY".to_string(), "MYNA".to_string()],
            Compose::new().with(Resize::new(8)),
        )
        .unwrap();

        assert_eq!(dataset.get(0).unwrap().image.dimensions(), (8, 8));
        // 元画像はそのまま
        assert_eq!(dataset.get_image(0).unwrap().dimensions(), (10, 6));
        assert_eq!(dataset.get_class(1), Some("MYNA"));
    }

    #[test]
    fn test_split_lengths() {
        assert_eq!(split_lengths(3113, 0.8), [2490, 623]);
        assert_eq!(split_lengths(10, 1.0), [10, 0]);
        assert_eq!(split_lengths(100, 0.7), [70, 30]);
        assert_eq!(split_lengths(10, 0.9), [9, 1]);
        assert_eq!(split_lengths(7, 0.5), [3, 4]);
    }

    #[test]
    fn test_random_split_partitions_indices() {
        let images = vec![RgbImage::new(1, 1); 10];
        let labels = vec![0; 10];
        let dataset = Arc::new(
            BirdDataset::new(images, labels, vec!["OSPREY".to_string()], Compose::new()).unwrap(),
        );

        let subsets = random_split(Arc::clone(&dataset), &[7, 3], 42).unwrap();
        assert_eq!(subsets[0].len(), 7);
        assert_eq!(subsets[1].len(), 3);

        let mut all: Vec<usize> = subsets
            .iter()
            .flat_map(|subset| subset.indices().to_vec())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());

        // 同じシードなら同じ分割
        let again = random_split(dataset, &[7, 3], 42).unwrap();
        assert_eq!(again[0].indices(), subsets[0].indices());
    }

    #[test]
    fn test_random_split_rejects_wrong_lengths() {
        let dataset = Arc::new(
            BirdDataset::new(
                vec![RgbImage::new(1, 1); 4],
                vec![0; 4],
                vec!["OSPREY".to_string()],
                Compose::new(),
            )
            .unwrap(),
        );
        assert!(random_split(dataset, &[2, 1], 0).is_err());
    }
}
