//! 画像バンドルの作成と読み込み
//!
//! Tar.gz形式で学習画像を1ファイルにまとめます。
//!
//! ファイル構成（tar.gz内部）:
//! - `<label> - <CLASS NAME>/<画像ファイル>` 例: `0 - BALTIMORE ORIOLE/0_35.jpg`
//! - 共通のルートディレクトリが1段あってもよい（例: `bird_data/0 - BALTIMORE ORIOLE/0_35.jpg`）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use image::RgbImage;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};

use crate::types::ClassTable;

/// バンドルから読み込んだデータ
pub struct BundleData {
    pub images: Vec<RgbImage>,
    pub labels: Vec<usize>,
    pub classes: Vec<String>,
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| ext == "png" || ext == "jpg" || ext == "jpeg")
}

/// "12 - HOUSE FINCH" -> (12, "HOUSE FINCH")
pub fn parse_class_dir_name(name: &str) -> Option<(usize, String)> {
    let (label, class_name) = name.split_once(" - ")?;
    let label = label.trim().parse().ok()?;
    let class_name = class_name.trim();
    if class_name.is_empty() {
        return None;
    }
    Some((label, class_name.to_string()))
}

/// 画像ファイルを直接含むディレクトリの名前
///
/// `tar czf bird_data.tar.gz bird_data` のように共通のルートがあっても
/// `bird_data/0 - BALTIMORE ORIOLE/0_35.jpg` からクラスディレクトリを取り出せる。
fn class_dir_name(path: &Path) -> Option<String> {
    let components: Vec<_> = path
        .components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect();
    // ファイルが直下にある場合は対象外
    let [.., dir, _file] = components.as_slice() else {
        return None;
    };
    Some(dir.as_os_str().to_string_lossy().into_owned())
}

/// Tar.gz バンドルから画像・ラベル・クラス名を読み込む
pub fn load_data(bundle_path: &Path) -> Result<BundleData> {
    let file = File::open(bundle_path)
        .context(format!("Failed to open bundle: {:?}", bundle_path))?;

    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);

    let mut images = Vec::new();
    let mut labels = Vec::new();
    let mut class_table = ClassTable::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path()?.into_owned();
        if !is_image_file(&path) {
            continue;
        }

        let Some(dir_name) = class_dir_name(&path) else {
            tracing::warn!(path = %path.display(), "skipping image outside of a class directory");
            continue;
        };
        let (label, class_name) = parse_class_dir_name(&dir_name)
            .with_context(|| format!("Invalid class directory name: '{}'", dir_name))?;

        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer)?;
        let image = image::load_from_memory(&buffer)
            .with_context(|| format!("Failed to decode image: {}", path.display()))?
            .to_rgb8();

        class_table.register(label, &class_name)?;
        images.push(image);
        labels.push(label);
    }

    if images.is_empty() {
        anyhow::bail!("No images found in bundle {}", bundle_path.display());
    }

    let classes = class_table.into_classes()?;

    Ok(BundleData {
        images,
        labels,
        classes,
    })
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// `<label> - <CLASS NAME>/` 形式のディレクトリ群を Tar.gz バンドルにまとめる
///
/// 戻り値は追加した画像の枚数。
pub fn pack_bundle(source_dir: &Path, output_path: &Path) -> Result<usize> {
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let file = File::create(output_path)
        .context(format!("Failed to create bundle: {:?}", output_path))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let mut count = 0;

    for class_dir in sorted_entries(source_dir)? {
        if !class_dir.is_dir() {
            continue;
        }
        let dir_name = class_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid directory name: {}", class_dir.display()))?;

        if parse_class_dir_name(dir_name).is_none() {
            tracing::warn!(dir = dir_name, "skipping directory without '<label> - <class>' name");
            continue;
        }

        for image_path in sorted_entries(&class_dir)? {
            if !image_path.is_file() || !is_image_file(&image_path) {
                continue;
            }
            let Some(file_name) = image_path.file_name() else {
                continue;
            };
            let name_in_archive = Path::new(dir_name).join(file_name);
            tar_builder
                .append_path_with_name(&image_path, &name_in_archive)
                .with_context(|| format!("Failed to add {} to bundle", image_path.display()))?;
            count += 1;
        }
    }

    tar_builder
        .into_inner()
        .context("Failed to finalize bundle")?
        .finish()
        .context("Failed to finish gzip stream")?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::fixture_dir;
    use image::Rgb;

    #[test]
    fn test_parse_class_dir_name() {
        assert_eq!(
            parse_class_dir_name("16 - HOUSE FINCH"),
            Some((16, "HOUSE FINCH".to_string()))
        );
        assert_eq!(parse_class_dir_name("HOUSE FINCH"), None);
        assert_eq!(parse_class_dir_name("x - HOUSE FINCH"), None);
        assert_eq!(parse_class_dir_name("3 - "), None);
    }

    #[test]
    fn test_pack_and_load_bundle() {
        let dir = fixture_dir("bundle");
        let source = dir.join("bird_data");
        for (label, class_name, count) in [(0, "BALTIMORE ORIOLE", 2), (1, "MYNA", 3)] {
            let class_dir = source.join(format!("{} - {}", label, class_name));
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..count {
                RgbImage::from_pixel(5, 5, Rgb([label as u8 * 100, i as u8, 0]))
                    .save(class_dir.join(format!("{}_{}.png", label, i)))
                    .unwrap();
            }
        }
        // 対象外のファイル
        std::fs::write(source.join("README.txt"), "not an image").unwrap();

        let bundle_path = dir.join("birds.tar.gz");
        assert_eq!(pack_bundle(&source, &bundle_path).unwrap(), 5);

        let data = load_data(&bundle_path).unwrap();
        assert_eq!(data.images.len(), 5);
        assert_eq!(data.labels, vec![0, 0, 1, 1, 1]);
        assert_eq!(data.classes, vec!["BALTIMORE ORIOLE".to_string(), "MYNA".to_string()]);
        assert_eq!(data.images[2].get_pixel(0, 0), &Rgb([100, 0, 0]));
    }

    #[test]
    fn test_load_bundle_with_root_directory() {
        let dir = fixture_dir("bundle_root");
        let source = dir.join("bird_data");
        for (label, class_name, count) in [(0, "BALTIMORE ORIOLE", 1), (1, "BARN OWL", 2)] {
            let class_dir = source.join(format!("{} - {}", label, class_name));
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..count {
                RgbImage::from_pixel(4, 4, Rgb([label as u8, i as u8, 0]))
                    .save(class_dir.join(format!("{}_{}.png", label, i)))
                    .unwrap();
            }
        }

        // tar czf birds.tar.gz bird_data と同じ構成
        let bundle_path = dir.join("birds.tar.gz");
        let encoder = GzEncoder::new(File::create(&bundle_path).unwrap(), Compression::default());
        let mut builder = Builder::new(encoder);
        builder.append_dir_all("bird_data", &source).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let data = load_data(&bundle_path).unwrap();
        assert_eq!(data.images.len(), 3);
        assert_eq!(data.classes, vec!["BALTIMORE ORIOLE".to_string(), "BARN OWL".to_string()]);
        assert_eq!(data.labels.iter().filter(|&&label| label == 1).count(), 2);
    }

    #[test]
    fn test_class_dir_name() {
        assert_eq!(
            class_dir_name(Path::new("./bird_data/2 - MYNA/2_119.jpg")),
            Some("2 - MYNA".to_string())
        );
        assert_eq!(class_dir_name(Path::new("2 - MYNA/2_119.jpg")), Some("2 - MYNA".to_string()));
        assert_eq!(class_dir_name(Path::new("2_119.jpg")), None);
    }

    #[test]
    fn test_load_missing_bundle() {
        assert!(load_data(Path::new("/nonexistent/birds.tar.gz")).is_err());
    }
}
