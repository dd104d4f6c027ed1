use crate::types::BirdRecord;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::path::Path;

const EXPECTED_HEADERS: [&str; 3] = ["filepath", "label", "class"];

pub fn load_csv(path: &Path) -> Result<Vec<BirdRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open csv: {}", path.display()))?;

    let headers = reader.headers()?.clone();
    for header in EXPECTED_HEADERS {
        if !headers.iter().any(|h| h == header) {
            anyhow::bail!("Missing column '{}' in {}", header, path.display());
        }
    }

    let mut records = Vec::new();

    for (row, result) in reader.deserialize::<BirdRecord>().enumerate() {
        // ヘッダー行を1行目として数える
        let record = result
            .with_context(|| format!("Invalid row {} in {}", row + 2, path.display()))?;
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_csv(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("bird_csv_loader_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.csv");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_rows_in_order() {
        let path = write_csv(
            "rows",
            "filepath,label,class\n\
             small_data/0 - GREAT XENOPS/0_1.jpg,0,GREAT XENOPS\n\
             small_data/2 - OSPREY/2_15.jpg,2,OSPREY\n",
        );

        let records = load_csv(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].filepath, PathBuf::from("small_data/0 - GREAT XENOPS/0_1.jpg"));
        assert_eq!(records[0].label, 0);
        assert_eq!(records[1].class_name, "OSPREY");
    }

    #[test]
    fn test_invalid_label() {
        let path = write_csv("invalid", "filepath,label,class\na.jpg,x,OSPREY\n");
        assert!(load_csv(&path).is_err());
    }

    #[test]
    fn test_missing_column() {
        let path = write_csv("missing", "filepath,label\na.jpg,0\n");
        assert!(load_csv(&path).is_err());
    }
}
