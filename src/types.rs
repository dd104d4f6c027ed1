use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// CSVの1行（filepath,label,class）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirdRecord {
    pub filepath: PathBuf,
    pub label: usize,
    #[serde(rename = "class")]
    pub class_name: String,
}

/// ラベル -> クラス名の対応表
///
/// 同じラベルには常に同じクラス名が対応し、
/// ラベルは 0..num_classes の連番でなければならない。
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    names: BTreeMap<usize, String>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// ラベルとクラス名の組を登録
    pub fn register(&mut self, label: usize, class_name: &str) -> Result<()> {
        match self.names.get(&label) {
            Some(existing) if existing != class_name => {
                anyhow::bail!(
                    "label {} is used for both '{}' and '{}'",
                    label,
                    existing,
                    class_name
                );
            }
            Some(_) => {}
            None => {
                self.names.insert(label, class_name.to_string());
            }
        }
        Ok(())
    }

    /// ラベル順のクラス名リストに変換（classes[label] == クラス名）
    pub fn into_classes(self) -> Result<Vec<String>> {
        let mut classes = Vec::with_capacity(self.names.len());
        for (expected, (label, name)) in self.names.into_iter().enumerate() {
            if label != expected {
                anyhow::bail!("labels are not contiguous: label {} is missing", expected);
            }
            classes.push(name);
        }
        Ok(classes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_indexed_by_label() {
        let mut table = ClassTable::new();
        table.register(1, "OSPREY").unwrap();
        table.register(0, "GREAT XENOPS").unwrap();
        table.register(1, "OSPREY").unwrap();

        let classes = table.into_classes().unwrap();
        assert_eq!(classes, vec!["GREAT XENOPS".to_string(), "OSPREY".to_string()]);
    }

    #[test]
    fn test_conflicting_class_name() {
        let mut table = ClassTable::new();
        table.register(0, "GREAT XENOPS").unwrap();
        assert!(table.register(0, "OSPREY").is_err());
    }

    #[test]
    fn test_missing_label() {
        let mut table = ClassTable::new();
        table.register(0, "GREAT XENOPS").unwrap();
        table.register(2, "OSPREY").unwrap();
        assert!(table.into_classes().is_err());
    }
}
