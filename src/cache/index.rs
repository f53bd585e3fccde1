//! On-disk cache index (`cache_index.json`, one per tier)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::MortarResult;

pub const INDEX_FILE_NAME: &str = "cache_index.json";

/// Serialized form of a tier's entry table and counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheIndexFile {
    pub statistics: IndexStatistics,
    pub items: Vec<IndexItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStatistics {
    pub total_items: usize,
    pub total_size_bytes: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    /// Unix seconds; 0 when no cleanup has run yet.
    pub last_cleanup: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexItem {
    pub key: String,
    pub package_name: String,
    pub version: String,
    pub cache_path: PathBuf,
    pub size_bytes: u64,
    /// Unix seconds.
    pub last_access: i64,
    /// Unix seconds.
    pub install_time: i64,
    pub access_count: u64,
    pub is_pinned: bool,
}

impl CacheIndexFile {
    pub fn load(path: &Path) -> MortarResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write atomically: serialize to a sibling temp file, then rename.
    pub fn save(&self, path: &Path) -> MortarResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE_NAME);

        let index = CacheIndexFile {
            statistics: IndexStatistics {
                total_items: 1,
                total_size_bytes: 128,
                hit_count: 3,
                miss_count: 1,
                hit_rate: 0.75,
                last_cleanup: 1_700_000_000,
            },
            items: vec![IndexItem {
                key: "fmt:10.1.0".into(),
                package_name: "fmt".into(),
                version: "10.1.0".into(),
                cache_path: dir.path().join("packages/fmt/10.1.0"),
                size_bytes: 128,
                last_access: 1_700_000_100,
                install_time: 1_700_000_000,
                access_count: 3,
                is_pinned: false,
            }],
        };

        index.save(&path).unwrap();
        let loaded = CacheIndexFile::load(&path).unwrap();

        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].key, "fmt:10.1.0");
        assert_eq!(loaded.statistics.hit_count, 3);
        assert!((loaded.statistics.hit_rate - 0.75).abs() < f64::EPSILON);
        // No stray temp file left behind.
        assert!(!dir.path().join("cache_index.json.tmp").exists());
    }

    #[test]
    fn test_field_names_are_stable() {
        let item = IndexItem {
            key: "zlib:1.3".into(),
            package_name: "zlib".into(),
            version: "1.3".into(),
            cache_path: PathBuf::from("/c/zlib/1.3"),
            size_bytes: 7,
            last_access: 10,
            install_time: 5,
            access_count: 2,
            is_pinned: true,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["package_name"], "zlib");
        assert_eq!(json["cache_path"], "/c/zlib/1.3");
        assert_eq!(json["is_pinned"], true);
    }
}
