//! 写入选项与协调器配置

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::common::{OTreeError, Result};

pub const DEFAULT_CUBE_SIZE: u64 = 5_000_000;

pub const OPT_COLUMNS_TO_INDEX: &str = "columnsToIndex";
pub const OPT_CUBE_SIZE:        &str = "cubeSize";
pub const OPT_COLUMN_STATS:     &str = "columnStats";

// ── 写入选项 ──────────────────────────────────────────────────────────────────

/// `columnsToIndex` 中的一项：`name` 或 `name:kind`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: Option<String>,
}

/// 宿主引擎传入的 key/value 写入选项
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    pub columns_to_index: Vec<ColumnSpec>,
    /// 未指定时沿用最新修订的 cube 大小
    pub cube_size:        Option<u64>,
    pub column_stats:     Option<serde_json::Value>,
}

impl IndexOptions {
    pub fn parse(options: &BTreeMap<String, String>) -> Result<Self> {
        let columns_to_index = match options.get(OPT_COLUMNS_TO_INDEX) {
            None => vec![],
            Some(raw) => raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    let (name, kind) = match s.split_once(':') {
                        Some((n, k)) => (n.trim(), Some(k.trim().to_ascii_lowercase())),
                        None => (s, None),
                    };
                    if name.is_empty() {
                        return Err(OTreeError::invalid_option(OPT_COLUMNS_TO_INDEX, "empty column name"));
                    }
                    Ok(ColumnSpec { name: name.into(), kind })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let mut seen = std::collections::BTreeSet::new();
        if let Some(dup) = columns_to_index.iter().find(|c| !seen.insert(c.name.as_str())) {
            return Err(OTreeError::invalid_option(
                OPT_COLUMNS_TO_INDEX, format!("duplicate column {}", dup.name)));
        }

        let cube_size = match options.get(OPT_CUBE_SIZE) {
            None => None,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(n) if n > 0 => Some(n),
                _ => return Err(OTreeError::invalid_option(
                    OPT_CUBE_SIZE, format!("expected a positive integer, got {raw:?}"))),
            },
        };

        let column_stats = match options.get(OPT_COLUMN_STATS) {
            None => None,
            Some(raw) => {
                let json: serde_json::Value = serde_json::from_str(raw)
                    .map_err(|e| OTreeError::invalid_option(OPT_COLUMN_STATS, e.to_string()))?;
                if !json.is_object() {
                    return Err(OTreeError::invalid_option(OPT_COLUMN_STATS, "expected a JSON object"));
                }
                Some(json)
            }
        };

        Ok(Self { columns_to_index, cube_size, column_stats })
    }

    /// 便于测试与示例：由 (key, value) 对构建
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let map = pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Self::parse(&map)
    }

    pub fn is_indexed(&self) -> bool { !self.columns_to_index.is_empty() }

    pub fn column_names(&self) -> Vec<String> {
        self.columns_to_index.iter().map(|c| c.name.clone()).collect()
    }
}

// ── 协调器配置 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// 可重试冲突的最大重试次数（总尝试次数 = max_retries + 1）
    pub max_retries:              u32,
    /// analyze 时 element_count 超过 cube_size × 该系数的满 cube 会被宣告复制
    pub overflow_factor:          f64,
    /// 小于该大小的文件参与 compaction
    pub compaction_min_file_size: u64,
    /// compaction 输出文件的大小上限
    pub compaction_max_file_size: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_retries:              2,
            overflow_factor:          1.5,
            compaction_min_file_size: 64 * 1024 * 1024,
            compaction_max_file_size: 1024 * 1024 * 1024,
        }
    }
}

impl WriterConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(raw)
            .map_err(|e| OTreeError::invalid_option("writerConfig", e.to_string()))?;
        if cfg.overflow_factor < 1.0 || cfg.compaction_min_file_size > cfg.compaction_max_file_size {
            return Err(OTreeError::invalid_option("writerConfig", "inconsistent thresholds"));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_columns_with_kinds() {
        let o = IndexOptions::from_pairs([
            (OPT_COLUMNS_TO_INDEX, "price, city:Hashing"),
            (OPT_CUBE_SIZE, "1000"),
        ]).unwrap();
        assert_eq!(o.column_names(), vec!["price", "city"]);
        assert_eq!(o.columns_to_index[1].kind.as_deref(), Some("hashing"));
        assert_eq!(o.cube_size, Some(1000));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(IndexOptions::from_pairs([(OPT_CUBE_SIZE, "0")]).is_err());
        assert!(IndexOptions::from_pairs([(OPT_CUBE_SIZE, "ten")]).is_err());
        assert!(IndexOptions::from_pairs([(OPT_COLUMNS_TO_INDEX, "a,a")]).is_err());
        assert!(IndexOptions::from_pairs([(OPT_COLUMN_STATS, "[1,2]")]).is_err());
        assert!(IndexOptions::from_pairs([(OPT_COLUMNS_TO_INDEX, ":linear")]).is_err());
    }

    #[test]
    fn writer_config_defaults_fill_missing_fields() {
        let cfg = WriterConfig::from_json(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.overflow_factor, 1.5);
        assert!(WriterConfig::from_json(r#"{"overflow_factor": 0.5}"#).is_err());
    }
}
