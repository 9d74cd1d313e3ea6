//! 表结构与数据文件元数据

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::common::{ColumnType, OTreeError, Result, RevisionId};
use crate::cube::CubeId;
use crate::weight::Weight;

// ── 列定义 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name:        String,
    pub column_type: ColumnType,
    pub is_nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type, is_nullable: true }
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false; self
    }
}

// ── Table Schema ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnSchema>) -> Self { Self { columns } }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Result<&ColumnSchema> {
        self.columns.iter()
            .find(|c| c.name == name)
            .ok_or_else(|| OTreeError::UnknownColumn(name.into()))
    }

    pub fn num_columns(&self) -> usize { self.columns.len() }
}

// ── Block ─────────────────────────────────────────────────────────────────────

/// 文件内属于同一个 cube 的一段行，以及写入时该 cube 的状态标签
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub cube:            CubeId,
    /// 本段行的实际最小/最大权重
    pub min_weight:      Weight,
    pub max_weight:      Weight,
    /// 写入时 cube 的下降阈值（未满时为 Weight::MAX）
    pub cube_max_weight: Weight,
    pub element_count:   u64,
    /// 从父 cube 传播而来的副本
    pub replicated:      bool,
}

impl Block {
    /// 合并同一 cube、同一复制状态的两段（compaction 使用）
    pub fn merge(&self, other: &Block) -> Block {
        Block {
            cube:            self.cube.clone(),
            min_weight:      self.min_weight.min(other.min_weight),
            max_weight:      self.max_weight.max(other.max_weight),
            cube_max_weight: self.cube_max_weight.min(other.cube_max_weight),
            element_count:   self.element_count + other.element_count,
            replicated:      self.replicated,
        }
    }
}

// ── 数据文件 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFile {
    pub path:             String,
    pub size:             u64,
    pub revision_id:      RevisionId,
    /// 目录分区键值，如 {"dt": "2024-01-01"}
    pub partition_values: BTreeMap<String, String>,
    pub blocks:           Vec<Block>,
}

impl IndexFile {
    pub fn element_count(&self) -> u64 {
        self.blocks.iter().map(|b| b.element_count).sum()
    }
}

/// 转换前已存在的数据文件（parquet / delta 表中的文件）
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingFile {
    pub path:             String,
    pub size:             u64,
    pub num_records:      u64,
    pub partition_values: BTreeMap<String, String>,
}

impl ExistingFile {
    pub fn new(path: &str, size: u64, num_records: u64) -> Self {
        Self { path: path.into(), size, num_records, partition_values: BTreeMap::new() }
    }

    /// 作为 staging 修订根 cube 的文件
    pub fn into_staging(self, root: CubeId) -> IndexFile {
        IndexFile {
            path:             self.path,
            size:             self.size,
            revision_id:      crate::common::STAGING_REVISION_ID,
            partition_values: self.partition_values,
            blocks:           vec![Block {
                cube:            root,
                min_weight:      Weight::MIN,
                max_weight:      Weight::MAX,
                cube_max_weight: Weight::MAX,
                element_count:   self.num_records,
                replicated:      false,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_column_is_validation_error() {
        let schema = TableSchema::new(vec![ColumnSchema::new("a", ColumnType::Int64)]);
        assert_eq!(schema.column_index("a"), Some(0));
        assert!(matches!(schema.column("b"), Err(OTreeError::UnknownColumn(_))));
    }

    #[test]
    fn block_merge_widens_weights() {
        let cube = CubeId::root(1);
        let a = Block {
            cube: cube.clone(), min_weight: Weight(-5), max_weight: Weight(3),
            cube_max_weight: Weight::MAX, element_count: 2, replicated: false,
        };
        let b = Block { min_weight: Weight(-9), max_weight: Weight(1),
            cube_max_weight: Weight(10), element_count: 4, ..a.clone() };
        let m = a.merge(&b);
        assert_eq!((m.min_weight, m.max_weight, m.cube_max_weight), (Weight(-9), Weight(3), Weight(10)));
        assert_eq!(m.element_count, 6);
    }
}
