//! 修订：被索引列、列变换与 cube 大小的版本化配置
//!
//! 修订一经持久化即不可变；cube 大小变化或列值域被新数据超出时产生新修订，
//! 新修订的列变换由旧变换合并而来，已索引数据的归一化坐标保持不变。

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use crate::common::{OTreeError, Result, RevisionId, TableId, STAGING_REVISION_ID};
use crate::config::{IndexOptions, DEFAULT_CUBE_SIZE};
use crate::cube::{Point, MAX_DIMENSIONS};
use crate::field_type::Row;
use crate::meta::TableSchema;
use crate::transform::{ColumnStats, Transformation, Transformer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub revision_id:         RevisionId,
    pub table_id:            TableId,
    /// 创建时间（毫秒时间戳）
    pub timestamp:           i64,
    pub desired_cube_size:   u64,
    pub column_transformers: Vec<Transformer>,
    /// 与 column_transformers 一一对应；尚未见过数据时为空
    pub transformations:     Vec<Transformation>,
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl Revision {
    /// staging 修订：每列 Empty 变换，所有文件归属根 cube
    pub fn staging(table_id: TableId, columns: &[String]) -> Self {
        Self {
            revision_id:         STAGING_REVISION_ID,
            table_id,
            timestamp:           now_millis(),
            desired_cube_size:   DEFAULT_CUBE_SIZE,
            column_transformers: columns.iter()
                .map(|c| Transformer::Empty { column: c.clone() })
                .collect(),
            transformations:     vec![Transformation::Empty; columns.len()],
        }
    }

    /// 由写入选项创建全新修订；`current_max` 为已存在的最大修订号
    pub fn create_new(
        table_id:    TableId,
        schema:      &TableSchema,
        options:     &IndexOptions,
        current_max: Option<RevisionId>,
    ) -> Result<Self> {
        if !options.is_indexed() {
            return Err(OTreeError::invalid_option("columnsToIndex", "no columns to index"));
        }
        if options.columns_to_index.len() > MAX_DIMENSIONS {
            return Err(OTreeError::invalid_option(
                "columnsToIndex", format!("at most {MAX_DIMENSIONS} columns can be indexed")));
        }
        let column_transformers = options.columns_to_index.iter()
            .map(|spec| Transformer::from_spec(schema.column(&spec.name)?, spec.kind.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        let mut revision = Self {
            revision_id:       current_max.map_or(1, |m| m + 1),
            table_id,
            timestamp:         now_millis(),
            desired_cube_size: options.cube_size.unwrap_or(DEFAULT_CUBE_SIZE),
            column_transformers,
            transformations:   vec![],
        };
        if options.column_stats.is_some() {
            let stats = revision.option_stats(options)?;
            revision.transformations = revision.column_transformers.iter()
                .zip(&stats)
                .map(|(t, s)| t.make_transformation(s))
                .collect();
        }
        info!(table = %revision.table_id, revision_id = revision.revision_id,
              cube_size = revision.desired_cube_size, "created new revision");
        Ok(revision)
    }

    /// 沿用本修订配置，修订号加一
    pub fn create_next(
        &self,
        desired_cube_size: u64,
        transformations:   Vec<Transformation>,
    ) -> Self {
        Self {
            revision_id:         self.revision_id + 1,
            table_id:            self.table_id.clone(),
            timestamp:           now_millis(),
            desired_cube_size,
            column_transformers: self.column_transformers.clone(),
            transformations,
        }
    }

    pub fn is_staging(&self) -> bool { self.revision_id == STAGING_REVISION_ID }

    pub fn dimension_count(&self) -> usize { self.column_transformers.len() }

    pub fn columns(&self) -> Vec<String> {
        self.column_transformers.iter().map(|t| t.column().to_string()).collect()
    }

    /// 索引列必须与本修订完全一致
    pub fn validate_columns(&self, requested: &[String]) -> Result<()> {
        let existing = self.columns();
        if requested.is_empty() || requested == existing.as_slice() {
            Ok(())
        } else {
            Err(OTreeError::ColumnsMismatch { requested: requested.to_vec(), existing })
        }
    }

    /// 被索引列在 schema 中的位置
    pub fn column_indices(&self, schema: &TableSchema) -> Result<Vec<usize>> {
        self.column_transformers.iter()
            .map(|t| schema.column_index(t.column())
                .ok_or_else(|| OTreeError::SchemaMismatch(
                    format!("indexed column {} missing from schema", t.column()))))
            .collect()
    }

    /// 行 → 归一化空间中的点
    pub fn point_of(&self, row: &Row, indices: &[usize]) -> Point {
        indices.iter().enumerate()
            .map(|(dim, &col)| match (self.transformations.get(dim), row.get(col)) {
                (Some(t), Some(v)) => t.transform(v),
                _ => 0.0,
            })
            .collect()
    }

    fn option_stats(&self, options: &IndexOptions) -> Result<Vec<ColumnStats>> {
        match &options.column_stats {
            None => Ok(vec![ColumnStats::default(); self.dimension_count()]),
            Some(json) => self.column_transformers.iter()
                .map(|t| ColumnStats::from_json(json, t.column()))
                .collect(),
        }
    }

    /// 一批数据的列统计，与 `columnStats` 选项合并
    pub fn batch_stats(
        &self,
        schema:  &TableSchema,
        rows:    &[Row],
        options: &IndexOptions,
    ) -> Result<Vec<ColumnStats>> {
        let indices = self.column_indices(schema)?;
        let supplied = self.option_stats(options)?;
        Ok(indices.iter().zip(&supplied)
            .map(|(&idx, s)| ColumnStats::from_rows(rows, idx).union(s))
            .collect())
    }

    /// 用统计数据直接填充尚未持久化修订的变换（合并已有变换）
    pub fn with_stats(mut self, stats: &[ColumnStats]) -> Self {
        let incoming: Vec<Transformation> = self.column_transformers.iter()
            .zip(stats)
            .map(|(t, s)| t.make_transformation(s))
            .collect();
        self.transformations = if self.transformations.is_empty() {
            incoming
        } else {
            self.transformations.iter().zip(&incoming).map(|(old, new)| old.merge(new)).collect()
        };
        self
    }

    /// 判断写入是否需要新修订；需要时返回合并后的下一修订
    pub fn compute_changes(
        &self,
        options: &IndexOptions,
        stats:   &[ColumnStats],
    ) -> Option<Revision> {
        let cube_size = options.cube_size.unwrap_or(self.desired_cube_size);
        let incoming: Vec<Transformation> = self.column_transformers.iter()
            .zip(stats)
            .map(|(t, s)| t.make_transformation(s))
            .collect();

        let superseded = self.transformations.len() != incoming.len()
            || self.transformations.iter().zip(&incoming).any(|(old, new)| old.is_superseded_by(new));
        if cube_size == self.desired_cube_size && !superseded {
            return None;
        }

        let merged = if self.transformations.len() != incoming.len() {
            incoming
        } else {
            self.transformations.iter().zip(&incoming)
                .map(|(old, new)| if old.is_superseded_by(new) { old.merge(new) } else { old.clone() })
                .collect()
        };
        debug!(table = %self.table_id, from = self.revision_id, cube_size, superseded,
               "revision superseded by incoming data");
        Some(self.create_next(cube_size, merged))
    }
}
