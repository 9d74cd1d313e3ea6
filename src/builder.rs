//! OTree 构建
//!
//! 把一批行分配到 cube：
//! 1. 由被索引列的稳定哈希得到权重，按 (权重, 行号) 升序处理，同权重按输入顺序
//! 2. 从根 cube 向下路由：cube 未满则吸收，满了（阈值 < MAX）只吸收权重低于阈值的行，
//!    其余下降到包含该点的子 cube
//! 3. 未满 cube 吸收到 desired_cube_size 行时，以最后吸收的权重作为阈值
//! 4. 吸收进已宣告/已复制 cube 的行同时复制一份到子 cube
//!
//! 输出 `TableChanges`：每 cube 的增量与逐行分配，文件由外部写入器生成。

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use crate::common::Result;
use crate::cube::{CubeId, MAX_DEPTH};
use crate::field_type::Row;
use crate::index::IndexStatus;
use crate::meta::{IndexFile, TableSchema};
use crate::revision::Revision;
use crate::weight::Weight;

// ── 增量 ──────────────────────────────────────────────────────────────────────

/// 一次构建中某 cube 的变化；多个分区并行构建的结果可按 `merge` 合并
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubeDelta {
    /// 本次构建确定的下降阈值（未在本次填满时为 Weight::MAX）
    pub max_weight:    Weight,
    pub element_count: u64,
    pub min_row:       Weight,
    pub max_row:       Weight,
}

impl CubeDelta {
    fn new() -> Self {
        Self { max_weight: Weight::MAX, element_count: 0, min_row: Weight::MAX, max_row: Weight::MIN }
    }

    fn absorb(&mut self, w: Weight) {
        self.element_count += 1;
        self.min_row = self.min_row.min(w);
        self.max_row = self.max_row.max(w);
    }

    /// 结合、交换：计数相加，行权重范围取并，阈值取较小者
    pub fn merge(&self, other: &CubeDelta) -> CubeDelta {
        CubeDelta {
            max_weight:    self.max_weight.min(other.max_weight),
            element_count: self.element_count + other.element_count,
            min_row:       self.min_row.min(other.min_row),
            max_row:       self.max_row.max(other.max_row),
        }
    }
}

pub fn merge_deltas(
    a: &BTreeMap<CubeId, CubeDelta>,
    b: &BTreeMap<CubeId, CubeDelta>,
) -> BTreeMap<CubeId, CubeDelta> {
    let mut out = a.clone();
    for (cube, d) in b {
        out.entry(cube.clone())
            .and_modify(|e| *e = e.merge(d))
            .or_insert(*d);
    }
    out
}

/// 一行（或其传播副本）在 cube 中的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowAssignment {
    pub row:        usize,
    pub cube:       CubeId,
    pub weight:     Weight,
    pub replicated: bool,
}

// ── TableChanges ──────────────────────────────────────────────────────────────

/// 一次索引/写入的增量：可选的新修订 + 更新后的 IndexStatus
#[derive(Debug, Clone)]
pub struct TableChanges {
    /// 需要持久化的新修订
    pub revision_change:  Option<Revision>,
    pub updated_status:   IndexStatus,
    pub cube_deltas:      BTreeMap<CubeId, CubeDelta>,
    pub assignments:      Vec<RowAssignment>,
    /// 本次完成复制的 cube（元数据变更）
    pub replicated_cubes: BTreeSet<CubeId>,
}

impl TableChanges {
    /// 不含任何行分配的变更
    pub fn empty(status: &IndexStatus, revision_change: Option<Revision>) -> Self {
        Self {
            revision_change,
            updated_status:   status.clone(),
            cube_deltas:      BTreeMap::new(),
            assignments:      vec![],
            replicated_cubes: BTreeSet::new(),
        }
    }

    pub fn revision(&self) -> &Revision { &self.updated_status.revision }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.replicated_cubes.is_empty() && self.revision_change.is_none()
    }

    /// 写入后 cube 的阈值标签
    pub fn cube_max_weight(&self, cube: &CubeId) -> Weight {
        let prior = self.updated_status.max_weight(cube);
        self.cube_deltas.get(cube).map_or(prior, |d| prior.min(d.max_weight))
    }

    /// 把写入器产出的文件并入 IndexStatus
    pub fn with_files(mut self, files: &[IndexFile]) -> Self {
        self.updated_status = self.updated_status
            .with_files(files)
            .with_replicated(self.replicated_cubes.iter().cloned());
        self
    }
}

// ── 构建器 ────────────────────────────────────────────────────────────────────

pub struct IndexBuilder<'a> {
    status: &'a IndexStatus,
    schema: &'a TableSchema,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(status: &'a IndexStatus, schema: &'a TableSchema) -> Self {
        Self { status, schema }
    }

    fn revision(&self) -> &Revision { &self.status.revision }

    fn empty_changes(&self, revision_change: Option<Revision>) -> TableChanges {
        TableChanges::empty(self.status, revision_change)
    }

    /// (行号, 权重, 点)，按权重升序、同权重按行号
    fn weigh(&self, rows: &[Row]) -> Result<Vec<(usize, Weight, Vec<f64>)>> {
        let revision = self.revision();
        let indices = revision.column_indices(self.schema)?;
        let mut weighed: Vec<_> = rows.iter().enumerate()
            .map(|(i, row)| {
                let w = Weight::of_values(indices.iter().filter_map(|&c| row.get(c)));
                (i, w, revision.point_of(row, &indices))
            })
            .collect();
        weighed.sort_by_key(|(i, w, _)| (*w, *i));
        Ok(weighed)
    }

    pub fn build(&self, rows: &[Row], revision_change: Option<Revision>) -> Result<TableChanges> {
        let mut changes = self.empty_changes(revision_change);
        if rows.is_empty() { return Ok(changes); }

        let desired = self.revision().desired_cube_size;
        let dims = self.revision().dimension_count();
        let mut deltas: BTreeMap<CubeId, CubeDelta> = BTreeMap::new();

        for (row, w, point) in self.weigh(rows)? {
            let mut cube = CubeId::root(dims);
            loop {
                let delta = deltas.get(&cube).copied().unwrap_or_else(CubeDelta::new);
                let threshold = self.status.max_weight(&cube).min(delta.max_weight);
                let count = self.status.element_count(&cube) + delta.element_count;

                let absorb = cube.depth() >= MAX_DEPTH
                    || (threshold == Weight::MAX && count < desired)
                    || (threshold < Weight::MAX && w < threshold);
                if !absorb {
                    cube = cube.child_containing(&point);
                    continue;
                }

                let entry = deltas.entry(cube.clone()).or_insert_with(CubeDelta::new);
                entry.absorb(w);
                if threshold == Weight::MAX && count + 1 >= desired {
                    entry.max_weight = w;
                }
                if self.status.is_propagating(&cube) && cube.depth() < MAX_DEPTH {
                    changes.assignments.push(RowAssignment {
                        row, cube: cube.child_containing(&point), weight: w, replicated: true,
                    });
                }
                changes.assignments.push(RowAssignment { row, cube, weight: w, replicated: false });
                break;
            }
        }

        debug!(revision_id = self.revision().revision_id, rows = rows.len(),
               cubes = deltas.len(), "index build complete");
        changes.cube_deltas = deltas;
        Ok(changes)
    }

    /// 未索引写入：所有行落在暂存修订的根 cube
    pub fn build_staging(&self, rows: &[Row], revision_change: Option<Revision>) -> TableChanges {
        let mut changes = self.empty_changes(revision_change);
        if rows.is_empty() { return changes; }
        let root = CubeId::root(self.revision().dimension_count());
        let mut delta = CubeDelta::new();
        for (row, values) in rows.iter().enumerate() {
            let w = Weight::of_values(values.iter());
            delta.absorb(w);
            changes.assignments.push(RowAssignment { row, cube: root.clone(), weight: w, replicated: false });
        }
        changes.cube_deltas.insert(root, delta);
        changes
    }

    /// 把已宣告 cube 的行传播到子 cube；`cube_rows` 为各 cube 自身（非副本）的行。
    /// 返回的行序列即分配中 `row` 下标所指
    pub fn replicate(&self, cube_rows: &BTreeMap<CubeId, Vec<Row>>) -> Result<(TableChanges, Vec<Row>)> {
        let mut changes = self.empty_changes(None);
        let mut all_rows: Vec<Row> = Vec::new();
        for (cube, rows) in cube_rows {
            if cube.depth() >= MAX_DEPTH { continue; }
            let offset = all_rows.len();
            for (i, w, point) in self.weigh(rows)? {
                changes.assignments.push(RowAssignment {
                    row: offset + i, cube: cube.child_containing(&point), weight: w, replicated: true,
                });
            }
            all_rows.extend(rows.iter().cloned());
            changes.replicated_cubes.insert(cube.clone());
        }
        debug!(revision_id = self.revision().revision_id,
               cubes = changes.replicated_cubes.len(), "replication computed");
        Ok((changes, all_rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ColumnType, TableId};
    use crate::field_type::Value;
    use crate::meta::ColumnSchema;
    use crate::transform::{Transformation, Transformer};

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnSchema::new("x", ColumnType::Int64),
            ColumnSchema::new("y", ColumnType::Int64),
        ])
    }

    fn status(cube_size: u64) -> IndexStatus {
        let mut r = Revision::staging(TableId::new("/tmp/b").unwrap(), &["x".into(), "y".into()]);
        r.revision_id = 1;
        r.desired_cube_size = cube_size;
        r.column_transformers = vec![
            Transformer::Linear { column: "x".into(), column_type: ColumnType::Int64 },
            Transformer::Linear { column: "y".into(), column_type: ColumnType::Int64 },
        ];
        r.transformations = vec![Transformation::Linear { min: 0.0, max: 1000.0 }; 2];
        IndexStatus::empty(r)
    }

    fn rows(n: i64) -> Vec<Row> {
        (0..n).map(|i| vec![Value::Int64(i % 1000), Value::Int64((i * 7) % 1000)]).collect()
    }

    #[test]
    fn empty_batch_yields_no_changes() {
        let s = status(10);
        let c = IndexBuilder::new(&s, &schema()).build(&[], None).unwrap();
        assert!(c.is_empty() && c.cube_deltas.is_empty());
    }

    #[test]
    fn small_batch_stays_in_root() {
        let s = status(100);
        let c = IndexBuilder::new(&s, &schema()).build(&rows(40), None).unwrap();
        let root = CubeId::root(2);
        assert_eq!(c.cube_deltas.len(), 1);
        assert_eq!(c.cube_deltas[&root].element_count, 40);
        assert_eq!(c.cube_max_weight(&root), Weight::MAX);
    }

    #[test]
    fn overflow_descends_with_monotonic_weights() {
        let s = status(10);
        let c = IndexBuilder::new(&s, &schema()).build(&rows(200), None).unwrap();
        assert_eq!(c.assignments.len(), 200);
        let root = CubeId::root(2);
        assert_eq!(c.cube_deltas[&root].element_count, 10);
        for a in &c.assignments {
            let mut anc = a.cube.parent();
            while let Some(p) = anc {
                assert!(a.weight >= c.cube_max_weight(&p), "row below ancestor threshold");
                anc = p.parent();
            }
        }
        for cube in c.cube_deltas.keys() {
            if let Some(p) = cube.parent() { assert!(c.cube_deltas.contains_key(&p)); }
            assert!(c.cube_deltas[cube].element_count > 0);
        }
    }

    #[test]
    fn flooded_prior_cube_only_takes_lighter_rows() {
        let s0 = status(10);
        let first = IndexBuilder::new(&s0, &schema()).build(&rows(30), None).unwrap();
        let root = CubeId::root(2);
        let threshold = first.cube_max_weight(&root);
        let files: Vec<IndexFile> = first.cube_deltas.iter().map(|(cube, d)| IndexFile {
            path: format!("f-{cube}"), size: 1, revision_id: 1, partition_values: Default::default(),
            blocks: vec![crate::meta::Block {
                cube: cube.clone(), min_weight: d.min_row, max_weight: d.max_row,
                cube_max_weight: first.cube_max_weight(cube), element_count: d.element_count,
                replicated: false,
            }],
        }).collect();
        let s1 = first.with_files(&files).updated_status;
        assert_eq!(s1.max_weight(&root), threshold);

        let more: Vec<Row> = (0..50).map(|i| vec![Value::Int64(500 + i), Value::Int64(i)]).collect();
        let second = IndexBuilder::new(&s1, &schema()).build(&more, None).unwrap();
        for a in second.assignments.iter().filter(|a| a.cube == root) {
            assert!(a.weight < threshold);
        }
    }

    #[test]
    fn ties_follow_input_order() {
        let s = status(1);
        let dup = vec![vec![Value::Int64(5), Value::Int64(5)]; 3];
        let c = IndexBuilder::new(&s, &schema()).build(&dup, None).unwrap();
        let root_rows: Vec<usize> = c.assignments.iter()
            .filter(|a| a.cube.is_root()).map(|a| a.row).collect();
        assert_eq!(root_rows, vec![0]);
    }

    #[test]
    fn announced_cube_propagates_new_rows() {
        let root = CubeId::root(2);
        let s = status(1000).with_announced([root.clone()]);
        let c = IndexBuilder::new(&s, &schema()).build(&rows(5), None).unwrap();
        assert_eq!(c.assignments.iter().filter(|a| a.replicated).count(), 5);
        assert!(c.assignments.iter().filter(|a| a.replicated).all(|a| a.cube.parent() == Some(root.clone())));
    }

    #[test]
    fn replicate_moves_cube_into_replicated_set() {
        let root = CubeId::root(2);
        let s = status(10).with_announced([root.clone()]);
        let input = BTreeMap::from([(root.clone(), rows(4))]);
        let (c, flat) = IndexBuilder::new(&s, &schema()).replicate(&input).unwrap();
        assert_eq!(flat.len(), 4);
        assert_eq!(c.assignments.len(), 4);
        assert!(c.assignments.iter().all(|a| a.replicated && a.cube.depth() == 1));
        let after = c.with_files(&[]).updated_status;
        assert!(after.replicated_set.contains(&root) && after.announced_set.is_empty());
    }

    #[test]
    fn staging_rows_all_land_in_root() {
        let staging = IndexStatus::empty(Revision::staging(TableId::new("/tmp/b").unwrap(), &[]));
        let c = IndexBuilder::new(&staging, &schema()).build_staging(&rows(25), None);
        assert_eq!(c.assignments.len(), 25);
        assert!(c.assignments.iter().all(|a| a.cube.is_root() && !a.replicated));
        assert_eq!(c.cube_max_weight(&CubeId::root(0)), Weight::MAX);
    }

    #[test]
    fn delta_merge_is_commutative_and_associative() {
        let s = status(5);
        let sch = schema();
        let b = IndexBuilder::new(&s, &sch);
        let parts: Vec<_> = [0i64, 100, 200].iter()
            .map(|&o| b.build(&rows(20).into_iter().map(|mut r| { r[0] = Value::Int64(o); r }).collect::<Vec<_>>(), None)
                .unwrap().cube_deltas)
            .collect();
        let ab_c = merge_deltas(&merge_deltas(&parts[0], &parts[1]), &parts[2]);
        let a_bc = merge_deltas(&parts[0], &merge_deltas(&parts[1], &parts[2]));
        let ba_c = merge_deltas(&merge_deltas(&parts[1], &parts[0]), &parts[2]);
        assert_eq!(ab_c, a_bc);
        assert_eq!(ab_c, ba_c);
        let total: u64 = ab_c.values().map(|d| d.element_count).sum();
        assert_eq!(total, 60);
    }
}
