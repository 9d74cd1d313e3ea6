//! 索引状态模型
//!
//! 每个修订一份不可变的 `IndexStatus`：
//! - **cubes**          — CubeId → CubeStatus（有序映射，先序遍历即深度优先）
//! - **replicated_set** — 已把数据传播到子 cube 的 cube
//! - **announced_set**  — 已宣告、等待复制的 cube
//!
//! 所有更新都返回新值；cube 映射以 `Arc` 共享，修改时写时复制。

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use crate::cube::CubeId;
use crate::meta::{Block, IndexFile};
use crate::revision::Revision;
use crate::weight::Weight;

// ── Cube 状态 ─────────────────────────────────────────────────────────────────

/// cube 拥有的某个文件中的一段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRef {
    pub file:          String,
    pub min_weight:    Weight,
    pub max_weight:    Weight,
    pub element_count: u64,
    pub replicated:    bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeStatus {
    pub cube_id:           CubeId,
    /// 下降阈值：后代 cube 中的行权重都不小于它；未满时为 Weight::MAX
    pub max_weight:        Weight,
    /// 分配给本 cube 的行数（不含传播副本）
    pub element_count:     u64,
    /// desired_cube_size / element_count；<= 1 表示已满
    pub normalized_weight: f64,
    pub blocks:            Vec<BlockRef>,
}

impl CubeStatus {
    fn empty(cube_id: CubeId) -> Self {
        Self {
            cube_id, max_weight: Weight::MAX,
            element_count: 0, normalized_weight: 0.0, blocks: vec![],
        }
    }

    fn add_block(&mut self, file: &str, block: &Block) {
        if !block.replicated {
            self.element_count += block.element_count;
            self.max_weight = self.max_weight.min(block.cube_max_weight);
        }
        self.blocks.push(BlockRef {
            file:          file.into(),
            min_weight:    block.min_weight,
            max_weight:    block.max_weight,
            element_count: block.element_count,
            replicated:    block.replicated,
        });
    }

    fn refresh(&mut self, desired_cube_size: u64) {
        self.normalized_weight = desired_cube_size as f64 / self.element_count.max(1) as f64;
    }

    pub fn is_flooded(&self) -> bool { self.normalized_weight <= 1.0 }

    pub fn files(&self) -> BTreeSet<&str> {
        self.blocks.iter().map(|b| b.file.as_str()).collect()
    }

    pub fn own_blocks(&self) -> impl Iterator<Item = &BlockRef> {
        self.blocks.iter().filter(|b| !b.replicated)
    }
}

// ── IndexStatus ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct IndexStatus {
    pub revision:       Revision,
    pub replicated_set: BTreeSet<CubeId>,
    pub announced_set:  BTreeSet<CubeId>,
    cubes:              Arc<BTreeMap<CubeId, CubeStatus>>,
}

impl IndexStatus {
    pub fn empty(revision: Revision) -> Self {
        Self {
            revision,
            replicated_set: BTreeSet::new(),
            announced_set:  BTreeSet::new(),
            cubes:          Arc::new(BTreeMap::new()),
        }
    }

    /// 由日志中的文件标签重建
    pub fn from_files(
        revision:       Revision,
        files:          &[IndexFile],
        replicated_set: BTreeSet<CubeId>,
        announced_set:  BTreeSet<CubeId>,
    ) -> Self {
        let status = Self { replicated_set, announced_set, ..Self::empty(revision) };
        status.with_files(files)
    }

    pub fn cube(&self, cube: &CubeId) -> Option<&CubeStatus> { self.cubes.get(cube) }

    pub fn cubes(&self) -> impl Iterator<Item = &CubeStatus> { self.cubes.values() }

    pub fn len(&self) -> usize { self.cubes.len() }

    pub fn is_empty(&self) -> bool { self.cubes.is_empty() }

    /// 不存在的 cube 视为未满
    pub fn max_weight(&self, cube: &CubeId) -> Weight {
        self.cubes.get(cube).map_or(Weight::MAX, |c| c.max_weight)
    }

    pub fn element_count(&self, cube: &CubeId) -> u64 {
        self.cubes.get(cube).map_or(0, |c| c.element_count)
    }

    /// 宣告或已复制的 cube：新写入的行需要同时传播到子 cube
    pub fn is_propagating(&self, cube: &CubeId) -> bool {
        self.announced_set.contains(cube) || self.replicated_set.contains(cube)
    }

    pub fn all_files(&self) -> BTreeSet<String> {
        self.cubes.values()
            .flat_map(|c| c.blocks.iter().map(|b| b.file.clone()))
            .collect()
    }

    // ── 函数式更新 ────────────────────────────────────────────────────────────

    pub fn with_revision(&self, revision: Revision) -> Self {
        let mut next = self.clone();
        next.revision = revision;
        next.refresh_all();
        next
    }

    pub fn with_announced(&self, cubes: impl IntoIterator<Item = CubeId>) -> Self {
        let mut next = self.clone();
        next.announced_set.extend(cubes.into_iter().filter(|c| !self.replicated_set.contains(c)));
        next
    }

    /// 复制完成：cube 从 announced 移入 replicated
    pub fn with_replicated(&self, cubes: impl IntoIterator<Item = CubeId>) -> Self {
        let mut next = self.clone();
        for c in cubes {
            next.announced_set.remove(&c);
            next.replicated_set.insert(c);
        }
        next
    }

    pub fn with_files(&self, files: &[IndexFile]) -> Self {
        let mut next = self.clone();
        let desired = next.revision.desired_cube_size;
        let cubes = Arc::make_mut(&mut next.cubes);
        for file in files {
            for block in &file.blocks {
                cubes.entry(block.cube.clone())
                    .or_insert_with(|| CubeStatus::empty(block.cube.clone()))
                    .add_block(&file.path, block);
            }
        }
        cubes.values_mut().for_each(|c| c.refresh(desired));
        next
    }

    /// 移除文件后重新计算受影响 cube 的计数；阈值保持不变
    pub fn without_files(&self, paths: &BTreeSet<String>) -> Self {
        let mut next = self.clone();
        let desired = next.revision.desired_cube_size;
        let cubes = Arc::make_mut(&mut next.cubes);
        for status in cubes.values_mut() {
            if status.blocks.iter().any(|b| paths.contains(&b.file)) {
                status.blocks.retain(|b| !paths.contains(&b.file));
                status.element_count = status.own_blocks().map(|b| b.element_count).sum();
                status.refresh(desired);
            }
        }
        cubes.retain(|_, c| !c.blocks.is_empty());
        next
    }

    fn refresh_all(&mut self) {
        let desired = self.revision.desired_cube_size;
        Arc::make_mut(&mut self.cubes).values_mut().for_each(|c| c.refresh(desired));
    }

    // ── 查询辅助 ──────────────────────────────────────────────────────────────

    /// 每个 cube 的所有祖先都在映射中
    pub fn is_prefix_closed(&self) -> bool {
        self.cubes.keys().all(|c| c.parent().map_or(true, |p| self.cubes.contains_key(&p)))
    }

    /// 映射中是否有 `cube` 的严格后代；先序下后代紧跟在 cube 之后
    pub fn has_descendant(&self, cube: &CubeId) -> bool {
        self.cubes.range::<CubeId, _>((Bound::Excluded(cube), Bound::Unbounded))
            .next()
            .map_or(false, |(next, _)| cube.is_ancestor_of(next))
    }

    /// 满且溢出超过 `factor` 倍、尚未宣告或复制的 cube
    pub fn overflowed_cubes(&self, factor: f64) -> Vec<CubeId> {
        let limit = self.revision.desired_cube_size as f64 * factor;
        self.cubes.values()
            .filter(|c| c.is_flooded() && c.element_count as f64 > limit)
            .filter(|c| !self.is_propagating(&c.cube_id))
            .map(|c| c.cube_id.clone())
            .collect()
    }
}
