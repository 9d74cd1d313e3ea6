//! Cube 寻址
//!
//! CubeId 是 d 维归一化空间中一个超矩形的计算值：
//! 深度 0 为整个空间 [0,1]^d，每下降一层各维二分，分支因子 2^d。
//! 以每维的整数格坐标表示，父子关系通过移位计算，不持有任何引用。
//!
//! ```text
//!   depth 0      depth 1 (d=2)
//! ┌─────────┐   ┌────┬────┐
//! │         │   │ 01 │ 11 │
//! │  root   │ → ├────┼────┤
//! │         │   │ 00 │ 10 │
//! └─────────┘   └────┴────┘
//! ```

use std::cmp::Ordering;
use serde::{Deserialize, Serialize};
use crate::common::{OTreeError, Result};

pub const MAX_DEPTH: u8 = 60;
pub const MAX_DIMENSIONS: usize = 16;

const ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// 归一化空间中的点，每维取值 [0,1]
pub type Point = Vec<f64>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CubeId {
    dimensions: u8,
    depth:      u8,
    /// 每维在本层的格坐标，取值 [0, 2^depth)
    coords:     Vec<u64>,
}

impl CubeId {
    pub fn root(dimensions: usize) -> Self {
        Self { dimensions: dimensions as u8, depth: 0, coords: vec![0; dimensions] }
    }

    /// 深度 `depth` 上包含 `point` 的唯一 cube；坐标 1.0 归入最上一格
    pub fn container(point: &[f64], depth: u8) -> Self {
        let cells = 1u64 << depth;
        let coords = point.iter()
            .map(|&x| {
                let x = if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) };
                ((x * cells as f64) as u64).min(cells - 1)
            })
            .collect();
        Self { dimensions: point.len() as u8, depth, coords }
    }

    pub fn dimensions(&self) -> usize { self.dimensions as usize }
    pub fn depth(&self) -> u8 { self.depth }
    pub fn is_root(&self) -> bool { self.depth == 0 }

    pub fn parent(&self) -> Option<CubeId> {
        if self.depth == 0 { return None; }
        Some(Self {
            dimensions: self.dimensions,
            depth:      self.depth - 1,
            coords:     self.coords.iter().map(|c| c >> 1).collect(),
        })
    }

    /// 按先序（深度优先）顺序枚举 2^d 个子 cube
    pub fn children(&self) -> impl Iterator<Item = CubeId> + '_ {
        let d = self.dimensions();
        let n = if d == 0 || self.depth >= MAX_DEPTH { 0u64 } else { 1u64 << d };
        (0..n).map(move |mask| {
            let coords = self.coords.iter().enumerate()
                .map(|(i, c)| (c << 1) | ((mask >> (d - 1 - i)) & 1))
                .collect();
            Self { dimensions: self.dimensions, depth: self.depth + 1, coords }
        })
    }

    /// 包含 `point` 的直接子 cube
    pub fn child_containing(&self, point: &[f64]) -> CubeId {
        Self::container(point, self.depth + 1)
    }

    pub fn contains_point(&self, point: &[f64]) -> bool {
        point.len() == self.dimensions() && Self::container(point, self.depth) == *self
    }

    pub fn is_ancestor_of(&self, other: &CubeId) -> bool {
        if self.dimensions != other.dimensions || self.depth >= other.depth {
            return false;
        }
        let shift = other.depth - self.depth;
        self.coords.iter().zip(&other.coords).all(|(a, b)| *a == b >> shift)
    }

    /// 第 `dim` 维的区间 [from, to)；最上一格的 to 为 1.0 且包含端点
    pub fn bounds(&self, dim: usize) -> (f64, f64) {
        let cells = (1u64 << self.depth) as f64;
        let c = self.coords[dim] as f64;
        (c / cells, (c + 1.0) / cells)
    }

    pub fn is_upper_edge(&self, dim: usize) -> bool {
        self.coords[dim] + 1 == 1u64 << self.depth
    }

    /// 第 `level` 层（0 为根下第一层）的子序号
    fn child_index_at(&self, level: u8) -> u64 {
        let shift = self.depth - 1 - level;
        self.coords.iter().fold(0u64, |acc, c| (acc << 1) | ((c >> shift) & 1))
    }

    // ── 字符串编码 ────────────────────────────────────────────────────────────

    fn chars_per_level(dimensions: usize) -> usize { dimensions.div_ceil(6).max(1) }

    /// 路径编码：每层的子序号按 6 bit 一组映射到 base64 字母表，根为空串
    pub fn to_path_string(&self) -> String {
        let cpl = Self::chars_per_level(self.dimensions());
        let mut out = String::with_capacity(self.depth as usize * cpl);
        for level in 0..self.depth {
            let idx = self.child_index_at(level);
            for k in (0..cpl).rev() {
                out.push(ALPHABET[((idx >> (6 * k)) & 63) as usize] as char);
            }
        }
        out
    }

    pub fn from_path_string(dimensions: usize, path: &str) -> Result<Self> {
        let cpl = Self::chars_per_level(dimensions);
        let bad = || OTreeError::CorruptMetadata(format!("invalid cube path {path:?}"));
        if dimensions == 0 {
            return if path.is_empty() { Ok(Self::root(0)) } else { Err(bad()) };
        }
        if dimensions > MAX_DIMENSIONS || path.len() % cpl != 0 || path.len() / cpl > MAX_DEPTH as usize {
            return Err(bad());
        }
        let mut cube = Self::root(dimensions);
        for chunk in path.as_bytes().chunks(cpl) {
            let mut idx = 0u64;
            for &ch in chunk {
                let v = ALPHABET.iter().position(|&a| a == ch).ok_or_else(bad)?;
                idx = (idx << 6) | v as u64;
            }
            if idx >= 1u64 << dimensions { return Err(bad()); }
            let next = cube.children().nth(idx as usize).ok_or_else(bad)?;
            cube = next;
        }
        Ok(cube)
    }
}

/// 先序：祖先排在后代之前，兄弟按子序号排列
impl Ord for CubeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dimensions.cmp(&other.dimensions).then_with(|| {
            let common = self.depth.min(other.depth);
            (0..common)
                .map(|l| self.child_index_at(l).cmp(&other.child_index_at(l)))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| self.depth.cmp(&other.depth))
        })
    }
}

impl PartialOrd for CubeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl std::fmt::Display for CubeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.depth == 0 { f.write_str("<root>") } else { f.write_str(&self.to_path_string()) }
    }
}
