//! 行权重与权重区间
//!
//! 权重由行内容的稳定哈希（xxh3）确定，同时驱动采样与 cube 填充度统计。

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;
use crate::field_type::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Weight(pub i32);

impl Weight {
    pub const MIN: Weight = Weight(i32::MIN);
    pub const MAX: Weight = Weight(i32::MAX);

    const SPAN: f64 = (i32::MAX as f64) - (i32::MIN as f64);

    /// 按行中被索引列的值计算权重
    pub fn of_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut hasher = Xxh3::new();
        for v in values {
            let key = v.to_sort_key();
            hasher.update(&(key.len() as u32).to_le_bytes());
            hasher.update(&key);
        }
        Self::from_hash(hasher.digest())
    }

    pub fn from_hash(h: u64) -> Self {
        Weight(((h >> 32) as u32 as i64 + i32::MIN as i64) as i32)
    }

    /// 归一化到 [0,1]
    pub fn fraction(self) -> f64 {
        (self.0 as f64 - i32::MIN as f64) / Self::SPAN
    }

    pub fn from_fraction(p: f64) -> Self {
        let p = p.clamp(0.0, 1.0);
        Weight((i32::MIN as f64 + p * Self::SPAN).round() as i32)
    }
}

impl std::fmt::Display for Weight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

// ── 权重区间 ──────────────────────────────────────────────────────────────────

/// 闭区间 [from, to]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightRange {
    pub from: Weight,
    pub to:   Weight,
}

impl WeightRange {
    pub fn new(from: Weight, to: Weight) -> Self { Self { from, to } }

    pub fn all() -> Self { Self::new(Weight::MIN, Weight::MAX) }

    /// 采样比例 p 对应的区间；p <= 0 时为空区间
    pub fn sample(p: f64) -> Self {
        if p <= 0.0 { return Self::empty(); }
        Self::new(Weight::MIN, Weight::from_fraction(p))
    }

    pub fn empty() -> Self { Self::new(Weight::MAX, Weight::MIN) }

    pub fn is_empty(&self) -> bool { self.from > self.to }

    pub fn contains(&self, w: Weight) -> bool { self.from <= w && w <= self.to }

    pub fn intersects(&self, lo: Weight, hi: Weight) -> bool {
        !self.is_empty() && lo <= self.to && hi >= self.from
    }

    pub fn intersect(&self, other: &Self) -> Self {
        Self::new(self.from.max(other.from), self.to.min(other.to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_is_deterministic() {
        let row = [Value::Int64(42), Value::str("x")];
        assert_eq!(Weight::of_values(&row), Weight::of_values(&row));
        assert_ne!(Weight::of_values(&row), Weight::of_values(&[Value::Int64(43), Value::str("x")]));
    }

    #[test]
    fn fraction_bounds() {
        assert_eq!(Weight::MIN.fraction(), 0.0);
        assert_eq!(Weight::MAX.fraction(), 1.0);
        assert_eq!(Weight::from_fraction(1.0), Weight::MAX);
        assert_eq!(Weight::from_fraction(0.0), Weight::MIN);
    }

    #[test]
    fn sample_ranges() {
        assert!(WeightRange::sample(0.0).is_empty());
        assert_eq!(WeightRange::sample(1.0), WeightRange::all());
        let half = WeightRange::sample(0.5);
        assert!(half.contains(Weight(-1)));
        assert!(!half.contains(Weight(i32::MAX / 2)));
        assert!(!WeightRange::empty().intersects(Weight::MIN, Weight::MAX));
    }
}
