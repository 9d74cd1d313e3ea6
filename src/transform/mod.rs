//! 列归一化变换
//!
//! 每个被索引列把原始值映射到 [0,1]：
//! - **Empty**           — staging 修订使用，恒为 0，任何非空变换都可取代它
//! - **Identity**        — 值域退化（min == max），恒为 0
//! - **Linear**          — 有序数值线性缩放，单调
//! - **Hashing**         — xxh3 哈希后缩放，仅支持等值裁剪
//! - **StringHistogram** — 字符串在有序分位边界中的位置，单调
//!
//! 序列化使用显式的 `type` 判别字段。

mod transformer;

pub use transformer::{ColumnStats, Transformer, MAX_HISTOGRAM_BOUNDS};

use serde::{Deserialize, Serialize};
use crate::field_type::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
    Empty,
    Identity { value: f64 },
    Linear { min: f64, max: f64 },
    Hashing,
    StringHistogram { bounds: Vec<String> },
}

impl Transformation {
    /// 数值域 [lo, hi]；非数值变换返回 None
    fn numeric_domain(&self) -> Option<(f64, f64)> {
        match self {
            Self::Identity { value }   => Some((*value, *value)),
            Self::Linear { min, max }  => Some((*min, *max)),
            _ => None,
        }
    }

    fn from_domain(lo: f64, hi: f64) -> Self {
        if lo == hi { Self::Identity { value: lo } } else { Self::Linear { min: lo, max: hi } }
    }

    /// 将值映射到 [0,1]；NULL 映射为 0
    pub fn transform(&self, value: &Value) -> f64 {
        if value.is_null() { return 0.0; }
        match self {
            Self::Empty | Self::Identity { .. } => 0.0,
            Self::Linear { min, max } => match value.as_f64() {
                Some(x) if x.is_finite() && max > min => ((x - min) / (max - min)).clamp(0.0, 1.0),
                _ => 0.0,
            },
            Self::Hashing => {
                let h = xxhash_rust::xxh3::xxh3_64(&value.to_sort_key());
                (h >> 11) as f64 / (1u64 << 53) as f64
            }
            Self::StringHistogram { bounds } => {
                if bounds.is_empty() { return 0.0; }
                let owned;
                let key: &[u8] = match value.as_bytes() {
                    Some(b) => b,
                    None => { owned = value.to_string(); owned.as_bytes() }
                };
                let idx = bounds.partition_point(|b| b.as_bytes() < key);
                idx as f64 / bounds.len() as f64
            }
        }
    }

    /// 能否用于范围裁剪（映射单调）
    pub fn is_order_preserving(&self) -> bool {
        matches!(self, Self::Linear { .. } | Self::StringHistogram { .. })
    }

    /// `other` 的数据是否超出了 `self` 的值域
    pub fn is_superseded_by(&self, other: &Transformation) -> bool {
        match (self, other) {
            (Self::Empty, Self::Empty) => false,
            (Self::Empty, _)           => true,
            (Self::StringHistogram { bounds }, Self::StringHistogram { bounds: new }) =>
                !new.is_empty() && new != bounds,
            (a, b) => match (a.numeric_domain(), b.numeric_domain()) {
                (Some((lo, hi)), Some((new_lo, new_hi))) => new_lo < lo || new_hi > hi,
                _ => false,
            },
        }
    }

    /// 合并：数值域取并集，其余情况优先取代者
    pub fn merge(&self, other: &Transformation) -> Transformation {
        match (self, other) {
            (Self::Empty, _) => other.clone(),
            (_, Self::Empty) => self.clone(),
            (a, b) => match (a.numeric_domain(), b.numeric_domain()) {
                (Some((lo, hi)), Some((new_lo, new_hi))) =>
                    Self::from_domain(lo.min(new_lo), hi.max(new_hi)),
                _ if a.is_superseded_by(b) => b.clone(),
                _ => a.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_is_monotonic_and_clamped() {
        let t = Transformation::Linear { min: 0.0, max: 100.0 };
        assert_eq!(t.transform(&Value::Int64(50)), 0.5);
        assert_eq!(t.transform(&Value::Int64(-10)), 0.0);
        assert_eq!(t.transform(&Value::Int64(1000)), 1.0);
        assert!(t.transform(&Value::Int32(10)) < t.transform(&Value::Float64(10.5)));
    }

    #[test]
    fn superseded_only_when_domain_grows() {
        let t = Transformation::Linear { min: 0.0, max: 10.0 };
        assert!(!t.is_superseded_by(&t));
        assert!(!t.is_superseded_by(&Transformation::Linear { min: 2.0, max: 5.0 }));
        assert!(t.is_superseded_by(&Transformation::Linear { min: -1.0, max: 5.0 }));
        assert!(t.is_superseded_by(&Transformation::Identity { value: 11.0 }));
        assert!(Transformation::Empty.is_superseded_by(&t));
        assert!(!Transformation::Hashing.is_superseded_by(&Transformation::Hashing));
    }

    #[test]
    fn merge_widens_and_is_idempotent() {
        let a = Transformation::Linear { min: 0.0, max: 10.0 };
        let b = Transformation::Linear { min: 5.0, max: 20.0 };
        assert_eq!(a.merge(&b), Transformation::Linear { min: 0.0, max: 20.0 });
        assert_eq!(a.merge(&a), a);
        let id = Transformation::Identity { value: 3.0 };
        assert_eq!(id.merge(&id), id);
        assert_eq!(Transformation::Empty.merge(&a), a);
    }

    #[test]
    fn histogram_positions() {
        let t = Transformation::StringHistogram { bounds: vec!["b".into(), "d".into(), "f".into()] };
        assert_eq!(t.transform(&Value::str("a")), 0.0);
        assert!(t.transform(&Value::str("c")) < t.transform(&Value::str("e")));
        assert_eq!(t.transform(&Value::str("z")), 1.0);
        assert!(t.is_superseded_by(&Transformation::StringHistogram { bounds: vec!["a".into()] }));
    }

    #[test]
    fn hashing_treats_equal_floats_alike() {
        let t = Transformation::Hashing;
        assert_eq!(t.transform(&Value::Float64(-0.0)), t.transform(&Value::Float64(0.0)));
        assert_eq!(t.transform(&Value::Float32(-0.0)), t.transform(&Value::Int64(0)));
        assert_eq!(t.transform(&Value::Float64(-f64::NAN)), t.transform(&Value::Float64(f64::NAN)));
        assert_ne!(t.transform(&Value::Float64(0.0)), t.transform(&Value::Float64(1.0)));
    }

    #[test]
    fn serde_uses_type_tag() {
        let t = Transformation::Linear { min: 1.0, max: 2.0 };
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"type\":\"linear\""));
        assert_eq!(serde_json::from_str::<Transformation>(&json).unwrap(), t);
    }
}
