//! 列值的运行时表示

use std::cmp::Ordering;
use serde::{Deserialize, Serialize};

/// 列值（运行时表示）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    /// 日期存储为 i32（天数）
    Date(i32),
    /// 变长字节（Varchar / String）
    Bytes(Vec<u8>),
}

/// 一行数据，列顺序与 `TableSchema::columns` 一致
pub type Row = Vec<Value>;

impl Value {
    pub fn str(s: &str) -> Self { Self::Bytes(s.as_bytes().to_vec()) }

    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v)  => Some(*v as i64),
            Self::Int16(v) => Some(*v as i64),
            Self::Int32(v) => Some(*v as i64),
            Self::Int64(v) => Some(*v),
            Self::Date(v)  => Some(*v as i64),
            _ => None,
        }
    }

    /// 数值类值转为 f64；字符串与 NULL 返回 None
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            other            => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self { Self::Bytes(b) => Some(b), _ => None }
    }

    /// 稳定的字节编码，用于权重哈希与 Hashing 变换。
    /// 数值统一按 f64 位模式编码，使 Int32(3) 与 Int64(3) 得到相同结果；
    /// 相等比较成立的值编码相同（-0.0 与 0.0，各种 NaN）。
    pub fn to_sort_key(&self) -> Vec<u8> {
        match self {
            Self::Null     => vec![0],
            Self::Bytes(b) => {
                let mut out = Vec::with_capacity(b.len() + 1);
                out.push(2);
                out.extend_from_slice(b);
                out
            }
            num => {
                let f = canonical(num.as_f64().unwrap_or_default());
                let mut out = Vec::with_capacity(9);
                out.push(1);
                out.extend_from_slice(&f.to_bits().to_be_bytes());
                out
            }
        }
    }

    /// 全序比较：NULL 最小，数值之间按大小，数值小于字符串
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null)         => Ordering::Equal,
            (Self::Null, _)                  => Ordering::Less,
            (_, Self::Null)                  => Ordering::Greater,
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Bytes(_), _)              => Ordering::Greater,
            (_, Self::Bytes(_))              => Ordering::Less,
            (a, b) => canonical(a.as_f64().unwrap_or_default())
                .total_cmp(&canonical(b.as_f64().unwrap_or_default())),
        }
    }
}

fn canonical(f: f64) -> f64 {
    if f == 0.0 { 0.0 } else if f.is_nan() { f64::NAN } else { f }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null       => write!(f, "NULL"),
            Self::Int8(v)    => write!(f, "{v}"),
            Self::Int16(v)   => write!(f, "{v}"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Date(v)    => write!(f, "date({v})"),
            Self::Bytes(b)   => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}
