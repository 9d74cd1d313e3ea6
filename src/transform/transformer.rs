//! 列变换器（修订中的每列配置）与列统计

use serde::{Deserialize, Serialize};
use crate::common::{ColumnType, OTreeError, Result};
use crate::field_type::{Row, Value};
use crate::meta::ColumnSchema;
use super::Transformation;

/// 由数据推导字符串直方图时的最大边界数
pub const MAX_HISTOGRAM_BOUNDS: usize = 100;

// ── 列统计 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnStats {
    pub min:       Option<Value>,
    pub max:       Option<Value>,
    pub histogram: Option<Vec<String>>,
}

impl ColumnStats {
    /// 扫描一批行中第 `idx` 列，忽略 NULL
    pub fn from_rows(rows: &[Row], idx: usize) -> Self {
        let mut stats = Self::default();
        let mut strings: Vec<&[u8]> = Vec::new();
        for v in rows.iter().filter_map(|r| r.get(idx)).filter(|v| !v.is_null()) {
            if stats.min.as_ref().map_or(true, |m| v.total_cmp(m).is_lt()) {
                stats.min = Some(v.clone());
            }
            if stats.max.as_ref().map_or(true, |m| v.total_cmp(m).is_gt()) {
                stats.max = Some(v.clone());
            }
            if let Some(b) = v.as_bytes() { strings.push(b); }
        }
        if !strings.is_empty() {
            strings.sort_unstable();
            strings.dedup();
            let step = strings.len().div_ceil(MAX_HISTOGRAM_BOUNDS);
            let bounds = strings.iter()
                .step_by(step)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .collect();
            stats.histogram = Some(bounds);
        }
        stats
    }

    /// 读取 `columnStats` 选项中 `<col>_min` / `<col>_max` / `<col>_histogram`
    pub fn from_json(json: &serde_json::Value, column: &str) -> Result<Self> {
        let field = |suffix: &str| json.get(format!("{column}_{suffix}"));
        let scalar = |suffix: &str| -> Result<Option<Value>> {
            match field(suffix) {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(serde_json::Value::Number(n)) => Ok(n.as_f64().map(Value::Float64)),
                Some(serde_json::Value::String(s)) => Ok(Some(Value::str(s))),
                Some(other) => Err(OTreeError::invalid_option(
                    "columnStats", format!("{column}_{suffix}: unexpected {other}"))),
            }
        };
        let histogram = match field("histogram") {
            None => None,
            Some(h) => {
                let mut bounds: Vec<String> = serde_json::from_value(h.clone())
                    .map_err(|e| OTreeError::invalid_option("columnStats", e.to_string()))?;
                bounds.sort();
                Some(bounds)
            }
        };
        Ok(Self { min: scalar("min")?, max: scalar("max")?, histogram })
    }

    /// 两份统计的并集；`other` 中缺失的字段不覆盖
    pub fn union(&self, other: &ColumnStats) -> ColumnStats {
        let pick = |a: &Option<Value>, b: &Option<Value>, take_lower: bool| match (a, b) {
            (Some(x), Some(y)) => {
                let lower = x.total_cmp(y).is_le();
                Some(if lower == take_lower { x.clone() } else { y.clone() })
            }
            (x, None) => x.clone(),
            (None, y) => y.clone(),
        };
        ColumnStats {
            min:       pick(&self.min, &other.min, true),
            max:       pick(&self.max, &other.max, false),
            histogram: other.histogram.clone().or_else(|| self.histogram.clone()),
        }
    }
}

// ── 变换器 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transformer {
    Linear          { column: String, column_type: ColumnType },
    Hashing         { column: String },
    StringHistogram { column: String },
    Empty           { column: String },
}

impl Transformer {
    /// 由 `columnsToIndex` 中的 `name[:kind]` 构建；未指定 kind 时按列类型选择
    pub fn from_spec(column: &ColumnSchema, kind: Option<&str>) -> Result<Self> {
        let name = column.name.clone();
        match kind {
            None if column.column_type.is_numeric() =>
                Ok(Self::Linear { column: name, column_type: column.column_type }),
            None | Some("hashing") => Ok(Self::Hashing { column: name }),
            Some("linear") if column.column_type.is_numeric() =>
                Ok(Self::Linear { column: name, column_type: column.column_type }),
            Some("linear") => Err(OTreeError::invalid_option(
                "columnsToIndex", format!("{name}: linear requires a numeric column"))),
            Some("histogram") => Ok(Self::StringHistogram { column: name }),
            Some(other) => Err(OTreeError::invalid_option(
                "columnsToIndex", format!("{name}: unknown transformer {other:?}"))),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Linear { column, .. }
            | Self::Hashing { column }
            | Self::StringHistogram { column }
            | Self::Empty { column } => column,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Linear { .. }          => "linear",
            Self::Hashing { .. }         => "hashing",
            Self::StringHistogram { .. } => "histogram",
            Self::Empty { .. }           => "empty",
        }
    }

    /// 根据列统计生成变换；没有可用统计时返回 Empty
    pub fn make_transformation(&self, stats: &ColumnStats) -> Transformation {
        match self {
            Self::Empty { .. }   => Transformation::Empty,
            Self::Hashing { .. } => Transformation::Hashing,
            Self::Linear { .. } => {
                let lo = stats.min.as_ref().and_then(Value::as_f64);
                let hi = stats.max.as_ref().and_then(Value::as_f64);
                match (lo, hi) {
                    (Some(lo), Some(hi)) if lo == hi => Transformation::Identity { value: lo },
                    (Some(lo), Some(hi)) if lo < hi  => Transformation::Linear { min: lo, max: hi },
                    _ => Transformation::Empty,
                }
            }
            Self::StringHistogram { .. } => match &stats.histogram {
                Some(bounds) if !bounds.is_empty() =>
                    Transformation::StringHistogram { bounds: bounds.clone() },
                _ => Transformation::Empty,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_kind_follows_column_type() {
        let num = ColumnSchema::new("price", ColumnType::Float64);
        let txt = ColumnSchema::new("city", ColumnType::Varchar);
        assert_eq!(Transformer::from_spec(&num, None).unwrap().kind(), "linear");
        assert_eq!(Transformer::from_spec(&txt, None).unwrap().kind(), "hashing");
        assert_eq!(Transformer::from_spec(&txt, Some("histogram")).unwrap().kind(), "histogram");
        assert!(Transformer::from_spec(&txt, Some("linear")).is_err());
        assert!(Transformer::from_spec(&num, Some("zorder")).is_err());
    }

    #[test]
    fn stats_from_rows_skip_nulls() {
        let rows = vec![
            vec![Value::Int64(5)], vec![Value::Null], vec![Value::Int64(-3)], vec![Value::Int64(9)],
        ];
        let s = ColumnStats::from_rows(&rows, 0);
        assert_eq!(s.min, Some(Value::Int64(-3)));
        assert_eq!(s.max, Some(Value::Int64(9)));
        let t = Transformer::Linear { column: "a".into(), column_type: ColumnType::Int64 };
        assert_eq!(t.make_transformation(&s), Transformation::Linear { min: -3.0, max: 9.0 });
        assert_eq!(t.make_transformation(&ColumnStats::default()), Transformation::Empty);
    }

    #[test]
    fn stats_from_json_option() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a_min": 0, "a_max": 50, "b_histogram": ["z", "m"]}"#).unwrap();
        let a = ColumnStats::from_json(&json, "a").unwrap();
        assert_eq!(a.max, Some(Value::Float64(50.0)));
        let b = ColumnStats::from_json(&json, "b").unwrap();
        assert_eq!(b.histogram, Some(vec!["m".to_string(), "z".to_string()]));
        let bad: serde_json::Value = serde_json::from_str(r#"{"a_min": [1]}"#).unwrap();
        assert!(ColumnStats::from_json(&bad, "a").is_err());
    }

    #[test]
    fn histogram_is_capped() {
        let rows: Vec<Row> = (0..1000).map(|i| vec![Value::str(&format!("k{i:04}"))]).collect();
        let s = ColumnStats::from_rows(&rows, 0);
        assert!(s.histogram.unwrap().len() <= MAX_HISTOGRAM_BOUNDS);
    }
}
