//! 目录分区过滤
//!
//! 文件按分区键值（如 `dt=2024-01-01`）组织；宿主引擎的分区过滤在
//! 文件级以三值逻辑求值，无法判断时保留文件。

use std::cmp::Ordering;
use std::collections::BTreeMap;
use crate::field_type::Value;
use crate::meta::IndexFile;
use crate::query::{CmpOp, Expr};

/// Hive 风格的 NULL 分区值
pub const DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

fn partition_value<'a>(values: &'a BTreeMap<String, String>, column: &str) -> Option<Option<&'a str>> {
    values.get(column).map(|v| if v == DEFAULT_PARTITION { None } else { Some(v.as_str()) })
}

/// 分区字符串与字面量比较：字面量为数值时按数值比较
fn compare(raw: &str, literal: &Value) -> Option<Ordering> {
    match literal.as_f64() {
        Some(x) => raw.parse::<f64>().ok().and_then(|p| p.partial_cmp(&x)),
        None => literal.as_bytes().map(|b| raw.as_bytes().cmp(b)),
    }
}

fn apply(op: CmpOp, ord: Ordering) -> bool {
    match op {
        CmpOp::Eq    => ord.is_eq(),
        CmpOp::NotEq => ord.is_ne(),
        CmpOp::Lt    => ord.is_lt(),
        CmpOp::LtEq  => ord.is_le(),
        CmpOp::Gt    => ord.is_gt(),
        CmpOp::GtEq  => ord.is_ge(),
    }
}

/// 三值求值；None 表示无法判断
pub fn evaluate(expr: &Expr, values: &BTreeMap<String, String>) -> Option<bool> {
    match expr {
        Expr::Compare { op, left, right } => {
            let (column, literal, op) = match (left.as_ref(), right.as_ref()) {
                (Expr::Column(c), Expr::Literal(v)) => (c, v, *op),
                (Expr::Literal(v), Expr::Column(c)) => (c, v, op.flip()),
                _ => return None,
            };
            match partition_value(values, column)? {
                None => Some(false),
                Some(raw) => compare(raw, literal).map(|o| apply(op, o)),
            }
        }
        Expr::In { expr, list } => match expr.as_ref() {
            Expr::Column(c) => match partition_value(values, c)? {
                None => Some(false),
                Some(raw) => {
                    let hits: Vec<Option<bool>> = list.iter()
                        .map(|v| compare(raw, v).map(Ordering::is_eq))
                        .collect();
                    if hits.contains(&Some(true)) { Some(true) }
                    else if hits.iter().all(Option::is_some) { Some(false) }
                    else { None }
                }
            },
            _ => None,
        },
        Expr::IsNull(inner) => match inner.as_ref() {
            Expr::Column(c) => partition_value(values, c).map(|v| v.is_none()),
            _ => None,
        },
        Expr::And(a, b) => match (evaluate(a, values), evaluate(b, values)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Expr::Or(a, b) => match (evaluate(a, values), evaluate(b, values)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        Expr::Not(inner) => evaluate(inner, values).map(|b| !b),
        Expr::Literal(Value::Null) => None,
        _ => None,
    }
}

/// 文件是否可能满足所有分区过滤
pub fn file_matches(file: &IndexFile, filters: &[Expr]) -> bool {
    filters.iter().all(|f| evaluate(f, &file.partition_values) != Some(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{col, lit};

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn string_and_numeric_comparisons() {
        let v = values(&[("dt", "2024-03-01"), ("hour", "7")]);
        assert_eq!(evaluate(&col("dt").eq(lit(Value::str("2024-03-01"))), &v), Some(true));
        assert_eq!(evaluate(&col("dt").lt(lit(Value::str("2024-01-01"))), &v), Some(false));
        assert_eq!(evaluate(&lit(Value::Int64(10)).gt(col("hour")), &v), Some(true));
        assert_eq!(evaluate(&col("hour").in_list(vec![Value::Int64(1), Value::Int64(7)]), &v), Some(true));
    }

    #[test]
    fn unknown_columns_are_kept() {
        let v = values(&[("dt", "2024-03-01")]);
        assert_eq!(evaluate(&col("region").eq(lit(Value::str("eu"))), &v), None);
        let f = col("region").eq(lit(Value::str("eu"))).and(col("dt").eq(lit(Value::str("x"))));
        assert_eq!(evaluate(&f, &v), Some(false));
        let g = col("region").eq(lit(Value::str("eu"))).or(col("dt").eq(lit(Value::str("x"))));
        assert_eq!(evaluate(&g, &v), None);
    }

    #[test]
    fn hive_default_partition_is_null() {
        let v = values(&[("dt", DEFAULT_PARTITION)]);
        assert_eq!(evaluate(&col("dt").is_null(), &v), Some(true));
        assert_eq!(evaluate(&col("dt").eq(lit(Value::str("a"))), &v), Some(false));
    }
}
