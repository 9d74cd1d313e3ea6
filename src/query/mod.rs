//! 查询裁剪
//!
//! 1. 拆分顶层 AND，把谓词分为索引相关（被索引列与字面量比较、权重比较）与
//!    不透明（OR / NOT / 子查询 / 未知列），后者留给宿主引擎逐行求值
//! 2. 每个修订：各维由比较谓词得到闭区间 [from, to]，未约束的维取 [0,1]
//! 3. 权重谓词得到权重区间，默认全域
//! 4. 从根 cube 深度优先：区域相交的 cube 中权重相交的段即命中；
//!    cube 阈值已超过权重上界时不再下降
//!
//! staging 修订的文件只经分区过滤，不做索引裁剪。裁剪只允许假阳性。

mod expr;

pub use expr::{col, lit, weight, CmpOp, Expr};

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use crate::cube::CubeId;
use crate::field_type::Value;
use crate::index::IndexStatus;
use crate::meta::IndexFile;
use crate::partition;
use crate::revision::Revision;
use crate::snapshot::Snapshot;
use crate::transform::Transformation;
use crate::weight::{Weight, WeightRange};

// ── 查询空间 ──────────────────────────────────────────────────────────────────

/// 归一化空间中的查询区域，各维闭区间
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpace {
    pub from: Vec<f64>,
    pub to:   Vec<f64>,
}

impl QuerySpace {
    pub fn all(dimensions: usize) -> Self {
        Self { from: vec![0.0; dimensions], to: vec![1.0; dimensions] }
    }

    pub fn is_empty(&self) -> bool {
        self.from.iter().zip(&self.to).any(|(f, t)| f > t)
    }

    fn restrict(&mut self, dim: usize, from: f64, to: f64) {
        self.from[dim] = self.from[dim].max(from);
        self.to[dim]   = self.to[dim].min(to);
    }

    /// cube 区域 [cf, ct)（最上一格含 ct）与查询闭区间相交
    pub fn intersects(&self, cube: &CubeId) -> bool {
        (0..cube.dimensions()).all(|d| {
            let (cf, ct) = cube.bounds(d);
            let (qf, qt) = (self.from[d], self.to[d]);
            qt >= cf && (qf < ct || (cube.is_upper_edge(d) && qf <= ct))
        })
    }
}

// ── 谓词分类 ──────────────────────────────────────────────────────────────────

/// 字面量能否交给该变换做坐标换算
fn literal_fits(t: &Transformation, v: &Value) -> bool {
    match t {
        _ if v.is_null() => false,
        Transformation::Linear { .. } | Transformation::Identity { .. } => v.as_f64().is_some(),
        Transformation::StringHistogram { .. } => v.as_bytes().is_some(),
        Transformation::Hashing | Transformation::Empty => true,
    }
}

fn column_literal(left: &Expr, right: &Expr, op: CmpOp) -> Option<(String, Value, CmpOp)> {
    match (left, right) {
        (Expr::Column(c), Expr::Literal(v)) => Some((c.clone(), v.clone(), op)),
        (Expr::Literal(v), Expr::Column(c)) => Some((c.clone(), v.clone(), op.flip())),
        _ => None,
    }
}

fn weight_literal(left: &Expr, right: &Expr, op: CmpOp) -> Option<(i64, CmpOp)> {
    let (v, op) = match (left, right) {
        (Expr::Weight, Expr::Literal(v)) => (v, op),
        (Expr::Literal(v), Expr::Weight) => (v, op.flip()),
        _ => return None,
    };
    v.as_i64().map(|x| (x, op))
}

/// 一个修订上的裁剪条件
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub space:        QuerySpace,
    pub weight_range: WeightRange,
}

impl QuerySpec {
    /// 由 AND 连接的谓词构建；返回不透明谓词
    pub fn build<'e>(revision: &Revision, filters: &'e [Expr]) -> (Self, Vec<&'e Expr>) {
        let columns = revision.columns();
        let mut space = QuerySpace::all(columns.len());
        let (mut lo, mut hi) = (Weight::MIN.0 as i64, Weight::MAX.0 as i64);
        let mut opaque = Vec::new();

        for conj in filters.iter().flat_map(Expr::conjuncts) {
            let handled = match conj {
                Expr::Compare { op, left, right } => {
                    if let Some((x, op)) = weight_literal(left, right, *op) {
                        match op {
                            CmpOp::Eq    => { lo = lo.max(x); hi = hi.min(x); true }
                            CmpOp::Lt    => { hi = hi.min(x.saturating_sub(1)); true }
                            CmpOp::LtEq  => { hi = hi.min(x); true }
                            CmpOp::Gt    => { lo = lo.max(x.saturating_add(1)); true }
                            CmpOp::GtEq  => { lo = lo.max(x); true }
                            CmpOp::NotEq => false,
                        }
                    } else if let Some((c, v, op)) = column_literal(left, right, *op) {
                        Self::restrict_column(revision, &columns, &mut space, &c, &v, op)
                    } else {
                        false
                    }
                }
                Expr::In { expr, list } => match expr.as_ref() {
                    Expr::Column(c) => Self::restrict_in(revision, &columns, &mut space, c, list),
                    _ => false,
                },
                Expr::IsNull(inner) => match inner.as_ref() {
                    Expr::Column(c) => match columns.iter().position(|x| x == c) {
                        Some(dim) => { space.restrict(dim, 0.0, 0.0); true }
                        None => false,
                    },
                    _ => false,
                },
                _ => false,
            };
            if !handled { opaque.push(conj); }
        }

        let weight_range = if lo > hi {
            WeightRange::empty()
        } else {
            WeightRange::new(Weight(lo as i32), Weight(hi as i32))
        };
        (Self { space, weight_range }, opaque)
    }

    fn restrict_column(
        revision: &Revision,
        columns:  &[String],
        space:    &mut QuerySpace,
        column:   &str,
        value:    &Value,
        op:       CmpOp,
    ) -> bool {
        let Some(dim) = columns.iter().position(|c| c == column) else { return false };
        let Some(t) = revision.transformations.get(dim) else { return false };
        if !literal_fits(t, value) { return false; }
        let p = t.transform(value);
        match op {
            CmpOp::Eq => space.restrict(dim, p, p),
            CmpOp::Lt | CmpOp::LtEq if t.is_order_preserving() => space.restrict(dim, 0.0, p),
            CmpOp::Gt | CmpOp::GtEq if t.is_order_preserving() => space.restrict(dim, p, 1.0),
            _ => return false,
        }
        true
    }

    fn restrict_in(
        revision: &Revision,
        columns:  &[String],
        space:    &mut QuerySpace,
        column:   &str,
        list:     &[Value],
    ) -> bool {
        let Some(dim) = columns.iter().position(|c| c == column) else { return false };
        let Some(t) = revision.transformations.get(dim) else { return false };
        if list.is_empty() || !list.iter().all(|v| literal_fits(t, v)) { return false; }
        let points: Vec<f64> = list.iter().map(|v| t.transform(v)).collect();
        let lo = points.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = points.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        space.restrict(dim, lo, hi);
        true
    }
}

// ── 执行 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QueryResult {
    /// 命中的文件（按路径去重）
    pub files:          Vec<IndexFile>,
    /// 交给宿主引擎逐行求值的不透明谓词
    pub opaque_filters: Vec<Expr>,
}

pub struct QueryExecutor<'a> {
    snapshot: &'a Snapshot,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self { Self { snapshot } }

    pub fn execute(&self, filters: &[Expr], partition_filters: &[Expr]) -> QueryResult {
        let mut matched: BTreeMap<String, IndexFile> = BTreeMap::new();
        let mut opaque: Vec<Expr> = Vec::new();

        for status in self.snapshot.index_statuses() {
            let revision = &status.revision;
            let candidates: Vec<&IndexFile> = if revision.is_staging() {
                self.snapshot.files(revision.revision_id).collect()
            } else {
                let (spec, residual) = QuerySpec::build(revision, filters);
                for r in residual {
                    if !opaque.contains(r) { opaque.push(r.clone()); }
                }
                let paths = execute_revision(status, &spec);
                paths.iter()
                    .filter_map(|p| self.snapshot.file(revision.revision_id, p))
                    .collect()
            };
            for f in candidates.into_iter().filter(|f| partition::file_matches(f, partition_filters)) {
                matched.entry(f.path.clone()).or_insert_with(|| f.clone());
            }
        }

        debug!(table = %self.snapshot.table_id, files = matched.len(), "query pruned");
        QueryResult { files: matched.into_values().collect(), opaque_filters: opaque }
    }
}

/// 单个修订上的深度优先裁剪，返回命中文件路径
pub fn execute_revision(status: &IndexStatus, spec: &QuerySpec) -> Vec<String> {
    let mut out: BTreeSet<String> = BTreeSet::new();
    if spec.space.is_empty() || spec.weight_range.is_empty() { return vec![]; }
    let range = spec.weight_range;

    let mut stack = vec![CubeId::root(status.revision.dimension_count())];
    while let Some(cube) = stack.pop() {
        if !spec.space.intersects(&cube) { continue; }

        let descend = match status.cube(&cube) {
            Some(cs) => {
                let stop = cs.max_weight < Weight::MAX && cs.max_weight > range.to;
                let skip_own = !stop && status.replicated_set.contains(&cube);
                let parent_replicated = cube.parent()
                    .map_or(false, |p| status.replicated_set.contains(&p));
                for b in &cs.blocks {
                    let wanted = if b.replicated { parent_replicated } else { !skip_own };
                    if wanted && range.intersects(b.min_weight, b.max_weight) {
                        out.insert(b.file.clone());
                    }
                }
                !stop
            }
            // 缺失的 cube 只在存在后代时继续下降
            None => status.has_descendant(&cube),
        };
        if descend {
            let kids: Vec<CubeId> = cube.children().collect();
            stack.extend(kids.into_iter().rev());
        }
    }
    out.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ColumnType, TableId};
    use crate::transform::Transformer;

    fn revision() -> Revision {
        let mut r = Revision::staging(TableId::new("/tmp/q").unwrap(), &["x".into(), "s".into()]);
        r.revision_id = 1;
        r.column_transformers = vec![
            Transformer::Linear { column: "x".into(), column_type: ColumnType::Int64 },
            Transformer::Hashing { column: "s".into() },
        ];
        r.transformations = vec![Transformation::Linear { min: 0.0, max: 100.0 }, Transformation::Hashing];
        r
    }

    #[test]
    fn ranges_and_equalities_build_space() {
        let f = vec![col("x").gt_eq(lit(Value::Int64(25))).and(lit(Value::Int64(50)).gt(col("x")))];
        let (spec, opaque) = QuerySpec::build(&revision(), &f);
        assert!(opaque.is_empty());
        assert_eq!(spec.space.from, vec![0.25, 0.0]);
        assert_eq!(spec.space.to, vec![0.5, 1.0]);
        assert_eq!(spec.weight_range, WeightRange::all());
    }

    #[test]
    fn hashing_ignores_ranges_but_uses_equality() {
        let r = revision();
        let preds = [col("s").lt(lit(Value::str("m")))];
        let (spec, opaque) = QuerySpec::build(&r, &preds);
        assert_eq!(opaque.len(), 1);
        assert_eq!(spec.space, QuerySpace::all(2));
        let (spec, _) = QuerySpec::build(&r, &[col("s").eq(lit(Value::str("m")))]);
        let p = Transformation::Hashing.transform(&Value::str("m"));
        assert_eq!((spec.space.from[1], spec.space.to[1]), (p, p));
    }

    #[test]
    fn disjunctions_subqueries_and_unknown_columns_are_opaque() {
        let f = vec![
            col("x").eq(lit(Value::Int64(1))).or(col("x").eq(lit(Value::Int64(2)))),
            Expr::Subquery,
            col("zzz").eq(lit(Value::Int64(3))),
            col("x").eq(lit(Value::str("text"))),
        ];
        let (spec, opaque) = QuerySpec::build(&revision(), &f);
        assert_eq!(opaque.len(), 4);
        assert_eq!(spec.space, QuerySpace::all(2));
    }

    #[test]
    fn weight_predicates_and_sampling() {
        let (spec, _) = QuerySpec::build(&revision(), &[Expr::sample(0.5)]);
        assert_eq!(spec.weight_range, WeightRange::sample(0.5));
        let (spec, _) = QuerySpec::build(&revision(), &[Expr::sample(0.0)]);
        assert!(spec.weight_range.is_empty());
        let f = weight().gt(lit(Value::Int32(10))).and(weight().lt_eq(lit(Value::Int32(20))));
        let (spec, _) = QuerySpec::build(&revision(), &[f]);
        assert_eq!(spec.weight_range, WeightRange::new(Weight(11), Weight(20)));
    }

    #[test]
    fn weight_bounds_at_integer_extremes_do_not_overflow() {
        let (spec, _) = QuerySpec::build(&revision(), &[weight().gt(lit(Value::Int64(i64::MAX)))]);
        assert!(spec.weight_range.is_empty());
        let (spec, _) = QuerySpec::build(&revision(), &[weight().lt(lit(Value::Int64(i64::MIN)))]);
        assert!(spec.weight_range.is_empty());
        let (spec, _) = QuerySpec::build(&revision(), &[weight().gt(lit(Value::Int64(i64::MIN)))]);
        assert_eq!(spec.weight_range, WeightRange::all());
        let (spec, _) = QuerySpec::build(&revision(), &[weight().lt(lit(Value::Int64(i64::MAX)))]);
        assert_eq!(spec.weight_range, WeightRange::all());
    }

    #[test]
    fn contradictory_range_is_empty() {
        let f = vec![col("x").gt(lit(Value::Int64(80))), col("x").lt(lit(Value::Int64(10)))];
        let (spec, _) = QuerySpec::build(&revision(), &f);
        assert!(spec.space.is_empty());
    }

    #[test]
    fn upper_edge_point_intersects() {
        let space = QuerySpace { from: vec![1.0], to: vec![1.0] };
        assert!(space.intersects(&CubeId::container(&[1.0], 3)));
        assert!(!space.intersects(&CubeId::container(&[0.5], 3)));
    }
}
