//! 宿主引擎传入的通用布尔表达式树

use crate::field_type::Value;
use crate::weight::Weight;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp { Eq, NotEq, Lt, LtEq, Gt, GtEq }

impl CmpOp {
    /// 交换左右操作数后的等价算子（`5 < x` ⇔ `x > 5`）
    pub fn flip(self) -> Self {
        match self {
            Self::Lt   => Self::Gt,
            Self::LtEq => Self::GtEq,
            Self::Gt   => Self::Lt,
            Self::GtEq => Self::LtEq,
            other      => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Value),
    /// 行权重（合成列），用于采样
    Weight,
    Compare { op: CmpOp, left: Box<Expr>, right: Box<Expr> },
    In { expr: Box<Expr>, list: Vec<Value> },
    IsNull(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// 子查询标记，内容对索引不可见
    Subquery,
}

pub fn col(name: &str) -> Expr { Expr::Column(name.into()) }

pub fn lit(v: Value) -> Expr { Expr::Literal(v) }

pub fn weight() -> Expr { Expr::Weight }

impl Expr {
    fn cmp(self, op: CmpOp, other: Expr) -> Expr {
        Expr::Compare { op, left: Box::new(self), right: Box::new(other) }
    }

    pub fn eq(self, other: Expr) -> Expr { self.cmp(CmpOp::Eq, other) }
    pub fn not_eq(self, other: Expr) -> Expr { self.cmp(CmpOp::NotEq, other) }
    pub fn lt(self, other: Expr) -> Expr { self.cmp(CmpOp::Lt, other) }
    pub fn lt_eq(self, other: Expr) -> Expr { self.cmp(CmpOp::LtEq, other) }
    pub fn gt(self, other: Expr) -> Expr { self.cmp(CmpOp::Gt, other) }
    pub fn gt_eq(self, other: Expr) -> Expr { self.cmp(CmpOp::GtEq, other) }

    pub fn and(self, other: Expr) -> Expr { Expr::And(Box::new(self), Box::new(other)) }
    pub fn or(self, other: Expr) -> Expr { Expr::Or(Box::new(self), Box::new(other)) }

    pub fn in_list(self, list: Vec<Value>) -> Expr { Expr::In { expr: Box::new(self), list } }

    pub fn is_null(self) -> Expr { Expr::IsNull(Box::new(self)) }

    /// 采样 `fraction` 比例的行：weight <= Weight::from_fraction(fraction)
    pub fn sample(fraction: f64) -> Expr {
        if fraction <= 0.0 {
            return weight().lt(lit(Value::Int32(Weight::MIN.0)));
        }
        weight().lt_eq(lit(Value::Int32(Weight::from_fraction(fraction).0)))
    }

    /// 拆开顶层 AND
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(a, b) => {
                let mut out = a.conjuncts();
                out.extend(b.conjuncts());
                out
            }
            other => vec![other],
        }
    }
}
