use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 自定义 reduce：必须满足结合律与交换律（调用方契约，运行时不检查）
pub trait CustomReducer: Send + Sync {
    fn name(&self) -> &str;
    /// 叶子：单条 emission 的 value → 部分聚合
    fn leaf(&self, value: &Value) -> Value;
    /// 合并两个部分聚合（rereduce）
    fn combine(&self, a: &Value, b: &Value) -> Value;
    fn identity(&self) -> Value;
}

/// 内置 reduce 的封闭枚举；树的合并操作因此静态已知且全函数
#[derive(Clone)]
pub enum Reducer {
    Count,
    Sum,
    Stats,
    Custom(Arc<dyn CustomReducer>),
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reducer({})", self.name())
    }
}

impl Reducer {
    pub fn name(&self) -> &str {
        match self {
            Reducer::Count => "_count",
            Reducer::Sum => "_sum",
            Reducer::Stats => "_stats",
            Reducer::Custom(c) => c.name(),
        }
    }

    pub fn identity(&self) -> Aggregate {
        match self {
            Reducer::Count => Aggregate::Count(0),
            Reducer::Sum => Aggregate::Sum(0.0),
            Reducer::Stats => Aggregate::Stats(StatsAgg::EMPTY),
            Reducer::Custom(c) => Aggregate::Custom(c.identity()),
        }
    }

    pub fn leaf(&self, value: &Value) -> Aggregate {
        match self {
            Reducer::Count => Aggregate::Count(1),
            Reducer::Sum => Aggregate::Sum(value.as_f64().unwrap_or(0.0)),
            Reducer::Stats => match value.as_f64() {
                Some(x) => Aggregate::Stats(StatsAgg {
                    sum: x,
                    count: 1,
                    min: x,
                    max: x,
                    sumsqr: x * x,
                }),
                None => Aggregate::Stats(StatsAgg::EMPTY),
            },
            Reducer::Custom(c) => Aggregate::Custom(c.leaf(value)),
        }
    }

    pub fn combine(&self, a: &Aggregate, b: &Aggregate) -> Aggregate {
        match (self, a, b) {
            (Reducer::Count, Aggregate::Count(x), Aggregate::Count(y)) => Aggregate::Count(x + y),
            (Reducer::Sum, Aggregate::Sum(x), Aggregate::Sum(y)) => Aggregate::Sum(x + y),
            (Reducer::Stats, Aggregate::Stats(x), Aggregate::Stats(y)) => {
                Aggregate::Stats(x.merge(y))
            }
            (Reducer::Custom(c), Aggregate::Custom(x), Aggregate::Custom(y)) => {
                Aggregate::Custom(c.combine(x, y))
            }
            // 不同 reducer 产生的聚合不会出现在同一棵树里
            _ => self.identity(),
        }
    }

    pub fn reduce_values<'a>(&self, values: impl IntoIterator<Item = &'a Value>) -> Aggregate {
        values
            .into_iter()
            .fold(self.identity(), |acc, v| self.combine(&acc, &self.leaf(v)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsAgg {
    pub sum: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sumsqr: f64,
}

impl StatsAgg {
    pub const EMPTY: StatsAgg = StatsAgg {
        sum: 0.0,
        count: 0,
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
        sumsqr: 0.0,
    };

    fn merge(&self, o: &StatsAgg) -> StatsAgg {
        StatsAgg {
            sum: self.sum + o.sum,
            count: self.count + o.count,
            min: self.min.min(o.min),
            max: self.max.max(o.max),
            sumsqr: self.sumsqr + o.sumsqr,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Aggregate {
    Count(u64),
    Sum(f64),
    Stats(StatsAgg),
    Custom(Value),
}

impl Aggregate {
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Aggregate::Count(n) => Some(*n),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Aggregate::Count(n) => json!(n),
            Aggregate::Sum(x) => json!(x),
            Aggregate::Stats(s) if s.count == 0 => {
                json!({"sum": 0, "count": 0, "min": null, "max": null, "sumsqr": 0})
            }
            Aggregate::Stats(s) => json!({
                "sum": s.sum,
                "count": s.count,
                "min": s.min,
                "max": s.max,
                "sumsqr": s.sumsqr,
            }),
            Aggregate::Custom(v) => v.clone(),
        }
    }

    /// 浮点聚合按相对误差比较（结合顺序不同会带来舍入差异）
    pub fn approx_eq(&self, other: &Aggregate) -> bool {
        fn close(a: f64, b: f64) -> bool {
            a == b || (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
        }
        match (self, other) {
            (Aggregate::Sum(a), Aggregate::Sum(b)) => close(*a, *b),
            (Aggregate::Stats(a), Aggregate::Stats(b)) => {
                a.count == b.count
                    && close(a.sum, b.sum)
                    && close(a.sumsqr, b.sumsqr)
                    && a.min == b.min
                    && a.max == b.max
            }
            _ => self == other,
        }
    }
}
