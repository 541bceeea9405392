//! Aggregate expressions.

use crate::Expr;

/// The aggregation operations the engine can evaluate.
///
/// The `SumCount`, partial, and merge variants only appear in split plans:
/// the splitter rewrites user-facing aggregates into a per-peer partial and a
/// coordinator-side merge (see the plan splitter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Sum of partial counts: like `Sum`, but an empty input yields 0 rather
    /// than NULL.
    SumCount,
    ApproxCountDistinct,
    /// Produces a serialized cardinality sketch instead of a count.
    ApproxCountDistinctPartial,
    /// Unions serialized sketches and produces the final count.
    ApproxCountDistinctMerge,
    StdDevPop,
    VariancePop,
}

impl AggOp {
    pub fn name(&self) -> &'static str {
        match self {
            AggOp::Count => "COUNT",
            AggOp::Sum => "SUM",
            AggOp::Avg => "AVG",
            AggOp::Min => "MIN",
            AggOp::Max => "MAX",
            AggOp::SumCount => "SUM_COUNT",
            AggOp::ApproxCountDistinct => "APPROX_COUNT_DISTINCT",
            AggOp::ApproxCountDistinctPartial => "APPROX_COUNT_DISTINCT_PARTIAL",
            AggOp::ApproxCountDistinctMerge => "APPROX_COUNT_DISTINCT_MERGE",
            AggOp::StdDevPop => "STDDEV_POP",
            AggOp::VariancePop => "VARIANCE_POP",
        }
    }

    pub fn from_name(name: &str) -> Option<AggOp> {
        Some(match name {
            "COUNT" => AggOp::Count,
            "SUM" => AggOp::Sum,
            "AVG" => AggOp::Avg,
            "MIN" => AggOp::Min,
            "MAX" => AggOp::Max,
            "SUM_COUNT" => AggOp::SumCount,
            "APPROX_COUNT_DISTINCT" => AggOp::ApproxCountDistinct,
            "APPROX_COUNT_DISTINCT_PARTIAL" => AggOp::ApproxCountDistinctPartial,
            "APPROX_COUNT_DISTINCT_MERGE" => AggOp::ApproxCountDistinctMerge,
            "STDDEV_POP" => AggOp::StdDevPop,
            "VARIANCE_POP" => AggOp::VariancePop,
            _ => return None,
        })
    }

    /// Default result column name when the query does not alias the output.
    pub fn default_result(&self) -> &'static str {
        match self {
            AggOp::Count | AggOp::SumCount => "count",
            AggOp::Sum => "sum",
            AggOp::Avg => "avg",
            AggOp::Min => "min",
            AggOp::Max => "max",
            AggOp::ApproxCountDistinct
            | AggOp::ApproxCountDistinctPartial
            | AggOp::ApproxCountDistinctMerge => "approx_count_distinct",
            AggOp::StdDevPop => "stddev_pop",
            AggOp::VariancePop => "variance_pop",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub op: AggOp,
    pub inner: Box<Expr>,
    /// Optional `FILTER (WHERE ...)` predicate.
    pub filter: Option<Box<Expr>>,
}

impl Aggregate {
    pub fn new(op: AggOp, inner: Expr) -> Self {
        Aggregate {
            op,
            inner: Box::new(inner),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Expr) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// The `COUNT(*)` shape with no filter, recognized by the lowering pass.
    pub fn is_count_star(&self) -> bool {
        self.op == AggOp::Count && matches!(self.inner.as_ref(), Expr::Star) && self.filter.is_none()
    }
}

/// A named aggregate output.
#[derive(Debug, Clone, PartialEq)]
pub struct AggBinding {
    pub agg: Aggregate,
    pub result: String,
}

impl AggBinding {
    pub fn new(agg: Aggregate, result: impl Into<String>) -> Self {
        AggBinding {
            agg,
            result: result.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_star_shape() {
        assert!(Aggregate::new(AggOp::Count, Expr::Star).is_count_star());
        assert!(!Aggregate::new(AggOp::Count, Expr::path("x")).is_count_star());
        assert!(!Aggregate::new(AggOp::Count, Expr::Star)
            .with_filter(Expr::boolean(true))
            .is_count_star());
    }

    #[test]
    fn names_roundtrip() {
        for op in [
            AggOp::Count,
            AggOp::Sum,
            AggOp::Avg,
            AggOp::Min,
            AggOp::Max,
            AggOp::SumCount,
            AggOp::ApproxCountDistinct,
            AggOp::ApproxCountDistinctPartial,
            AggOp::ApproxCountDistinctMerge,
            AggOp::StdDevPop,
            AggOp::VariancePop,
        ] {
            assert_eq!(AggOp::from_name(op.name()), Some(op));
        }
    }
}
