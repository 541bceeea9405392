//! Splitting a trace into a per-peer map half and a coordinator reduce half.
//!
//! Everything below the first reduction barrier runs on every peer; the
//! barrier itself is rewritten into partial aggregates on the map half and a
//! merge (plus any finalizing projection) on the reduce half. Steps above
//! the barrier stay on the coordinator.

use tern_error::{not_implemented, Result};
use tern_expr::{
    AggBinding, AggOp, Aggregate, ArithOp, Binding, Builtin, Case, CompareOp, Expr,
};

use crate::ir::Step;

/// Split `sub` into the map-half trace and the reduce-half steps (in
/// application order, predecessors stripped).
pub(crate) fn split_steps(step: &Step) -> Result<(Step, Vec<Step>)> {
    Ok(match step {
        Step::IterTable { .. } | Step::NoOutput | Step::DummyOutput => (step.clone(), Vec::new()),
        Step::UnionMap { .. } => not_implemented!("nested UNION MAP"),
        linear => {
            let from = match linear.from_step() {
                Some(from) => from,
                None => return Ok((step.clone(), Vec::new())),
            };
            let (map, mut reduce) = split_steps(from)?;
            if !reduce.is_empty() {
                // Already past the barrier: everything further stays on the
                // coordinator.
                reduce.push(strip(linear));
                return Ok((map, reduce));
            }
            match linear {
                Step::Aggregate {
                    aggs, group_by, ..
                } => {
                    let parts = split_aggregate(aggs, group_by)?;
                    let map = Step::Aggregate {
                        from: Box::new(map),
                        aggs: parts.map_aggs,
                        group_by: group_by.clone(),
                    };
                    (map, parts.reduce)
                }
                Step::Order { .. } => (map, vec![strip(linear)]),
                Step::Distinct { fields, .. } => {
                    // Peers pre-deduplicate; the union deduplicates again.
                    let map = Step::Distinct {
                        from: Box::new(map),
                        fields: fields.clone(),
                    };
                    (map, vec![strip(linear)])
                }
                Step::Limit { count, offset, .. } => {
                    // Each peer needs at most count+offset rows.
                    let map = Step::Limit {
                        from: Box::new(map),
                        count: count + offset,
                        offset: 0,
                    };
                    (map, vec![strip(linear)])
                }
                Step::OutputPart { .. } | Step::OutputIndex { .. } => (map, vec![strip(linear)]),
                other => (other.clone().restack(map), Vec::new()),
            }
        }
    })
}

/// Clone a step with its predecessor replaced by a placeholder; the lowering
/// pass stacks reduce steps over the union explicitly.
fn strip(step: &Step) -> Step {
    step.clone().restack(Step::NoOutput)
}

struct AggSplit {
    map_aggs: Vec<AggBinding>,
    reduce: Vec<Step>,
}

/// Rewrite aggregates into partial and merge forms.
fn split_aggregate(aggs: &[AggBinding], group_by: &[Binding]) -> Result<AggSplit> {
    let mut map_aggs: Vec<AggBinding> = Vec::new();
    let mut reduce_aggs: Vec<AggBinding> = Vec::new();
    let mut proj: Vec<Binding> = Vec::new();
    let mut need_proj = false;

    for b in aggs {
        match b.agg.op {
            AggOp::Sum | AggOp::Min | AggOp::Max => {
                map_aggs.push(b.clone());
                reduce_aggs.push(remerge(b, b.agg.op));
                proj.push(passthrough(&b.result));
            }
            AggOp::Count | AggOp::SumCount => {
                map_aggs.push(b.clone());
                reduce_aggs.push(remerge(b, AggOp::SumCount));
                proj.push(passthrough(&b.result));
            }
            AggOp::ApproxCountDistinct => {
                map_aggs.push(AggBinding::new(
                    rebuild(&b.agg, AggOp::ApproxCountDistinctPartial),
                    b.result.clone(),
                ));
                reduce_aggs.push(remerge(b, AggOp::ApproxCountDistinctMerge));
                proj.push(passthrough(&b.result));
            }
            AggOp::Avg => {
                let sum = format!("$sum_{}", b.result);
                let count = format!("$count_{}", b.result);
                map_aggs.push(AggBinding::new(rebuild(&b.agg, AggOp::Sum), sum.clone()));
                map_aggs.push(AggBinding::new(rebuild(&b.agg, AggOp::Count), count.clone()));
                reduce_aggs.push(AggBinding::new(
                    Aggregate::new(AggOp::Sum, Expr::path(sum.clone())),
                    sum.clone(),
                ));
                reduce_aggs.push(AggBinding::new(
                    Aggregate::new(AggOp::SumCount, Expr::path(count.clone())),
                    count.clone(),
                ));
                // AVG(x) = CASE WHEN count = 0 THEN NULL ELSE sum / count END
                proj.push(Binding::new(
                    guard_zero(&count, div(Expr::path(sum), Expr::path(count.clone()))),
                    b.result.clone(),
                ));
                need_proj = true;
            }
            AggOp::StdDevPop | AggOp::VariancePop => {
                let sum = format!("$sum_{}", b.result);
                let sq = format!("$sq_{}", b.result);
                let count = format!("$count_{}", b.result);
                map_aggs.push(AggBinding::new(rebuild(&b.agg, AggOp::Sum), sum.clone()));
                map_aggs.push(AggBinding::new(
                    Aggregate {
                        op: AggOp::Sum,
                        inner: Box::new(Expr::Arith(
                            ArithOp::Mul,
                            b.agg.inner.clone(),
                            b.agg.inner.clone(),
                        )),
                        filter: b.agg.filter.clone(),
                    },
                    sq.clone(),
                ));
                map_aggs.push(AggBinding::new(rebuild(&b.agg, AggOp::Count), count.clone()));
                for name in [&sum, &sq] {
                    reduce_aggs.push(AggBinding::new(
                        Aggregate::new(AggOp::Sum, Expr::path(name.clone())),
                        name.clone(),
                    ));
                }
                reduce_aggs.push(AggBinding::new(
                    Aggregate::new(AggOp::SumCount, Expr::path(count.clone())),
                    count.clone(),
                ));
                // VAR(x) = sq/n - (sum/n)^2, closed form over the partials.
                let mean = div(Expr::path(sum), Expr::path(count.clone()));
                let variance = Expr::Arith(
                    ArithOp::Sub,
                    Box::new(div(Expr::path(sq), Expr::path(count.clone()))),
                    Box::new(Expr::Arith(
                        ArithOp::Mul,
                        Box::new(mean.clone()),
                        Box::new(mean),
                    )),
                );
                let finished = if b.agg.op == AggOp::StdDevPop {
                    Expr::Call(Builtin::Sqrt, vec![variance])
                } else {
                    variance
                };
                proj.push(Binding::new(guard_zero(&count, finished), b.result.clone()));
                need_proj = true;
            }
            AggOp::ApproxCountDistinctPartial | AggOp::ApproxCountDistinctMerge => {
                not_implemented!("splitting an already-partial aggregate")
            }
        }
    }

    let reduce_groups: Vec<Binding> = group_by
        .iter()
        .map(|b| Binding::new(Expr::path(b.result.clone()), b.result.clone()))
        .collect();
    for b in group_by {
        proj.push(passthrough(&b.result));
    }

    let mut reduce = vec![Step::Aggregate {
        from: Box::new(Step::NoOutput),
        aggs: reduce_aggs,
        group_by: reduce_groups,
    }];
    if need_proj {
        reduce.push(Step::Bind {
            from: Box::new(Step::NoOutput),
            bindings: proj,
        });
    }
    Ok(AggSplit { map_aggs, reduce })
}

fn passthrough(name: &str) -> Binding {
    Binding::new(Expr::path(name), name)
}

/// Same aggregate applied to the partial column it produced.
fn remerge(b: &AggBinding, op: AggOp) -> AggBinding {
    AggBinding::new(
        Aggregate::new(op, Expr::path(b.result.clone())),
        b.result.clone(),
    )
}

/// The original aggregate with a different operation.
fn rebuild(agg: &Aggregate, op: AggOp) -> Aggregate {
    Aggregate {
        op,
        inner: agg.inner.clone(),
        filter: agg.filter.clone(),
    }
}

fn div(num: Expr, den: Expr) -> Expr {
    Expr::Arith(ArithOp::Div, Box::new(num), Box::new(den))
}

/// `CASE WHEN count = 0 THEN NULL ELSE value END`.
fn guard_zero(count: &str, value: Expr) -> Expr {
    Expr::Case(Case {
        limbs: vec![(
            Expr::compare(CompareOp::Eq, Expr::path(count), Expr::integer(0)),
            Expr::Const(tern_codec::Value::Null),
        )],
        default: Some(Box::new(value)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(op: AggOp, result: &str) -> AggBinding {
        AggBinding::new(Aggregate::new(op, Expr::path("x")), result)
    }

    #[test]
    fn plain_chain_has_no_reduce_half() {
        let trace = Step::iter_table(Expr::path("t")).filter(Expr::boolean(true));
        let (map, reduce) = split_steps(&trace).unwrap();
        assert_eq!(map, trace);
        assert!(reduce.is_empty());
    }

    #[test]
    fn count_becomes_sum_count() {
        let trace =
            Step::iter_table(Expr::path("t")).aggregate(vec![agg(AggOp::Count, "n")], vec![]);
        let (map, reduce) = split_steps(&trace).unwrap();
        match &map {
            Step::Aggregate { aggs, .. } => assert_eq!(aggs[0].agg.op, AggOp::Count),
            other => panic!("unexpected map half: {other:?}"),
        }
        assert_eq!(reduce.len(), 1);
        match &reduce[0] {
            Step::Aggregate { aggs, .. } => {
                assert_eq!(aggs[0].agg.op, AggOp::SumCount);
                assert_eq!(*aggs[0].agg.inner, Expr::path("n"));
            }
            other => panic!("unexpected reduce half: {other:?}"),
        }
    }

    #[test]
    fn avg_splits_into_sum_count_and_case() {
        let trace = Step::iter_table(Expr::path("t")).aggregate(
            vec![agg(AggOp::Avg, "avg")],
            vec![Binding::new(Expr::path("g"), "g")],
        );
        let (map, reduce) = split_steps(&trace).unwrap();
        match &map {
            Step::Aggregate { aggs, group_by, .. } => {
                assert_eq!(aggs.len(), 2);
                assert_eq!(aggs[0].agg.op, AggOp::Sum);
                assert_eq!(aggs[1].agg.op, AggOp::Count);
                assert_eq!(group_by.len(), 1);
            }
            other => panic!("unexpected map half: {other:?}"),
        }
        // Merge aggregate, then the finalizing projection.
        assert_eq!(reduce.len(), 2);
        match &reduce[1] {
            Step::Bind { bindings, .. } => {
                assert_eq!(bindings.len(), 2);
                assert_eq!(bindings[0].result, "avg");
                assert!(matches!(bindings[0].expr, Expr::Case(_)));
                assert_eq!(bindings[1].result, "g");
            }
            other => panic!("unexpected projection: {other:?}"),
        }
    }

    #[test]
    fn stddev_splits_into_moments() {
        let trace = Step::iter_table(Expr::path("t"))
            .aggregate(vec![agg(AggOp::StdDevPop, "sd")], vec![]);
        let (map, reduce) = split_steps(&trace).unwrap();
        match &map {
            Step::Aggregate { aggs, .. } => {
                assert_eq!(aggs.len(), 3);
                assert!(aggs.iter().all(|a| matches!(
                    a.agg.op,
                    AggOp::Sum | AggOp::Count
                )));
            }
            other => panic!("unexpected map half: {other:?}"),
        }
        match &reduce[1] {
            Step::Bind { bindings, .. } => {
                assert!(matches!(bindings[0].expr, Expr::Case(_)));
            }
            other => panic!("unexpected projection: {other:?}"),
        }
    }

    #[test]
    fn approx_count_distinct_splits_into_partial_merge() {
        let trace = Step::iter_table(Expr::path("t"))
            .aggregate(vec![agg(AggOp::ApproxCountDistinct, "acd")], vec![]);
        let (map, reduce) = split_steps(&trace).unwrap();
        match &map {
            Step::Aggregate { aggs, .. } => {
                assert_eq!(aggs[0].agg.op, AggOp::ApproxCountDistinctPartial)
            }
            other => panic!("unexpected map half: {other:?}"),
        }
        match &reduce[0] {
            Step::Aggregate { aggs, .. } => {
                assert_eq!(aggs[0].agg.op, AggOp::ApproxCountDistinctMerge)
            }
            other => panic!("unexpected reduce half: {other:?}"),
        }
    }

    #[test]
    fn order_and_post_barrier_steps_stay_on_the_coordinator() {
        let trace = Step::iter_table(Expr::path("t"))
            .aggregate(vec![agg(AggOp::Sum, "s")], vec![])
            .order(vec![tern_expr::OrderPart {
                expr: Expr::path("s"),
                desc: false,
                nulls_last: false,
            }])
            .limit(3, 0);
        let (map, reduce) = split_steps(&trace).unwrap();
        assert!(matches!(map, Step::Aggregate { .. }));
        assert_eq!(reduce.len(), 3);
        assert!(matches!(reduce[1], Step::Order { .. }));
        assert!(matches!(reduce[2], Step::Limit { .. }));
    }

    #[test]
    fn distinct_and_limit_run_on_both_halves() {
        let trace = Step::iter_table(Expr::path("t")).distinct(vec![Expr::path("c")]);
        let (map, reduce) = split_steps(&trace).unwrap();
        assert!(matches!(map, Step::Distinct { .. }));
        assert!(matches!(reduce[0], Step::Distinct { .. }));

        let trace = Step::iter_table(Expr::path("t")).limit(5, 2);
        let (map, reduce) = split_steps(&trace).unwrap();
        match &map {
            Step::Limit { count, offset, .. } => {
                assert_eq!(*count, 7);
                assert_eq!(*offset, 0);
            }
            other => panic!("unexpected map half: {other:?}"),
        }
        assert!(matches!(reduce[0], Step::Limit { count: 5, offset: 2, .. }));
    }
}
