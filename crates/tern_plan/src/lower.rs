//! Lowering: logical trace to physical operator tree.

use tern_error::{not_implemented, Result, TernError};
use tern_expr::{AggBinding, Binding, Expr, OrderPart, Visitor};
use tracing::debug;

use crate::env::Env;
use crate::ir::Step;
use crate::op::{
    AggOrder, Apply, CountStar, Distinct, DummyOutput, Filter, HashAggregate, Leaf, Limit,
    NoOutput, Op, OrderBy, OutputIndex, OutputPart, Project, SimpleAggregate, UnionMap,
    UnionPartition, Unnest,
};
use crate::split::split_steps;
use crate::transport::Geometry;
use crate::tree::{Node, Tree};
use crate::walker::InputWalker;

/// Lower a trace into an executable plan.
pub fn lower(trace: &Step, env: &dyn Env) -> Result<Tree> {
    lower_impl(trace, env, None)
}

/// Lower a trace into a distributed plan: the whole trace runs under a
/// `UnionMap` over `geometry`, with an aggregate-aware reduce half on the
/// coordinator.
pub fn lower_split(trace: &Step, env: &dyn Env, geometry: &Geometry) -> Result<Tree> {
    let wrapped = Step::union_map(trace.clone());
    lower_impl(&wrapped, env, Some(geometry))
}

fn lower_impl(trace: &Step, env: &dyn Env, geometry: Option<&Geometry>) -> Result<Tree> {
    let mut lowerer = Lowerer {
        env,
        walker: InputWalker::new(),
        geometry,
    };
    let (op, input) = lowerer.build(trace)?;
    let schema = input
        .filter(|_| chain_preserves_schema(&op))
        .and_then(|i| lowerer.walker.table_of(i))
        .and_then(|table| env.schema(table));
    let inputs = lowerer.walker.finalize(env)?;
    debug!(inputs = inputs.len(), "plan lowered");
    let mut node = Node::new(input, op);
    node.output_type = schema;
    Ok(Tree::new(inputs, node))
}

/// Does the chain emit source rows unchanged in shape (scan and filter
/// only)? Only then does the table's declared schema describe the output.
fn chain_preserves_schema(op: &Op) -> bool {
    match op {
        Op::Leaf(_) => true,
        Op::Filter(f) => chain_preserves_schema(&f.from),
        _ => false,
    }
}

struct Lowerer<'a> {
    env: &'a dyn Env,
    walker: InputWalker,
    geometry: Option<&'a Geometry>,
}

impl Lowerer<'_> {
    fn build(&mut self, step: &Step) -> Result<(Op, Option<usize>)> {
        Ok(match step {
            Step::IterTable {
                table,
                filter,
                fields,
            } => {
                let idx = self.walker.lookup(table, filter.as_ref(), fields.as_deref());
                let mut op = Op::Leaf(Leaf::new());
                if let Some(f) = filter {
                    op = Op::Filter(Filter::new(op, f.clone()));
                }
                (op, Some(idx))
            }
            Step::NoOutput => (Op::NoOutput(NoOutput), None),
            Step::DummyOutput => (Op::DummyOutput(DummyOutput), None),
            Step::UnionMap { sub } => self.lower_union_map(sub)?,
            linear => {
                let from_step = linear
                    .from_step()
                    .ok_or_else(|| TernError::new("malformed trace: linear step with no input"))?;
                let (from, mut input) = self.build(from_step)?;
                let op = self.build_onto(linear, from, input)?;
                if matches!(op, Op::NoOutput(_)) {
                    input = None;
                }
                (op, input)
            }
        })
    }

    /// Lower one linear step on top of an already-built chain.
    fn build_onto(&mut self, step: &Step, from: Op, input: Option<usize>) -> Result<Op> {
        Ok(match step {
            Step::Filter { expr, .. } => Op::Filter(Filter::new(from, expr.clone())),
            Step::Bind { bindings, .. } => lower_bind(from, bindings)?,
            Step::Aggregate {
                aggs, group_by, ..
            } => self.lower_aggregate(from, input, aggs, group_by)?,
            Step::Limit { count, offset, .. } => lower_limit(from, *count, *offset)?,
            Step::Order { cols, .. } => lower_order(from, cols)?,
            Step::Distinct { fields, .. } => {
                if fields.is_empty() {
                    return Err(TernError::new("DISTINCT with no columns"));
                }
                Op::Distinct(Distinct::new(from, fields.clone()))
            }
            Step::IterValue { expr, result, .. } => {
                Op::Unnest(Unnest::new(from, expr.clone(), result.clone()))
            }
            Step::Unpivot { .. } => not_implemented!("UNPIVOT"),
            Step::OutputPart {
                basename, store, ..
            } => {
                if self.env.upload().is_none() {
                    return Err(TernError::new("cannot write parts: no uploader configured"));
                }
                Op::OutputPart(OutputPart::new(from, basename.clone(), store.clone()))
            }
            Step::OutputIndex {
                table,
                basename,
                store,
                ..
            } => {
                let upload = self
                    .env
                    .upload()
                    .ok_or_else(|| TernError::new("cannot write an index: no uploader configured"))?;
                Op::OutputIndex(OutputIndex::new(
                    from,
                    table.clone(),
                    basename.clone(),
                    store.clone(),
                    upload.key(),
                ))
            }
            Step::IterTable { .. }
            | Step::NoOutput
            | Step::DummyOutput
            | Step::UnionMap { .. } => {
                return Err(TernError::new("malformed trace: terminal step mid-chain"))
            }
        })
    }

    fn lower_aggregate(
        &mut self,
        from: Op,
        input: Option<usize>,
        aggs: &[AggBinding],
        group_by: &[Binding],
    ) -> Result<Op> {
        if aggs.is_empty() && group_by.is_empty() {
            return Err(TernError::new("aggregate with no outputs"));
        }
        // The COUNT(*) pattern: a single unfiltered star count, ungrouped.
        if group_by.is_empty() && aggs.len() == 1 && aggs[0].agg.is_count_star() {
            return Ok(Op::CountStar(CountStar::new(from, aggs[0].result.clone())));
        }
        if group_by.is_empty() {
            return Ok(Op::SimpleAggregate(SimpleAggregate::new(
                from,
                aggs.to_vec(),
            )));
        }
        if self.geometry.is_none() {
            if let Some(fields) = self.partition_fields(input, group_by)? {
                // Every group key is a partition constant: run the grouped
                // aggregate once per partition, with the key rewritten to
                // the group's constant.
                let groups = group_by
                    .iter()
                    .enumerate()
                    .map(|(i, b)| Binding::new(Expr::PartitionValue(i), b.result.clone()))
                    .collect();
                let inner = Op::HashAggregate(HashAggregate::new(from, aggs.to_vec(), groups));
                return Ok(Op::UnionPartition(UnionPartition::new(inner, fields)));
            }
        }
        Ok(Op::HashAggregate(HashAggregate::new(
            from,
            aggs.to_vec(),
            group_by.to_vec(),
        )))
    }

    /// Group-by fields usable for value-based partitioning: all plain
    /// top-level paths that the table's index declares as partitions.
    fn partition_fields(
        &self,
        input: Option<usize>,
        group_by: &[Binding],
    ) -> Result<Option<Vec<String>>> {
        let table = match input.and_then(|i| self.walker.table_of(i)) {
            Some(table) => table,
            None => return Ok(None),
        };
        let indexer = match self.env.indexer() {
            Some(indexer) => indexer,
            None => return Ok(None),
        };
        let index = match indexer.index(table)? {
            Some(index) => index,
            None => return Ok(None),
        };
        let mut fields = Vec::with_capacity(group_by.len());
        for b in group_by {
            match &b.expr {
                Expr::Path(p) if p.rest.is_empty() && index.has_partition(&p.first) => {
                    fields.push(p.first.clone());
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(fields))
    }

    fn lower_union_map(&mut self, sub: &Step) -> Result<(Op, Option<usize>)> {
        let geometry = self
            .geometry
            .ok_or_else(|| TernError::new("UNION MAP requires a distribution geometry"))?;
        if geometry.is_empty() {
            // Nothing to fan out over.
            return Ok((Op::NoOutput(NoOutput), None));
        }
        let (map_trace, reduce_steps) = split_steps(sub)?;
        let (map_op, map_input) = self.build(&map_trace)?;
        let input_idx = match map_input {
            Some(i) => i,
            // A subplan with no table input runs as-is; distribution would
            // have nothing to split.
            None => return Ok((map_op, None)),
        };
        let mut op = Op::UnionMap(UnionMap::new(map_op, geometry.clone()));
        let mut input = Some(input_idx);
        for step in &reduce_steps {
            op = self.build_onto(step, op, input)?;
            if matches!(op, Op::NoOutput(_)) {
                input = None;
            }
        }
        Ok((op, input))
    }
}

/// Bind lowers to a projection, or to apply-then-project when an expression
/// needs the row-extension path (string concatenation).
fn lower_bind(from: Op, bindings: &[Binding]) -> Result<Op> {
    // Reject bindings that reference names introduced earlier in the same
    // list; PartiQL leaves their meaning ambiguous.
    for (i, b) in bindings.iter().enumerate() {
        let earlier: Vec<&str> = bindings[..i].iter().map(|p| p.result.as_str()).collect();
        if let Some(name) = references_any(&b.expr, &earlier) {
            return Err(TernError::not_supported(format!(
                "projection references its own binding {name:?}"
            )));
        }
    }
    let needs_apply = bindings.iter().any(|b| contains_concat(&b.expr));
    if !needs_apply {
        return Ok(Op::Project(Project::new(from, bindings.to_vec())));
    }
    let apply = Op::Apply(Apply::new(from, bindings.to_vec()));
    let select = bindings
        .iter()
        .map(|b| Binding::new(Expr::path(b.result.clone()), b.result.clone()))
        .collect();
    Ok(Op::Project(Project::new(apply, select)))
}

fn references_any(e: &Expr, names: &[&str]) -> Option<String> {
    struct Finder<'a> {
        names: &'a [&'a str],
        found: Option<String>,
    }
    impl Visitor for Finder<'_> {
        fn visit(&mut self, e: &Expr) -> bool {
            if let Expr::Path(p) = e {
                if self.names.contains(&p.first.as_str()) {
                    self.found = Some(p.first.clone());
                }
            }
            self.found.is_none()
        }
    }
    let mut f = Finder { names, found: None };
    tern_expr::walk(&mut f, e);
    f.found
}

fn contains_concat(e: &Expr) -> bool {
    struct Finder {
        found: bool,
    }
    impl Visitor for Finder {
        fn visit(&mut self, e: &Expr) -> bool {
            if matches!(e, Expr::Concat(..)) {
                self.found = true;
            }
            !self.found
        }
    }
    let mut f = Finder { found: false };
    tern_expr::walk(&mut f, e);
    f.found
}

fn lower_limit(from: Op, count: u64, offset: u64) -> Result<Op> {
    // LIMIT 0 can never produce a row.
    if count == 0 {
        return Ok(Op::NoOutput(NoOutput));
    }
    Ok(match from {
        Op::HashAggregate(mut h) if offset == 0 && h.limit.is_none() => {
            h.limit = Some(count);
            Op::HashAggregate(h)
        }
        Op::OrderBy(mut o) if o.limit.is_none() => {
            o.limit = Some(count);
            o.offset = offset;
            Op::OrderBy(o)
        }
        Op::Distinct(mut d) if offset == 0 && d.limit.is_none() => {
            d.limit = Some(count);
            Op::Distinct(d)
        }
        other if offset == 0 => Op::Limit(Limit::new(other, count)),
        _ => not_implemented!("OFFSET without GROUP BY/ORDER BY not implemented"),
    })
}

fn lower_order(from: Op, cols: &[OrderPart]) -> Result<Op> {
    // Constant keys order nothing.
    let cols: Vec<OrderPart> = cols
        .iter()
        .filter(|c| !c.expr.is_constant())
        .cloned()
        .collect();
    if cols.is_empty() {
        return Ok(from);
    }
    for (i, a) in cols.iter().enumerate() {
        for b in &cols[i + 1..] {
            if a.expr == b.expr {
                return Err(TernError::new(format!(
                    "duplicate ORDER BY expression {}",
                    a.expr
                )));
            }
        }
    }
    // ORDER BY over a grouped aggregate fuses when every key names an
    // output column.
    let from = match from {
        Op::HashAggregate(mut h) if h.order.is_empty() => match fuse_order(&h, &cols) {
            Some(order) => {
                h.order = order;
                return Ok(Op::HashAggregate(h));
            }
            None => Op::HashAggregate(h),
        },
        other => other,
    };
    Ok(Op::OrderBy(OrderBy::new(from, cols)))
}

fn fuse_order(h: &HashAggregate, cols: &[OrderPart]) -> Option<Vec<AggOrder>> {
    let mut out = Vec::with_capacity(cols.len());
    for c in cols {
        let name = match &c.expr {
            Expr::Path(p) if p.rest.is_empty() => p.first.as_str(),
            _ => return None,
        };
        let index = (0..h.aggs.len() + h.group_by.len())
            .find(|&i| h.column_name(i) == Some(name))?;
        out.push(AggOrder {
            index,
            desc: c.desc,
            nulls_last: c.nulls_last,
        });
    }
    Some(out)
}
