//! The closed set of physical operators.
//!
//! Operators form a chain evaluated predecessor-first: each nonterminal holds
//! the operator it consumes from. Execution composes the chain into a stack
//! of [`QuerySink`] stages; serialization flattens it into a list tagged by
//! operator name.

pub mod aggregate;
pub mod distinct;
pub mod explain;
pub mod filter;
pub mod leaf;
pub mod limit;
pub mod order;
pub mod outpart;
pub mod output;
pub mod project;
pub mod substitute;
pub mod unionmap;
pub mod unionpart;
pub mod unnest;

pub use aggregate::{AggOrder, CountStar, HashAggregate, SimpleAggregate};
pub use distinct::Distinct;
pub use explain::{Explain, ExplainFormat};
pub use filter::Filter;
pub use leaf::Leaf;
pub use limit::Limit;
pub use order::OrderBy;
pub use outpart::{OutputIndex, OutputPart};
pub use output::{DummyOutput, NoOutput};
pub use project::{Apply, Project};
pub use substitute::Substitute;
pub use unionmap::UnionMap;
pub use unionpart::UnionPartition;
pub use unnest::Unnest;

use tern_codec::Value;
use tern_error::{ErrorKind, OptionExt, Result, TernError};
use tern_expr::{Expr, Rewriter};
use tern_mill::QuerySink;

use crate::exec::ExecParams;
use crate::input::Input;

/// A unit of work spawned onto the plan's worker pool.
pub type ExecTask = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Result of composing an operator chain over a destination sink.
pub enum Wrapped {
    /// The chain consumes a table input; the executor scans `input` into
    /// `sink`.
    Input {
        input: Input,
        sink: Box<dyn QuerySink>,
    },
    /// The chain consumes no input. The sink is closed after every
    /// input-driven task of the node finishes; closing may emit rows.
    Extra { sink: Box<dyn QuerySink> },
    /// The chain drives itself with its own tasks (distributed unions). The
    /// sink is closed after the tasks complete.
    Tasks {
        tasks: Vec<ExecTask>,
        sink: Box<dyn QuerySink>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Leaf(Leaf),
    Filter(Filter),
    Project(Project),
    Apply(Apply),
    Unnest(Unnest),
    SimpleAggregate(SimpleAggregate),
    HashAggregate(HashAggregate),
    CountStar(CountStar),
    Distinct(Distinct),
    OrderBy(OrderBy),
    Limit(Limit),
    NoOutput(NoOutput),
    DummyOutput(DummyOutput),
    UnionMap(UnionMap),
    UnionPartition(UnionPartition),
    OutputPart(OutputPart),
    OutputIndex(OutputIndex),
    Explain(Explain),
    Substitute(Substitute),
}

impl Op {
    /// Serialization tag.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Leaf(_) => "leaf",
            Op::Filter(_) => "filter",
            Op::Project(_) => "project",
            Op::Apply(_) => "apply",
            Op::Unnest(_) => "unnest",
            Op::SimpleAggregate(_) => "simple_agg",
            Op::HashAggregate(_) => "hash_agg",
            Op::CountStar(_) => "count_star",
            Op::Distinct(_) => "distinct",
            Op::OrderBy(_) => "order",
            Op::Limit(_) => "limit",
            Op::NoOutput(_) => "none",
            Op::DummyOutput(_) => "dummy",
            Op::UnionMap(_) => "union_map",
            Op::UnionPartition(_) => "union_partition",
            Op::OutputPart(_) => "output_part",
            Op::OutputIndex(_) => "output_index",
            Op::Explain(_) => "explain",
            Op::Substitute(_) => "substitute",
        }
    }

    /// The predecessor this operator consumes from, if any.
    pub fn from_op(&self) -> Option<&Op> {
        match self {
            Op::Leaf(_)
            | Op::NoOutput(_)
            | Op::DummyOutput(_)
            | Op::Explain(_)
            | Op::Substitute(_) => None,
            Op::Filter(op) => Some(&op.from),
            Op::Project(op) => Some(&op.from),
            Op::Apply(op) => Some(&op.from),
            Op::Unnest(op) => Some(&op.from),
            Op::SimpleAggregate(op) => Some(&op.from),
            Op::HashAggregate(op) => Some(&op.from),
            Op::CountStar(op) => Some(&op.from),
            Op::Distinct(op) => Some(&op.from),
            Op::OrderBy(op) => Some(&op.from),
            Op::Limit(op) => Some(&op.from),
            Op::UnionMap(op) => Some(&op.from),
            Op::UnionPartition(op) => Some(&op.from),
            Op::OutputPart(op) => Some(&op.from),
            Op::OutputIndex(op) => Some(&op.from),
        }
    }

    pub fn from_op_mut(&mut self) -> Option<&mut Op> {
        match self {
            Op::Leaf(_)
            | Op::NoOutput(_)
            | Op::DummyOutput(_)
            | Op::Explain(_)
            | Op::Substitute(_) => None,
            Op::Filter(op) => Some(&mut op.from),
            Op::Project(op) => Some(&mut op.from),
            Op::Apply(op) => Some(&mut op.from),
            Op::Unnest(op) => Some(&mut op.from),
            Op::SimpleAggregate(op) => Some(&mut op.from),
            Op::HashAggregate(op) => Some(&mut op.from),
            Op::CountStar(op) => Some(&mut op.from),
            Op::Distinct(op) => Some(&mut op.from),
            Op::OrderBy(op) => Some(&mut op.from),
            Op::Limit(op) => Some(&mut op.from),
            Op::UnionMap(op) => Some(&mut op.from),
            Op::UnionPartition(op) => Some(&mut op.from),
            Op::OutputPart(op) => Some(&mut op.from),
            Op::OutputIndex(op) => Some(&mut op.from),
        }
    }

    /// The terminal operator at the bottom of this chain.
    pub fn terminal(&self) -> &Op {
        let mut cur = self;
        while let Some(from) = cur.from_op() {
            cur = from;
        }
        cur
    }

    /// Compose this chain over `dst`. `input` resolves the node's input
    /// index, when it has one.
    pub fn wrap(
        &self,
        dst: Box<dyn QuerySink>,
        input: Option<&Input>,
        ep: &ExecParams,
    ) -> Result<Wrapped> {
        match self {
            Op::Leaf(op) => op.wrap(dst, input),
            Op::Filter(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::Project(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::Apply(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::Unnest(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::SimpleAggregate(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::HashAggregate(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::CountStar(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::Distinct(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::OrderBy(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::Limit(op) => op.from.wrap(op.sink(dst), input, ep),
            Op::NoOutput(_) => Ok(Wrapped::Extra { sink: dst }),
            Op::DummyOutput(op) => op.wrap(dst),
            Op::UnionMap(op) => op.wrap(dst, input, ep),
            Op::UnionPartition(op) => op.wrap(dst, input, ep),
            Op::OutputPart(op) => op.wrap(dst, input, ep, None),
            Op::OutputIndex(op) => op.wrap(dst, input, ep),
            Op::Substitute(_) => Err(TernError::new(
                "SUBSTITUTE is a rendering marker and cannot execute",
            )),
            Op::Explain(op) => op.wrap(dst),
        }
    }

    /// Apply a rewriter to every expression embedded in this operator (not
    /// its predecessors).
    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        match self {
            Op::Leaf(op) => op.rewrite_exprs(r),
            Op::Filter(op) => op.rewrite_exprs(r),
            Op::Project(op) => op.rewrite_exprs(r),
            Op::Apply(op) => op.rewrite_exprs(r),
            Op::Unnest(op) => op.rewrite_exprs(r),
            Op::SimpleAggregate(op) => op.rewrite_exprs(r),
            Op::HashAggregate(op) => op.rewrite_exprs(r),
            Op::Distinct(op) => op.rewrite_exprs(r),
            Op::OrderBy(op) => op.rewrite_exprs(r),
            Op::UnionMap(op) => op.rewrite_exprs(r),
            Op::UnionPartition(op) => op.rewrite_exprs(r),
            Op::CountStar(_)
            | Op::Limit(_)
            | Op::NoOutput(_)
            | Op::DummyOutput(_)
            | Op::OutputPart(_)
            | Op::OutputIndex(_)
            | Op::Explain(_)
            | Op::Substitute(_) => Ok(()),
        }
    }

    /// Apply a rewriter to this operator and every predecessor.
    pub fn rewrite_chain(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        self.rewrite_exprs(r)?;
        if let Some(from) = self.from_op_mut() {
            from.rewrite_chain(r)?;
        }
        Ok(())
    }

    /// Encode this operator's own fields (not its predecessor) as a tagged
    /// struct.
    pub fn encode(&self) -> Value {
        let fields = match self {
            Op::Leaf(op) => op.encode_fields(),
            Op::Filter(op) => op.encode_fields(),
            Op::Project(op) => op.encode_fields(),
            Op::Apply(op) => op.encode_fields(),
            Op::Unnest(op) => op.encode_fields(),
            Op::SimpleAggregate(op) => op.encode_fields(),
            Op::HashAggregate(op) => op.encode_fields(),
            Op::CountStar(op) => op.encode_fields(),
            Op::Distinct(op) => op.encode_fields(),
            Op::OrderBy(op) => op.encode_fields(),
            Op::Limit(op) => op.encode_fields(),
            Op::NoOutput(_) | Op::DummyOutput(_) => Vec::new(),
            Op::UnionMap(op) => op.encode_fields(),
            Op::UnionPartition(op) => op.encode_fields(),
            Op::OutputPart(op) => op.encode_fields(),
            Op::OutputIndex(op) => op.encode_fields(),
            Op::Explain(op) => op.encode_fields(),
            Op::Substitute(op) => op.encode_fields(),
        };
        tagged(self.name(), fields)
    }

    /// Decode one operator, attaching `from` as its predecessor.
    ///
    /// Terminal operators reject a predecessor; nonterminals require one.
    pub fn decode_onto(v: &Value, from: Option<Op>) -> Result<Op> {
        let ty = v.field("type").as_str().required("type")?.to_string();
        let terminal = matches!(
            ty.as_str(),
            "leaf" | "none" | "dummy" | "explain" | "substitute"
        );
        if terminal && from.is_some() {
            return Err(TernError::with_kind(
                ErrorKind::Protocol,
                format!("operator {ty:?} cannot have a predecessor"),
            ));
        }
        if !terminal && from.is_none() {
            return Err(TernError::with_kind(
                ErrorKind::Protocol,
                format!("operator {ty:?} requires a predecessor"),
            ));
        }
        // Validated above; terminal arms ignore this placeholder.
        let from = from.unwrap_or(Op::NoOutput(NoOutput));
        Ok(match ty.as_str() {
            "leaf" => Op::Leaf(Leaf::decode_fields(v)?),
            "none" => Op::NoOutput(NoOutput),
            "dummy" => Op::DummyOutput(DummyOutput),
            "explain" => Op::Explain(Explain::decode_fields(v)?),
            "substitute" => Op::Substitute(Substitute::decode_fields(v)?),
            "filter" => Op::Filter(Filter::decode_fields(v, from)?),
            "project" => Op::Project(Project::decode_fields(v, from)?),
            "apply" => Op::Apply(Apply::decode_fields(v, from)?),
            "unnest" => Op::Unnest(Unnest::decode_fields(v, from)?),
            "simple_agg" => Op::SimpleAggregate(SimpleAggregate::decode_fields(v, from)?),
            "hash_agg" => Op::HashAggregate(HashAggregate::decode_fields(v, from)?),
            "count_star" => Op::CountStar(CountStar::decode_fields(v, from)?),
            "distinct" => Op::Distinct(Distinct::decode_fields(v, from)?),
            "order" => Op::OrderBy(OrderBy::decode_fields(v, from)?),
            "limit" => Op::Limit(Limit::decode_fields(v, from)?),
            "union_map" => Op::UnionMap(UnionMap::decode_fields(v, from)?),
            "union_partition" => Op::UnionPartition(UnionPartition::decode_fields(v, from)?),
            "output_part" => Op::OutputPart(OutputPart::decode_fields(v, from)?),
            "output_index" => Op::OutputIndex(OutputIndex::decode_fields(v, from)?),
            other => return Err(TernError::new(format!("unknown operator {other:?}"))),
        })
    }

    /// Render this chain predecessor-first, one operator per line.
    ///
    /// Distributed unions nest their shipped chain in parentheses instead of
    /// flattening it into the surrounding list.
    pub fn render(&self, input: Option<usize>, indent: usize, buf: &mut String) {
        match self {
            Op::UnionMap(op) => {
                push_line(buf, indent, &format!("UNION MAP {} (", input_name(input)));
                op.from.render(input, indent + 1, buf);
                push_line(buf, indent, ")");
                return;
            }
            Op::UnionPartition(op) => {
                push_line(
                    buf,
                    indent,
                    &format!("UNION PARTITION BY [{}] (", op.by.join(", ")),
                );
                op.from.render(input, indent + 1, buf);
                push_line(buf, indent, ")");
                return;
            }
            _ => {}
        }
        if let Some(from) = self.from_op() {
            from.render(input, indent, buf);
        }
        match self {
            Op::Leaf(op) => push_line(buf, indent, &op.display(input)),
            Op::Substitute(op) => op.render(indent, buf),
            Op::Explain(op) => op.render(indent, buf),
            other => push_line(buf, indent, &other.line()),
        }
    }

    /// One-line rendering for operators without nested structure.
    fn line(&self) -> String {
        match self {
            Op::Filter(op) => op.to_string(),
            Op::Project(op) => op.to_string(),
            Op::Apply(op) => op.to_string(),
            Op::Unnest(op) => op.to_string(),
            Op::SimpleAggregate(op) => op.to_string(),
            Op::HashAggregate(op) => op.to_string(),
            Op::CountStar(op) => op.to_string(),
            Op::Distinct(op) => op.to_string(),
            Op::OrderBy(op) => op.to_string(),
            Op::Limit(op) => op.to_string(),
            Op::NoOutput(_) => "NO OUTPUT".to_string(),
            Op::DummyOutput(_) => "DUMMY OUTPUT".to_string(),
            Op::OutputPart(op) => op.to_string(),
            Op::OutputIndex(op) => op.to_string(),
            // Handled structurally in `render`.
            Op::Leaf(_)
            | Op::UnionMap(_)
            | Op::UnionPartition(_)
            | Op::Explain(_)
            | Op::Substitute(_) => self.name().to_string(),
        }
    }
}

pub(crate) fn push_line(buf: &mut String, indent: usize, line: &str) {
    for _ in 0..indent {
        buf.push_str("  ");
    }
    buf.push_str(line);
    buf.push('\n');
}

pub(crate) fn input_name(input: Option<usize>) -> String {
    match input {
        Some(i) => format!("INPUT({i})"),
        None => "INPUT(-)".to_string(),
    }
}

pub(crate) fn tagged(ty: &str, mut fields: Vec<(String, Value)>) -> Value {
    let mut all = vec![("type".to_string(), Value::String(ty.to_string()))];
    all.append(&mut fields);
    Value::Struct(all)
}

pub(crate) fn encode_expr_list(exprs: &[Expr]) -> Value {
    Value::List(exprs.iter().map(tern_expr::encode_expr).collect())
}

pub(crate) fn decode_expr_list(v: &Value) -> Result<Vec<Expr>> {
    let mut out = Vec::new();
    if let Value::List(items) = v {
        for item in items {
            out.push(tern_expr::decode_expr(item)?);
        }
    }
    Ok(out)
}

pub(crate) fn encode_bindings(bindings: &[tern_expr::Binding]) -> Value {
    Value::List(
        bindings
            .iter()
            .map(|b| {
                Value::struct_of([
                    ("expr", tern_expr::encode_expr(&b.expr)),
                    ("as", Value::String(b.result.clone())),
                ])
            })
            .collect(),
    )
}

pub(crate) fn decode_bindings(v: &Value) -> Result<Vec<tern_expr::Binding>> {
    let mut out = Vec::new();
    if let Value::List(items) = v {
        for item in items {
            out.push(tern_expr::Binding::new(
                tern_expr::decode_expr(item.field("expr"))?,
                item.field("as").as_str().required("as")?,
            ));
        }
    }
    Ok(out)
}

/// Rewrite a list of expressions in place.
pub(crate) fn rewrite_all(r: &mut dyn Rewriter, exprs: &mut [Expr]) -> Result<()> {
    for e in exprs.iter_mut() {
        let taken = std::mem::replace(e, Expr::Star);
        *e = tern_expr::rewrite(r, taken)?;
    }
    Ok(())
}
