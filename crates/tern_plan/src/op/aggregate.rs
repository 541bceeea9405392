//! Aggregation operators: one-group, grouped, and the `COUNT(*)` fast path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tern_codec::{compare_total, encode_key, Value};
use tern_error::{OptionExt, Result, TernError};
use tern_expr::{
    decode_expr, encode_expr, AggBinding, AggOp, Aggregate, Binding, Expr, Rewriter,
};
use tern_mill::{eval, eval_filter, QuerySink, RowSink, Sketch};

use super::order::sort_cmp;
use super::project::rewrite_bindings;
use super::{decode_bindings, encode_bindings, Op};

/// One-group aggregation: a single output row regardless of input size.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleAggregate {
    pub from: Box<Op>,
    pub outputs: Vec<AggBinding>,
}

impl SimpleAggregate {
    pub fn new(from: Op, outputs: Vec<AggBinding>) -> SimpleAggregate {
        SimpleAggregate {
            from: Box::new(from),
            outputs,
        }
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(SimpleAggSink {
            outputs: self.outputs.clone(),
            merged: Arc::new(Mutex::new(None)),
            down,
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        rewrite_agg_bindings(r, &mut self.outputs)
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![("outputs".to_string(), encode_agg_bindings(&self.outputs))]
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<SimpleAggregate> {
        Ok(SimpleAggregate {
            from: Box::new(from),
            outputs: decode_agg_bindings(v.field("outputs"))?,
        })
    }
}

impl fmt::Display for SimpleAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AGGREGATE ")?;
        write_agg_bindings(f, &self.outputs)
    }
}

/// Ordering of grouped-aggregate output, by column index into the
/// concatenation of aggregate outputs and group-by outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggOrder {
    pub index: usize,
    pub desc: bool,
    pub nulls_last: bool,
}

/// Grouped aggregation, with optionally fused ORDER BY and LIMIT.
#[derive(Debug, Clone, PartialEq)]
pub struct HashAggregate {
    pub from: Box<Op>,
    pub aggs: Vec<AggBinding>,
    pub group_by: Vec<Binding>,
    pub order: Vec<AggOrder>,
    pub limit: Option<u64>,
}

impl HashAggregate {
    pub fn new(from: Op, aggs: Vec<AggBinding>, group_by: Vec<Binding>) -> HashAggregate {
        HashAggregate {
            from: Box::new(from),
            aggs,
            group_by,
            order: Vec::new(),
            limit: None,
        }
    }

    /// Name of output column `index`, counting aggregates first and then
    /// group-by columns.
    pub fn column_name(&self, index: usize) -> Option<&str> {
        if index < self.aggs.len() {
            return Some(&self.aggs[index].result);
        }
        self.group_by
            .get(index - self.aggs.len())
            .map(|b| b.result.as_str())
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(HashAggSink {
            op: self.clone(),
            merged: Arc::new(Mutex::new(None)),
            down,
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        rewrite_agg_bindings(r, &mut self.aggs)?;
        rewrite_bindings(r, &mut self.group_by)
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        let mut fields = vec![
            ("aggs".to_string(), encode_agg_bindings(&self.aggs)),
            ("group_by".to_string(), encode_bindings(&self.group_by)),
        ];
        if !self.order.is_empty() {
            fields.push((
                "order".to_string(),
                Value::List(
                    self.order
                        .iter()
                        .map(|o| {
                            Value::struct_of([
                                ("index", Value::Uint(o.index as u64)),
                                ("desc", Value::Bool(o.desc)),
                                ("nulls_last", Value::Bool(o.nulls_last)),
                            ])
                        })
                        .collect(),
                ),
            ));
        }
        if let Some(limit) = self.limit {
            fields.push(("limit".to_string(), Value::Uint(limit)));
        }
        fields
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<HashAggregate> {
        let mut order = Vec::new();
        if let Value::List(items) = v.field("order") {
            for item in items {
                order.push(AggOrder {
                    index: item.field("index").as_i64().required("index")? as usize,
                    desc: item.field("desc").as_bool().unwrap_or(false),
                    nulls_last: item.field("nulls_last").as_bool().unwrap_or(false),
                });
            }
        }
        Ok(HashAggregate {
            from: Box::new(from),
            aggs: decode_agg_bindings(v.field("aggs"))?,
            group_by: decode_bindings(v.field("group_by"))?,
            order,
            limit: v
                .field("limit")
                .as_i64()
                .and_then(|i| u64::try_from(i).ok()),
        })
    }
}

impl fmt::Display for HashAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AGGREGATE ")?;
        write_agg_bindings(f, &self.aggs)?;
        write!(f, " BY ")?;
        for (i, b) in self.group_by.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{b}")?;
        }
        for o in &self.order {
            write!(
                f,
                " ORDER COL {} {}{}",
                o.index,
                if o.desc { "DESC" } else { "ASC" },
                if o.nulls_last { " NULLS LAST" } else { "" },
            )?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

/// Optimized `COUNT(*)`: counts rows without evaluating any expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CountStar {
    pub from: Box<Op>,
    pub result: String,
}

impl CountStar {
    pub fn new(from: Op, result: impl Into<String>) -> CountStar {
        CountStar {
            from: Box::new(from),
            result: result.into(),
        }
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(CountStarSink {
            result: self.result.clone(),
            count: Arc::new(AtomicU64::new(0)),
            down,
        })
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![("as".to_string(), Value::String(self.result.clone()))]
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<CountStar> {
        Ok(CountStar {
            from: Box::new(from),
            result: v.field("as").as_str().required("as")?.to_string(),
        })
    }
}

impl fmt::Display for CountStar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COUNT(*) AS {}", self.result)
    }
}

fn write_agg_bindings(f: &mut fmt::Formatter<'_>, outputs: &[AggBinding]) -> fmt::Result {
    for (i, b) in outputs.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{b}")?;
    }
    Ok(())
}

fn encode_agg_bindings(outputs: &[AggBinding]) -> Value {
    Value::List(
        outputs
            .iter()
            .map(|b| {
                Value::struct_of([
                    ("agg", encode_expr(&Expr::Aggregate(b.agg.clone()))),
                    ("as", Value::String(b.result.clone())),
                ])
            })
            .collect(),
    )
}

fn decode_agg_bindings(v: &Value) -> Result<Vec<AggBinding>> {
    let mut out = Vec::new();
    if let Value::List(items) = v {
        for item in items {
            let agg = match decode_expr(item.field("agg"))? {
                Expr::Aggregate(agg) => agg,
                other => {
                    return Err(TernError::new(format!(
                        "expected aggregate expression, got {other}"
                    )))
                }
            };
            out.push(AggBinding::new(
                agg,
                item.field("as").as_str().required("as")?,
            ));
        }
    }
    Ok(out)
}

fn rewrite_agg_bindings(r: &mut dyn Rewriter, outputs: &mut [AggBinding]) -> Result<()> {
    for b in outputs.iter_mut() {
        let inner = std::mem::replace(&mut *b.agg.inner, Expr::Star);
        b.agg.inner = Box::new(tern_expr::rewrite(r, inner)?);
        if let Some(filter) = b.agg.filter.take() {
            b.agg.filter = Some(Box::new(tern_expr::rewrite(r, *filter)?));
        }
    }
    Ok(())
}

/// Exact integer sums until they would overflow, floats after.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn add(self, v: &Value) -> Num {
        match (self, v) {
            (Num::Int(a), Value::Int(b)) => match a.checked_add(*b) {
                Some(s) => Num::Int(s),
                None => Num::Float(a as f64 + *b as f64),
            },
            (Num::Int(a), Value::Uint(b)) => match i64::try_from(*b).ok().and_then(|b| a.checked_add(b)) {
                Some(s) => Num::Int(s),
                None => Num::Float(a as f64 + *b as f64),
            },
            (Num::Int(a), Value::Float(b)) => Num::Float(a as f64 + b),
            (Num::Int(_), _) => unreachable!("Num::add called with non-numeric value"),
            (Num::Float(a), _) => Num::Float(a + v.as_f64().unwrap_or(0.0)),
        }
    }

    fn merge(self, other: Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => match a.checked_add(b) {
                Some(s) => Num::Int(s),
                None => Num::Float(a as f64 + b as f64),
            },
            (a, b) => Num::Float(a.to_f64() + b.to_f64()),
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn to_value(self) -> Value {
        match self {
            Num::Int(i) => Value::Int(i),
            Num::Float(f) => Value::Float(f),
        }
    }
}

/// Accumulator state for one aggregate output.
#[derive(Debug, Clone)]
enum AccState {
    Count(u64),
    Sum(Option<Num>),
    SumCount(u64),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Approx(Sketch),
    Moments { sum: f64, sq: f64, count: u64 },
}

pub(crate) struct Acc {
    binding: AggBinding,
    state: AccState,
}

impl Acc {
    pub(crate) fn new(binding: &AggBinding) -> Acc {
        let state = match binding.agg.op {
            AggOp::Count => AccState::Count(0),
            AggOp::Sum => AccState::Sum(None),
            AggOp::SumCount => AccState::SumCount(0),
            AggOp::Avg => AccState::Avg { sum: 0.0, count: 0 },
            AggOp::Min => AccState::Min(None),
            AggOp::Max => AccState::Max(None),
            AggOp::ApproxCountDistinct
            | AggOp::ApproxCountDistinctPartial
            | AggOp::ApproxCountDistinctMerge => AccState::Approx(Sketch::new()),
            AggOp::StdDevPop | AggOp::VariancePop => AccState::Moments {
                sum: 0.0,
                sq: 0.0,
                count: 0,
            },
        };
        Acc {
            binding: binding.clone(),
            state,
        }
    }

    pub(crate) fn update(&mut self, row: &Value) -> Result<()> {
        if let Some(filter) = &self.binding.agg.filter {
            if !eval_filter(filter, row)? {
                return Ok(());
            }
        }
        // COUNT(*) counts rows without evaluating.
        if matches!(self.binding.agg.inner.as_ref(), Expr::Star) {
            if let AccState::Count(n) = &mut self.state {
                *n += 1;
                return Ok(());
            }
            return Err(TernError::new(format!(
                "cannot evaluate {}(*)",
                self.binding.agg.op.name()
            )));
        }
        let v = eval(&self.binding.agg.inner, row)?;
        if v.is_null() || v.is_missing() {
            return Ok(());
        }
        match &mut self.state {
            AccState::Count(n) => *n += 1,
            AccState::Sum(acc) => {
                if v.is_number() {
                    *acc = Some(match acc.take() {
                        Some(num) => num.add(&v),
                        None => Num::Int(0).add(&v),
                    });
                }
            }
            AccState::SumCount(acc) => {
                if let Some(n) = v.as_i64() {
                    *acc += n.max(0) as u64;
                } else if let Value::Uint(n) = v {
                    *acc += n;
                }
            }
            AccState::Avg { sum, count } => {
                if let Some(f) = v.as_f64() {
                    *sum += f;
                    *count += 1;
                }
            }
            AccState::Min(best) => {
                let better = best
                    .as_ref()
                    .map(|b| compare_total(&v, b) == std::cmp::Ordering::Less)
                    .unwrap_or(true);
                if better {
                    *best = Some(v);
                }
            }
            AccState::Max(best) => {
                let better = best
                    .as_ref()
                    .map(|b| compare_total(&v, b) == std::cmp::Ordering::Greater)
                    .unwrap_or(true);
                if better {
                    *best = Some(v);
                }
            }
            AccState::Approx(sketch) => {
                if self.binding.agg.op == AggOp::ApproxCountDistinctMerge {
                    match &v {
                        Value::Bytes(b) => sketch.merge(&Sketch::from_bytes(b)?),
                        other => {
                            return Err(TernError::new(format!(
                                "sketch merge expects bytes, got {other}"
                            )))
                        }
                    }
                } else {
                    sketch.insert(&v);
                }
            }
            AccState::Moments { sum, sq, count } => {
                if let Some(f) = v.as_f64() {
                    *sum += f;
                    *sq += f * f;
                    *count += 1;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn merge(&mut self, other: Acc) {
        match (&mut self.state, other.state) {
            (AccState::Count(a), AccState::Count(b)) => *a += b,
            (AccState::Sum(a), AccState::Sum(b)) => {
                *a = match (a.take(), b) {
                    (Some(x), Some(y)) => Some(x.merge(y)),
                    (x, y) => x.or(y),
                }
            }
            (AccState::SumCount(a), AccState::SumCount(b)) => *a += b,
            (AccState::Avg { sum, count }, AccState::Avg { sum: s2, count: c2 }) => {
                *sum += s2;
                *count += c2;
            }
            (AccState::Min(a), AccState::Min(b)) => {
                if let Some(v) = b {
                    let better = a
                        .as_ref()
                        .map(|x| compare_total(&v, x) == std::cmp::Ordering::Less)
                        .unwrap_or(true);
                    if better {
                        *a = Some(v);
                    }
                }
            }
            (AccState::Max(a), AccState::Max(b)) => {
                if let Some(v) = b {
                    let better = a
                        .as_ref()
                        .map(|x| compare_total(&v, x) == std::cmp::Ordering::Greater)
                        .unwrap_or(true);
                    if better {
                        *a = Some(v);
                    }
                }
            }
            (AccState::Approx(a), AccState::Approx(b)) => a.merge(&b),
            (
                AccState::Moments { sum, sq, count },
                AccState::Moments {
                    sum: s2,
                    sq: q2,
                    count: c2,
                },
            ) => {
                *sum += s2;
                *sq += q2;
                *count += c2;
            }
            // States always pair up: accumulators are built from the same
            // binding list on every writer.
            _ => {}
        }
    }

    pub(crate) fn finish(self) -> Value {
        match self.state {
            AccState::Count(n) => Value::Uint(n),
            AccState::Sum(None) => Value::Null,
            AccState::Sum(Some(num)) => num.to_value(),
            AccState::SumCount(n) => Value::Uint(n),
            AccState::Avg { count: 0, .. } => Value::Null,
            AccState::Avg { sum, count } => Value::Float(sum / count as f64),
            AccState::Min(best) | AccState::Max(best) => best.unwrap_or(Value::Null),
            AccState::Approx(sketch) => {
                if self.binding.agg.op == AggOp::ApproxCountDistinctPartial {
                    Value::Bytes(sketch.to_bytes())
                } else {
                    Value::Uint(sketch.estimate())
                }
            }
            AccState::Moments { count: 0, .. } => Value::Null,
            AccState::Moments { sum, sq, count } => {
                let n = count as f64;
                let mean = sum / n;
                let var = (sq / n - mean * mean).max(0.0);
                if self.binding.agg.op == AggOp::StdDevPop {
                    Value::Float(var.sqrt())
                } else {
                    Value::Float(var)
                }
            }
        }
    }
}

fn new_accs(outputs: &[AggBinding]) -> Vec<Acc> {
    outputs.iter().map(Acc::new).collect()
}

fn merge_accs(into: &mut Vec<Acc>, from: Vec<Acc>) {
    for (a, b) in into.iter_mut().zip(from) {
        a.merge(b);
    }
}

struct SimpleAggSink {
    outputs: Vec<AggBinding>,
    merged: Arc<Mutex<Option<Vec<Acc>>>>,
    down: Box<dyn QuerySink>,
}

impl QuerySink for SimpleAggSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(SimpleAggWriter {
            accs: new_accs(&self.outputs),
            merged: self.merged.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        // An aggregation over no input still emits its single row.
        let accs = self
            .merged
            .lock()
            .take()
            .unwrap_or_else(|| new_accs(&self.outputs));
        let row = Value::Struct(
            accs.into_iter()
                .map(|acc| (acc.binding.result.clone(), acc.finish()))
                .collect(),
        );
        let mut w = self.down.open()?;
        match w.write_rows(vec![row]) {
            Ok(()) => {}
            Err(err) if err.is_eof() => {}
            Err(err) => return Err(err),
        }
        w.close()?;
        self.down.close()
    }
}

struct SimpleAggWriter {
    accs: Vec<Acc>,
    merged: Arc<Mutex<Option<Vec<Acc>>>>,
}

impl RowSink for SimpleAggWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        for row in &rows {
            for acc in &mut self.accs {
                acc.update(row)?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let accs = std::mem::take(&mut self.accs);
        let mut merged = self.merged.lock();
        match merged.as_mut() {
            Some(existing) => merge_accs(existing, accs),
            None => *merged = Some(accs),
        }
        Ok(())
    }
}

type GroupMap = HashMap<Vec<u8>, (Vec<Value>, Vec<Acc>)>;

struct HashAggSink {
    op: HashAggregate,
    merged: Arc<Mutex<Option<GroupMap>>>,
    down: Box<dyn QuerySink>,
}

impl QuerySink for HashAggSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(HashAggWriter {
            op: self.op.clone(),
            groups: GroupMap::new(),
            merged: self.merged.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        let groups = self.merged.lock().take().unwrap_or_default();
        // Materialize per-group column tuples, aggregates first.
        let mut rows: Vec<Vec<Value>> = Vec::with_capacity(groups.len());
        for (_, (keys, accs)) in groups {
            let mut cols: Vec<Value> = accs.into_iter().map(Acc::finish).collect();
            cols.extend(keys);
            rows.push(cols);
        }
        if !self.op.order.is_empty() {
            let order = self.op.order.clone();
            rows.sort_by(|a, b| {
                for o in &order {
                    let (x, y) = (
                        a.get(o.index).unwrap_or(&Value::Missing),
                        b.get(o.index).unwrap_or(&Value::Missing),
                    );
                    let ord = sort_cmp(x, y, o.desc, o.nulls_last);
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        if let Some(limit) = self.op.limit {
            rows.truncate(limit as usize);
        }
        let names: Vec<String> = self
            .op
            .aggs
            .iter()
            .map(|b| b.result.clone())
            .chain(self.op.group_by.iter().map(|b| b.result.clone()))
            .collect();
        let out: Vec<Value> = rows
            .into_iter()
            .map(|cols| {
                Value::Struct(names.iter().cloned().zip(cols).collect())
            })
            .collect();
        let mut w = self.down.open()?;
        if !out.is_empty() {
            match w.write_rows(out) {
                Ok(()) => {}
                Err(err) if err.is_eof() => {}
                Err(err) => return Err(err),
            }
        }
        w.close()?;
        self.down.close()
    }
}

struct HashAggWriter {
    op: HashAggregate,
    groups: GroupMap,
    merged: Arc<Mutex<Option<GroupMap>>>,
}

impl RowSink for HashAggWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        for row in &rows {
            let mut keys = Vec::with_capacity(self.op.group_by.len());
            for b in &self.op.group_by {
                keys.push(eval(&b.expr, row)?);
            }
            let key = encode_key(&keys);
            let entry = self.groups.entry(key).or_insert_with(|| {
                (keys, new_accs(&self.op.aggs))
            });
            for acc in &mut entry.1 {
                acc.update(row)?;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let local = std::mem::take(&mut self.groups);
        let mut merged = self.merged.lock();
        let target = merged.get_or_insert_with(GroupMap::new);
        for (key, (keys, accs)) in local {
            match target.get_mut(&key) {
                Some((_, existing)) => merge_accs(existing, accs),
                None => {
                    target.insert(key, (keys, accs));
                }
            }
        }
        Ok(())
    }
}

struct CountStarSink {
    result: String,
    count: Arc<AtomicU64>,
    down: Box<dyn QuerySink>,
}

impl QuerySink for CountStarSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(CountStarWriter {
            count: self.count.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        let row = Value::struct_of([(
            self.result.as_str(),
            Value::Uint(self.count.load(Ordering::SeqCst)),
        )]);
        let mut w = self.down.open()?;
        match w.write_rows(vec![row]) {
            Ok(()) => {}
            Err(err) if err.is_eof() => {}
            Err(err) => return Err(err),
        }
        w.close()?;
        self.down.close()
    }
}

struct CountStarWriter {
    count: Arc<AtomicU64>,
}

impl RowSink for CountStarWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        self.count.fetch_add(rows.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_mill::CollectSink;

    fn feed(sink: &dyn QuerySink, rows: Vec<Value>) {
        let mut w = sink.open().unwrap();
        w.write_rows(rows).unwrap();
        w.close().unwrap();
        sink.close().unwrap();
    }

    fn row(v: i64, g: &str) -> Value {
        Value::struct_of([("v", Value::Int(v)), ("g", Value::String(g.to_string()))])
    }

    #[test]
    fn simple_aggregate_all_ops() {
        let op = SimpleAggregate::new(
            Op::Leaf(super::super::Leaf::new()),
            vec![
                AggBinding::new(Aggregate::new(AggOp::Count, Expr::Star), "n"),
                AggBinding::new(Aggregate::new(AggOp::Sum, Expr::path("v")), "sum"),
                AggBinding::new(Aggregate::new(AggOp::Avg, Expr::path("v")), "avg"),
                AggBinding::new(Aggregate::new(AggOp::Min, Expr::path("v")), "min"),
                AggBinding::new(Aggregate::new(AggOp::Max, Expr::path("v")), "max"),
            ],
        );
        let collect = CollectSink::new();
        let sink = op.sink(Box::new(collect.clone()));
        feed(&*sink, vec![row(1, "a"), row(2, "a"), row(3, "b")]);
        let out = collect.rows();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field("n"), &Value::Uint(3));
        assert_eq!(out[0].field("sum"), &Value::Int(6));
        assert_eq!(out[0].field("avg"), &Value::Float(2.0));
        assert_eq!(out[0].field("min"), &Value::Int(1));
        assert_eq!(out[0].field("max"), &Value::Int(3));
    }

    #[test]
    fn simple_aggregate_empty_input_emits_row() {
        let op = SimpleAggregate::new(
            Op::Leaf(super::super::Leaf::new()),
            vec![
                AggBinding::new(Aggregate::new(AggOp::Count, Expr::path("v")), "n"),
                AggBinding::new(Aggregate::new(AggOp::Sum, Expr::path("v")), "sum"),
            ],
        );
        let collect = CollectSink::new();
        let sink = op.sink(Box::new(collect.clone()));
        sink.close().unwrap();
        let out = collect.rows();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field("n"), &Value::Uint(0));
        assert_eq!(out[0].field("sum"), &Value::Null);
    }

    #[test]
    fn aggregate_filter_clause() {
        let op = SimpleAggregate::new(
            Op::Leaf(super::super::Leaf::new()),
            vec![AggBinding::new(
                Aggregate::new(AggOp::Count, Expr::path("v")).with_filter(Expr::compare(
                    tern_expr::CompareOp::Gt,
                    Expr::path("v"),
                    Expr::integer(1),
                )),
                "n",
            )],
        );
        let collect = CollectSink::new();
        let sink = op.sink(Box::new(collect.clone()));
        feed(&*sink, vec![row(1, "a"), row(2, "a"), row(3, "b")]);
        assert_eq!(collect.rows()[0].field("n"), &Value::Uint(2));
    }

    #[test]
    fn hash_aggregate_groups_orders_and_limits() {
        let mut op = HashAggregate::new(
            Op::Leaf(super::super::Leaf::new()),
            vec![AggBinding::new(
                Aggregate::new(AggOp::Sum, Expr::path("v")),
                "sum",
            )],
            vec![Binding::new(Expr::path("g"), "g")],
        );
        // Order by the group column (index 1 = aggs ++ group_by).
        op.order = vec![AggOrder {
            index: 1,
            desc: false,
            nulls_last: false,
        }];
        op.limit = Some(2);
        let collect = CollectSink::new();
        let sink = op.sink(Box::new(collect.clone()));
        // Two writers, interleaved groups.
        let mut w1 = sink.open().unwrap();
        let mut w2 = sink.open().unwrap();
        w1.write_rows(vec![row(1, "c"), row(2, "a")]).unwrap();
        w2.write_rows(vec![row(3, "a"), row(4, "b")]).unwrap();
        w1.close().unwrap();
        w2.close().unwrap();
        sink.close().unwrap();
        let out = collect.rows();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].field("g"), &Value::String("a".to_string()));
        assert_eq!(out[0].field("sum"), &Value::Int(5));
        assert_eq!(out[1].field("g"), &Value::String("b".to_string()));
    }

    #[test]
    fn count_star_counts_rows() {
        let op = CountStar::new(Op::Leaf(super::super::Leaf::new()), "count");
        let collect = CollectSink::new();
        let sink = op.sink(Box::new(collect.clone()));
        feed(&*sink, vec![row(1, "a"), row(2, "b"), Value::Struct(vec![])]);
        assert_eq!(
            collect.rows(),
            vec![Value::struct_of([("count", Value::Uint(3))])]
        );
    }

    #[test]
    fn approx_partial_merge_matches_plain() {
        let plain = SimpleAggregate::new(
            Op::Leaf(super::super::Leaf::new()),
            vec![AggBinding::new(
                Aggregate::new(AggOp::ApproxCountDistinct, Expr::path("v")),
                "acd",
            )],
        );
        let collect = CollectSink::new();
        let sink = plain.sink(Box::new(collect.clone()));
        let rows: Vec<Value> = (0..300).map(|i| row(i % 100, "x")).collect();
        feed(&*sink, rows.clone());
        let direct = collect.rows()[0].field("acd").clone();

        // Partial on two halves, then merge.
        let partial_op = SimpleAggregate::new(
            Op::Leaf(super::super::Leaf::new()),
            vec![AggBinding::new(
                Aggregate::new(AggOp::ApproxCountDistinctPartial, Expr::path("v")),
                "p",
            )],
        );
        let mut partials = Vec::new();
        for half in rows.chunks(150) {
            let c = CollectSink::new();
            let s = partial_op.sink(Box::new(c.clone()));
            feed(&*s, half.to_vec());
            partials.push(Value::struct_of([("p", c.rows()[0].field("p").clone())]));
        }
        let merge_op = SimpleAggregate::new(
            Op::Leaf(super::super::Leaf::new()),
            vec![AggBinding::new(
                Aggregate::new(AggOp::ApproxCountDistinctMerge, Expr::path("p")),
                "acd",
            )],
        );
        let c = CollectSink::new();
        let s = merge_op.sink(Box::new(c.clone()));
        feed(&*s, partials);
        assert_eq!(c.rows()[0].field("acd"), &direct);
    }
}
