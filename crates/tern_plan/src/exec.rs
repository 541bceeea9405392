//! Local plan execution on a fixed-size worker pool.

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::ThreadPool;
use tern_codec::Value;
use tern_error::{Result, TernError};
use tern_expr::{Expr, Rewriter};
use tern_mill::{CollectSink, Context, QuerySink, RowSink};
use tracing::debug;

use crate::env::{Runner, UploadEnv};
use crate::op::{Op, Wrapped};
use crate::stats::ExecStats;
use crate::tree::{Node, Tree};

/// Parameters shared by every task of one plan execution.
#[derive(Clone)]
pub struct ExecParams {
    pub ctx: Context,
    pub stats: Arc<ExecStats>,
    /// Configured worker-pool size; the effective pool is capped by the
    /// number of inputs in the plan.
    pub parallel: usize,
    /// Parallelism granted to a single table scan.
    pub sub_parallel: usize,
    pub runner: Arc<dyn Runner>,
    pub upload: Option<Arc<dyn UploadEnv>>,
    /// The plan's opaque datum, forwarded to peers untouched.
    pub data: Option<Value>,
}

impl ExecParams {
    pub fn new(runner: Arc<dyn Runner>) -> ExecParams {
        ExecParams {
            ctx: Context::new(),
            stats: Arc::new(ExecStats::new()),
            parallel: num_cpus::get(),
            sub_parallel: 1,
            runner,
            upload: None,
            data: None,
        }
    }

    pub fn with_parallel(mut self, parallel: usize) -> ExecParams {
        self.parallel = parallel.max(1);
        self
    }

    pub fn with_context(mut self, ctx: Context) -> ExecParams {
        self.ctx = ctx;
        self
    }

    pub fn with_upload(mut self, upload: Arc<dyn UploadEnv>) -> ExecParams {
        self.upload = Some(upload);
        self
    }

    /// Clone for a subplan: same context and configuration, same stats.
    /// Callers that need isolated stats swap them afterwards.
    pub fn clone_for_subplan(&self) -> ExecParams {
        self.clone()
    }
}

/// Run a plan, streaming its output into `dst`.
///
/// `dst` is not closed; the caller owns its lifecycle. Rows written to it are
/// counted into the plan's stats.
pub fn run(tree: &Tree, dst: Arc<dyn QuerySink>, ep: &ExecParams) -> Result<()> {
    ep.ctx.check()?;
    let total_inputs = tree.input_count();
    let parallel = ep.parallel.max(1).min(total_inputs.max(1));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallel)
        .thread_name(|i| format!("tern_exec_{i}"))
        .build()
        .map_err(|e| TernError::with_source("failed to build worker pool", Box::new(e)))?;
    debug!(id = %tree.id, workers = parallel, "executing plan");

    let mut ep = ep.clone();
    ep.sub_parallel = parallel.div_ceil(total_inputs.max(1));
    if ep.data.is_none() {
        ep.data = tree.data.clone();
    }

    let counted: Arc<dyn QuerySink> = Arc::new(CountingSink {
        down: dst,
        stats: ep.stats.clone(),
    });
    let mut root = tree.root.clone();
    exec_node(&pool, tree, &mut root, counted, &ep)
}

fn exec_node(
    pool: &ThreadPool,
    tree: &Tree,
    node: &mut Node,
    dst: Arc<dyn QuerySink>,
    ep: &ExecParams,
) -> Result<()> {
    ep.ctx.check()?;
    push_filters(&mut node.op);
    subexec(pool, tree, node, ep)?;

    let input = node.input.and_then(|i| tree.inputs.get(i));
    let wrapped = node.op.wrap(Box::new(NoClose { down: dst }), input, ep)?;
    let errors = TaskErrors::default();
    match wrapped {
        Wrapped::Input { input, sink } => {
            let sink: Arc<dyn QuerySink> = Arc::from(sink);
            let task_sink = sink.clone();
            pool.scope(|s| {
                s.spawn(|_| {
                    errors.record(ep.runner.run(&*task_sink, &input, ep));
                });
            });
            errors.record(sink.close());
        }
        Wrapped::Extra { sink } => {
            errors.record(sink.close());
        }
        Wrapped::Tasks { tasks, sink } => {
            // Distribution tasks block on peers or subplans; give each its
            // own thread so peers genuinely run side by side instead of
            // queueing behind the scan pool.
            std::thread::scope(|s| {
                for task in tasks {
                    s.spawn(|| errors.record(task()));
                }
            });
            errors.record(sink.close());
        }
    }
    errors.into_result()
}

/// Execute every child subtree concurrently, then substitute each child's
/// scalar output into this node's expressions.
fn subexec(pool: &ThreadPool, tree: &Tree, node: &mut Node, ep: &ExecParams) -> Result<()> {
    if node.children.is_empty() {
        return Ok(());
    }
    let outputs: Mutex<Vec<Option<Result<Vec<Value>>>>> =
        Mutex::new((0..node.children.len()).map(|_| None).collect());
    std::thread::scope(|s| {
        for (i, child) in node.children.iter_mut().enumerate() {
            let outputs = &outputs;
            s.spawn(move || {
                let collect = CollectSink::new();
                let result = exec_node(pool, tree, child, Arc::new(collect.clone()), ep)
                    .map(|()| collect.take_rows());
                outputs.lock()[i] = Some(result);
            });
        }
    });
    let mut scalars = Vec::with_capacity(node.children.len());
    for (i, slot) in outputs.into_inner().into_iter().enumerate() {
        let rows = slot.unwrap_or_else(|| Err(TernError::new("child subtree did not run")))?;
        scalars.push(scalar_of(i, rows)?);
    }
    let mut rewriter = ReplacementRewriter { scalars };
    node.op.rewrite_chain(&mut rewriter)
}

/// The scalar constant a replacement resolves to: the first field of its
/// single output row.
fn scalar_of(index: usize, rows: Vec<Value>) -> Result<Value> {
    match rows.len() {
        0 => Ok(Value::Missing),
        1 => match &rows[0] {
            Value::Struct(fields) if !fields.is_empty() => Ok(fields[0].1.clone()),
            other => Ok(other.clone()),
        },
        n => Err(TernError::new(format!(
            "replacement {index} produced {n} rows, expected one"
        ))),
    }
}

struct ReplacementRewriter {
    scalars: Vec<Value>,
}

impl Rewriter for ReplacementRewriter {
    fn rewrite(&mut self, e: Expr) -> Result<Expr> {
        match e {
            Expr::ScalarReplacement(i) => match self.scalars.get(i) {
                Some(v) => Ok(Expr::Const(v.clone())),
                None => Err(TernError::new(format!(
                    "SCALAR_REPLACEMENT({i}) has no child"
                ))),
            },
            other => Ok(other),
        }
    }
}

/// Rewriter installed for each partition group: `PARTITION_VALUE(i)` becomes
/// the group's i-th constant.
pub(crate) struct PartitionValueRewriter {
    pub values: Vec<Value>,
}

impl Rewriter for PartitionValueRewriter {
    fn rewrite(&mut self, e: Expr) -> Result<Expr> {
        match e {
            Expr::PartitionValue(i) => match self.values.get(i) {
                Some(v) => Ok(Expr::Const(v.clone())),
                None => Err(TernError::new(format!(
                    "PARTITION_VALUE({i}) out of range"
                ))),
            },
            other => Ok(other),
        }
    }
}

/// Attach every filter's predicate to the nearest pushdown point below it:
/// a leaf, another filter, an order-by barrier, or a distributed union.
fn push_filters(op: &mut Op) {
    if let Op::Filter(f) = op {
        let pred = f.expr.clone();
        attach_hint(&mut f.from, pred);
    }
    if let Some(from) = op.from_op_mut() {
        push_filters(from);
    }
}

fn attach_hint(op: &mut Op, pred: Expr) {
    match op {
        Op::Leaf(leaf) => leaf.hints.push(pred),
        Op::Filter(f) => f.hints.push(pred),
        Op::OrderBy(o) => o.hints.push(pred),
        Op::UnionMap(u) => u.hints.push(pred),
        // A limit passes rows through unchanged, so the predicate still
        // names scan columns below it. Everything else reshapes rows;
        // pushing a predicate past it would prune against the wrong
        // columns, so the hint is dropped instead.
        Op::Limit(l) => attach_hint(&mut l.from, pred),
        _ => {}
    }
}

/// Collects task errors; EOF never wins, and a real failure displaces a bare
/// cancellation.
#[derive(Default)]
pub(crate) struct TaskErrors {
    first: Mutex<Option<TernError>>,
}

impl TaskErrors {
    pub(crate) fn record(&self, result: Result<()>) {
        let err = match result {
            Ok(()) => return,
            Err(err) if err.is_eof() => return,
            Err(err) => err,
        };
        let mut first = self.first.lock();
        match first.as_ref() {
            None => *first = Some(err),
            Some(existing) if existing.is_cancelled() && !err.is_cancelled() => {
                *first = Some(err)
            }
            Some(_) => {}
        }
    }

    pub(crate) fn into_result(self) -> Result<()> {
        match self.first.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Shields the caller's sink from the executor's cascading close.
struct NoClose {
    down: Arc<dyn QuerySink>,
}

impl QuerySink for NoClose {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        self.down.open()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Counts rows that reach the plan's output.
struct CountingSink {
    down: Arc<dyn QuerySink>,
    stats: Arc<ExecStats>,
}

impl QuerySink for CountingSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(CountingWriter {
            down: self.down.open()?,
            stats: self.stats.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.down.close()
    }
}

struct CountingWriter {
    down: Box<dyn RowSink>,
    stats: Arc<ExecStats>,
}

impl RowSink for CountingWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        self.stats.add_rows_out(rows.len() as u64);
        self.down.write_rows(rows)
    }

    fn close(&mut self) -> Result<()> {
        self.down.close()
    }
}

/// Split `value` units proportionally to `sizes`.
///
/// Zero sizes count as one. Every slot receives at least one unit (when
/// `value` covers the slot count) and the total always equals `value`.
pub fn distribute(sizes: &[i64], value: usize) -> Vec<usize> {
    if sizes.is_empty() {
        return Vec::new();
    }
    let weights: Vec<u64> = sizes.iter().map(|&s| s.max(1) as u64).collect();
    let total: u64 = weights.iter().sum();
    let mut out: Vec<usize> = weights
        .iter()
        .map(|&w| ((value as u64 * w) / total) as usize)
        .collect();
    let mut used: usize = out.iter().sum();
    for slot in out.iter_mut() {
        if *slot == 0 {
            *slot = 1;
            used += 1;
        }
    }
    if used < value {
        // Remainder lands on the last slot.
        if let Some(last) = out.last_mut() {
            *last += value - used;
        }
    } else if used > value {
        let mut excess = used - value;
        for slot in out.iter_mut().rev() {
            while *slot > 1 && excess > 0 {
                *slot -= 1;
                excess -= 1;
            }
            if excess == 0 {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribute_is_proportional() {
        let out = distribute(&[100, 100, 100, 100], 8);
        assert_eq!(out, vec![2, 2, 2, 2]);

        let out = distribute(&[300, 100], 4);
        assert_eq!(out, vec![3, 1]);
    }

    #[test]
    fn distribute_remainder_on_last() {
        let out = distribute(&[1, 1, 1], 10);
        assert_eq!(out.iter().sum::<usize>(), 10);
        assert_eq!(out, vec![3, 3, 4]);
    }

    #[test]
    fn distribute_minimum_one() {
        let out = distribute(&[1_000_000, 1, 0], 6);
        assert_eq!(out.iter().sum::<usize>(), 6);
        assert!(out.iter().all(|&v| v >= 1));
        assert!(out[0] >= out[1]);
    }

    #[test]
    fn distribute_value_equals_len() {
        let out = distribute(&[500, 1, 1, 1], 4);
        assert_eq!(out, vec![1, 1, 1, 1]);
    }

    #[test]
    fn task_errors_prefer_real_failures() {
        let errors = TaskErrors::default();
        errors.record(Err(TernError::eof()));
        errors.record(Err(TernError::cancelled()));
        errors.record(Err(TernError::new("boom")));
        errors.record(Err(TernError::new("later")));
        let err = errors.into_result().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
