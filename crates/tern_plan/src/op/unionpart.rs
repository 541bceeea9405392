use std::sync::Arc;

use tern_codec::Value;
use tern_error::{Result, TernError};
use tern_expr::Rewriter;
use tern_mill::QuerySink;
use tracing::debug;

use super::{ExecTask, Op, Wrapped};
use crate::exec::{self, distribute, ExecParams, PartitionValueRewriter};
use crate::input::Input;
use crate::stats::ExecStats;
use crate::tree::{Node, Tree};

/// Splits its input by distinct tuples of sparse-metadata constants and runs
/// the predecessor chain once per group.
///
/// Inside a group, `PARTITION_VALUE(i)` resolves to the group's i-th
/// constant. Worker shares are allocated proportionally to group size.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionPartition {
    pub from: Box<Op>,
    pub by: Vec<String>,
}

impl UnionPartition {
    pub fn new(from: Op, by: Vec<String>) -> UnionPartition {
        UnionPartition {
            from: Box::new(from),
            by,
        }
    }

    pub fn wrap(
        &self,
        dst: Box<dyn QuerySink>,
        input: Option<&Input>,
        ep: &ExecParams,
    ) -> Result<Wrapped> {
        if self.by.is_empty() {
            return Err(TernError::new("UNION PARTITION with no fields"));
        }
        let input = input.ok_or_else(|| TernError::new("UNION PARTITION without an input"))?;
        let part = input.partition(&self.by)?;
        if part.is_empty() {
            // No groups: empty output.
            return Ok(Wrapped::Extra { sink: dst });
        }
        let shared: Arc<dyn QuerySink> = Arc::from(dst);
        let sizes: Vec<i64> = part.groups().iter().map(|g| g.input.size()).collect();
        let shares = distribute(&sizes, ep.parallel.max(part.len()));
        let group_ctx = ep.ctx.child();
        let mut tasks: Vec<ExecTask> = Vec::new();
        for (group, share) in part.groups().iter().zip(shares) {
            let mut op = (*self.from).clone();
            op.rewrite_chain(&mut PartitionValueRewriter {
                values: group.values.clone(),
            })?;
            let stub = Tree {
                id: format!("{}", uuid::Uuid::new_v4()),
                inputs: vec![group.input.clone()],
                root: Node::new(Some(0), op),
                data: ep.data.clone(),
            };
            let mut sub = ep.clone_for_subplan();
            sub.ctx = group_ctx.clone();
            sub.stats = Arc::new(ExecStats::new());
            sub.parallel = share.max(1);
            let parent_stats = ep.stats.clone();
            let abort = group_ctx.clone();
            let out = shared.clone();
            tasks.push(Box::new(move || {
                debug!(plan = %stub.id, workers = sub.parallel, "executing partition group");
                let result = exec::run(&stub, out, &sub);
                parent_stats.fold(&sub.stats);
                if let Err(err) = &result {
                    if !err.is_eof() {
                        abort.cancel();
                    }
                }
                result
            }));
        }
        Ok(Wrapped::Tasks {
            tasks,
            sink: Box::new(CloseShared { shared }),
        })
    }

    pub fn rewrite_exprs(&mut self, _r: &mut dyn Rewriter) -> Result<()> {
        // The chain below carries the partition-value references; the
        // chain-level rewrite visits it directly.
        Ok(())
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![(
            "by".to_string(),
            Value::List(self.by.iter().map(|f| Value::String(f.clone())).collect()),
        )]
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<UnionPartition> {
        let mut by = Vec::new();
        if let Value::List(items) = v.field("by") {
            for item in items {
                by.push(
                    item.as_str()
                        .ok_or_else(|| TernError::new("bad partition field"))?
                        .to_string(),
                );
            }
        }
        if by.is_empty() {
            return Err(TernError::new("UNION PARTITION with no fields"));
        }
        Ok(UnionPartition {
            from: Box::new(from),
            by,
        })
    }
}

struct CloseShared {
    shared: Arc<dyn QuerySink>,
}

impl QuerySink for CloseShared {
    fn open(&self) -> Result<Box<dyn tern_mill::RowSink>> {
        self.shared.open()
    }

    fn close(&self) -> Result<()> {
        self.shared.close()
    }
}
