use std::sync::Arc;

use tern_codec::Value;
use tern_error::{Result, TernError};
use tern_expr::{Expr, Rewriter};
use tern_mill::{LockedSink, QuerySink};
use tracing::debug;

use super::{decode_expr_list, encode_expr_list, rewrite_all, ExecTask, Op, Wrapped};
use crate::exec::ExecParams;
use crate::input::Input;
use crate::stats::ExecStats;
use crate::transport::Geometry;
use crate::tree::{Node, Tree};

/// Distributes its predecessor chain across a geometry of peers.
///
/// The input splits deterministically by `(object, block)` hash; each
/// non-empty shard becomes a stub plan holding only that shard, shipped to
/// one peer. Peer outputs merge through a shared locked sink, in no
/// particular order.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionMap {
    pub from: Box<Op>,
    pub geometry: Option<Geometry>,
    /// Predicates pushed down from above; applied to shards before shipping.
    pub hints: Vec<Expr>,
}

impl UnionMap {
    pub fn new(from: Op, geometry: Geometry) -> UnionMap {
        UnionMap {
            from: Box::new(from),
            geometry: Some(geometry),
            hints: Vec::new(),
        }
    }

    pub fn wrap(
        &self,
        dst: Box<dyn QuerySink>,
        input: Option<&Input>,
        ep: &ExecParams,
    ) -> Result<Wrapped> {
        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| TernError::new("UNION MAP without a geometry"))?;
        if geometry.is_empty() {
            return Err(TernError::new("UNION MAP with zero peers"));
        }
        let input = input.ok_or_else(|| TernError::new("UNION MAP without an input"))?;
        let mut eff = input.clone();
        for h in &self.hints {
            eff = eff.filter(h);
            crate::input::merge_hint(&mut eff.hint, h);
        }
        let shards = eff.hash_split(geometry.len())?;

        let locked = Arc::new(LockedSink::new(dst.open()?));
        let peer_ctx = ep.ctx.child();
        let mut tasks: Vec<ExecTask> = Vec::new();
        for (i, shard) in shards.into_iter().enumerate() {
            // Empty shards contribute nothing.
            let shard = match shard {
                Some(shard) => shard,
                None => continue,
            };
            let peer = geometry.peers[i].clone();
            let stub = Tree {
                id: format!("{}", uuid::Uuid::new_v4()),
                inputs: vec![shard],
                root: Node::new(Some(0), (*self.from).clone()),
                data: ep.data.clone(),
            };
            let mut sub = ep.clone_for_subplan();
            sub.ctx = peer_ctx.clone();
            sub.stats = Arc::new(ExecStats::new());
            let parent_stats = ep.stats.clone();
            let abort = peer_ctx.clone();
            let out = locked.clone();
            tasks.push(Box::new(move || {
                debug!(peer = i, plan = %stub.id, "dispatching union-map shard");
                let result = peer.exec(&stub, &sub, out);
                parent_stats.fold(&sub.stats);
                if let Err(err) = &result {
                    if !err.is_eof() {
                        // Abort the sibling peers; the parent context stays
                        // alive so the error can surface normally.
                        abort.cancel();
                    }
                }
                result
            }));
        }
        Ok(Wrapped::Tasks {
            tasks,
            sink: Box::new(CloseMerge { locked, down: dst }),
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        rewrite_all(r, &mut self.hints)
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        // The shipped chain is the predecessor in the flattened op list;
        // only the geometry and hints are ours.
        let mut fields = Vec::new();
        if let Some(geometry) = &self.geometry {
            fields.push(("geometry".to_string(), geometry.encode()));
        }
        if !self.hints.is_empty() {
            fields.push(("hints".to_string(), encode_expr_list(&self.hints)));
        }
        fields
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<UnionMap> {
        let geometry = match v.field("geometry") {
            Value::Missing => None,
            g => Some(Geometry::decode(g)?),
        };
        Ok(UnionMap {
            from: Box::new(from),
            geometry,
            hints: decode_expr_list(v.field("hints"))?,
        })
    }
}

/// Closes the merge writer, then the downstream chain.
struct CloseMerge {
    locked: Arc<LockedSink>,
    down: Box<dyn QuerySink>,
}

impl QuerySink for CloseMerge {
    fn open(&self) -> Result<Box<dyn tern_mill::RowSink>> {
        self.locked.open()
    }

    fn close(&self) -> Result<()> {
        self.locked.close()?;
        self.down.close()
    }
}
