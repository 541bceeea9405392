//! Input deduplication during lowering.
//!
//! Leaves scanning the same table share one `Inputs[]` slot when their hints
//! can merge; `stat` runs once per slot, after every reference has been
//! seen, so the environment observes the final merged hints.

use tern_error::Result;
use tern_expr::{conjoin, conjuncts, contains_timestamp_compare, Expr};

use crate::env::{Env, StatHints};
use crate::input::Input;

struct TableRef {
    table: Expr,
    /// `None` is the wildcard: every field.
    fields: Option<Vec<String>>,
    wildcard: bool,
    /// Merged filter hint.
    hint: Option<Expr>,
}

#[derive(Default)]
pub(crate) struct InputWalker {
    refs: Vec<TableRef>,
}

impl InputWalker {
    pub(crate) fn new() -> InputWalker {
        InputWalker::default()
    }

    /// Find or create the input slot for a table reference, merging hints
    /// when allowed. Returns the slot index.
    pub(crate) fn lookup(
        &mut self,
        table: &Expr,
        filter: Option<&Expr>,
        fields: Option<&[String]>,
    ) -> usize {
        for (i, r) in self.refs.iter_mut().enumerate() {
            if &r.table != table {
                continue;
            }
            if let Some(hint) = merge_hints(r.hint.as_ref(), filter) {
                r.fields = merge_fields(r.fields.take(), fields);
                r.wildcard = r.wildcard || fields.is_none();
                r.hint = hint;
                return i;
            }
        }
        self.refs.push(TableRef {
            table: table.clone(),
            fields: fields.map(|f| f.to_vec()),
            wildcard: fields.is_none(),
            hint: filter.cloned(),
        });
        self.refs.len() - 1
    }

    /// Table expression behind a slot.
    pub(crate) fn table_of(&self, index: usize) -> Option<&Expr> {
        self.refs.get(index).map(|r| &r.table)
    }

    /// Stat every slot with its final hints and produce the plan inputs.
    pub(crate) fn finalize(self, env: &dyn Env) -> Result<Vec<Input>> {
        let mut inputs = Vec::with_capacity(self.refs.len());
        for r in self.refs {
            let hints = StatHints {
                filter: r.hint.as_ref(),
                fields: r.fields.as_deref(),
                wildcard: r.wildcard,
            };
            let mut input = env.stat(&r.table, &hints)?;
            input.fields = r.fields.clone();
            if let Some(hint) = r.hint {
                // Pre-prune blocks and keep the hint for scan-time pushdown.
                input = input.filter(&hint);
                input.hint = Some(hint);
            }
            inputs.push(input);
        }
        Ok(inputs)
    }
}

/// Union of two field projections. A wildcard on either side wins.
fn merge_fields(a: Option<Vec<String>>, b: Option<&[String]>) -> Option<Vec<String>> {
    match (a, b) {
        (Some(mut a), Some(b)) => {
            a.extend(b.iter().cloned());
            a.sort();
            a.dedup();
            Some(a)
        }
        _ => None,
    }
}

/// Merge two filter hints per the dedup rules.
///
/// Overlapping conjuncts survive; non-overlapping ones are dropped unless
/// any of them compares against a timestamp, in which case the merge fails
/// (`None`) and the caller allocates a separate input slot.
fn merge_hints(a: Option<&Expr>, b: Option<&Expr>) -> Option<Option<Expr>> {
    let ac: Vec<&Expr> = a.map(conjuncts).unwrap_or_default();
    let bc: Vec<&Expr> = b.map(conjuncts).unwrap_or_default();
    let mut overlap: Vec<Expr> = Vec::new();
    let mut dropped: Vec<&Expr> = Vec::new();
    for e in &ac {
        if bc.contains(e) {
            overlap.push((*e).clone());
        } else {
            dropped.push(e);
        }
    }
    for e in &bc {
        if !ac.contains(e) {
            dropped.push(e);
        }
    }
    if dropped.iter().any(|e| contains_timestamp_compare(e)) {
        return None;
    }
    Some(conjoin(overlap))
}
