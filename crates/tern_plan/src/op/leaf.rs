use std::fmt;

use tern_codec::Value;
use tern_error::{Result, TernError};
use tern_expr::{Expr, Rewriter};
use tern_mill::QuerySink;

use super::{decode_expr_list, encode_expr_list, rewrite_all, Wrapped};
use crate::input::Input;

/// Terminal operator producing the rows of the node's input.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Leaf {
    /// Predicates pushed down from enclosing filters, in pushdown order.
    /// Advisory: they narrow the blocks scanned, they do not filter rows.
    pub hints: Vec<Expr>,
}

impl Leaf {
    pub fn new() -> Leaf {
        Leaf::default()
    }

    pub fn wrap(&self, dst: Box<dyn QuerySink>, input: Option<&Input>) -> Result<Wrapped> {
        let input = input.ok_or_else(|| TernError::new("leaf with no input"))?;
        let mut eff = input.clone();
        for h in &self.hints {
            eff = eff.filter(h);
            crate::input::merge_hint(&mut eff.hint, h);
        }
        Ok(Wrapped::Input {
            input: eff,
            sink: dst,
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        rewrite_all(r, &mut self.hints)
    }

    pub fn display(&self, input: Option<usize>) -> String {
        use std::fmt::Write as _;
        let mut out = format!("ITERATE {}", super::input_name(input));
        for h in &self.hints {
            let _ = write!(out, " WHERE {h}");
        }
        out
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        let mut fields = Vec::new();
        if !self.hints.is_empty() {
            fields.push(("hints".to_string(), encode_expr_list(&self.hints)));
        }
        fields
    }

    pub fn decode_fields(v: &Value) -> Result<Leaf> {
        Ok(Leaf {
            hints: decode_expr_list(v.field("hints"))?,
        })
    }
}

impl fmt::Display for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display(None))
    }
}
