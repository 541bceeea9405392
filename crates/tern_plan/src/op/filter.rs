use std::fmt;

use tern_codec::Value;
use tern_error::Result;
use tern_expr::{decode_expr, encode_expr, Expr, Rewriter};
use tern_mill::{eval_filter, QuerySink, RowSink};

use super::{decode_expr_list, encode_expr_list, rewrite_all, Op};

/// Emits the rows for which the predicate is TRUE.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub from: Box<Op>,
    pub expr: Expr,
    /// Predicates pushed down onto this filter from enclosing filters.
    pub hints: Vec<Expr>,
}

impl Filter {
    pub fn new(from: Op, expr: Expr) -> Filter {
        Filter {
            from: Box::new(from),
            expr,
            hints: Vec::new(),
        }
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(FilterSink {
            expr: self.expr.clone(),
            down,
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        let expr = std::mem::replace(&mut self.expr, Expr::Star);
        self.expr = tern_expr::rewrite(r, expr)?;
        rewrite_all(r, &mut self.hints)
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        let mut fields = vec![("expr".to_string(), encode_expr(&self.expr))];
        if !self.hints.is_empty() {
            fields.push(("hints".to_string(), encode_expr_list(&self.hints)));
        }
        fields
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<Filter> {
        Ok(Filter {
            from: Box::new(from),
            expr: decode_expr(v.field("expr"))?,
            hints: decode_expr_list(v.field("hints"))?,
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FILTER {}", self.expr)
    }
}

struct FilterSink {
    expr: Expr,
    down: Box<dyn QuerySink>,
}

impl QuerySink for FilterSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(FilterWriter {
            expr: self.expr.clone(),
            down: self.down.open()?,
        }))
    }

    fn close(&self) -> Result<()> {
        self.down.close()
    }
}

struct FilterWriter {
    expr: Expr,
    down: Box<dyn RowSink>,
}

impl RowSink for FilterWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if eval_filter(&self.expr, &row)? {
                kept.push(row);
            }
        }
        if kept.is_empty() {
            return Ok(());
        }
        self.down.write_rows(kept)
    }

    fn close(&mut self) -> Result<()> {
        self.down.close()
    }
}
