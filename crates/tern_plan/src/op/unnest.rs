use std::fmt;

use tern_codec::Value;
use tern_error::{OptionExt, Result};
use tern_expr::{decode_expr, encode_expr, Expr, Rewriter};
use tern_mill::{eval, QuerySink, RowSink};

use super::Op;

/// Iterates a list-typed expression and emits one joined row per element.
#[derive(Debug, Clone, PartialEq)]
pub struct Unnest {
    pub from: Box<Op>,
    pub expr: Expr,
    /// Name the element is bound to in the output row.
    pub result: String,
}

impl Unnest {
    pub fn new(from: Op, expr: Expr, result: impl Into<String>) -> Unnest {
        Unnest {
            from: Box::new(from),
            expr,
            result: result.into(),
        }
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(UnnestSink {
            expr: self.expr.clone(),
            result: self.result.clone(),
            down,
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        let expr = std::mem::replace(&mut self.expr, Expr::Star);
        self.expr = tern_expr::rewrite(r, expr)?;
        Ok(())
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![
            ("expr".to_string(), encode_expr(&self.expr)),
            ("as".to_string(), Value::String(self.result.clone())),
        ]
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<Unnest> {
        Ok(Unnest {
            from: Box::new(from),
            expr: decode_expr(v.field("expr"))?,
            result: v.field("as").as_str().required("as")?.to_string(),
        })
    }
}

impl fmt::Display for Unnest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UNNEST {} AS {}", self.expr, self.result)
    }
}

struct UnnestSink {
    expr: Expr,
    result: String,
    down: Box<dyn QuerySink>,
}

impl QuerySink for UnnestSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(UnnestWriter {
            expr: self.expr.clone(),
            result: self.result.clone(),
            down: self.down.open()?,
        }))
    }

    fn close(&self) -> Result<()> {
        self.down.close()
    }
}

struct UnnestWriter {
    expr: Expr,
    result: String,
    down: Box<dyn RowSink>,
}

impl RowSink for UnnestWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        let mut out = Vec::new();
        for row in rows {
            let list = match eval(&self.expr, &row)? {
                Value::List(items) => items,
                // Rows without a list yield nothing.
                _ => continue,
            };
            for item in list {
                let mut fields = match &row {
                    Value::Struct(fs) => fs
                        .iter()
                        .filter(|(k, _)| k != &self.result)
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                };
                fields.push((self.result.clone(), item));
                out.push(Value::Struct(fields));
            }
        }
        if out.is_empty() {
            return Ok(());
        }
        self.down.write_rows(out)
    }

    fn close(&mut self) -> Result<()> {
        self.down.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_mill::CollectSink;

    #[test]
    fn unnest_joins_elements() {
        let unnest = Unnest::new(
            Op::Leaf(super::super::Leaf::new()),
            Expr::path("tags"),
            "tag",
        );
        let collect = CollectSink::new();
        let sink = unnest.sink(Box::new(collect.clone()));
        let mut w = sink.open().unwrap();
        w.write_rows(vec![
            Value::struct_of([
                ("id", Value::Int(1)),
                (
                    "tags",
                    Value::List(vec![
                        Value::String("a".to_string()),
                        Value::String("b".to_string()),
                    ]),
                ),
            ]),
            Value::struct_of([("id", Value::Int(2))]),
        ])
        .unwrap();
        w.close().unwrap();
        sink.close().unwrap();
        let rows = collect.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].field("tag"), &Value::String("a".to_string()));
        assert_eq!(rows[1].field("id"), &Value::Int(1));
    }
}
