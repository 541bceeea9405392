use std::fmt;

use tern_codec::Value;
use tern_error::Result;
use tern_expr::{Binding, Rewriter};
use tern_mill::{eval, QuerySink, RowSink};

use super::{decode_bindings, encode_bindings, Op};

/// Replaces each row with a row of named bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub from: Box<Op>,
    pub bindings: Vec<Binding>,
}

impl Project {
    pub fn new(from: Op, bindings: Vec<Binding>) -> Project {
        Project {
            from: Box::new(from),
            bindings,
        }
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(BindSink {
            bindings: self.bindings.clone(),
            extend: false,
            down,
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        rewrite_bindings(r, &mut self.bindings)
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![("bindings".to_string(), encode_bindings(&self.bindings))]
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<Project> {
        Ok(Project {
            from: Box::new(from),
            bindings: decode_bindings(v.field("bindings"))?,
        })
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PROJECT ")?;
        write_bindings(f, &self.bindings)
    }
}

/// Extends each row with additional computed bindings. Used for expressions
/// the vectorized core cannot lower.
#[derive(Debug, Clone, PartialEq)]
pub struct Apply {
    pub from: Box<Op>,
    pub bindings: Vec<Binding>,
}

impl Apply {
    pub fn new(from: Op, bindings: Vec<Binding>) -> Apply {
        Apply {
            from: Box::new(from),
            bindings,
        }
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(BindSink {
            bindings: self.bindings.clone(),
            extend: true,
            down,
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        rewrite_bindings(r, &mut self.bindings)
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![("bindings".to_string(), encode_bindings(&self.bindings))]
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<Apply> {
        Ok(Apply {
            from: Box::new(from),
            bindings: decode_bindings(v.field("bindings"))?,
        })
    }
}

impl fmt::Display for Apply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "APPLY ")?;
        write_bindings(f, &self.bindings)
    }
}

fn write_bindings(f: &mut fmt::Formatter<'_>, bindings: &[Binding]) -> fmt::Result {
    for (i, b) in bindings.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{b}")?;
    }
    Ok(())
}

pub(crate) fn rewrite_bindings(r: &mut dyn Rewriter, bindings: &mut [Binding]) -> Result<()> {
    for b in bindings.iter_mut() {
        let expr = std::mem::replace(&mut b.expr, tern_expr::Expr::Star);
        b.expr = tern_expr::rewrite(r, expr)?;
    }
    Ok(())
}

struct BindSink {
    bindings: Vec<Binding>,
    /// Extend the incoming row instead of replacing it.
    extend: bool,
    down: Box<dyn QuerySink>,
}

impl QuerySink for BindSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(BindWriter {
            bindings: self.bindings.clone(),
            extend: self.extend,
            down: self.down.open()?,
        }))
    }

    fn close(&self) -> Result<()> {
        self.down.close()
    }
}

struct BindWriter {
    bindings: Vec<Binding>,
    extend: bool,
    down: Box<dyn RowSink>,
}

impl RowSink for BindWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut fields: Vec<(String, Value)> = if self.extend {
                match &row {
                    Value::Struct(fs) => fs
                        .iter()
                        .filter(|(k, _)| !self.bindings.iter().any(|b| &b.result == k))
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                }
            } else {
                Vec::with_capacity(self.bindings.len())
            };
            for b in &self.bindings {
                let v = eval(&b.expr, &row)?;
                // MISSING values produce no output field.
                if !v.is_missing() {
                    fields.push((b.result.clone(), v));
                }
            }
            out.push(Value::Struct(fields));
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
    use tern_expr::{ArithOp, Expr};
    use tern_mill::CollectSink;

    fn row() -> Value {
        Value::struct_of([("a", Value::Int(2)), ("b", Value::Int(3))])
    }

    #[test]
    fn project_replaces_rows() {
        let project = Project::new(
            Op::Leaf(super::super::Leaf::new()),
            vec![
                Binding::new(
                    Expr::Arith(
                        ArithOp::Add,
                        Box::new(Expr::path("a")),
                        Box::new(Expr::path("b")),
                    ),
                    "sum",
                ),
                Binding::new(Expr::path("missing_col"), "gone"),
            ],
        );
        let collect = CollectSink::new();
        let sink = project.sink(Box::new(collect.clone()));
        let mut w = sink.open().unwrap();
        w.write_rows(vec![row()]).unwrap();
        w.close().unwrap();
        sink.close().unwrap();
        assert_eq!(
            collect.rows(),
            vec![Value::struct_of([("sum", Value::Int(5))])]
        );
    }

    #[test]
    fn apply_extends_rows() {
        let apply = Apply::new(
            Op::Leaf(super::super::Leaf::new()),
            vec![Binding::new(
                Expr::Arith(
                    ArithOp::Mul,
                    Box::new(Expr::path("a")),
                    Box::new(Expr::integer(10)),
                ),
                "a10",
            )],
        );
        let collect = CollectSink::new();
        let sink = apply.sink(Box::new(collect.clone()));
        let mut w = sink.open().unwrap();
        w.write_rows(vec![row()]).unwrap();
        w.close().unwrap();
        sink.close().unwrap();
        assert_eq!(
            collect.rows(),
            vec![Value::struct_of([
                ("a", Value::Int(2)),
                ("b", Value::Int(3)),
                ("a10", Value::Int(20)),
            ])]
        );
    }
}
