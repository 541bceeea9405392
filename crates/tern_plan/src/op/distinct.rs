use std::fmt;
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;
use tern_codec::{encode_key, Value};
use tern_error::{Result, TernError};
use tern_expr::{Expr, PathStep, Rewriter};
use tern_mill::{eval, QuerySink, RowSink};

use super::{decode_expr_list, encode_expr_list, rewrite_all, Op};

/// Deduplicates tuples over a list of expressions, emitting one projected
/// row per distinct tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Distinct {
    pub from: Box<Op>,
    pub fields: Vec<Expr>,
    pub limit: Option<u64>,
}

impl Distinct {
    pub fn new(from: Op, fields: Vec<Expr>) -> Distinct {
        Distinct {
            from: Box::new(from),
            fields,
            limit: None,
        }
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(DistinctSink {
            op: self.clone(),
            names: self.fields.iter().map(result_name).collect(),
            seen: Arc::new(Mutex::new(HashSet::new())),
            down,
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        rewrite_all(r, &mut self.fields)
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        let mut fields = vec![("fields".to_string(), encode_expr_list(&self.fields))];
        if let Some(limit) = self.limit {
            fields.push(("limit".to_string(), Value::Uint(limit)));
        }
        fields
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<Distinct> {
        let fields = decode_expr_list(v.field("fields"))?;
        if fields.is_empty() {
            return Err(TernError::new("distinct with no fields"));
        }
        Ok(Distinct {
            from: Box::new(from),
            fields,
            limit: v
                .field("limit")
                .as_i64()
                .and_then(|i| u64::try_from(i).ok()),
        })
    }
}

impl fmt::Display for Distinct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DISTINCT [")?;
        for (i, e) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, "]")?;
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

/// Output column name for one distinct expression: the trailing path
/// segment when there is one, the rendered expression otherwise.
fn result_name(e: &Expr) -> String {
    match e {
        Expr::Path(p) => match p.rest.last() {
            Some(PathStep::Field(name)) => name.clone(),
            Some(PathStep::Index(_)) | None => {
                if p.rest.is_empty() {
                    p.first.clone()
                } else {
                    e.to_string()
                }
            }
        },
        other => other.to_string(),
    }
}

struct DistinctSink {
    op: Distinct,
    names: Vec<String>,
    seen: Arc<Mutex<HashSet<Vec<u8>>>>,
    down: Box<dyn QuerySink>,
}

impl QuerySink for DistinctSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(DistinctWriter {
            op: self.op.clone(),
            names: self.names.clone(),
            seen: self.seen.clone(),
            down: self.down.open()?,
        }))
    }

    fn close(&self) -> Result<()> {
        self.down.close()
    }
}

struct DistinctWriter {
    op: Distinct,
    names: Vec<String>,
    seen: Arc<Mutex<HashSet<Vec<u8>>>>,
    down: Box<dyn RowSink>,
}

impl RowSink for DistinctWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        let limit = self.op.limit.map(|l| l as usize);
        let mut out = Vec::new();
        for row in &rows {
            let mut tuple = Vec::with_capacity(self.op.fields.len());
            for e in &self.op.fields {
                tuple.push(eval(e, row)?);
            }
            let key = encode_key(&tuple);
            {
                let mut seen = self.seen.lock();
                if let Some(limit) = limit {
                    if seen.len() >= limit {
                        // Flush what this batch found before unwinding.
                        if !out.is_empty() {
                            self.down.write_rows(std::mem::take(&mut out))?;
                        }
                        return Err(TernError::eof());
                    }
                }
                if !seen.insert(key) {
                    continue;
                }
            }
            out.push(Value::Struct(
                self.names.iter().cloned().zip(tuple).collect(),
            ));
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
