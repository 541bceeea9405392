use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tern_codec::{compare_total, Value};
use tern_error::{Result, TernError};
use tern_expr::{decode_expr, encode_expr, Expr, OrderPart, Rewriter};
use tern_mill::{eval, QuerySink, RowSink};

use super::{decode_expr_list, encode_expr_list, rewrite_all, Op};

/// Sorts its entire input by the given columns, then applies the optional
/// offset and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub from: Box<Op>,
    pub cols: Vec<OrderPart>,
    pub limit: Option<u64>,
    pub offset: u64,
    /// Predicates pushed down onto this barrier; held for observability, the
    /// sort itself never applies them.
    pub hints: Vec<Expr>,
}

impl OrderBy {
    pub fn new(from: Op, cols: Vec<OrderPart>) -> OrderBy {
        OrderBy {
            from: Box::new(from),
            cols,
            limit: None,
            offset: 0,
            hints: Vec::new(),
        }
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(OrderSink {
            op: self.clone(),
            rows: Arc::new(Mutex::new(Vec::new())),
            down,
        })
    }

    pub fn rewrite_exprs(&mut self, r: &mut dyn Rewriter) -> Result<()> {
        for col in self.cols.iter_mut() {
            let expr = std::mem::replace(&mut col.expr, Expr::Star);
            col.expr = tern_expr::rewrite(r, expr)?;
        }
        rewrite_all(r, &mut self.hints)
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        let cols = self
            .cols
            .iter()
            .map(|c| {
                Value::struct_of([
                    ("expr", encode_expr(&c.expr)),
                    ("desc", Value::Bool(c.desc)),
                    ("nulls_last", Value::Bool(c.nulls_last)),
                ])
            })
            .collect();
        let mut fields = vec![("cols".to_string(), Value::List(cols))];
        if let Some(limit) = self.limit {
            fields.push(("limit".to_string(), Value::Uint(limit)));
        }
        if self.offset > 0 {
            fields.push(("offset".to_string(), Value::Uint(self.offset)));
        }
        if !self.hints.is_empty() {
            fields.push(("hints".to_string(), encode_expr_list(&self.hints)));
        }
        fields
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<OrderBy> {
        let mut cols = Vec::new();
        if let Value::List(items) = v.field("cols") {
            for item in items {
                cols.push(OrderPart {
                    expr: decode_expr(item.field("expr"))?,
                    desc: item.field("desc").as_bool().unwrap_or(false),
                    nulls_last: item.field("nulls_last").as_bool().unwrap_or(false),
                });
            }
        }
        if cols.is_empty() {
            return Err(TernError::new("order by with no columns"));
        }
        Ok(OrderBy {
            from: Box::new(from),
            cols,
            limit: v
                .field("limit")
                .as_i64()
                .and_then(|i| u64::try_from(i).ok()),
            offset: v
                .field("offset")
                .as_i64()
                .and_then(|i| u64::try_from(i).ok())
                .unwrap_or(0),
            hints: decode_expr_list(v.field("hints"))?,
        })
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ORDER BY ")?;
        for (i, c) in self.cols.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{c}")?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if self.offset > 0 {
            write!(f, " OFFSET {}", self.offset)?;
        }
        Ok(())
    }
}

/// Compare two sort-key values with null placement. NULL and MISSING sort
/// together.
pub(crate) fn sort_cmp(a: &Value, b: &Value, desc: bool, nulls_last: bool) -> Ordering {
    let an = a.is_null() || a.is_missing();
    let bn = b.is_null() || b.is_missing();
    match (an, bn) {
        (true, true) => return Ordering::Equal,
        (true, false) => return if nulls_last { Ordering::Greater } else { Ordering::Less },
        (false, true) => return if nulls_last { Ordering::Less } else { Ordering::Greater },
        (false, false) => {}
    }
    let ord = compare_total(a, b);
    if desc {
        ord.reverse()
    } else {
        ord
    }
}

type Keyed = (SmallVec<[Value; 4]>, Value);

struct OrderSink {
    op: OrderBy,
    rows: Arc<Mutex<Vec<Keyed>>>,
    down: Box<dyn QuerySink>,
}

impl QuerySink for OrderSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(OrderWriter {
            cols: self.op.cols.clone(),
            local: Vec::new(),
            rows: self.rows.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        let mut rows = std::mem::take(&mut *self.rows.lock());
        let cols = &self.op.cols;
        rows.sort_by(|(ka, _), (kb, _)| {
            for (i, c) in cols.iter().enumerate() {
                let (x, y) = (
                    ka.get(i).unwrap_or(&Value::Missing),
                    kb.get(i).unwrap_or(&Value::Missing),
                );
                let ord = sort_cmp(x, y, c.desc, c.nulls_last);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        let mut out: Vec<Value> = rows.into_iter().map(|(_, row)| row).collect();
        let offset = self.op.offset as usize;
        if offset > 0 {
            out = if offset >= out.len() {
                Vec::new()
            } else {
                out.split_off(offset)
            };
        }
        if let Some(limit) = self.op.limit {
            out.truncate(limit as usize);
        }
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

struct OrderWriter {
    cols: Vec<OrderPart>,
    local: Vec<Keyed>,
    rows: Arc<Mutex<Vec<Keyed>>>,
}

impl RowSink for OrderWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        for row in rows {
            let mut keys = SmallVec::new();
            for c in &self.cols {
                keys.push(eval(&c.expr, &row)?);
            }
            self.local.push((keys, row));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.rows.lock().append(&mut self.local);
        Ok(())
    }
}
