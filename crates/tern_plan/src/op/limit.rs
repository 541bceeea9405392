use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tern_codec::Value;
use tern_error::{Result, TernError};
use tern_mill::{QuerySink, RowSink};

use super::Op;

/// Emits the first `count` rows, in arrival order, across all writers.
#[derive(Debug, Clone, PartialEq)]
pub struct Limit {
    pub from: Box<Op>,
    pub count: u64,
}

impl Limit {
    pub fn new(from: Op, count: u64) -> Limit {
        Limit {
            from: Box::new(from),
            count,
        }
    }

    pub(crate) fn sink(&self, down: Box<dyn QuerySink>) -> Box<dyn QuerySink> {
        Box::new(LimitSink {
            remaining: Arc::new(AtomicI64::new(self.count as i64)),
            down,
        })
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![("count".to_string(), Value::Uint(self.count))]
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<Limit> {
        Ok(Limit {
            from: Box::new(from),
            count: v
                .field("count")
                .as_i64()
                .and_then(|i| u64::try_from(i).ok())
                .ok_or_else(|| TernError::new("limit missing count"))?,
        })
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LIMIT {}", self.count)
    }
}

struct LimitSink {
    /// Shared budget across every writer. Negative once exhausted.
    remaining: Arc<AtomicI64>,
    down: Box<dyn QuerySink>,
}

impl QuerySink for LimitSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(LimitWriter {
            remaining: self.remaining.clone(),
            down: self.down.open()?,
        }))
    }

    fn close(&self) -> Result<()> {
        self.down.close()
    }
}

struct LimitWriter {
    remaining: Arc<AtomicI64>,
    down: Box<dyn RowSink>,
}

impl RowSink for LimitWriter {
    fn write_rows(&mut self, mut rows: Vec<Value>) -> Result<()> {
        let want = rows.len() as i64;
        let prev = self.remaining.fetch_sub(want, Ordering::SeqCst);
        if prev <= 0 {
            // Budget exhausted before this batch; tell producers to stop.
            return Err(TernError::eof());
        }
        let take = prev.min(want) as usize;
        rows.truncate(take);
        self.down.write_rows(rows)
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
    fn limit_truncates_and_signals_eof() {
        let limit = Limit::new(Op::Leaf(super::super::Leaf::new()), 3);
        let collect = CollectSink::new();
        let sink = limit.sink(Box::new(collect.clone()));
        let mut w = sink.open().unwrap();
        w.write_rows(vec![Value::Int(1), Value::Int(2)]).unwrap();
        w.write_rows(vec![Value::Int(3), Value::Int(4)]).unwrap();
        let err = w.write_rows(vec![Value::Int(5)]).unwrap_err();
        assert!(err.is_eof());
        w.close().unwrap();
        sink.close().unwrap();
        assert_eq!(collect.len(), 3);
    }
}
