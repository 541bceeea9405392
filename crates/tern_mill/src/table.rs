//! Table sources.

use tern_codec::Value;
use tern_error::Result;

use crate::{Context, QuerySink, RowSink, BATCH_ROWS};

/// A stream of rows that can be pushed into a sink.
///
/// `write_chunks` opens up to `parallel` writers on `dst` and feeds each an
/// arbitrary subset of the table. EOF errors from the sink stop the scan
/// without surfacing; cancellation is checked between batches.
pub trait Table: Send + Sync {
    fn write_chunks(&self, dst: &dyn QuerySink, ctx: &Context, parallel: usize) -> Result<()>;
}

/// An in-memory table. Used by tests and by environments whose data already
/// lives in decoded form.
#[derive(Debug, Default, Clone)]
pub struct MemTable {
    rows: Vec<Value>,
}

impl MemTable {
    pub fn new(rows: Vec<Value>) -> Self {
        MemTable { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Value] {
        &self.rows
    }
}

impl Table for MemTable {
    fn write_chunks(&self, dst: &dyn QuerySink, ctx: &Context, parallel: usize) -> Result<()> {
        let parallel = parallel.max(1);
        let mut writers: Vec<Box<dyn RowSink>> = Vec::with_capacity(parallel);
        for _ in 0..parallel {
            writers.push(dst.open()?);
        }
        let mut result = Ok(());
        'scan: for (i, batch) in self.rows.chunks(BATCH_ROWS).enumerate() {
            if let Err(err) = ctx.check() {
                result = Err(err);
                break;
            }
            let w = &mut writers[i % parallel];
            if let Err(err) = w.write_rows(batch.to_vec()) {
                if !err.is_eof() {
                    result = Err(err);
                }
                break 'scan;
            }
        }
        for mut w in writers {
            let err = w.close();
            if result.is_ok() {
                if let Err(err) = err {
                    if !err.is_eof() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }
}
