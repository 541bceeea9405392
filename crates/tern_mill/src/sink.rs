//! Query sinks and row writers.

use std::sync::Arc;

use parking_lot::Mutex;
use tern_codec::Value;
use tern_error::Result;

/// Destination for the rows an operator stage produces.
///
/// Each concurrent producer calls `open` once to obtain its own writer, and
/// the sink's owner calls `close` exactly once after every writer has been
/// closed. Stateful stages (aggregation, sorting) accumulate per-writer and
/// merge on writer close; sink close flushes the merged result downstream.
pub trait QuerySink: Send + Sync {
    fn open(&self) -> Result<Box<dyn RowSink>>;
    fn close(&self) -> Result<()>;
}

/// One producer's handle into a [`QuerySink`].
pub trait RowSink: Send {
    /// Push a batch of struct rows.
    ///
    /// An `Eof` error means the consumer needs no more input; producers must
    /// stop writing and unwind without treating it as failure.
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Serializes any number of concurrent producers onto one underlying writer.
///
/// Used where a single consumer sits below parallel producers, e.g. the
/// merge side of a distributed union.
pub struct LockedSink {
    shared: Arc<Mutex<Box<dyn RowSink>>>,
}

impl LockedSink {
    pub fn new(inner: Box<dyn RowSink>) -> Self {
        LockedSink {
            shared: Arc::new(Mutex::new(inner)),
        }
    }
}

impl QuerySink for LockedSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(LockedWriter {
            shared: self.shared.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.shared.lock().close()
    }
}

struct LockedWriter {
    shared: Arc<Mutex<Box<dyn RowSink>>>,
}

impl RowSink for LockedWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        self.shared.lock().write_rows(rows)
    }

    fn close(&mut self) -> Result<()> {
        // The underlying writer closes once, via the sink.
        Ok(())
    }
}

/// Collects every row into memory. The final consumer in tests and the
/// carrier for child-subquery (replacement) outputs. Clones share storage.
#[derive(Default, Clone)]
pub struct CollectSink {
    rows: Arc<Mutex<Vec<Value>>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_rows(&self) -> Vec<Value> {
        std::mem::take(&mut self.rows.lock())
    }

    pub fn rows(&self) -> Vec<Value> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl QuerySink for CollectSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(CollectWriter {
            rows: self.rows.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct CollectWriter {
    rows: Arc<Mutex<Vec<Value>>>,
}

impl RowSink for CollectWriter {
    fn write_rows(&mut self, mut rows: Vec<Value>) -> Result<()> {
        self.rows.lock().append(&mut rows);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_gathers_from_multiple_writers() {
        let sink = CollectSink::new();
        let mut a = sink.open().unwrap();
        let mut b = sink.open().unwrap();
        a.write_rows(vec![Value::Int(1)]).unwrap();
        b.write_rows(vec![Value::Int(2), Value::Int(3)]).unwrap();
        a.close().unwrap();
        b.close().unwrap();
        sink.close().unwrap();
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn locked_serializes_writers() {
        let collect = CollectSink::new();
        let locked = Arc::new(LockedSink::new(collect.open().unwrap()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let locked = locked.clone();
            handles.push(std::thread::spawn(move || {
                let mut w = locked.open().unwrap();
                for j in 0..100 {
                    w.write_rows(vec![Value::Int(i * 100 + j)]).unwrap();
                }
                w.close().unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        locked.close().unwrap();
        assert_eq!(collect.len(), 800);
    }
}
