use tern_codec::Value;
use tern_error::Result;
use tern_mill::QuerySink;

use super::Wrapped;

/// Terminal operator that emits no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoOutput;

/// Terminal operator that emits exactly one empty struct row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DummyOutput;

impl DummyOutput {
    pub fn wrap(&self, dst: Box<dyn QuerySink>) -> Result<Wrapped> {
        Ok(Wrapped::Extra {
            sink: Box::new(EmitOnClose { down: dst }),
        })
    }
}

/// Writes one empty struct row when closed, then cascades the close.
struct EmitOnClose {
    down: Box<dyn QuerySink>,
}

impl QuerySink for EmitOnClose {
    fn open(&self) -> Result<Box<dyn tern_mill::RowSink>> {
        self.down.open()
    }

    fn close(&self) -> Result<()> {
        let mut w = self.down.open()?;
        let write_result = w.write_rows(vec![Value::Struct(Vec::new())]);
        match write_result {
            Ok(()) => {}
            Err(err) if err.is_eof() => {}
            Err(err) => return Err(err),
        }
        w.close()?;
        self.down.close()
    }
}
