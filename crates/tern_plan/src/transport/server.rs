//! Server side of the framed query protocol.

use std::sync::Arc;

use parking_lot::Mutex;
use tern_codec::{encode_rows, Value};
use tern_error::{ErrorKind, Result, TernError};
use tern_mill::{Context, QuerySink, RowSink};
use tracing::debug;

use super::frame::{read_frame, write_frame, FrameKind, MAX_PAYLOAD};
use super::pipe::Conn;
use crate::exec::{self, ExecParams};
use crate::stats::ExecStats;
use crate::tree::Tree;

/// Serve exactly one query on `conn`.
///
/// `ep` supplies the execution environment (runner, uploader, parallelism);
/// the query runs under a fresh context and fresh stats. The server never
/// closes the pipe: the client owns teardown, and the returned error (if
/// any) is the query's failure after it has been reported as an ERR frame.
pub fn serve(conn: Arc<dyn Conn>, ep: &ExecParams) -> Result<()> {
    let (kind, payload) = read_frame(&*conn)?;
    if kind != FrameKind::Start {
        return Err(TernError::with_kind(
            ErrorKind::Protocol,
            format!("expected START, got {kind:?}"),
        ));
    }
    let tree = match Tree::decode(&payload) {
        Ok(tree) => tree,
        Err(err) => {
            let _ = write_frame(&*conn, FrameKind::Err, err.to_string().as_bytes());
            return Err(err);
        }
    };
    debug!(plan = %tree.id, "serving query");

    // The client must not send another byte until it tears the pipe down.
    // Reading one byte therefore doubles as a disconnect watcher: EOF or
    // data both cancel the server-side context.
    let ctx = Context::new();
    {
        let conn = conn.clone();
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            let mut byte = [0u8; 1];
            let _ = conn.recv(&mut byte);
            ctx.cancel();
        });
    }

    let mut run_ep = ep.clone_for_subplan();
    run_ep.ctx = ctx;
    run_ep.stats = Arc::new(ExecStats::new());
    let dst: Arc<dyn QuerySink> = Arc::new(FrameSink {
        conn: conn.clone(),
        mu: Arc::new(Mutex::new(())),
    });
    match exec::run(&tree, dst, &run_ep) {
        Ok(()) => {
            let stats = tern_codec::encode_document(&run_ep.stats.encode());
            // A write failure here means the client already went away.
            let _ = write_frame(&*conn, FrameKind::Fin, &stats);
            Ok(())
        }
        Err(err) if err.is_eof() => {
            // Client disconnect mid-stream; nothing left to report.
            Err(err)
        }
        Err(err) => {
            let _ = write_frame(&*conn, FrameKind::Err, err.to_string().as_bytes());
            Err(err)
        }
    }
}

/// Streams row batches as DATA frames, one frame per send, serialized by a
/// sink-wide mutex.
struct FrameSink {
    conn: Arc<dyn Conn>,
    mu: Arc<Mutex<()>>,
}

impl QuerySink for FrameSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        Ok(Box::new(FrameWriter {
            conn: self.conn.clone(),
            mu: self.mu.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FrameWriter {
    conn: Arc<dyn Conn>,
    mu: Arc<Mutex<()>>,
}

impl FrameWriter {
    fn send_chunk(&self, rows: &[Value]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let chunk = encode_rows(rows);
        if chunk.len() > MAX_PAYLOAD {
            if rows.len() == 1 {
                return Err(TernError::with_kind(
                    ErrorKind::Protocol,
                    "single row exceeds maximum frame size",
                ));
            }
            let mid = rows.len() / 2;
            self.send_chunk(&rows[..mid])?;
            return self.send_chunk(&rows[mid..]);
        }
        let _guard = self.mu.lock();
        // A broken pipe means the client went away; report EOF so operators
        // stop fast.
        write_frame(&*self.conn, FrameKind::Data, &chunk)
            .map_err(|err| if err.is_eof() { err } else { TernError::eof() })
    }
}

impl RowSink for FrameWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        self.send_chunk(&rows)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
