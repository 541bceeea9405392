//! Client side of the framed query protocol.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tern_codec::{decode_document, decode_rows, Value};
use tern_error::{ErrorKind, Result, TernError};
use tern_mill::QuerySink;
use tracing::debug;

use super::frame::{read_frame, write_frame, FrameKind};
use super::pipe::Conn;
use super::Transport;
use crate::exec::ExecParams;
use crate::stats::ExecStats;
use crate::tree::Tree;

/// Executes plans on a remote peer over a bidirectional byte pipe.
///
/// Every execution dials a fresh connection: the protocol allows exactly one
/// query per connection, and the client owns teardown.
pub struct Client {
    dial: Box<dyn Fn() -> Result<Arc<dyn Conn>> + Send + Sync>,
}

impl Client {
    pub fn new<F>(dial: F) -> Client
    where
        F: Fn() -> Result<Arc<dyn Conn>> + Send + Sync + 'static,
    {
        Client {
            dial: Box::new(dial),
        }
    }

    /// Run `tree` remotely, streaming DATA chunks into `dst` and folding the
    /// peer's stats into `ep` on completion.
    pub fn exec(&self, tree: &Tree, ep: &ExecParams, dst: Arc<dyn QuerySink>) -> Result<()> {
        let conn = (self.dial)()?;
        let result = exec_on(&conn, tree, ep, dst);
        // The client owns teardown, success or not.
        conn.close();
        match result {
            // Cancellation outranks whatever the transport saw.
            Err(err) if ep.ctx.is_cancelled() && !err.is_cancelled() => {
                Err(TernError::cancelled())
            }
            other => other,
        }
    }
}

fn exec_on(
    conn: &Arc<dyn Conn>,
    tree: &Tree,
    ep: &ExecParams,
    dst: Arc<dyn QuerySink>,
) -> Result<()> {
    write_frame(&**conn, FrameKind::Start, &tree.encode())?;
    debug!(plan = %tree.id, "query dispatched");

    // If the caller's context fires, closing the pipe is what makes the
    // server notice: its EOF watcher cancels the server-side context.
    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let conn = conn.clone();
        let ctx = ep.ctx.clone();
        let done = done.clone();
        std::thread::spawn(move || loop {
            if done.load(Ordering::SeqCst) {
                return;
            }
            if ctx.wait_timeout(Duration::from_millis(20)) {
                conn.close();
                return;
            }
        })
    };

    let result = read_results(conn, ep, dst);
    done.store(true, Ordering::SeqCst);
    let _ = watcher.join();
    result
}

fn read_results(conn: &Arc<dyn Conn>, ep: &ExecParams, dst: Arc<dyn QuerySink>) -> Result<()> {
    let mut writer = dst.open()?;
    let result = loop {
        let (kind, payload) = match read_frame(&**conn) {
            Ok(frame) => frame,
            Err(err) => break Err(err),
        };
        match kind {
            FrameKind::Data => {
                let rows = match decode_rows(&payload) {
                    Ok(rows) => rows,
                    Err(err) => break Err(err),
                };
                match writer.write_rows(rows) {
                    Ok(()) => {}
                    // Downstream needs no more rows; unwind quietly.
                    Err(err) if err.is_eof() => break Ok(()),
                    Err(err) => break Err(err),
                }
            }
            FrameKind::Err => {
                let text = String::from_utf8_lossy(&payload);
                break Err(TernError::new(format!("remote error: {text}")));
            }
            FrameKind::Fin => {
                match decode_document(&payload) {
                    Ok((v, _)) => ep.stats.fold(&ExecStats::decode(&v)?),
                    Err(err) => break Err(err),
                }
                break Ok(());
            }
            FrameKind::Start => {
                break Err(TernError::with_kind(
                    ErrorKind::Protocol,
                    "unexpected START frame from server",
                ))
            }
        }
    };
    let closed = writer.close();
    if result.is_ok() {
        closed?;
    }
    result
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Transport for Client {
    fn exec(&self, tree: &Tree, ep: &ExecParams, dst: Arc<dyn QuerySink>) -> Result<()> {
        Client::exec(self, tree, ep, dst)
    }

    fn encode(&self) -> Value {
        // Remote connection details never serialize; a peer re-encoding a
        // plan substitutes its own transports.
        Value::struct_of([("type", Value::String("remote".to_string()))])
    }
}
