//! Bidirectional byte pipes.
//!
//! A [`Conn`] is safe to use from several threads at once: the client's
//! cancellation watcher closes the pipe while the read loop is blocked on it,
//! and the server's EOF watcher reads while the execution threads write.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tern_error::Result;

/// One end of a bidirectional byte stream.
pub trait Conn: Send + Sync {
    /// Blocking read; 0 means the other side closed.
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Blocking write of the whole buffer.
    fn send(&self, buf: &[u8]) -> Result<()>;

    /// Close both directions; any blocked reader observes EOF.
    fn close(&self);
}

#[derive(Default)]
struct HalfState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// One direction of an in-memory pipe.
#[derive(Default)]
struct Half {
    state: Mutex<HalfState>,
    cond: Condvar,
}

impl Half {
    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(tern_error::TernError::eof());
        }
        state.buf.extend(bytes);
        self.cond.notify_all();
        Ok(())
    }

    fn read(&self, out: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        loop {
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for slot in out.iter_mut().take(n) {
                    *slot = state.buf.pop_front().unwrap_or(0);
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            self.cond.wait(&mut state);
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }
}

/// An end of an in-memory duplex pipe.
#[derive(Clone)]
pub struct PipeConn {
    rx: Arc<Half>,
    tx: Arc<Half>,
}

/// Create a connected pair of in-memory pipe ends.
pub fn duplex() -> (PipeConn, PipeConn) {
    let ab = Arc::new(Half::default());
    let ba = Arc::new(Half::default());
    (
        PipeConn {
            rx: ba.clone(),
            tx: ab.clone(),
        },
        PipeConn { rx: ab, tx: ba },
    )
}

impl Conn for PipeConn {
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.rx.read(buf)
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        self.tx.write(buf)
    }

    fn close(&self) {
        self.tx.close();
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_flow_both_ways() {
        let (a, b) = duplex();
        a.send(b"ping").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");

        b.send(b"pong").unwrap();
        assert_eq!(a.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn close_unblocks_reader() {
        let (a, b) = duplex();
        let t = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            b.recv(&mut buf).unwrap()
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        a.close();
        assert_eq!(t.join().unwrap(), 0);
    }

    #[test]
    fn write_after_close_fails() {
        let (a, b) = duplex();
        // Closing either end stops writes from both.
        b.close();
        assert!(a.send(b"x").is_err());
    }
}
