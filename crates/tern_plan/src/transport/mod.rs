//! Transports: how a plan fragment gets executed, locally or on a peer.

pub mod client;
pub mod frame;
pub mod pipe;
pub mod server;

pub use client::Client;
pub use frame::{FrameKind, MAX_PAYLOAD};
pub use pipe::{duplex, Conn, PipeConn};
pub use server::serve;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tern_codec::Value;
use tern_error::{OptionExt, Result, TernError};
use tern_mill::QuerySink;

use crate::exec::{self, ExecParams};
use crate::stats::ExecStats;
use crate::tree::Tree;

/// Evaluates a plan and streams its output into a sink.
pub trait Transport: Send + Sync + fmt::Debug {
    fn exec(&self, tree: &Tree, ep: &ExecParams, dst: Arc<dyn QuerySink>) -> Result<()>;

    /// Self-describing encoding, tagged by a `"type"` field registered in
    /// the transport registry.
    fn encode(&self) -> Value;
}

/// The peers a distributed plan's map half fans out over.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub peers: Vec<Arc<dyn Transport>>,
}

impl Geometry {
    pub fn new(peers: Vec<Arc<dyn Transport>>) -> Geometry {
        Geometry { peers }
    }

    /// `n` in-process peers, for local distribution and tests.
    pub fn local(n: usize, threads: Option<usize>) -> Geometry {
        Geometry {
            peers: (0..n)
                .map(|_| Arc::new(LocalTransport { threads }) as Arc<dyn Transport>)
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn encode(&self) -> Value {
        Value::struct_of([(
            "peers",
            Value::List(self.peers.iter().map(|p| p.encode()).collect()),
        )])
    }

    pub fn decode(v: &Value) -> Result<Geometry> {
        let mut peers = Vec::new();
        if let Value::List(items) = v.field("peers") {
            for item in items {
                peers.push(decode_transport(item)?);
            }
        }
        Ok(Geometry { peers })
    }
}

/// Geometries compare by their encoded form; transports themselves are
/// opaque.
impl PartialEq for Geometry {
    fn eq(&self, other: &Self) -> bool {
        self.encode() == other.encode()
    }
}

/// In-process transport: runs the plan on the local executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport {
    /// Worker override; `None` uses the caller's parallelism.
    pub threads: Option<usize>,
}

impl Transport for LocalTransport {
    fn exec(&self, tree: &Tree, ep: &ExecParams, dst: Arc<dyn QuerySink>) -> Result<()> {
        let mut sub = ep.clone_for_subplan();
        sub.stats = Arc::new(ExecStats::new());
        if let Some(threads) = self.threads {
            sub.parallel = threads.max(1);
        }
        let result = exec::run(tree, dst, &sub);
        ep.stats.fold(&sub.stats);
        result
    }

    fn encode(&self) -> Value {
        let mut fields = vec![("type".to_string(), Value::String("local".to_string()))];
        if let Some(threads) = self.threads {
            fields.push(("threads".to_string(), Value::Uint(threads as u64)));
        }
        Value::Struct(fields)
    }
}

type DecodeFn = fn(&Value) -> Result<Arc<dyn Transport>>;

/// Process-wide decoder registry. Registered at startup, read-only after.
static REGISTRY: Lazy<RwLock<HashMap<String, DecodeFn>>> = Lazy::new(|| {
    let mut map: HashMap<String, DecodeFn> = HashMap::new();
    map.insert("local".to_string(), decode_local);
    RwLock::new(map)
});

fn decode_local(v: &Value) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(LocalTransport {
        threads: v
            .field("threads")
            .as_i64()
            .and_then(|i| usize::try_from(i).ok()),
    }))
}

/// Register a custom transport decoder under a type name.
pub fn register_transport(name: &str, decode: DecodeFn) -> Result<()> {
    let mut registry = REGISTRY.write();
    if registry.contains_key(name) {
        return Err(TernError::new(format!(
            "transport {name:?} already registered"
        )));
    }
    registry.insert(name.to_string(), decode);
    Ok(())
}

pub fn decode_transport(v: &Value) -> Result<Arc<dyn Transport>> {
    let name = v.field("type").as_str().required("type")?;
    let decode = REGISTRY
        .read()
        .get(name)
        .copied()
        .ok_or_else(|| TernError::new(format!("unknown transport {name:?}")))?;
    decode(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_transport_roundtrip() {
        let t = LocalTransport { threads: Some(3) };
        let decoded = decode_transport(&t.encode()).unwrap();
        assert_eq!(decoded.encode(), t.encode());

        let bare = LocalTransport::default();
        let decoded = decode_transport(&bare.encode()).unwrap();
        assert_eq!(decoded.encode(), bare.encode());
    }

    #[test]
    fn unknown_transport_rejected() {
        let v = Value::struct_of([("type", Value::String("warp".to_string()))]);
        assert!(decode_transport(&v).is_err());
    }
}
