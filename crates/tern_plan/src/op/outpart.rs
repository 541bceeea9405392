//! Output operators: write result rows into packed objects and signed
//! indices instead of streaming them to the caller.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::Rng;
use sha2::Sha256;
use tern_codec::{encode_document, encode_rows, Value};
use tern_error::{OptionExt, Result, TernError};
use tern_mill::{QuerySink, RowSink};

use super::{Op, Wrapped};
use crate::env::UploadFS;
use crate::exec::ExecParams;
use crate::input::{Descriptor, Input};
use crate::mem::build_trailer;

/// Rows per block in packed output objects.
const OUTPUT_BLOCK_ROWS: usize = 256;

/// Writes streamed rows into packed objects under `store`, emitting one
/// descriptor row per output writer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPart {
    pub from: Box<Op>,
    pub basename: String,
    pub store: String,
}

impl OutputPart {
    pub fn new(from: Op, basename: impl Into<String>, store: impl Into<String>) -> OutputPart {
        OutputPart {
            from: Box::new(from),
            basename: basename.into(),
            store: store.into(),
        }
    }

    pub(crate) fn wrap(
        &self,
        dst: Box<dyn QuerySink>,
        input: Option<&Input>,
        ep: &ExecParams,
        collector: Option<Arc<DescCollector>>,
    ) -> Result<Wrapped> {
        let upload = ep
            .upload
            .as_ref()
            .ok_or_else(|| TernError::new("cannot write parts: no uploader configured"))?;
        let sink = Box::new(OutputPartSink {
            basename: self.basename.clone(),
            store: self.store.clone(),
            fs: upload.uploader(),
            collector,
            seq: AtomicU64::new(0),
            down: dst,
        });
        self.from.wrap(sink, input, ep)
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![
            ("basename".to_string(), Value::String(self.basename.clone())),
            ("store".to_string(), Value::String(self.store.clone())),
        ]
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<OutputPart> {
        Ok(OutputPart {
            from: Box::new(from),
            basename: v.field("basename").as_str().required("basename")?.to_string(),
            store: v.field("store").as_str().required("store")?.to_string(),
        })
    }
}

impl fmt::Display for OutputPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OUTPUT PART {}/{}", self.store, self.basename)
    }
}

/// Collects OutputPart descriptors, writes a signed index object, and emits
/// one row naming the assigned table path.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputIndex {
    pub from: Box<Op>,
    pub table: String,
    pub basename: String,
    pub store: String,
    pub key: [u8; 32],
}

impl OutputIndex {
    pub fn new(
        from: Op,
        table: impl Into<String>,
        basename: impl Into<String>,
        store: impl Into<String>,
        key: [u8; 32],
    ) -> OutputIndex {
        OutputIndex {
            from: Box::new(from),
            table: table.into(),
            basename: basename.into(),
            store: store.into(),
            key,
        }
    }

    pub(crate) fn wrap(
        &self,
        dst: Box<dyn QuerySink>,
        input: Option<&Input>,
        ep: &ExecParams,
    ) -> Result<Wrapped> {
        let upload = ep
            .upload
            .as_ref()
            .ok_or_else(|| TernError::new("cannot write an index: no uploader configured"))?;
        let collector = Arc::new(DescCollector::default());
        let sink = Box::new(OutputIndexSink {
            op: self.clone(),
            fs: upload.uploader(),
            collector: collector.clone(),
            down: dst,
        });
        // Fuse with a directly-preceding OutputPart so descriptors skip the
        // row encoding entirely.
        match self.from.as_ref() {
            Op::OutputPart(part) => part.wrap(sink, input, ep, Some(collector)),
            _ => self.from.wrap(sink, input, ep),
        }
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![
            ("table".to_string(), Value::String(self.table.clone())),
            ("basename".to_string(), Value::String(self.basename.clone())),
            ("store".to_string(), Value::String(self.store.clone())),
            ("key".to_string(), Value::Bytes(self.key.to_vec())),
        ]
    }

    pub fn decode_fields(v: &Value, from: Op) -> Result<OutputIndex> {
        let key_bytes = match v.field("key") {
            Value::Bytes(b) => b.clone(),
            _ => return Err(TernError::new("output index missing key")),
        };
        let key: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| TernError::new("output index key must be 32 bytes"))?;
        Ok(OutputIndex {
            from: Box::new(from),
            table: v.field("table").as_str().required("table")?.to_string(),
            basename: v.field("basename").as_str().required("basename")?.to_string(),
            store: v.field("store").as_str().required("store")?.to_string(),
            key,
        })
    }
}

impl fmt::Display for OutputIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OUTPUT INDEX {} AT {}/{}",
            self.table, self.store, self.basename
        )
    }
}

#[derive(Debug, Default)]
pub(crate) struct DescCollector {
    descs: Mutex<Vec<Descriptor>>,
}

impl DescCollector {
    fn push(&self, desc: Descriptor) {
        self.descs.lock().push(desc);
    }

    fn take(&self) -> Vec<Descriptor> {
        std::mem::take(&mut self.descs.lock())
    }
}

struct OutputPartSink {
    basename: String,
    store: String,
    fs: Arc<dyn UploadFS>,
    collector: Option<Arc<DescCollector>>,
    seq: AtomicU64,
    down: Box<dyn QuerySink>,
}

impl QuerySink for OutputPartSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let path = format!(
            "{}/{}-{:04}-{}.tern",
            self.store,
            self.basename,
            n,
            suffix()
        );
        Ok(Box::new(OutputPartWriter {
            path,
            rows: Vec::new(),
            fs: self.fs.clone(),
            collector: self.collector.clone(),
            down: match &self.collector {
                // When fused into an index, descriptor rows never flow.
                Some(_) => None,
                None => Some(self.down.open()?),
            },
        }))
    }

    fn close(&self) -> Result<()> {
        self.down.close()
    }
}

struct OutputPartWriter {
    path: String,
    rows: Vec<Value>,
    fs: Arc<dyn UploadFS>,
    collector: Option<Arc<DescCollector>>,
    down: Option<Box<dyn RowSink>>,
}

impl RowSink for OutputPartWriter {
    fn write_rows(&mut self, mut rows: Vec<Value>) -> Result<()> {
        self.rows.append(&mut rows);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Idle writers upload nothing.
        if !self.rows.is_empty() {
            let blocks: Vec<Vec<Value>> = self
                .rows
                .chunks(OUTPUT_BLOCK_ROWS)
                .map(|c| c.to_vec())
                .collect();
            let trailer = build_trailer(&blocks, &[]);
            let mut sink = self.fs.create(&self.path)?;
            for block in &blocks {
                sink.write_all(&encode_rows(block))?;
            }
            let object = sink.finish()?;
            let desc = Descriptor::whole(object, trailer);
            match (&self.collector, &mut self.down) {
                (Some(collector), _) => collector.push(desc),
                (None, Some(down)) => down.write_rows(vec![desc.encode()])?,
                (None, None) => {}
            }
        }
        if let Some(down) = &mut self.down {
            down.close()?;
        }
        Ok(())
    }
}

struct OutputIndexSink {
    op: OutputIndex,
    fs: Arc<dyn UploadFS>,
    collector: Arc<DescCollector>,
    down: Box<dyn QuerySink>,
}

impl QuerySink for OutputIndexSink {
    fn open(&self) -> Result<Box<dyn RowSink>> {
        // Descriptor rows arrive from an unfused OutputPart.
        Ok(Box::new(OutputIndexWriter {
            collector: self.collector.clone(),
        }))
    }

    fn close(&self) -> Result<()> {
        let descs = self.collector.take();
        let table_path = format!("{}/{}-{}", self.op.store, self.op.table, suffix());
        let index = Value::struct_of([
            ("table", Value::String(table_path.clone())),
            (
                "descs",
                Value::List(descs.iter().map(Descriptor::encode).collect()),
            ),
        ]);
        let body = encode_document(&index);
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.op.key)
            .map_err(|_| TernError::new("bad signing key"))?;
        mac.update(&body);
        let sig = mac.finalize().into_bytes();

        let index_path = format!("{}/{}.index", self.op.store, self.op.basename);
        let mut sink = self.fs.create(&index_path)?;
        sink.write_all(&sig)?;
        sink.write_all(&body)?;
        sink.finish()?;

        let mut w = self.down.open()?;
        let row = Value::struct_of([("table", Value::String(table_path))]);
        match w.write_rows(vec![row]) {
            Ok(()) => {}
            Err(err) if err.is_eof() => {}
            Err(err) => return Err(err),
        }
        w.close()?;
        self.down.close()
    }
}

struct OutputIndexWriter {
    collector: Arc<DescCollector>,
}

impl RowSink for OutputIndexWriter {
    fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
        for row in rows {
            self.collector.push(Descriptor::decode(&row)?);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Verify and decode a signed index object. The inverse of what
/// `OutputIndex` writes; callers use it to open the table a query created.
pub fn verify_index(key: &[u8; 32], bytes: &[u8]) -> Result<Value> {
    if bytes.len() < 32 {
        return Err(TernError::new("index object too short"));
    }
    let (sig, body) = bytes.split_at(32);
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| TernError::new("bad signing key"))?;
    mac.update(body);
    mac.verify_slice(sig)
        .map_err(|_| TernError::new("index signature mismatch"))?;
    let (v, _) = tern_codec::decode_document(body)?;
    Ok(v)
}
