//! Memory-backed planning environment and runner.
//!
//! Every "object" is a list of row blocks held in memory, with a trailer
//! computed the same way an ingest pipeline would: per-block min/max ranges
//! for scalar columns and whole-object constants. This provides a complete
//! environment for tests and for memory-only instances.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tern_codec::{compare_total, Value};
use tern_error::{Result, TernError};
use tern_expr::Expr;
use tern_mill::{Context, MemTable, QuerySink, Table};

use crate::blob::{BlockInfo, BlockRange, FieldIndex, ObjectInfo, SparseIndex, Trailer};
use crate::env::{
    Env, Index, Indexer, Runner, StatHints, TableHandle, TableLister, UploadEnv, UploadFS,
    UploadSink,
};
use crate::exec::ExecParams;
use crate::input::{Descriptor, Input};

const DEFAULT_BLOCK_ROWS: usize = 64;
const BLOCK_SHIFT: u32 = 6;

/// Build a trailer for rows split into blocks, indexing every top-level
/// scalar field. `constants` adds object-level constants that need not appear
/// in the rows themselves (partition labels).
pub fn build_trailer(blocks: &[Vec<Value>], constants: &[(String, Value)]) -> Trailer {
    let mut field_names: Vec<String> = Vec::new();
    for block in blocks {
        for row in block {
            if let Value::Struct(fields) = row {
                for (name, value) in fields {
                    if scalar(value) && !field_names.iter().any(|f| f == name) {
                        field_names.push(name.clone());
                    }
                }
            }
        }
    }

    let mut fields = Vec::with_capacity(field_names.len() + constants.len());
    for name in &field_names {
        let mut ranges = Vec::with_capacity(blocks.len());
        let mut constant: Option<Value> = None;
        let mut constant_ok = true;
        let mut seen_any = false;
        for block in blocks {
            let mut lo: Option<Value> = None;
            let mut hi: Option<Value> = None;
            for row in block {
                let v = row.field(name);
                if v.is_missing() || v.is_null() || !scalar(v) {
                    // A column absent from some row is not an object constant.
                    constant_ok = false;
                    continue;
                }
                if !seen_any {
                    constant = Some(v.clone());
                    seen_any = true;
                } else if constant.as_ref() != Some(v) {
                    constant_ok = false;
                }
                if lo
                    .as_ref()
                    .map(|m| compare_total(v, m) == std::cmp::Ordering::Less)
                    .unwrap_or(true)
                {
                    lo = Some(v.clone());
                }
                if hi
                    .as_ref()
                    .map(|m| compare_total(v, m) == std::cmp::Ordering::Greater)
                    .unwrap_or(true)
                {
                    hi = Some(v.clone());
                }
            }
            ranges.push(match (lo, hi) {
                (Some(min), Some(max)) => Some(BlockRange { min, max }),
                _ => None,
            });
        }
        fields.push(FieldIndex {
            path: name.clone(),
            ranges,
            constant: if constant_ok && seen_any { constant } else { None },
        });
    }
    for (name, value) in constants {
        fields.push(FieldIndex {
            path: name.clone(),
            ranges: vec![None; blocks.len()],
            constant: Some(value.clone()),
        });
    }

    Trailer {
        block_shift: BLOCK_SHIFT,
        blocks: blocks
            .iter()
            .map(|b| BlockInfo {
                chunks: b.len() as i64,
            })
            .collect(),
        sparse: SparseIndex { fields },
    }
}

fn scalar(v: &Value) -> bool {
    !matches!(
        v,
        Value::List(_) | Value::Struct(_) | Value::Missing | Value::Bytes(_)
    )
}

/// Shared object storage: path to row blocks.
#[derive(Debug, Default)]
pub struct MemStore {
    objects: Mutex<HashMap<String, Arc<Vec<Vec<Value>>>>>,
}

impl MemStore {
    fn insert(&self, path: &str, blocks: Vec<Vec<Value>>) {
        self.objects
            .lock()
            .insert(path.to_string(), Arc::new(blocks));
    }

    fn get(&self, path: &str) -> Result<Arc<Vec<Vec<Value>>>> {
        self.objects
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| TernError::new(format!("no object at {path:?}")))
    }
}

#[derive(Debug, Default)]
struct MemTableMeta {
    /// Object paths, in ingest order.
    paths: Vec<String>,
    /// Declared partition fields.
    partitions: Vec<String>,
}

/// In-memory [`Env`]: a catalog of tables over a [`MemStore`].
#[derive(Debug, Default)]
pub struct MemEnv {
    store: Arc<MemStore>,
    tables: Mutex<HashMap<String, MemTableMeta>>,
    /// Object-level constants by path, applied when trailers are rebuilt.
    constants: Mutex<HashMap<String, Vec<(String, Value)>>>,
    filter_log: Arc<Mutex<Vec<String>>>,
    upload: Option<Arc<MemUploadEnv>>,
    object_seq: Mutex<u64>,
}

impl MemEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upload(mut self) -> Self {
        self.upload = Some(Arc::new(MemUploadEnv::new()));
        self
    }

    pub fn upload_fs(&self) -> Option<Arc<MemUploadFS>> {
        self.upload.as_ref().map(|u| u.fs())
    }

    /// Register a single-object table.
    pub fn add_table(&self, name: &str, rows: Vec<Value>) {
        self.add_table_with_blocks(name, rows, DEFAULT_BLOCK_ROWS);
    }

    pub fn add_table_with_blocks(&self, name: &str, rows: Vec<Value>, block_rows: usize) {
        let blocks: Vec<Vec<Value>> = rows
            .chunks(block_rows.max(1))
            .map(|c| c.to_vec())
            .collect();
        self.add_object(name, blocks, &[]);
    }

    /// Register a table with one object per partition group. Each object
    /// carries `field = value` as a sparse-index constant.
    pub fn add_partitioned_table(
        &self,
        name: &str,
        field: &str,
        groups: Vec<(Value, Vec<Value>)>,
    ) {
        for (value, rows) in groups {
            let blocks: Vec<Vec<Value>> = rows
                .chunks(DEFAULT_BLOCK_ROWS)
                .map(|c| c.to_vec())
                .collect();
            self.add_object(name, blocks, &[(field.to_string(), value)]);
        }
        if let Some(meta) = self.tables.lock().get_mut(name) {
            meta.partitions = vec![field.to_string()];
        }
    }

    fn add_object(&self, table: &str, blocks: Vec<Vec<Value>>, constants: &[(String, Value)]) {
        let seq = {
            let mut guard = self.object_seq.lock();
            *guard += 1;
            *guard
        };
        let path = format!("db/{table}/obj-{seq:04}");
        self.store.insert(&path, blocks);
        self.constants
            .lock()
            .insert(path.clone(), constants.to_vec());
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .paths
            .push(path);
    }

    fn descriptor(&self, path: &str) -> Result<Descriptor> {
        let blocks = self.store.get(path)?;
        let constants = self
            .constants
            .lock()
            .get(path)
            .cloned()
            .unwrap_or_default();
        let trailer = build_trailer(&blocks, &constants);
        let size: i64 = (0..trailer.block_count())
            .map(|b| trailer.block_size(b))
            .sum();
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        for block in blocks.iter() {
            hasher.update((block.len() as u64).to_le_bytes());
        }
        let etag = hex(&hasher.finalize()[..8]);
        Ok(Descriptor::whole(
            ObjectInfo {
                path: path.to_string(),
                etag,
                size,
                last_modified: None,
            },
            trailer,
        ))
    }

    fn stat_one(&self, table: &str, hints: &StatHints) -> Result<Input> {
        if table.contains('*') {
            let names = crate::env::expand_pattern(self, "db", table)?;
            let mut out: Option<Input> = None;
            for name in names {
                let input = self.stat_one(&name, hints)?;
                match &mut out {
                    Some(acc) => acc.append(input)?,
                    None => out = Some(input),
                }
            }
            return out.ok_or_else(|| TernError::new(format!("no tables match {table:?}")));
        }
        let paths = {
            let tables = self.tables.lock();
            let meta = tables
                .get(table)
                .ok_or_else(|| TernError::new(format!("no such table: {table}")))?;
            meta.paths.clone()
        };
        let mut descs = Vec::with_capacity(paths.len());
        for path in &paths {
            descs.push(self.descriptor(path)?);
        }
        Ok(Input::new(descs).with_fields(hints.fields.map(|f| f.to_vec())))
    }

    pub fn runner(&self) -> Arc<MemRunner> {
        Arc::new(MemRunner {
            store: self.store.clone(),
            filter_log: self.filter_log.clone(),
        })
    }

    /// Every filter hint observed by `stat` and by scan-time pushdown, in
    /// order.
    pub fn filter_observations(&self) -> Vec<String> {
        self.filter_log.lock().clone()
    }
}

impl Env for MemEnv {
    fn stat(&self, table: &Expr, hints: &StatHints) -> Result<Input> {
        if let Some(filter) = hints.filter {
            self.filter_log.lock().push(filter.to_string());
        }
        match table {
            Expr::Path(p) if p.rest.is_empty() => self.stat_one(&p.first, hints),
            // `a ++ b` resolves to the append of both inputs.
            Expr::Concat(l, r) => {
                let sub = StatHints {
                    filter: None,
                    ..*hints
                };
                let mut input = self.stat(l, &sub)?;
                let other = self.stat(r, &sub)?;
                input.append(other)?;
                Ok(input)
            }
            other => Err(TernError::new(format!("unresolvable table: {other}"))),
        }
    }

    fn indexer(&self) -> Option<&dyn Indexer> {
        Some(self)
    }

    fn lister(&self) -> Option<&dyn TableLister> {
        Some(self)
    }

    fn upload(&self) -> Option<Arc<dyn UploadEnv>> {
        self.upload.clone().map(|u| u as Arc<dyn UploadEnv>)
    }
}

impl TableLister for MemEnv {
    fn list_tables(&self, _db: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.tables.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

impl Indexer for MemEnv {
    fn index(&self, table: &Expr) -> Result<Option<Box<dyn Index>>> {
        let name = match table {
            Expr::Path(p) if p.rest.is_empty() => p.first.clone(),
            _ => return Ok(None),
        };
        let tables = self.tables.lock();
        let meta = match tables.get(&name) {
            Some(meta) => meta,
            None => return Ok(None),
        };
        Ok(Some(Box::new(MemIndex {
            partitions: meta.partitions.clone(),
        })))
    }
}

struct MemIndex {
    partitions: Vec<String>,
}

impl Index for MemIndex {
    fn time_range(
        &self,
        _path: &[String],
    ) -> Option<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> {
        None
    }

    fn has_partition(&self, field: &str) -> bool {
        self.partitions.iter().any(|p| p == field)
    }
}

/// Runner over a [`MemStore`].
pub struct MemRunner {
    store: Arc<MemStore>,
    filter_log: Arc<Mutex<Vec<String>>>,
}

impl Runner for MemRunner {
    fn run(&self, dst: &dyn QuerySink, input: &Input, ep: &ExecParams) -> Result<()> {
        if let Some(hint) = &input.hint {
            self.filter_log.lock().push(hint.to_string());
        }
        for desc in &input.descs {
            ep.ctx.check()?;
            let mut handle: Box<dyn TableHandle> = Box::new(MemHandle {
                store: self.store.clone(),
                desc: desc.clone(),
                fields: input.fields.clone(),
            });
            if let Some(hint) = &input.hint {
                if let Some(refined) = handle.filter(hint) {
                    handle = refined;
                }
            }
            ep.stats.add_scanned_bytes(desc.size() as u64);
            ep.stats.add_cache_hits(desc.blocks.len() as u64);
            let table = handle.open(&ep.ctx)?;
            table.write_chunks(dst, &ep.ctx, ep.sub_parallel.max(1))?;
        }
        Ok(())
    }
}

/// Handle over one in-memory object.
struct MemHandle {
    store: Arc<MemStore>,
    desc: Descriptor,
    fields: Option<Vec<String>>,
}

impl TableHandle for MemHandle {
    fn open(&self, _ctx: &Context) -> Result<Box<dyn Table>> {
        let blocks = self.store.get(&self.desc.object.path)?;
        let mut rows = Vec::new();
        for &b in &self.desc.blocks {
            let block = blocks
                .get(b as usize)
                .ok_or_else(|| TernError::new("descriptor block out of range"))?;
            match &self.fields {
                None => rows.extend(block.iter().cloned()),
                Some(fields) => {
                    for row in block {
                        rows.push(project_fields(row, fields));
                    }
                }
            }
        }
        Ok(Box::new(MemTable::new(rows)))
    }

    fn size(&self) -> i64 {
        self.desc.size()
    }

    fn filter(&self, e: &Expr) -> Option<Box<dyn TableHandle>> {
        // Narrow the descriptor's blocks by the predicate.
        let narrowed = Input::new(vec![self.desc.clone()]).filter(e);
        let desc = match narrowed.descs.into_iter().next() {
            Some(d) => d,
            None => Descriptor {
                object: self.desc.object.clone(),
                trailer: self.desc.trailer.clone(),
                blocks: Vec::new(),
            },
        };
        Some(Box::new(MemHandle {
            store: self.store.clone(),
            desc,
            fields: self.fields.clone(),
        }))
    }

    fn split(&self, n: usize) -> Result<Option<Vec<Box<dyn TableHandle>>>> {
        let shards = Input::new(vec![self.desc.clone()]).hash_split(n)?;
        let out = shards
            .into_iter()
            .flatten()
            .flat_map(|input| input.descs)
            .map(|desc| {
                Box::new(MemHandle {
                    store: self.store.clone(),
                    desc,
                    fields: self.fields.clone(),
                }) as Box<dyn TableHandle>
            })
            .collect();
        Ok(Some(out))
    }
}

fn project_fields(row: &Value, fields: &[String]) -> Value {
    match row {
        Value::Struct(all) => Value::Struct(
            all.iter()
                .filter(|(k, _)| fields.iter().any(|f| f == k))
                .cloned()
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Memory-backed upload target.
#[derive(Debug, Default)]
pub struct MemUploadFS {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemUploadFS {
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut out: Vec<String> = self.files.lock().keys().cloned().collect();
        out.sort();
        out
    }
}

impl UploadFS for MemUploadFS {
    fn create(&self, path: &str) -> Result<Box<dyn UploadSink>> {
        Ok(Box::new(MemUploadSink {
            path: path.to_string(),
            buf: Vec::new(),
            files: self.files.clone(),
        }))
    }
}

struct MemUploadSink {
    path: String,
    buf: Vec<u8>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl UploadSink for MemUploadSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<ObjectInfo> {
        let mut hasher = Sha256::new();
        hasher.update(&self.buf);
        let etag = hex(&hasher.finalize()[..16]);
        let size = self.buf.len() as i64;
        self.files.lock().insert(self.path.clone(), self.buf);
        Ok(ObjectInfo {
            path: self.path,
            etag,
            size,
            last_modified: None,
        })
    }
}

#[derive(Debug)]
pub struct MemUploadEnv {
    fs: Arc<MemUploadFS>,
    key: [u8; 32],
}

impl MemUploadEnv {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        MemUploadEnv {
            fs: Arc::new(MemUploadFS::default()),
            key,
        }
    }

    pub fn fs(&self) -> Arc<MemUploadFS> {
        self.fs.clone()
    }
}

impl Default for MemUploadEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadEnv for MemUploadEnv {
    fn uploader(&self) -> Arc<dyn UploadFS> {
        self.fs.clone()
    }

    fn key(&self) -> [u8; 32] {
        self.key
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: i64) -> Vec<Value> {
        (0..n)
            .map(|i| {
                Value::struct_of([
                    ("id", Value::Int(i)),
                    ("grp", Value::String(format!("g{}", i % 3))),
                ])
            })
            .collect()
    }

    #[test]
    fn trailer_ranges_and_constants() {
        let blocks: Vec<Vec<Value>> = rows(10).chunks(4).map(|c| c.to_vec()).collect();
        let t = build_trailer(&blocks, &[("region".to_string(), Value::String("eu".into()))]);
        let id = t.sparse.get("id").unwrap();
        assert_eq!(id.ranges.len(), 3);
        let r0 = id.ranges[0].as_ref().unwrap();
        assert_eq!(r0.min, Value::Int(0));
        assert_eq!(r0.max, Value::Int(3));
        assert!(id.constant.is_none());
        assert_eq!(
            t.sparse.constant("region"),
            Some(&Value::String("eu".into()))
        );
    }

    #[test]
    fn stat_and_append() {
        let env = MemEnv::new();
        env.add_table("a", rows(10));
        env.add_table("b", rows(5));
        let hints = StatHints::default();
        let one = env.stat(&Expr::path("a"), &hints).unwrap();
        assert_eq!(one.descs.len(), 1);

        let both = env
            .stat(
                &Expr::Concat(Box::new(Expr::path("a")), Box::new(Expr::path("b"))),
                &hints,
            )
            .unwrap();
        assert_eq!(both.descs.len(), 2);
    }

    #[test]
    fn glob_expansion() {
        let env = MemEnv::new();
        env.add_table("nyc_taxi", rows(4));
        env.add_table("nyc_bikes", rows(4));
        env.add_table("parking", rows(4));
        let input = env
            .stat(&Expr::path("nyc_*"), &StatHints::default())
            .unwrap();
        assert_eq!(input.descs.len(), 2);
        assert!(env.stat(&Expr::path("zzz*"), &StatHints::default()).is_err());
    }

    #[test]
    fn handle_split_capability() {
        let env = MemEnv::new();
        env.add_table_with_blocks("a", rows(64), 4);
        let input = env.stat(&Expr::path("a"), &StatHints::default()).unwrap();
        let handle = MemHandle {
            store: env.store.clone(),
            desc: input.descs[0].clone(),
            fields: None,
        };
        let shards = handle.split(4).unwrap().unwrap();
        let total: i64 = shards.iter().map(|h| h.size()).sum();
        assert_eq!(total, handle.size());
    }
}
