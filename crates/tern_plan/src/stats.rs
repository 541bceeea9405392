//! Execution statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use tern_codec::Value;
use tern_error::Result;

/// Counters accumulated while a plan runs.
///
/// All counters are atomics so concurrent tasks fold their contributions in
/// without coordination. Remote peers ship a snapshot back in the FIN frame
/// and the client folds it into its own stats.
#[derive(Debug, Default)]
pub struct ExecStats {
    scanned_bytes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rows_out: AtomicU64,
}

impl ExecStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scanned_bytes(&self, n: u64) {
        self.scanned_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_cache_hits(&self, n: u64) {
        self.cache_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_cache_misses(&self, n: u64) {
        self.cache_misses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rows_out(&self, n: u64) {
        self.rows_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn scanned_bytes(&self) -> u64 {
        self.scanned_bytes.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn rows_out(&self) -> u64 {
        self.rows_out.load(Ordering::Relaxed)
    }

    /// Fold another stats block into this one.
    pub fn fold(&self, other: &ExecStats) {
        self.add_scanned_bytes(other.scanned_bytes());
        self.add_cache_hits(other.cache_hits());
        self.add_cache_misses(other.cache_misses());
        self.add_rows_out(other.rows_out());
    }

    pub fn encode(&self) -> Value {
        Value::struct_of([
            ("scanned_bytes", Value::Uint(self.scanned_bytes())),
            ("cache_hits", Value::Uint(self.cache_hits())),
            ("cache_misses", Value::Uint(self.cache_misses())),
            ("rows_out", Value::Uint(self.rows_out())),
        ])
    }

    pub fn decode(v: &Value) -> Result<ExecStats> {
        let stats = ExecStats::new();
        let field = |name: &str| -> u64 {
            match v.field(name) {
                Value::Uint(n) => *n,
                Value::Int(n) => (*n).max(0) as u64,
                _ => 0,
            }
        };
        stats.add_scanned_bytes(field("scanned_bytes"));
        stats.add_cache_hits(field("cache_hits"));
        stats.add_cache_misses(field("cache_misses"));
        stats.add_rows_out(field("rows_out"));
        Ok(stats)
    }
}
