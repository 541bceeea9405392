//! Contracts between the planner/runtime and its collaborators: the catalog
//! environment consulted at planning time, the runner that turns inputs into
//! row streams at execution time, and the upload surface used by `INTO`-style
//! output operators.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tern_codec::Value;
use tern_error::{Result, TernError};
use tern_expr::{types::TypeHint, Expr};
use tern_mill::{Context, QuerySink, Table};

use crate::blob::ObjectInfo;
use crate::exec::ExecParams;
use crate::input::Input;

/// Planning hints passed to [`Env::stat`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StatHints<'a> {
    /// Predicate the scan will apply; the environment may pre-prune blocks.
    pub filter: Option<&'a Expr>,
    /// Fields the query touches; `None` when everything is needed.
    pub fields: Option<&'a [String]>,
    /// True when the query selects `*` (so `fields` is necessarily `None`).
    pub wildcard: bool,
}

/// The planning environment: resolves table expressions to inputs.
pub trait Env: Send + Sync {
    /// Resolve a table expression into the input it scans.
    ///
    /// Composite tables (the `++` operator, glob patterns) return a single
    /// input holding every matched object.
    fn stat(&self, table: &Expr, hints: &StatHints) -> Result<Input>;

    /// Optional result-schema hint for a table.
    fn schema(&self, _table: &Expr) -> Option<Vec<TypeHint>> {
        None
    }

    /// Optional index metadata provider.
    fn indexer(&self) -> Option<&dyn Indexer> {
        None
    }

    /// Optional table listing, used for glob expansion.
    fn lister(&self) -> Option<&dyn TableLister> {
        None
    }

    /// Upload capability; required for `OutputPart`/`OutputIndex` lowering.
    fn upload(&self) -> Option<Arc<dyn UploadEnv>> {
        None
    }
}

pub trait Indexer: Send + Sync {
    fn index(&self, table: &Expr) -> Result<Option<Box<dyn Index>>>;
}

/// Index metadata for one table.
pub trait Index: Send + Sync {
    /// Min/max timestamps recorded for a column path, if known.
    fn time_range(&self, path: &[String]) -> Option<(DateTime<Utc>, DateTime<Utc>)>;

    /// Is the table partitioned by `field` (every object carries a constant
    /// for it)?
    fn has_partition(&self, field: &str) -> bool;
}

pub trait TableLister: Send + Sync {
    fn list_tables(&self, db: &str) -> Result<Vec<String>>;
}

/// Executes a leaf scan: opens the input's objects and streams their rows
/// into the sink.
pub trait Runner: Send + Sync {
    fn run(&self, dst: &dyn QuerySink, input: &Input, ep: &ExecParams) -> Result<()>;
}

/// An opaque, openable reference to one table's data.
pub trait TableHandle: Send + Sync {
    fn open(&self, ctx: &Context) -> Result<Box<dyn Table>>;

    /// Approximate decompressed size.
    fn size(&self) -> i64;

    /// Optional pushdown: return a refined handle that will skip data not
    /// satisfying `e`. `None` when the handle cannot narrow further.
    fn filter(&self, _e: &Expr) -> Option<Box<dyn TableHandle>> {
        None
    }

    /// Optional split capability used when distributing a scan.
    fn split(&self, _n: usize) -> Result<Option<Vec<Box<dyn TableHandle>>>> {
        Ok(None)
    }

    /// Optional partition capability: split by constant-valued fields.
    fn split_by(&self, _fields: &[String]) -> Result<Option<Vec<Box<dyn TableHandle>>>> {
        Ok(None)
    }

    fn encode(&self) -> Result<Value> {
        Err(TernError::new("table handle is not encodable"))
    }
}

/// Write access to the object store for `INTO`-style output.
pub trait UploadFS: Send + Sync {
    fn create(&self, path: &str) -> Result<Box<dyn UploadSink>>;
}

pub trait UploadSink: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Complete the upload and return the stored object's identity.
    fn finish(self: Box<Self>) -> Result<ObjectInfo>;
}

pub trait UploadEnv: Send + Sync {
    fn uploader(&self) -> Arc<dyn UploadFS>;

    /// Signing key for index files.
    fn key(&self) -> [u8; 32];
}

/// Match a table name against a `*` glob pattern.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Expand a glob pattern against the tables of a database.
pub fn expand_pattern(
    lister: &dyn TableLister,
    db: &str,
    pattern: &str,
) -> Result<Vec<String>> {
    let mut out: Vec<String> = lister
        .list_tables(db)?
        .into_iter()
        .filter(|t| pattern_matches(pattern, t))
        .collect();
    out.sort();
    if out.is_empty() {
        return Err(TernError::new(format!(
            "no tables match pattern {pattern:?} in {db:?}"
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(pattern_matches("nyc*", "nyc_taxi"));
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("a*c", "abc"));
        assert!(pattern_matches("a*c", "ac"));
        assert!(!pattern_matches("a*c", "acd"));
        assert!(!pattern_matches("nyc", "nyc_taxi"));
    }
}
