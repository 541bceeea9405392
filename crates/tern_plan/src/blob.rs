//! Object metadata: handles, trailers, and the sparse per-column index.
//!
//! A columnar object is opaque bytes to the planner, but its trailer is not:
//! the trailer says how many blocks the object holds, how large each block
//! decompresses to, and for indexed columns, the per-block value ranges and
//! whole-object constants. That is exactly the set of facts the input engine
//! needs for pruning, hash-splitting, and partitioning.

use chrono::{DateTime, Utc};
use tern_codec::{compare_total, Value};
use tern_error::{OptionExt, Result, TernError};

/// Identity and size of one stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub path: String,
    /// Entity tag; two objects are the same iff path and etag match.
    pub etag: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectInfo {
    /// Same underlying object?
    pub fn same_object(&self, other: &ObjectInfo) -> bool {
        self.path == other.path && self.etag == other.etag
    }

    pub fn encode(&self) -> Value {
        let mut fields = vec![
            ("path".to_string(), Value::String(self.path.clone())),
            ("etag".to_string(), Value::String(self.etag.clone())),
            ("size".to_string(), Value::Int(self.size)),
        ];
        if let Some(lm) = self.last_modified {
            fields.push(("last_modified".to_string(), Value::Timestamp(lm)));
        }
        Value::Struct(fields)
    }

    pub fn decode(v: &Value) -> Result<ObjectInfo> {
        Ok(ObjectInfo {
            path: v.field("path").as_str().required("path")?.to_string(),
            etag: v.field("etag").as_str().required("etag")?.to_string(),
            size: v.field("size").as_i64().unwrap_or(0),
            last_modified: match v.field("last_modified") {
                Value::Timestamp(ts) => Some(*ts),
                _ => None,
            },
        })
    }
}

/// Per-block accounting. A block decompresses to `chunks << block_shift`
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub chunks: i64,
}

/// Min/max bounds of one column within one block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRange {
    pub min: Value,
    pub max: Value,
}

impl BlockRange {
    /// Does `v` fall within the bounds?
    pub fn contains(&self, v: &Value) -> bool {
        use std::cmp::Ordering;
        compare_total(&self.min, v) != Ordering::Greater
            && compare_total(v, &self.max) != Ordering::Greater
    }
}

/// Sparse index entry for one column path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldIndex {
    pub path: String,
    /// One entry per block; `None` when the block has no bounds recorded.
    pub ranges: Vec<Option<BlockRange>>,
    /// Present when the column holds a single value across the whole object.
    pub constant: Option<Value>,
}

/// The sparse per-column index embedded in a trailer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseIndex {
    pub fields: Vec<FieldIndex>,
}

impl SparseIndex {
    pub fn get(&self, path: &str) -> Option<&FieldIndex> {
        self.fields.iter().find(|f| f.path == path)
    }

    /// The constant value of `path` for this object, if any.
    pub fn constant(&self, path: &str) -> Option<&Value> {
        self.get(path).and_then(|f| f.constant.as_ref())
    }
}

/// Object metadata: block layout plus the sparse index.
#[derive(Debug, Clone, PartialEq)]
pub struct Trailer {
    pub block_shift: u32,
    pub blocks: Vec<BlockInfo>,
    pub sparse: SparseIndex,
}

impl Trailer {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Decompressed size of one block.
    pub fn block_size(&self, block: usize) -> i64 {
        match self.blocks.get(block) {
            Some(b) => b.chunks << self.block_shift,
            None => 0,
        }
    }

    pub fn encode(&self) -> Value {
        let blocks = self
            .blocks
            .iter()
            .map(|b| Value::Int(b.chunks))
            .collect::<Vec<_>>();
        let fields = self
            .sparse
            .fields
            .iter()
            .map(|f| {
                let ranges = f
                    .ranges
                    .iter()
                    .map(|r| match r {
                        Some(r) => Value::List(vec![r.min.clone(), r.max.clone()]),
                        None => Value::Null,
                    })
                    .collect();
                let mut entry = vec![
                    ("path".to_string(), Value::String(f.path.clone())),
                    ("ranges".to_string(), Value::List(ranges)),
                ];
                if let Some(c) = &f.constant {
                    entry.push(("const".to_string(), c.clone()));
                }
                Value::Struct(entry)
            })
            .collect();
        Value::struct_of([
            ("block_shift", Value::Uint(u64::from(self.block_shift))),
            ("blocks", Value::List(blocks)),
            ("sparse", Value::List(fields)),
        ])
    }

    pub fn decode(v: &Value) -> Result<Trailer> {
        let block_shift = v.field("block_shift").as_i64().unwrap_or(0) as u32;
        let mut blocks = Vec::new();
        if let Value::List(items) = v.field("blocks") {
            for item in items {
                blocks.push(BlockInfo {
                    chunks: item
                        .as_i64()
                        .ok_or_else(|| TernError::new("bad block chunk count"))?,
                });
            }
        }
        let mut fields = Vec::new();
        if let Value::List(items) = v.field("sparse") {
            for item in items {
                let path = item.field("path").as_str().required("path")?.to_string();
                let mut ranges = Vec::new();
                if let Value::List(rs) = item.field("ranges") {
                    for r in rs {
                        ranges.push(match r {
                            Value::List(pair) if pair.len() == 2 => Some(BlockRange {
                                min: pair[0].clone(),
                                max: pair[1].clone(),
                            }),
                            Value::Null => None,
                            other => {
                                return Err(TernError::new(format!("bad range: {other}")))
                            }
                        });
                    }
                }
                let constant = match item.field("const") {
                    Value::Missing => None,
                    other => Some(other.clone()),
                };
                fields.push(FieldIndex {
                    path,
                    ranges,
                    constant,
                });
            }
        }
        Ok(Trailer {
            block_shift,
            blocks,
            sparse: SparseIndex { fields },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_trailer() -> Trailer {
        Trailer {
            block_shift: 4,
            blocks: vec![BlockInfo { chunks: 2 }, BlockInfo { chunks: 3 }],
            sparse: SparseIndex {
                fields: vec![FieldIndex {
                    path: "ts".to_string(),
                    ranges: vec![
                        Some(BlockRange {
                            min: Value::Int(0),
                            max: Value::Int(9),
                        }),
                        None,
                    ],
                    constant: None,
                }],
            },
        }
    }

    #[test]
    fn trailer_roundtrip() {
        let t = sample_trailer();
        let got = Trailer::decode(&t.encode()).unwrap();
        assert_eq!(t, got);
        assert_eq!(got.block_size(0), 2 << 4);
        assert_eq!(got.block_size(7), 0);
    }

    #[test]
    fn range_contains() {
        let r = BlockRange {
            min: Value::Int(10),
            max: Value::Int(20),
        };
        assert!(r.contains(&Value::Int(10)));
        assert!(r.contains(&Value::Int(20)));
        assert!(!r.contains(&Value::Int(21)));
        assert!(r.contains(&Value::Uint(15)));
    }

    #[test]
    fn object_identity() {
        let a = ObjectInfo {
            path: "db/t/obj0".to_string(),
            etag: "abc".to_string(),
            size: 100,
            last_modified: None,
        };
        let mut b = a.clone();
        assert!(a.same_object(&b));
        b.etag = "def".to_string();
        assert!(!a.same_object(&b));
    }
}
