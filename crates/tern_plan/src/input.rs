//! Table inputs: descriptor sets plus the operations the planner applies to
//! them: block-range filtering, deterministic hash-splitting, and
//! value-based partitioning.

use std::sync::Arc;

use ahash::RandomState;
use parking_lot::Mutex;
use tern_codec::{compare_total, encode_key, Value};
use tern_error::{Result, TernError};
use tern_expr::{decode_expr, encode_expr, CompareOp, Expr, LogicalOp};

use crate::blob::{ObjectInfo, Trailer};

/// One object reference plus the subset of its blocks a scan will touch.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub object: ObjectInfo,
    pub trailer: Trailer,
    /// Referenced block indices, strictly increasing.
    pub blocks: Vec<u32>,
}

impl Descriptor {
    /// A descriptor referencing every block of the object.
    pub fn whole(object: ObjectInfo, trailer: Trailer) -> Descriptor {
        let blocks = (0..trailer.block_count() as u32).collect();
        Descriptor {
            object,
            trailer,
            blocks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total decompressed size of the referenced blocks.
    pub fn size(&self) -> i64 {
        self.blocks
            .iter()
            .map(|&b| self.trailer.block_size(b as usize))
            .sum()
    }

    /// Merge another descriptor for the same object into this one.
    pub fn merge_from(&mut self, other: &Descriptor) -> Result<()> {
        if !self.object.same_object(&other.object) {
            return Err(TernError::new(format!(
                "cannot merge descriptors for {} and {}",
                self.object.path, other.object.path
            )));
        }
        self.blocks.extend_from_slice(&other.blocks);
        self.blocks.sort_unstable();
        self.blocks.dedup();
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let count = self.trailer.block_count() as u32;
        let mut prev: Option<u32> = None;
        for &b in &self.blocks {
            if b >= count {
                return Err(TernError::new(format!(
                    "block {b} out of range for {} ({count} blocks)",
                    self.object.path
                )));
            }
            if let Some(p) = prev {
                if b <= p {
                    return Err(TernError::new("descriptor blocks not strictly increasing"));
                }
            }
            prev = Some(b);
        }
        Ok(())
    }

    pub fn encode(&self) -> Value {
        Value::struct_of([
            ("object", self.object.encode()),
            ("trailer", self.trailer.encode()),
            (
                "blocks",
                Value::List(
                    self.blocks
                        .iter()
                        .map(|&b| Value::Uint(u64::from(b)))
                        .collect(),
                ),
            ),
        ])
    }

    pub fn decode(v: &Value) -> Result<Descriptor> {
        let object = ObjectInfo::decode(v.field("object"))?;
        let trailer = Trailer::decode(v.field("trailer"))?;
        let mut blocks = Vec::new();
        if let Value::List(items) = v.field("blocks") {
            for item in items {
                blocks.push(
                    item.as_i64()
                        .and_then(|i| u32::try_from(i).ok())
                        .ok_or_else(|| TernError::new("bad block index"))?,
                );
            }
        }
        let desc = Descriptor {
            object,
            trailer,
            blocks,
        };
        desc.validate()?;
        Ok(desc)
    }
}

type PartCacheInner = Option<(Vec<String>, Arc<TablePart>)>;

/// Memoizes the most recent partitioning of an input.
#[derive(Debug, Default, Clone)]
struct PartCache(Arc<Mutex<PartCacheInner>>);

/// A set of descriptors plus projection and filter hints.
#[derive(Debug, Clone, Default)]
pub struct Input {
    pub descs: Vec<Descriptor>,
    /// `None` means every field is needed; `Some` (possibly empty) means
    /// exactly the listed fields. The distinction survives encoding.
    pub fields: Option<Vec<String>>,
    /// Merged pushdown predicate, advisory only.
    pub hint: Option<Expr>,
    cache: PartCache,
}

impl PartialEq for Input {
    fn eq(&self, other: &Self) -> bool {
        self.descs == other.descs && self.fields == other.fields && self.hint == other.hint
    }
}

impl Input {
    pub fn new(descs: Vec<Descriptor>) -> Input {
        Input {
            descs,
            ..Default::default()
        }
    }

    pub fn with_fields(mut self, fields: Option<Vec<String>>) -> Input {
        self.fields = fields;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.descs.iter().all(Descriptor::is_empty)
    }

    pub fn size(&self) -> i64 {
        self.descs.iter().map(Descriptor::size).sum()
    }

    pub fn block_count(&self) -> usize {
        self.descs.iter().map(|d| d.blocks.len()).sum()
    }

    /// Append another input's descriptors, merging references to the same
    /// object. Used for the `++` table composite.
    pub fn append(&mut self, other: Input) -> Result<()> {
        for desc in other.descs {
            match self
                .descs
                .iter_mut()
                .find(|d| d.object.same_object(&desc.object))
            {
                Some(existing) => existing.merge_from(&desc)?,
                None => self.descs.push(desc),
            }
        }
        Ok(())
    }

    /// Narrow the referenced blocks to those whose sparse ranges may satisfy
    /// `e`. A trivially-true predicate returns the receiver unchanged.
    pub fn filter(&self, e: &Expr) -> Input {
        let pred = BlockPred::compile(e);
        if pred.is_trivial() {
            return self.clone();
        }
        let mut descs = Vec::with_capacity(self.descs.len());
        for desc in &self.descs {
            let blocks: Vec<u32> = desc
                .blocks
                .iter()
                .copied()
                .filter(|&b| pred.keep(&desc.trailer, b as usize))
                .collect();
            if blocks.is_empty() {
                continue;
            }
            descs.push(Descriptor {
                object: desc.object.clone(),
                trailer: desc.trailer.clone(),
                blocks,
            });
        }
        Input {
            descs,
            fields: self.fields.clone(),
            hint: self.hint.clone(),
            cache: PartCache::default(),
        }
    }

    /// Deterministically split the referenced `(object, block)` pairs into
    /// `n` shards. The mapping depends only on object etags and block
    /// numbers, so the same input always splits the same way. Empty shards
    /// stay `None`.
    pub fn hash_split(&self, n: usize) -> Result<Vec<Option<Input>>> {
        if n == 0 {
            return Err(TernError::new("hash split into zero shards"));
        }
        let divisor = u64::MAX / n as u64;
        let mut shards: Vec<Vec<Vec<u32>>> = vec![vec![Vec::new(); self.descs.len()]; n];
        for (di, desc) in self.descs.iter().enumerate() {
            let mut key = Vec::with_capacity(desc.object.etag.len() + 4);
            key.extend_from_slice(desc.object.etag.as_bytes());
            for &b in &desc.blocks {
                key.truncate(desc.object.etag.len());
                key.extend_from_slice(&b.to_le_bytes());
                let hash = SPLIT_RANDOM_STATE.hash_one(&key);
                let slot = ((hash / divisor) as usize).min(n - 1);
                shards[slot][di].push(b);
            }
        }
        let out = shards
            .into_iter()
            .map(|blocks| {
                let descs: Vec<Descriptor> = blocks
                    .into_iter()
                    .enumerate()
                    .filter(|(_, bs)| !bs.is_empty())
                    .map(|(di, bs)| Descriptor {
                        object: self.descs[di].object.clone(),
                        trailer: self.descs[di].trailer.clone(),
                        blocks: bs,
                    })
                    .collect();
                if descs.is_empty() {
                    None
                } else {
                    Some(Input {
                        descs,
                        fields: self.fields.clone(),
                        hint: self.hint.clone(),
                        cache: PartCache::default(),
                    })
                }
            })
            .collect();
        Ok(out)
    }

    /// Group descriptors by the constant values of `fields`.
    ///
    /// Fails when any descriptor lacks a constant for any requested field.
    /// The most recent partitioning is memoized per input.
    pub fn partition(&self, fields: &[String]) -> Result<Arc<TablePart>> {
        {
            let cached = self.cache.0.lock();
            if let Some((f, part)) = cached.as_ref() {
                if f == fields {
                    return Ok(part.clone());
                }
            }
        }
        let part = Arc::new(self.partition_uncached(fields)?);
        *self.cache.0.lock() = Some((fields.to_vec(), part.clone()));
        Ok(part)
    }

    fn partition_uncached(&self, fields: &[String]) -> Result<TablePart> {
        if fields.is_empty() {
            return Err(TernError::new("partition with no fields"));
        }
        let mut groups: Vec<PartGroup> = Vec::new();
        let mut index: hashbrown::HashMap<Vec<u8>, usize> = hashbrown::HashMap::new();
        for desc in &self.descs {
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                let v = desc.trailer.sparse.constant(field).ok_or_else(|| {
                    TernError::new(format!(
                        "{} is not constant within {}",
                        field, desc.object.path
                    ))
                })?;
                values.push(v.clone());
            }
            let key = encode_key(&values);
            let gi = match index.get(&key) {
                Some(&gi) => gi,
                None => {
                    groups.push(PartGroup {
                        values,
                        input: Input {
                            descs: Vec::new(),
                            fields: self.fields.clone(),
                            hint: self.hint.clone(),
                            cache: PartCache::default(),
                        },
                    });
                    index.insert(key, groups.len() - 1);
                    groups.len() - 1
                }
            };
            groups[gi].input.descs.push(desc.clone());
        }
        Ok(TablePart {
            fields: fields.to_vec(),
            groups,
        })
    }

    pub fn encode(&self) -> Value {
        let descs = self.descs.iter().map(Descriptor::encode).collect();
        let fields = match &self.fields {
            // Typed null preserves the "all fields" meaning; an empty list
            // means "no fields".
            None => Value::Null,
            Some(fs) => Value::List(fs.iter().map(|f| Value::String(f.clone())).collect()),
        };
        let mut out = vec![
            ("descs".to_string(), Value::List(descs)),
            ("fields".to_string(), fields),
        ];
        if let Some(hint) = &self.hint {
            out.push(("hint".to_string(), encode_expr(hint)));
        }
        Value::Struct(out)
    }

    pub fn decode(v: &Value) -> Result<Input> {
        let mut descs = Vec::new();
        if let Value::List(items) = v.field("descs") {
            for item in items {
                descs.push(Descriptor::decode(item)?);
            }
        }
        let fields = match v.field("fields") {
            Value::Null | Value::Missing => None,
            Value::List(items) => {
                let mut fs = Vec::with_capacity(items.len());
                for item in items {
                    fs.push(
                        item.as_str()
                            .ok_or_else(|| TernError::new("bad field name"))?
                            .to_string(),
                    );
                }
                Some(fs)
            }
            other => return Err(TernError::new(format!("bad fields value: {other}"))),
        };
        let hint = match v.field("hint") {
            Value::Missing => None,
            other => Some(decode_expr(other)?),
        };
        Ok(Input {
            descs,
            fields,
            hint,
            cache: PartCache::default(),
        })
    }
}

/// AND a predicate into a hint slot, skipping conjuncts already present so
/// repeated pushdown of the same filter stays idempotent.
pub(crate) fn merge_hint(hint: &mut Option<Expr>, pred: &Expr) {
    match hint {
        Some(existing) => {
            if !tern_expr::conjuncts(existing).contains(&pred) {
                *existing = tern_expr::and(existing.clone(), pred.clone());
            }
        }
        None => *hint = Some(pred.clone()),
    }
}

/// Fixed seeds: the shard layout must be identical on every node and across
/// runs.
const SPLIT_RANDOM_STATE: RandomState = RandomState::with_seeds(
    0x7465_726e_5f73_706c,
    0x6974_5f68_6173_6800,
    0xa076_1d64_78bd_642f,
    0xe703_7ed1_a0b4_28db,
);

/// Result of partitioning an input by constant fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TablePart {
    fields: Vec<String>,
    groups: Vec<PartGroup>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartGroup {
    /// Constant value per partition field, in field order.
    pub values: Vec<Value>,
    pub input: Input,
}

impl TablePart {
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn groups(&self) -> &[PartGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn each<F: FnMut(&[Value], &Input) -> Result<()>>(&self, mut f: F) -> Result<()> {
        for g in &self.groups {
            f(&g.values, &g.input)?;
        }
        Ok(())
    }

    /// The group whose constants equal `equal`, if any.
    pub fn get(&self, equal: &[Value]) -> Option<&Input> {
        self.groups
            .iter()
            .find(|g| g.values == equal)
            .map(|g| &g.input)
    }
}

/// A compiled block-level predicate over the sparse index.
#[derive(Debug)]
enum BlockPred {
    All,
    Cmp {
        path: String,
        op: CompareOp,
        value: Value,
    },
    And(Box<BlockPred>, Box<BlockPred>),
    Or(Box<BlockPred>, Box<BlockPred>),
}

impl BlockPred {
    /// Compile an expression into a block predicate. Unsupported shapes
    /// compile to `All`, which keeps every block.
    fn compile(e: &Expr) -> BlockPred {
        match e {
            Expr::Logical(LogicalOp::And, l, r) => {
                match (Self::compile(l), Self::compile(r)) {
                    (BlockPred::All, p) | (p, BlockPred::All) => p,
                    (l, r) => BlockPred::And(Box::new(l), Box::new(r)),
                }
            }
            Expr::Logical(LogicalOp::Or, l, r) => {
                match (Self::compile(l), Self::compile(r)) {
                    // OR with an unknown side keeps everything.
                    (BlockPred::All, _) | (_, BlockPred::All) => BlockPred::All,
                    (l, r) => BlockPred::Or(Box::new(l), Box::new(r)),
                }
            }
            Expr::Compare(op, l, r) => match (l.as_ref(), r.as_ref()) {
                (Expr::Path(p), Expr::Const(c)) if p.rest.is_empty() => BlockPred::Cmp {
                    path: p.first.clone(),
                    op: *op,
                    value: c.clone(),
                },
                (Expr::Const(c), Expr::Path(p)) if p.rest.is_empty() => BlockPred::Cmp {
                    path: p.first.clone(),
                    op: flip(*op),
                    value: c.clone(),
                },
                _ => BlockPred::All,
            },
            _ => BlockPred::All,
        }
    }

    fn is_trivial(&self) -> bool {
        matches!(self, BlockPred::All)
    }

    /// May any row in `block` satisfy the predicate?
    fn keep(&self, trailer: &Trailer, block: usize) -> bool {
        match self {
            BlockPred::All => true,
            BlockPred::And(l, r) => l.keep(trailer, block) && r.keep(trailer, block),
            BlockPred::Or(l, r) => l.keep(trailer, block) || r.keep(trailer, block),
            BlockPred::Cmp { path, op, value } => {
                let field = match trailer.sparse.get(path) {
                    Some(f) => f,
                    None => return true,
                };
                let (min, max) = if let Some(c) = &field.constant {
                    (c, c)
                } else {
                    match field.ranges.get(block) {
                        Some(Some(r)) => (&r.min, &r.max),
                        _ => return true,
                    }
                };
                range_may_match(*op, min, max, value)
            }
        }
    }
}

fn flip(op: CompareOp) -> CompareOp {
    match op {
        CompareOp::Eq => CompareOp::Eq,
        CompareOp::Ne => CompareOp::Ne,
        CompareOp::Lt => CompareOp::Gt,
        CompareOp::Le => CompareOp::Ge,
        CompareOp::Gt => CompareOp::Lt,
        CompareOp::Ge => CompareOp::Le,
    }
}

/// Could any value in `[min, max]` compare as requested against `v`?
fn range_may_match(op: CompareOp, min: &Value, max: &Value, v: &Value) -> bool {
    use std::cmp::Ordering;
    // Ranges over a different type family say nothing about the predicate.
    let comparable = |a: &Value| {
        a.is_number() && v.is_number() || std::mem::discriminant(a) == std::mem::discriminant(v)
    };
    if !comparable(min) || !comparable(max) {
        return true;
    }
    let lo = compare_total(min, v);
    let hi = compare_total(max, v);
    match op {
        CompareOp::Eq => lo != Ordering::Greater && hi != Ordering::Less,
        // Only a constant block can rule out inequality.
        CompareOp::Ne => !(lo == Ordering::Equal && hi == Ordering::Equal),
        CompareOp::Lt => lo == Ordering::Less,
        CompareOp::Le => lo != Ordering::Greater,
        CompareOp::Gt => hi == Ordering::Greater,
        CompareOp::Ge => hi != Ordering::Less,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlockInfo, BlockRange, FieldIndex, SparseIndex};
    use tern_expr::and;

    fn obj(path: &str, etag: &str) -> ObjectInfo {
        ObjectInfo {
            path: path.to_string(),
            etag: etag.to_string(),
            size: 1 << 20,
            last_modified: None,
        }
    }

    fn trailer_with_ranges(ranges: Vec<(i64, i64)>) -> Trailer {
        Trailer {
            block_shift: 10,
            blocks: vec![BlockInfo { chunks: 1 }; ranges.len()],
            sparse: SparseIndex {
                fields: vec![FieldIndex {
                    path: "x".to_string(),
                    ranges: ranges
                        .into_iter()
                        .map(|(lo, hi)| {
                            Some(BlockRange {
                                min: Value::Int(lo),
                                max: Value::Int(hi),
                            })
                        })
                        .collect(),
                    constant: None,
                }],
            },
        }
    }

    fn input_with_ranges() -> Input {
        let trailer = trailer_with_ranges(vec![(0, 9), (10, 19), (20, 29), (30, 39)]);
        Input::new(vec![Descriptor::whole(obj("t/a", "etag-a"), trailer)])
    }

    #[test]
    fn filter_prunes_by_range() {
        let input = input_with_ranges();
        let pred = Expr::compare(CompareOp::Ge, Expr::path("x"), Expr::integer(25));
        let got = input.filter(&pred);
        assert_eq!(got.descs.len(), 1);
        assert_eq!(got.descs[0].blocks, vec![2, 3]);

        // Conjunction narrows further.
        let both = and(
            pred,
            Expr::compare(CompareOp::Lt, Expr::path("x"), Expr::integer(30)),
        );
        let got = input.filter(&both);
        assert_eq!(got.descs[0].blocks, vec![2]);
    }

    #[test]
    fn trivial_filter_returns_receiver() {
        let input = input_with_ranges();
        let trivial = Expr::Is(Box::new(Expr::path("y")), tern_expr::IsOp::Missing);
        let got = input.filter(&trivial);
        assert_eq!(got, input);
        assert_eq!(got.block_count(), 4);
    }

    #[test]
    fn filter_drops_empty_descriptors() {
        let input = input_with_ranges();
        let never = Expr::compare(CompareOp::Gt, Expr::path("x"), Expr::integer(1000));
        let got = input.filter(&never);
        assert!(got.descs.is_empty());
        assert!(got.is_empty());
    }

    #[test]
    fn hash_split_is_stable_and_complete() {
        let t = trailer_with_ranges((0..32).map(|i| (i * 10, i * 10 + 9)).collect());
        let input = Input::new(vec![
            Descriptor::whole(obj("t/a", "etag-a"), t.clone()),
            Descriptor::whole(obj("t/b", "etag-b"), t),
        ]);
        let a = input.hash_split(4).unwrap();
        let b = input.hash_split(4).unwrap();
        assert_eq!(a, b);

        let total: usize = a
            .iter()
            .flatten()
            .map(|i| i.block_count())
            .sum();
        assert_eq!(total, input.block_count());

        // Every (object, block) pair lands in exactly one shard.
        let mut seen = std::collections::HashSet::new();
        for shard in a.iter().flatten() {
            for d in &shard.descs {
                for &blk in &d.blocks {
                    assert!(seen.insert((d.object.etag.clone(), blk)));
                }
            }
        }
    }

    #[test]
    fn hash_split_one_is_identity() {
        let input = input_with_ranges();
        let shards = input.hash_split(1).unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].as_ref().unwrap(), &input);
    }

    #[test]
    fn partition_by_constant() {
        let mk = |label: &str, etag: &str| {
            let mut t = trailer_with_ranges(vec![(0, 9)]);
            t.sparse.fields.push(FieldIndex {
                path: "region".to_string(),
                ranges: vec![None],
                constant: Some(Value::String(label.to_string())),
            });
            Descriptor::whole(obj(&format!("t/{etag}"), etag), t)
        };
        let input = Input::new(vec![mk("east", "e1"), mk("west", "w1"), mk("east", "e2")]);
        let part = input.partition(&["region".to_string()]).unwrap();
        assert_eq!(part.len(), 2);
        assert_eq!(part.fields(), &["region".to_string()]);
        let east = part
            .get(&[Value::String("east".to_string())])
            .unwrap();
        assert_eq!(east.descs.len(), 2);

        // Memoized: same fields give the same Arc.
        let again = input.partition(&["region".to_string()]).unwrap();
        assert!(Arc::ptr_eq(&part, &again));

        // A field without a constant fails.
        assert!(input.partition(&["x".to_string()]).is_err());
    }

    #[test]
    fn descriptor_merge() {
        let t = trailer_with_ranges(vec![(0, 9), (10, 19), (20, 29)]);
        let mut a = Descriptor {
            object: obj("t/a", "e"),
            trailer: t.clone(),
            blocks: vec![0, 2],
        };
        let b = Descriptor {
            object: obj("t/a", "e"),
            trailer: t.clone(),
            blocks: vec![1, 2],
        };
        a.merge_from(&b).unwrap();
        assert_eq!(a.blocks, vec![0, 1, 2]);

        let other = Descriptor {
            object: obj("t/b", "x"),
            trailer: t,
            blocks: vec![0],
        };
        assert!(a.merge_from(&other).is_err());
    }

    #[test]
    fn input_roundtrip_preserves_fields_discipline() {
        let mut input = input_with_ranges();
        input.fields = Some(vec![]);
        let got = Input::decode(&input.encode()).unwrap();
        assert_eq!(got.fields, Some(vec![]));

        input.fields = None;
        let got = Input::decode(&input.encode()).unwrap();
        assert_eq!(got.fields, None);

        input.fields = Some(vec!["Make".to_string()]);
        input.hint = Some(Expr::Is(
            Box::new(Expr::path("Make")),
            tern_expr::IsOp::Missing,
        ));
        let got = Input::decode(&input.encode()).unwrap();
        assert_eq!(got, input);
    }

    #[test]
    fn decode_validates_blocks() {
        let input = input_with_ranges();
        let mut v = input.encode();
        // Corrupt a block index beyond the trailer's block count.
        if let Value::Struct(fields) = &mut v {
            if let Value::List(descs) = &mut fields[0].1 {
                if let Value::Struct(dfields) = &mut descs[0] {
                    dfields[2].1 = Value::List(vec![Value::Uint(99)]);
                }
            }
        }
        assert!(Input::decode(&v).is_err());
    }
}
