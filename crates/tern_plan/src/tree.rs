//! The plan tree: deduplicated inputs plus a tree of operator chains.

use tern_codec::{decode_document, encode_document, Value};
use tern_error::{OptionExt, Result, TernError};
use tern_expr::types::{TypeHint, TypeSet};
use uuid::Uuid;

use crate::input::Input;
use crate::op::{push_line, Op};

/// One node: an operator chain, the input it scans, and child subtrees whose
/// scalar outputs substitute into this node's expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Index into the owning tree's inputs, or `None` when the chain has no
    /// table source.
    pub input: Option<usize>,
    pub op: Op,
    /// Child subtrees, materialized before this node runs; child `i` is
    /// referenced as `SCALAR_REPLACEMENT(i)`.
    pub children: Vec<Node>,
    /// Optional result schema.
    pub output_type: Option<Vec<TypeHint>>,
}

impl Node {
    pub fn new(input: Option<usize>, op: Op) -> Node {
        Node {
            input,
            op,
            children: Vec::new(),
            output_type: None,
        }
    }

    pub fn encode(&self) -> Value {
        let mut fields = vec![
            (
                "input".to_string(),
                Value::Int(self.input.map(|i| i as i64).unwrap_or(-1)),
            ),
            (
                "children".to_string(),
                Value::List(self.children.iter().map(Node::encode).collect()),
            ),
            ("op".to_string(), encode_chain(&self.op)),
        ];
        if let Some(ot) = &self.output_type {
            fields.push(("output_type".to_string(), encode_output_type(ot)));
        }
        Value::Struct(fields)
    }

    pub fn decode(v: &Value) -> Result<Node> {
        let input = match v.field("input").as_i64() {
            Some(i) if i >= 0 => Some(i as usize),
            _ => None,
        };
        let mut children = Vec::new();
        if let Value::List(items) = v.field("children") {
            for item in items {
                children.push(Node::decode(item)?);
            }
        }
        Ok(Node {
            input,
            op: decode_chain(v.field("op"))?,
            children,
            output_type: decode_output_type(v.field("output_type"))?,
        })
    }

    pub fn render(&self, indent: usize, buf: &mut String) {
        for (i, child) in self.children.iter().enumerate() {
            push_line(buf, indent, &format!("WITH REPLACEMENT({i}) AS ("));
            child.render(indent + 1, buf);
            push_line(buf, indent, ")");
        }
        self.op.render(self.input, indent, buf);
    }
}

/// A complete plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    /// Correlation id, carried across the wire.
    pub id: String,
    /// Deduplicated table inputs referenced by leaf chains.
    pub inputs: Vec<Input>,
    pub root: Node,
    /// Opaque datum forwarded to peers untouched.
    pub data: Option<Value>,
}

impl Tree {
    pub fn new(inputs: Vec<Input>, root: Node) -> Tree {
        Tree {
            id: Uuid::new_v4().to_string(),
            inputs,
            root,
            data: None,
        }
    }

    /// Serialize per the wire shape: the root node's fields hoisted into the
    /// top-level struct next to `inputs`, `id`, and `data`.
    pub fn to_value(&self) -> Value {
        let mut fields = vec![("id".to_string(), Value::String(self.id.clone()))];
        if let Some(data) = &self.data {
            fields.push(("data".to_string(), data.clone()));
        }
        fields.push((
            "inputs".to_string(),
            Value::List(self.inputs.iter().map(Input::encode).collect()),
        ));
        if let Value::Struct(node_fields) = self.root.encode() {
            fields.extend(node_fields);
        }
        Value::Struct(fields)
    }

    pub fn from_value(v: &Value) -> Result<Tree> {
        let id = v.field("id").as_str().required("id")?.to_string();
        let data = match v.field("data") {
            Value::Missing => None,
            other => Some(other.clone()),
        };
        let mut inputs = Vec::new();
        if let Value::List(items) = v.field("inputs") {
            for item in items {
                inputs.push(Input::decode(item)?);
            }
        }
        let root = Node::decode(v)?;
        let tree = Tree {
            id,
            inputs,
            root,
            data,
        };
        tree.validate()?;
        Ok(tree)
    }

    /// Serialize as a self-describing document: symbol table then plan
    /// struct.
    pub fn encode(&self) -> Vec<u8> {
        encode_document(&self.to_value())
    }

    pub fn decode(buf: &[u8]) -> Result<Tree> {
        let (v, _) = decode_document(buf)?;
        Tree::from_value(&v)
    }

    /// Every leaf index must resolve against `inputs`.
    fn validate(&self) -> Result<()> {
        fn check(node: &Node, inputs: usize) -> Result<()> {
            if let Some(i) = node.input {
                if i >= inputs {
                    return Err(TernError::new(format!(
                        "node references input {i} of {inputs}"
                    )));
                }
            }
            for child in &node.children {
                check(child, inputs)?;
            }
            Ok(())
        }
        check(&self.root, self.inputs.len())
    }

    /// Total number of distinct table inputs the plan scans.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }
}

impl std::fmt::Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf = String::new();
        self.root.render(0, &mut buf);
        f.write_str(&buf)
    }
}

fn encode_chain(op: &Op) -> Value {
    // Predecessor-first list.
    let mut chain = Vec::new();
    fn collect<'a>(op: &'a Op, out: &mut Vec<&'a Op>) {
        if let Some(from) = op.from_op() {
            collect(from, out);
        }
        out.push(op);
    }
    let mut ops = Vec::new();
    collect(op, &mut ops);
    for op in ops {
        chain.push(op.encode());
    }
    Value::List(chain)
}

fn decode_chain(v: &Value) -> Result<Op> {
    let items = match v {
        Value::List(items) if !items.is_empty() => items,
        _ => return Err(TernError::new("empty operator chain")),
    };
    let mut op: Option<Op> = None;
    for item in items {
        op = Some(Op::decode_onto(item, op)?);
    }
    op.required("op")
}

fn encode_output_type(hints: &[TypeHint]) -> Value {
    Value::List(
        hints
            .iter()
            .map(|h| {
                Value::struct_of([
                    ("field", Value::String(h.field.clone())),
                    ("types", Value::Uint(u64::from(h.types.0))),
                ])
            })
            .collect(),
    )
}

fn decode_output_type(v: &Value) -> Result<Option<Vec<TypeHint>>> {
    let items = match v {
        Value::List(items) => items,
        _ => return Ok(None),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(TypeHint {
            field: item.field("field").as_str().required("field")?.to_string(),
            types: TypeSet(item.field("types").as_i64().unwrap_or(0) as u16),
        });
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Filter, Leaf, Limit};
    use tern_expr::{Expr, IsOp};

    fn sample_tree() -> Tree {
        let chain = Op::Limit(Limit::new(
            Op::Filter(Filter::new(
                Op::Leaf(Leaf::new()),
                Expr::Is(Box::new(Expr::path("Make")), IsOp::Missing),
            )),
            10,
        ));
        Tree::new(vec![Input::default()], Node::new(Some(0), chain))
    }

    #[test]
    fn tree_roundtrip() {
        let tree = sample_tree();
        let bytes = tree.encode();
        let got = Tree::decode(&bytes).unwrap();
        assert_eq!(got, tree);
        assert_eq!(got.to_string(), tree.to_string());
    }

    #[test]
    fn tree_renders_chain_in_execution_order() {
        let tree = sample_tree();
        let text = tree.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec!["ITERATE INPUT(0)", "FILTER Make IS MISSING", "LIMIT 10"]
        );
    }

    #[test]
    fn decode_rejects_bad_input_index() {
        let mut tree = sample_tree();
        tree.root.input = Some(3);
        let bytes = tree.encode();
        assert!(Tree::decode(&bytes).is_err());
    }

    #[test]
    fn every_operator_roundtrips() {
        use crate::op::*;
        use crate::transport::Geometry;
        use tern_expr::{AggBinding, AggOp, Aggregate, Binding, CompareOp, OrderPart};

        let mut chain = Op::Leaf(Leaf::new());
        chain = Op::Filter(Filter::new(
            chain,
            Expr::compare(CompareOp::Ge, Expr::path("x"), Expr::integer(3)),
        ));
        chain = Op::Project(Project::new(
            chain,
            vec![Binding::new(Expr::path("x"), "x")],
        ));
        chain = Op::Apply(Apply::new(
            chain,
            vec![Binding::new(
                Expr::Concat(Box::new(Expr::path("x")), Box::new(Expr::string("!"))),
                "xs",
            )],
        ));
        chain = Op::Unnest(Unnest::new(chain, Expr::path("tags"), "tag"));
        chain = Op::SimpleAggregate(SimpleAggregate::new(
            chain,
            vec![AggBinding::new(
                Aggregate::new(AggOp::Sum, Expr::path("x")),
                "sum",
            )],
        ));
        chain = Op::UnionMap(UnionMap::new(chain, Geometry::local(2, Some(3))));
        let mut hash = HashAggregate::new(
            chain,
            vec![AggBinding::new(
                Aggregate::new(AggOp::SumCount, Expr::path("sum")),
                "sum",
            )],
            vec![Binding::new(Expr::path("g"), "g")],
        );
        hash.order = vec![AggOrder {
            index: 1,
            desc: true,
            nulls_last: true,
        }];
        hash.limit = Some(9);
        chain = Op::HashAggregate(hash);
        chain = Op::UnionPartition(UnionPartition::new(chain, vec!["g".to_string()]));
        let mut distinct = Distinct::new(chain, vec![Expr::path("g")]);
        distinct.limit = Some(12);
        chain = Op::Distinct(distinct);
        let mut order = OrderBy::new(
            chain,
            vec![OrderPart {
                expr: Expr::path("g"),
                desc: false,
                nulls_last: true,
            }],
        );
        order.limit = Some(5);
        order.offset = 2;
        chain = Op::OrderBy(order);
        chain = Op::CountStar(CountStar::new(chain, "count"));
        chain = Op::Limit(Limit::new(chain, 4));
        chain = Op::OutputPart(OutputPart::new(chain, "part", "db/out"));
        chain = Op::OutputIndex(OutputIndex::new(chain, "t", "idx", "db/out", [7u8; 32]));

        let tree = Tree::new(vec![Input::default()], Node::new(Some(0), chain));
        let got = Tree::decode(&tree.encode()).unwrap();
        assert_eq!(got, tree);
        assert_eq!(got.to_string(), tree.to_string());

        for terminal in [
            Op::NoOutput(NoOutput),
            Op::DummyOutput(DummyOutput),
            Op::Substitute(Substitute::new(vec![Node::new(
                Some(0),
                Op::Leaf(Leaf::new()),
            )])),
        ] {
            let tree = Tree::new(vec![Input::default()], Node::new(None, terminal));
            let got = Tree::decode(&tree.encode()).unwrap();
            assert_eq!(got, tree);
        }

        let explained = Explain::plan(tree, ExplainFormat::List, "SELECT 1");
        let got = Tree::decode(&explained.encode()).unwrap();
        assert_eq!(got, explained);
    }

    #[test]
    fn children_render_as_replacements() {
        let mut tree = sample_tree();
        let child = Node::new(
            Some(0),
            Op::CountStar(crate::op::CountStar::new(Op::Leaf(Leaf::new()), "count")),
        );
        tree.root.children.push(child);
        let text = tree.to_string();
        assert!(text.starts_with("WITH REPLACEMENT(0) AS (\n"));
        assert!(text.contains("  COUNT(*) AS count\n"));
    }
}
