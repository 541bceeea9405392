use tern_codec::Value;
use tern_error::Result;

use super::push_line;
use crate::tree::Node;

/// Marker operator carrying materialized replacement subtrees.
///
/// Never executed: it exists so that rendered plans and serialized fragments
/// can show where `SCALAR_REPLACEMENT(i)` values came from after the
/// executor detached the children from their node.
#[derive(Debug, Clone, PartialEq)]
pub struct Substitute {
    pub inner: Vec<Node>,
}

impl Substitute {
    pub fn new(inner: Vec<Node>) -> Substitute {
        Substitute { inner }
    }

    pub fn render(&self, indent: usize, buf: &mut String) {
        for (i, node) in self.inner.iter().enumerate() {
            push_line(buf, indent, &format!("SUBSTITUTE REPLACEMENT({i}) (",));
            node.render(indent + 1, buf);
            push_line(buf, indent, ")");
        }
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![(
            "inner".to_string(),
            Value::List(self.inner.iter().map(Node::encode).collect()),
        )]
    }

    pub fn decode_fields(v: &Value) -> Result<Substitute> {
        let mut inner = Vec::new();
        if let Value::List(items) = v.field("inner") {
            for item in items {
                inner.push(Node::decode(item)?);
            }
        }
        Ok(Substitute { inner })
    }
}
