use tern_codec::Value;
use tern_error::{OptionExt, Result, TernError};
use tern_mill::QuerySink;

use super::{push_line, Wrapped};
use crate::tree::Tree;

/// Plan rendering formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainFormat {
    /// Indented tree, one operator per line.
    Text,
    /// Flat list of operator descriptions.
    List,
}

impl ExplainFormat {
    fn name(&self) -> &'static str {
        match self {
            ExplainFormat::Text => "text",
            ExplainFormat::List => "list",
        }
    }

    fn from_name(name: &str) -> Result<ExplainFormat> {
        Ok(match name {
            "text" => ExplainFormat::Text,
            "list" => ExplainFormat::List,
            other => return Err(TernError::new(format!("unknown explain format {other:?}"))),
        })
    }
}

/// Terminal operator that renders the enclosing plan instead of running it.
#[derive(Debug, Clone, PartialEq)]
pub struct Explain {
    pub format: ExplainFormat,
    /// Original query text, echoed in the output.
    pub query: String,
    pub tree: Box<Tree>,
}

impl Explain {
    /// Wrap a finished plan into one that explains itself.
    pub fn plan(tree: Tree, format: ExplainFormat, query: impl Into<String>) -> Tree {
        let inputs = tree.inputs.clone();
        let explain = Explain {
            format,
            query: query.into(),
            tree: Box::new(tree),
        };
        Tree::new(
            inputs,
            crate::tree::Node::new(None, super::Op::Explain(explain)),
        )
    }

    pub fn wrap(&self, dst: Box<dyn QuerySink>) -> Result<Wrapped> {
        let rendered = self.render_plan();
        Ok(Wrapped::Extra {
            sink: Box::new(ExplainSink {
                rows: rendered
                    .lines()
                    .map(|line| Value::struct_of([("plan", Value::String(line.to_string()))]))
                    .collect(),
                down: dst,
            }),
        })
    }

    fn render_plan(&self) -> String {
        match self.format {
            ExplainFormat::Text => self.tree.to_string(),
            ExplainFormat::List => {
                let text = self.tree.to_string();
                // Flatten: strip indentation and structural parentheses.
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && *l != ")")
                    .map(|l| l.trim_end_matches(" ("))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
    }

    pub fn render(&self, indent: usize, buf: &mut String) {
        push_line(
            buf,
            indent,
            &format!("EXPLAIN {} {:?} (", self.format.name(), self.query),
        );
        let mut inner = String::new();
        self.tree.root.render(indent + 1, &mut inner);
        buf.push_str(&inner);
        push_line(buf, indent, ")");
    }

    pub fn encode_fields(&self) -> Vec<(String, Value)> {
        vec![
            (
                "format".to_string(),
                Value::String(self.format.name().to_string()),
            ),
            ("query".to_string(), Value::String(self.query.clone())),
            ("tree".to_string(), self.tree.to_value()),
        ]
    }

    pub fn decode_fields(v: &Value) -> Result<Explain> {
        Ok(Explain {
            format: ExplainFormat::from_name(v.field("format").as_str().required("format")?)?,
            query: v.field("query").as_str().required("query")?.to_string(),
            tree: Box::new(Tree::from_value(v.field("tree"))?),
        })
    }
}

struct ExplainSink {
    rows: Vec<Value>,
    down: Box<dyn QuerySink>,
}

impl QuerySink for ExplainSink {
    fn open(&self) -> Result<Box<dyn tern_mill::RowSink>> {
        self.down.open()
    }

    fn close(&self) -> Result<()> {
        let mut w = self.down.open()?;
        match w.write_rows(self.rows.clone()) {
            Ok(()) => {}
            Err(err) if err.is_eof() => {}
            Err(err) => return Err(err),
        }
        w.close()?;
        self.down.close()
    }
}
