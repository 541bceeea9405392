//! Expression serialization as self-describing values.
//!
//! Expressions embed into plan records as tagged structs, the same shape the
//! operators themselves use: a `"type"` field picks the variant, the
//! remaining fields carry the operands.

use tern_codec::Value;
use tern_error::{OptionExt, Result, TernError};

use crate::{
    AggOp, Aggregate, ArithOp, Builtin, Case, CompareOp, Expr, IsOp, LogicalOp, Path, PathStep,
};

pub fn encode_expr(e: &Expr) -> Value {
    match e {
        Expr::Const(v) => tagged("const", vec![("value".to_string(), v.clone())]),
        Expr::Star => tagged("star", vec![]),
        Expr::Path(p) => {
            let rest = p
                .rest
                .iter()
                .map(|step| match step {
                    PathStep::Field(name) => Value::String(name.clone()),
                    PathStep::Index(i) => Value::Uint(*i as u64),
                })
                .collect();
            tagged(
                "path",
                vec![
                    ("first".to_string(), Value::String(p.first.clone())),
                    ("rest".to_string(), Value::List(rest)),
                ],
            )
        }
        Expr::Compare(op, l, r) => binop("cmp", op.symbol_name(), l, r),
        Expr::Arith(op, l, r) => binop("arith", op.symbol_name(), l, r),
        Expr::Logical(op, l, r) => binop(
            "logical",
            match op {
                LogicalOp::And => "AND",
                LogicalOp::Or => "OR",
            },
            l,
            r,
        ),
        Expr::Not(inner) => tagged("not", vec![("expr".to_string(), encode_expr(inner))]),
        Expr::Is(inner, op) => tagged(
            "is",
            vec![
                ("expr".to_string(), encode_expr(inner)),
                ("op".to_string(), Value::String(op.name().to_string())),
            ],
        ),
        Expr::Concat(l, r) => tagged(
            "concat",
            vec![
                ("left".to_string(), encode_expr(l)),
                ("right".to_string(), encode_expr(r)),
            ],
        ),
        Expr::Case(case) => {
            let limbs = case
                .limbs
                .iter()
                .map(|(when, then)| Value::List(vec![encode_expr(when), encode_expr(then)]))
                .collect();
            let mut fields = vec![("limbs".to_string(), Value::List(limbs))];
            if let Some(def) = &case.default {
                fields.push(("else".to_string(), encode_expr(def)));
            }
            tagged("case", fields)
        }
        Expr::Call(func, args) => tagged(
            "call",
            vec![
                ("fn".to_string(), Value::String(func.name().to_string())),
                (
                    "args".to_string(),
                    Value::List(args.iter().map(encode_expr).collect()),
                ),
            ],
        ),
        Expr::Aggregate(agg) => {
            let mut fields = vec![
                ("op".to_string(), Value::String(agg.op.name().to_string())),
                ("inner".to_string(), encode_expr(&agg.inner)),
            ];
            if let Some(filter) = &agg.filter {
                fields.push(("filter".to_string(), encode_expr(filter)));
            }
            tagged("agg", fields)
        }
        Expr::ScalarReplacement(i) => tagged(
            "scalar_replacement",
            vec![("index".to_string(), Value::Uint(*i as u64))],
        ),
        Expr::PartitionValue(i) => tagged(
            "partition_value",
            vec![("index".to_string(), Value::Uint(*i as u64))],
        ),
    }
}

pub fn decode_expr(v: &Value) -> Result<Expr> {
    let ty = v
        .field("type")
        .as_str()
        .required("type")?
        .to_string();
    Ok(match ty.as_str() {
        "const" => Expr::Const(v.field("value").clone()),
        "star" => Expr::Star,
        "path" => {
            let first = v.field("first").as_str().required("first")?.to_string();
            let mut rest = Vec::new();
            if let Value::List(items) = v.field("rest") {
                for item in items {
                    rest.push(match item {
                        Value::String(name) => PathStep::Field(name.clone()),
                        Value::Uint(i) => PathStep::Index(*i as usize),
                        other => {
                            return Err(TernError::new(format!(
                                "bad path step: {other}"
                            )))
                        }
                    });
                }
            }
            Expr::Path(Path { first, rest })
        }
        "cmp" => {
            let (op, l, r) = decode_binop(v)?;
            Expr::Compare(CompareOp::from_symbol_name(&op)?, Box::new(l), Box::new(r))
        }
        "arith" => {
            let (op, l, r) = decode_binop(v)?;
            Expr::Arith(ArithOp::from_symbol_name(&op)?, Box::new(l), Box::new(r))
        }
        "logical" => {
            let (op, l, r) = decode_binop(v)?;
            let op = match op.as_str() {
                "AND" => LogicalOp::And,
                "OR" => LogicalOp::Or,
                other => return Err(TernError::new(format!("bad logical op {other:?}"))),
            };
            Expr::Logical(op, Box::new(l), Box::new(r))
        }
        "not" => Expr::Not(Box::new(decode_expr(v.field("expr"))?)),
        "is" => {
            let inner = decode_expr(v.field("expr"))?;
            let op = IsOp::from_name(v.field("op").as_str().required("op")?)?;
            Expr::Is(Box::new(inner), op)
        }
        "concat" => Expr::Concat(
            Box::new(decode_expr(v.field("left"))?),
            Box::new(decode_expr(v.field("right"))?),
        ),
        "case" => {
            let mut limbs = Vec::new();
            if let Value::List(items) = v.field("limbs") {
                for item in items {
                    match item {
                        Value::List(pair) if pair.len() == 2 => {
                            limbs.push((decode_expr(&pair[0])?, decode_expr(&pair[1])?));
                        }
                        other => {
                            return Err(TernError::new(format!("bad case limb: {other}")))
                        }
                    }
                }
            }
            let default = match v.field("else") {
                Value::Missing => None,
                other => Some(Box::new(decode_expr(other)?)),
            };
            Expr::Case(Case { limbs, default })
        }
        "call" => {
            let name = v.field("fn").as_str().required("fn")?;
            let func = Builtin::from_name(name)
                .ok_or_else(|| TernError::new(format!("unknown builtin {name:?}")))?;
            let mut args = Vec::new();
            if let Value::List(items) = v.field("args") {
                for item in items {
                    args.push(decode_expr(item)?);
                }
            }
            Expr::Call(func, args)
        }
        "agg" => {
            let name = v.field("op").as_str().required("op")?;
            let op = AggOp::from_name(name)
                .ok_or_else(|| TernError::new(format!("unknown aggregate {name:?}")))?;
            let inner = decode_expr(v.field("inner"))?;
            let filter = match v.field("filter") {
                Value::Missing => None,
                other => Some(Box::new(decode_expr(other)?)),
            };
            Expr::Aggregate(Aggregate {
                op,
                inner: Box::new(inner),
                filter,
            })
        }
        "scalar_replacement" => {
            Expr::ScalarReplacement(v.field("index").as_i64().required("index")? as usize)
        }
        "partition_value" => {
            Expr::PartitionValue(v.field("index").as_i64().required("index")? as usize)
        }
        other => return Err(TernError::new(format!("unknown expression type {other:?}"))),
    })
}

fn tagged(ty: &str, mut fields: Vec<(String, Value)>) -> Value {
    let mut all = vec![("type".to_string(), Value::String(ty.to_string()))];
    all.append(&mut fields);
    Value::Struct(all)
}

fn binop(ty: &str, op: &str, l: &Expr, r: &Expr) -> Value {
    tagged(
        ty,
        vec![
            ("op".to_string(), Value::String(op.to_string())),
            ("left".to_string(), encode_expr(l)),
            ("right".to_string(), encode_expr(r)),
        ],
    )
}

fn decode_binop(v: &Value) -> Result<(String, Expr, Expr)> {
    let op = v.field("op").as_str().required("op")?.to_string();
    let l = decode_expr(v.field("left"))?;
    let r = decode_expr(v.field("right"))?;
    Ok((op, l, r))
}

impl CompareOp {
    fn symbol_name(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn from_symbol_name(s: &str) -> Result<CompareOp> {
        Ok(match s {
            "=" => CompareOp::Eq,
            "<>" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            other => return Err(TernError::new(format!("bad comparison op {other:?}"))),
        })
    }
}

impl ArithOp {
    fn symbol_name(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }

    fn from_symbol_name(s: &str) -> Result<ArithOp> {
        Ok(match s {
            "+" => ArithOp::Add,
            "-" => ArithOp::Sub,
            "*" => ArithOp::Mul,
            "/" => ArithOp::Div,
            "%" => ArithOp::Mod,
            other => return Err(TernError::new(format!("bad arithmetic op {other:?}"))),
        })
    }
}

impl IsOp {
    fn name(&self) -> &'static str {
        match self {
            IsOp::Null => "NULL",
            IsOp::NotNull => "NOT_NULL",
            IsOp::Missing => "MISSING",
            IsOp::NotMissing => "NOT_MISSING",
        }
    }

    fn from_name(s: &str) -> Result<IsOp> {
        Ok(match s {
            "NULL" => IsOp::Null,
            "NOT_NULL" => IsOp::NotNull,
            "MISSING" => IsOp::Missing,
            "NOT_MISSING" => IsOp::NotMissing,
            other => return Err(TernError::new(format!("bad IS op {other:?}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::and;

    fn roundtrip(e: &Expr) {
        let v = encode_expr(e);
        let got = decode_expr(&v).unwrap();
        assert_eq!(e, &got);
    }

    #[test]
    fn expr_roundtrips() {
        roundtrip(&Expr::Star);
        roundtrip(&Expr::integer(-12));
        roundtrip(&Expr::string("hello"));
        roundtrip(&Expr::Path(Path {
            first: "a".to_string(),
            rest: vec![PathStep::Field("b".to_string()), PathStep::Index(3)],
        }));
        roundtrip(&and(
            Expr::Is(Box::new(Expr::path("Make")), IsOp::Missing),
            Expr::compare(CompareOp::Ge, Expr::path("Ticket"), Expr::integer(100)),
        ));
        roundtrip(&Expr::Aggregate(
            Aggregate::new(AggOp::Avg, Expr::path("fare_amount"))
                .with_filter(Expr::boolean(true)),
        ));
        roundtrip(&Expr::Case(Case {
            limbs: vec![(
                Expr::compare(CompareOp::Eq, Expr::path("c"), Expr::integer(0)),
                Expr::Const(Value::Null),
            )],
            default: Some(Box::new(Expr::Arith(
                ArithOp::Div,
                Box::new(Expr::path("s")),
                Box::new(Expr::path("c")),
            ))),
        }));
        roundtrip(&Expr::ScalarReplacement(2));
        roundtrip(&Expr::PartitionValue(0));
    }

    #[test]
    fn null_const_roundtrips() {
        roundtrip(&Expr::Const(Value::Null));
    }
}
