use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::primitives::{write_varint, write_varuint};

/// An owned, dynamically typed datum.
///
/// `Missing` is distinct from `Null`: a missing value is the absence of a
/// struct field, while null is a present field with no value. The distinction
/// matters for `IS MISSING` predicates and for three-valued logic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Missing,
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Field order is preserved; duplicate names are not rejected here.
    Struct(Vec<(String, Value)>),
}

impl Value {
    pub fn struct_of<I, S>(fields: I) -> Value
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Value::Struct(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// First struct field with the given name, or `Missing`.
    pub fn field(&self, name: &str) -> &Value {
        match self {
            Value::Struct(fields) => fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v)
                .unwrap_or(&Value::Missing),
            _ => &Value::Missing,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Uint(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Uint(_) | Value::Float(_))
    }

    /// Rank used to order values of different types relative to each other.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Missing => 0,
            Value::Null => 1,
            Value::Bool(_) => 2,
            Value::Int(_) | Value::Uint(_) | Value::Float(_) => 3,
            Value::Timestamp(_) => 4,
            Value::String(_) => 5,
            Value::Bytes(_) => 6,
            Value::List(_) => 7,
            Value::Struct(_) => 8,
        }
    }
}

/// Total order over values: type rank first, then value.
///
/// Numbers compare across their representations, so `Int(2) == Uint(2)` for
/// ordering purposes. NaN sorts after every other float.
pub fn compare_total(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (a.type_rank(), b.type_rank());
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Missing, Value::Missing) | (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::List(x), Value::List(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = compare_total(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Struct(x), Value::Struct(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk).then_with(|| compare_total(xv, yv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => compare_numbers(a, b),
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    // Exact integer comparison when neither side is a float.
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => return x.cmp(y),
        (Value::Uint(x), Value::Uint(y)) => return x.cmp(y),
        (Value::Int(x), Value::Uint(y)) => {
            if *x < 0 {
                return Ordering::Less;
            }
            return (*x as u64).cmp(y);
        }
        (Value::Uint(x), Value::Int(y)) => {
            if *y < 0 {
                return Ordering::Greater;
            }
            return x.cmp(&(*y as u64));
        }
        _ => {}
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.partial_cmp(&y).unwrap_or_else(|| {
        // NaN sorts last.
        match (x.is_nan(), y.is_nan()) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => Ordering::Equal,
        }
    })
}

/// Canonical symbol-free encoding of a tuple of values.
///
/// Two tuples encode identically iff they are identical value-for-value, so
/// the result can be used directly as a grouping or partitioning key.
pub fn encode_key(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    for v in values {
        encode_key_value(&mut buf, v);
    }
    buf
}

fn encode_key_value(buf: &mut Vec<u8>, v: &Value) {
    match v {
        Value::Missing => buf.push(0x00),
        Value::Null => buf.push(0x01),
        Value::Bool(b) => {
            buf.push(0x02);
            buf.push(u8::from(*b));
        }
        Value::Int(i) => {
            buf.push(0x03);
            write_varint(buf, *i);
        }
        Value::Uint(u) => {
            buf.push(0x04);
            write_varuint(buf, *u);
        }
        Value::Float(f) => {
            buf.push(0x05);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::Timestamp(ts) => {
            buf.push(0x06);
            write_varint(buf, ts.timestamp_micros());
        }
        Value::String(s) => {
            buf.push(0x07);
            write_varuint(buf, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(0x08);
            write_varuint(buf, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::List(items) => {
            buf.push(0x09);
            write_varuint(buf, items.len() as u64);
            for item in items {
                encode_key_value(buf, item);
            }
        }
        Value::Struct(fields) => {
            buf.push(0x0A);
            write_varuint(buf, fields.len() as u64);
            for (k, v) in fields {
                write_varuint(buf, k.len() as u64);
                buf.extend_from_slice(k.as_bytes());
                encode_key_value(buf, v);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => write!(f, "MISSING"),
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Timestamp(ts) => write!(f, "`{}`", ts.to_rfc3339()),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "{{{{blob len={}}}}}", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}
