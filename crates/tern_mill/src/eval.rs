//! Row-at-a-time expression evaluation with PartiQL semantics.

use std::cmp::Ordering;

use tern_codec::{compare_total, Value};
use tern_error::{Result, TernError};
use tern_expr::{ArithOp, CompareOp, Expr, IsOp, LogicalOp, PathStep};

/// Three-valued truthiness: only booleans decide; anything else is unknown.
pub fn truthy(v: &Value) -> Option<bool> {
    v.as_bool()
}

/// Evaluate a predicate; rows pass only when the result is TRUE.
pub fn eval_filter(e: &Expr, row: &Value) -> Result<bool> {
    Ok(truthy(&eval(e, row)?) == Some(true))
}

pub fn eval(e: &Expr, row: &Value) -> Result<Value> {
    Ok(match e {
        Expr::Const(v) => v.clone(),
        Expr::Path(p) => {
            let mut cur = row.field(&p.first).clone();
            for step in &p.rest {
                cur = match (&cur, step) {
                    (Value::Struct(_), PathStep::Field(name)) => cur.field(name).clone(),
                    (Value::List(items), PathStep::Index(i)) => {
                        items.get(*i).cloned().unwrap_or(Value::Missing)
                    }
                    _ => Value::Missing,
                };
            }
            cur
        }
        Expr::Compare(op, l, r) => {
            let lv = eval(l, row)?;
            let rv = eval(r, row)?;
            compare_values(*op, &lv, &rv)
        }
        Expr::Arith(op, l, r) => {
            let lv = eval(l, row)?;
            let rv = eval(r, row)?;
            arith(*op, &lv, &rv)
        }
        Expr::Logical(op, l, r) => {
            let lv = truthy(&eval(l, row)?);
            let rv = truthy(&eval(r, row)?);
            kleene(*op, lv, rv)
        }
        Expr::Not(inner) => match truthy(&eval(inner, row)?) {
            Some(b) => Value::Bool(!b),
            None => Value::Null,
        },
        Expr::Is(inner, op) => {
            let v = eval(inner, row)?;
            let out = match op {
                IsOp::Missing => v.is_missing(),
                IsOp::NotMissing => !v.is_missing(),
                // MISSING IS NULL is TRUE, per PartiQL.
                IsOp::Null => v.is_null() || v.is_missing(),
                IsOp::NotNull => !(v.is_null() || v.is_missing()),
            };
            Value::Bool(out)
        }
        Expr::Concat(l, r) => {
            let lv = eval(l, row)?;
            let rv = eval(r, row)?;
            match (&lv, &rv) {
                (Value::String(a), Value::String(b)) => {
                    let mut s = String::with_capacity(a.len() + b.len());
                    s.push_str(a);
                    s.push_str(b);
                    Value::String(s)
                }
                (Value::Null, _) | (_, Value::Null) => Value::Null,
                _ => Value::Missing,
            }
        }
        Expr::Case(case) => {
            for (when, then) in &case.limbs {
                if truthy(&eval(when, row)?) == Some(true) {
                    return eval(then, row);
                }
            }
            match &case.default {
                Some(def) => eval(def, row)?,
                None => Value::Null,
            }
        }
        Expr::Call(func, args) => {
            let mut vals = Vec::with_capacity(args.len());
            for arg in args {
                vals.push(eval(arg, row)?);
            }
            call(*func, &vals)
        }
        Expr::Star => return Err(TernError::new("cannot evaluate * outside COUNT(*)")),
        Expr::Aggregate(agg) => {
            return Err(TernError::new(format!(
                "aggregate {} evaluated outside an aggregation",
                agg.op.name()
            )))
        }
        Expr::ScalarReplacement(i) => {
            return Err(TernError::new(format!(
                "unresolved SCALAR_REPLACEMENT({i})"
            )))
        }
        Expr::PartitionValue(i) => {
            return Err(TernError::new(format!("unresolved PARTITION_VALUE({i})")))
        }
    })
}

fn compare_values(op: CompareOp, l: &Value, r: &Value) -> Value {
    if l.is_missing() || r.is_missing() {
        return Value::Missing;
    }
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    let comparable = l.is_number() && r.is_number()
        || std::mem::discriminant(l) == std::mem::discriminant(r);
    if !comparable {
        return Value::Missing;
    }
    let ord = compare_total(l, r);
    let out = match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    };
    Value::Bool(out)
}

fn arith(op: ArithOp, l: &Value, r: &Value) -> Value {
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    if !l.is_number() || !r.is_number() {
        return Value::Missing;
    }
    // Exact integer arithmetic when both sides are integers and the result
    // fits; otherwise fall through to floats.
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        match op {
            ArithOp::Add => {
                if let Some(v) = a.checked_add(b) {
                    return Value::Int(v);
                }
            }
            ArithOp::Sub => {
                if let Some(v) = a.checked_sub(b) {
                    return Value::Int(v);
                }
            }
            ArithOp::Mul => {
                if let Some(v) = a.checked_mul(b) {
                    return Value::Int(v);
                }
            }
            ArithOp::Mod => {
                if b != 0 {
                    return Value::Int(a % b);
                }
                return Value::Null;
            }
            // Division always produces a float.
            ArithOp::Div => {}
        }
    }
    let a = match l.as_f64() {
        Some(v) => v,
        None => return Value::Missing,
    };
    let b = match r.as_f64() {
        Some(v) => v,
        None => return Value::Missing,
    };
    let out = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => {
            if b == 0.0 {
                return Value::Null;
            }
            a / b
        }
        ArithOp::Mod => {
            if b == 0.0 {
                return Value::Null;
            }
            a % b
        }
    };
    Value::Float(out)
}

fn call(func: tern_expr::Builtin, args: &[Value]) -> Value {
    match func {
        tern_expr::Builtin::Sqrt => {
            let v = match args.first() {
                Some(v) => v,
                None => return Value::Missing,
            };
            if v.is_null() {
                return Value::Null;
            }
            match v.as_f64() {
                Some(f) if f >= 0.0 => Value::Float(f.sqrt()),
                Some(_) => Value::Null,
                None => Value::Missing,
            }
        }
    }
}

fn kleene(op: LogicalOp, l: Option<bool>, r: Option<bool>) -> Value {
    let out = match op {
        LogicalOp::And => match (l, r) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        LogicalOp::Or => match (l, r) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
    };
    match out {
        Some(b) => Value::Bool(b),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_expr::and;

    fn row() -> Value {
        Value::struct_of([
            ("a", Value::Int(3)),
            ("b", Value::Null),
            ("s", Value::String("hi".to_string())),
            (
                "nested",
                Value::struct_of([("x", Value::List(vec![Value::Int(7)]))]),
            ),
        ])
    }

    #[test]
    fn path_traversal() {
        let e = Expr::Path(tern_expr::Path {
            first: "nested".to_string(),
            rest: vec![PathStep::Field("x".to_string()), PathStep::Index(0)],
        });
        assert_eq!(eval(&e, &row()).unwrap(), Value::Int(7));
    }

    #[test]
    fn missing_propagates_through_compare() {
        let e = Expr::compare(CompareOp::Eq, Expr::path("nope"), Expr::integer(1));
        assert_eq!(eval(&e, &row()).unwrap(), Value::Missing);
        assert!(!eval_filter(&e, &row()).unwrap());
    }

    #[test]
    fn null_compare_is_unknown_but_is_null_is_true() {
        let cmp = Expr::compare(CompareOp::Eq, Expr::path("b"), Expr::integer(1));
        assert_eq!(eval(&cmp, &row()).unwrap(), Value::Null);
        let is = Expr::Is(Box::new(Expr::path("b")), IsOp::Null);
        assert_eq!(eval(&is, &row()).unwrap(), Value::Bool(true));
        let miss = Expr::Is(Box::new(Expr::path("zzz")), IsOp::Null);
        assert_eq!(eval(&miss, &row()).unwrap(), Value::Bool(true));
    }

    #[test]
    fn kleene_and() {
        // FALSE AND NULL is FALSE, TRUE AND NULL is NULL.
        let false_and_null = and(
            Expr::boolean(false),
            Expr::compare(CompareOp::Eq, Expr::path("b"), Expr::integer(1)),
        );
        assert_eq!(eval(&false_and_null, &row()).unwrap(), Value::Bool(false));
        let true_and_null = and(
            Expr::boolean(true),
            Expr::compare(CompareOp::Eq, Expr::path("b"), Expr::integer(1)),
        );
        assert_eq!(eval(&true_and_null, &row()).unwrap(), Value::Null);
    }

    #[test]
    fn integer_arith_stays_exact() {
        let e = Expr::Arith(
            ArithOp::Mul,
            Box::new(Expr::path("a")),
            Box::new(Expr::integer(2)),
        );
        assert_eq!(eval(&e, &row()).unwrap(), Value::Int(6));
        let div = Expr::Arith(
            ArithOp::Div,
            Box::new(Expr::path("a")),
            Box::new(Expr::integer(2)),
        );
        assert_eq!(eval(&div, &row()).unwrap(), Value::Float(1.5));
    }

    #[test]
    fn concat_strings() {
        let e = Expr::Concat(Box::new(Expr::path("s")), Box::new(Expr::string("!")));
        assert_eq!(
            eval(&e, &row()).unwrap(),
            Value::String("hi!".to_string())
        );
        let bad = Expr::Concat(Box::new(Expr::path("a")), Box::new(Expr::string("!")));
        assert_eq!(eval(&bad, &row()).unwrap(), Value::Missing);
    }
}
