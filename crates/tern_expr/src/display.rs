//! PartiQL-flavored rendering of expressions.

use std::fmt;

use tern_codec::Value;

use crate::{
    AggBinding, Aggregate, ArithOp, Binding, Case, CompareOp, Expr, IsOp, LogicalOp, OrderPart,
    Path, PathStep,
};

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.first)?;
        for step in &self.rest {
            match step {
                PathStep::Field(name) => write!(f, ".{name}")?,
                PathStep::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

impl ArithOp {
    fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

fn write_const(f: &mut fmt::Formatter<'_>, v: &Value) -> fmt::Result {
    match v {
        Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
        other => write!(f, "{other}"),
    }
}

/// Write `e`, parenthesized when it is a binary expression.
fn write_operand(f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
    match e {
        Expr::Compare(..) | Expr::Arith(..) | Expr::Logical(..) | Expr::Concat(..) => {
            write!(f, "({e})")
        }
        other => write!(f, "{other}"),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write_const(f, v),
            Expr::Star => write!(f, "*"),
            Expr::Path(p) => write!(f, "{p}"),
            Expr::Compare(op, l, r) => {
                write_operand(f, l)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, r)
            }
            Expr::Arith(op, l, r) => {
                write_operand(f, l)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, r)
            }
            Expr::Logical(op, l, r) => {
                write_operand(f, l)?;
                let name = match op {
                    LogicalOp::And => "AND",
                    LogicalOp::Or => "OR",
                };
                write!(f, " {name} ")?;
                write_operand(f, r)
            }
            Expr::Not(inner) => {
                write!(f, "NOT ")?;
                write_operand(f, inner)
            }
            Expr::Is(inner, op) => {
                write_operand(f, inner)?;
                let name = match op {
                    IsOp::Null => "IS NULL",
                    IsOp::NotNull => "IS NOT NULL",
                    IsOp::Missing => "IS MISSING",
                    IsOp::NotMissing => "IS NOT MISSING",
                };
                write!(f, " {name}")
            }
            Expr::Concat(l, r) => {
                write_operand(f, l)?;
                write!(f, " || ")?;
                write_operand(f, r)
            }
            Expr::Case(case) => write!(f, "{case}"),
            Expr::Call(func, args) => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::Aggregate(agg) => write!(f, "{agg}"),
            Expr::ScalarReplacement(i) => write!(f, "SCALAR_REPLACEMENT({i})"),
            Expr::PartitionValue(i) => write!(f, "PARTITION_VALUE({i})"),
        }
    }
}

impl fmt::Display for Case {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CASE")?;
        for (when, then) in &self.limbs {
            write!(f, " WHEN {when} THEN {then}")?;
        }
        if let Some(def) = &self.default {
            write!(f, " ELSE {def}")?;
        }
        write!(f, " END")
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.op.name(), self.inner)?;
        if let Some(filter) = &self.filter {
            write!(f, " FILTER (WHERE {filter})")?;
        }
        Ok(())
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} AS {}", self.expr, self.result)
    }
}

impl fmt::Display for AggBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} AS {}", self.agg, self.result)
    }
}

impl fmt::Display for OrderPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        write!(f, " {}", if self.desc { "DESC" } else { "ASC" })?;
        write!(
            f,
            " {}",
            if self.nulls_last {
                "NULLS LAST"
            } else {
                "NULLS FIRST"
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{and, AggOp};

    #[test]
    fn render_predicates() {
        let e = and(
            Expr::Is(Box::new(Expr::path("Make")), IsOp::Missing),
            Expr::compare(
                CompareOp::Eq,
                Expr::path("Color"),
                Expr::string("BG"),
            ),
        );
        assert_eq!(e.to_string(), "(Make IS MISSING) AND (Color = 'BG')");
    }

    #[test]
    fn render_aggregate_binding() {
        let b = AggBinding::new(Aggregate::new(AggOp::Count, Expr::Star), "count");
        assert_eq!(b.to_string(), "COUNT(*) AS count");
    }

    #[test]
    fn render_case() {
        let c = Expr::Case(Case {
            limbs: vec![(Expr::boolean(true), Expr::integer(1))],
            default: Some(Box::new(Expr::Const(Value::Null))),
        });
        assert_eq!(c.to_string(), "CASE WHEN TRUE THEN 1 ELSE NULL END");
    }
}
