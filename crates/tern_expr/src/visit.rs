//! Expression traversal and rewriting.

use tern_error::Result;

use crate::{Case, Expr};

/// Read-only visitor. `visit` returning false prunes the subtree.
pub trait Visitor {
    fn visit(&mut self, e: &Expr) -> bool;
}

pub fn walk<V: Visitor + ?Sized>(v: &mut V, e: &Expr) {
    if !v.visit(e) {
        return;
    }
    match e {
        Expr::Const(_)
        | Expr::Star
        | Expr::Path(_)
        | Expr::ScalarReplacement(_)
        | Expr::PartitionValue(_) => {}
        Expr::Compare(_, l, r) | Expr::Arith(_, l, r) | Expr::Logical(_, l, r) => {
            walk(v, l);
            walk(v, r);
        }
        Expr::Concat(l, r) => {
            walk(v, l);
            walk(v, r);
        }
        Expr::Not(inner) | Expr::Is(inner, _) => walk(v, inner),
        Expr::Case(case) => {
            for (when, then) in &case.limbs {
                walk(v, when);
                walk(v, then);
            }
            if let Some(def) = &case.default {
                walk(v, def);
            }
        }
        Expr::Call(_, args) => {
            for arg in args {
                walk(v, arg);
            }
        }
        Expr::Aggregate(agg) => {
            walk(v, &agg.inner);
            if let Some(filter) = &agg.filter {
                walk(v, filter);
            }
        }
    }
}

/// Bottom-up rewriter: children are rewritten before their parent is handed
/// to `rewrite`.
pub trait Rewriter {
    fn rewrite(&mut self, e: Expr) -> Result<Expr>;
}

pub fn rewrite<R: Rewriter + ?Sized>(r: &mut R, e: Expr) -> Result<Expr> {
    let e = match e {
        Expr::Const(_)
        | Expr::Star
        | Expr::Path(_)
        | Expr::ScalarReplacement(_)
        | Expr::PartitionValue(_) => e,
        Expr::Compare(op, l, r2) => Expr::Compare(
            op,
            Box::new(rewrite(r, *l)?),
            Box::new(rewrite(r, *r2)?),
        ),
        Expr::Arith(op, l, r2) => {
            Expr::Arith(op, Box::new(rewrite(r, *l)?), Box::new(rewrite(r, *r2)?))
        }
        Expr::Logical(op, l, r2) => {
            Expr::Logical(op, Box::new(rewrite(r, *l)?), Box::new(rewrite(r, *r2)?))
        }
        Expr::Concat(l, r2) => {
            Expr::Concat(Box::new(rewrite(r, *l)?), Box::new(rewrite(r, *r2)?))
        }
        Expr::Not(inner) => Expr::Not(Box::new(rewrite(r, *inner)?)),
        Expr::Is(inner, op) => Expr::Is(Box::new(rewrite(r, *inner)?), op),
        Expr::Case(case) => {
            let mut limbs = Vec::with_capacity(case.limbs.len());
            for (when, then) in case.limbs {
                limbs.push((rewrite(r, when)?, rewrite(r, then)?));
            }
            let default = match case.default {
                Some(def) => Some(Box::new(rewrite(r, *def)?)),
                None => None,
            };
            Expr::Case(Case { limbs, default })
        }
        Expr::Call(func, args) => Expr::Call(
            func,
            args.into_iter()
                .map(|a| rewrite(r, a))
                .collect::<Result<Vec<_>>>()?,
        ),
        Expr::Aggregate(mut agg) => {
            agg.inner = Box::new(rewrite(r, *agg.inner)?);
            agg.filter = match agg.filter {
                Some(f) => Some(Box::new(rewrite(r, *f)?)),
                None => None,
            };
            Expr::Aggregate(agg)
        }
    };
    r.rewrite(e)
}

/// A rewriter that never fails and applies a plain function.
pub struct FnRewriter<F>(pub F);

impl<F: FnMut(Expr) -> Expr> Rewriter for FnRewriter<F> {
    fn rewrite(&mut self, e: Expr) -> Result<Expr> {
        Ok((self.0)(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{and, CompareOp};

    #[test]
    fn rewrite_replaces_leaves() {
        let e = and(
            Expr::compare(CompareOp::Eq, Expr::path("a"), Expr::ScalarReplacement(0)),
            Expr::path("b"),
        );
        let mut r = FnRewriter(|e| match e {
            Expr::ScalarReplacement(0) => Expr::integer(7),
            other => other,
        });
        let got = rewrite(&mut r, e).unwrap();
        let want = and(
            Expr::compare(CompareOp::Eq, Expr::path("a"), Expr::integer(7)),
            Expr::path("b"),
        );
        assert_eq!(got, want);
    }

    #[test]
    fn walk_counts_nodes() {
        struct Counter(usize);
        impl Visitor for Counter {
            fn visit(&mut self, _: &Expr) -> bool {
                self.0 += 1;
                true
            }
        }
        let e = Expr::Not(Box::new(and(Expr::path("a"), Expr::path("b"))));
        let mut c = Counter(0);
        walk(&mut c, &e);
        assert_eq!(c.0, 4);
    }
}
