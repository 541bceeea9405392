//! The logical trace: the contract between the external query planner and
//! the lowering pass.
//!
//! A trace is a chain of steps, terminal step innermost, mirroring the order
//! rows flow. The builder methods exist so traces read top-down at
//! construction sites:
//!
//! ```
//! use tern_plan::ir::Step;
//! use tern_expr::{Expr, IsOp};
//!
//! let trace = Step::iter_table(Expr::path("parking"))
//!     .filter(Expr::Is(Box::new(Expr::path("Make")), IsOp::Missing))
//!     .limit(10, 0);
//! ```

use tern_expr::{AggBinding, Binding, Expr, OrderPart};

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Terminal: scan a table.
    IterTable {
        table: Expr,
        /// Pushed-down scan predicate.
        filter: Option<Expr>,
        /// `None` when the query needs every field.
        fields: Option<Vec<String>>,
    },
    /// Terminal: no rows.
    NoOutput,
    /// Terminal: exactly one empty row.
    DummyOutput,
    /// Terminal: distribute the inner trace across peers.
    UnionMap { sub: Box<Step> },
    Filter {
        from: Box<Step>,
        expr: Expr,
    },
    /// Projection (or extension, decided during lowering).
    Bind {
        from: Box<Step>,
        bindings: Vec<Binding>,
    },
    Aggregate {
        from: Box<Step>,
        aggs: Vec<AggBinding>,
        group_by: Vec<Binding>,
    },
    Limit {
        from: Box<Step>,
        count: u64,
        offset: u64,
    },
    Order {
        from: Box<Step>,
        cols: Vec<OrderPart>,
    },
    Distinct {
        from: Box<Step>,
        fields: Vec<Expr>,
    },
    /// Iterate a list-valued expression, binding each element.
    IterValue {
        from: Box<Step>,
        expr: Expr,
        result: String,
    },
    /// Row pivoting. Present in the contract, unsupported by the closed
    /// operator set.
    Unpivot {
        from: Box<Step>,
        result: Option<String>,
        at: Option<String>,
    },
    OutputPart {
        from: Box<Step>,
        basename: String,
        store: String,
    },
    OutputIndex {
        from: Box<Step>,
        table: String,
        basename: String,
        store: String,
    },
}

impl Step {
    pub fn iter_table(table: Expr) -> Step {
        Step::IterTable {
            table,
            filter: None,
            fields: None,
        }
    }

    pub fn iter_table_filtered(table: Expr, filter: Expr) -> Step {
        Step::IterTable {
            table,
            filter: Some(filter),
            fields: None,
        }
    }

    /// Restrict the scanned fields. Only meaningful on `IterTable`.
    pub fn with_fields(self, fields: Vec<&str>) -> Step {
        match self {
            Step::IterTable { table, filter, .. } => Step::IterTable {
                table,
                filter,
                fields: Some(fields.into_iter().map(String::from).collect()),
            },
            other => other,
        }
    }

    pub fn union_map(sub: Step) -> Step {
        Step::UnionMap { sub: Box::new(sub) }
    }

    pub fn filter(self, expr: Expr) -> Step {
        Step::Filter {
            from: Box::new(self),
            expr,
        }
    }

    pub fn bind(self, bindings: Vec<Binding>) -> Step {
        Step::Bind {
            from: Box::new(self),
            bindings,
        }
    }

    pub fn aggregate(self, aggs: Vec<AggBinding>, group_by: Vec<Binding>) -> Step {
        Step::Aggregate {
            from: Box::new(self),
            aggs,
            group_by,
        }
    }

    pub fn limit(self, count: u64, offset: u64) -> Step {
        Step::Limit {
            from: Box::new(self),
            count,
            offset,
        }
    }

    pub fn order(self, cols: Vec<OrderPart>) -> Step {
        Step::Order {
            from: Box::new(self),
            cols,
        }
    }

    pub fn distinct(self, fields: Vec<Expr>) -> Step {
        Step::Distinct {
            from: Box::new(self),
            fields,
        }
    }

    pub fn iter_value(self, expr: Expr, result: impl Into<String>) -> Step {
        Step::IterValue {
            from: Box::new(self),
            expr,
            result: result.into(),
        }
    }

    pub fn output_part(self, basename: impl Into<String>, store: impl Into<String>) -> Step {
        Step::OutputPart {
            from: Box::new(self),
            basename: basename.into(),
            store: store.into(),
        }
    }

    pub fn output_index(
        self,
        table: impl Into<String>,
        basename: impl Into<String>,
        store: impl Into<String>,
    ) -> Step {
        Step::OutputIndex {
            from: Box::new(self),
            table: table.into(),
            basename: basename.into(),
            store: store.into(),
        }
    }

    /// The step this one consumes from, if any.
    pub fn from_step(&self) -> Option<&Step> {
        match self {
            Step::IterTable { .. }
            | Step::NoOutput
            | Step::DummyOutput
            | Step::UnionMap { .. } => None,
            Step::Filter { from, .. }
            | Step::Bind { from, .. }
            | Step::Aggregate { from, .. }
            | Step::Limit { from, .. }
            | Step::Order { from, .. }
            | Step::Distinct { from, .. }
            | Step::IterValue { from, .. }
            | Step::Unpivot { from, .. }
            | Step::OutputPart { from, .. }
            | Step::OutputIndex { from, .. } => Some(from),
        }
    }

    /// Replace the predecessor, returning the modified step.
    pub(crate) fn restack(mut self, new_from: Step) -> Step {
        match &mut self {
            Step::IterTable { .. }
            | Step::NoOutput
            | Step::DummyOutput
            | Step::UnionMap { .. } => {}
            Step::Filter { from, .. }
            | Step::Bind { from, .. }
            | Step::Aggregate { from, .. }
            | Step::Limit { from, .. }
            | Step::Order { from, .. }
            | Step::Distinct { from, .. }
            | Step::IterValue { from, .. }
            | Step::Unpivot { from, .. }
            | Step::OutputPart { from, .. }
            | Step::OutputIndex { from, .. } => **from = new_from,
        }
        self
    }
}
