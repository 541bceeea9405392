//! Row-streaming runtime substrate.
//!
//! The planner's operators are implemented as [`QuerySink`] stages stacked on
//! top of each other; tables push batches of rows into the top of a stack and
//! results fall out of the bottom. Rows are owned [`tern_codec::Value`]
//! structs; nothing here is vectorized.

mod context;
mod eval;
mod hll;
mod sink;
mod table;

pub use context::Context;
pub use eval::{eval, eval_filter, truthy};
pub use hll::Sketch;
pub use sink::{CollectSink, LockedSink, QuerySink, RowSink};
pub use table::{MemTable, Table};

/// Rows per pushed batch when a table is free to choose.
pub const BATCH_ROWS: usize = 1024;
