//! Distributed query planning and execution.
//!
//! A logical trace lowers into a [`tree::Tree`] of physical operators over
//! deduplicated table [`input::Input`]s; the tree optionally splits across a
//! [`transport::Geometry`] of peers, serializes as a self-describing binary
//! document, and executes on a per-plan worker pool that streams result
//! chunks into a sink.

pub mod blob;
pub mod env;
pub mod exec;
pub mod input;
pub mod ir;
pub mod lower;
pub mod mem;
pub mod op;
pub mod stats;
pub mod transport;
pub mod tree;

mod split;
mod walker;

pub use exec::{distribute, run, ExecParams};
pub use lower::{lower, lower_split};
pub use stats::ExecStats;
pub use transport::{Client, Geometry, LocalTransport, Transport};
pub use tree::{Node, Tree};
