//! Passes that turn a solution into a sharded, communication-annotated graph.

pub mod apply;
pub mod preparation;

pub use apply::{apply, ShardedGraph, ShardedOp};
pub use preparation::{prepare, ConsumerSpec, EdgeKey, PreparedGraph, ResolvedNode};
