//! Automatic tensor sharding for traced computation graphs.
//!
//! Given a traced graph and a device mesh, every node gets a list of
//! candidate layouts, a cost graph links producer and consumer choices, and
//! a solver picks one layout per node. The runtime passes then describe the
//! resharding needed between nodes whose layouts disagree.

pub mod constructor;
pub mod cost_graph;
pub mod device_mesh;
pub mod error;
pub mod generators;
pub mod graph;
pub mod graph_analysis;
pub mod handlers;
pub mod options;
pub mod passes;
pub mod planner;
pub mod shape_consistency;
pub mod sharding;
pub mod solver;
pub mod strategy;

pub use device_mesh::DeviceMesh;
pub use error::{AutoShardError, Result};
pub use graph::ComputationGraph;
pub use handlers::HandlerRegistry;
pub use options::SolverOptions;
pub use planner::{plan, Plan, PlanReport};
