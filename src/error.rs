use thiserror::Error;

/// Errors raised while building strategies, solving or rewriting a graph.
#[derive(Error, Debug)]
pub enum AutoShardError {
    /// Operand shapes disagree with the logical shape the handler derives for them.
    #[error("shape mismatch on node '{node}': {reason}")]
    ShapeMismatch { node: String, reason: String },

    /// No handler or generator is registered for an operation family.
    #[error("unsupported operation '{0}'")]
    UnsupportedOperation(String),

    /// No assignment satisfies the configured memory budget.
    #[error("no feasible sharding solution: {0}")]
    InfeasibleSolution(String),

    /// A communication action cannot convert one layout into another.
    #[error("incompatible layouts: {0}")]
    IncompatibleLayout(String),

    /// A solution does not fit the graph or strategies it is applied to.
    #[error("invalid solution: {0}")]
    InvalidSolution(String),

    #[error("invalid device mesh: {0}")]
    InvalidMesh(String),

    #[error("invalid sharding spec: {0}")]
    InvalidShardingSpec(String),

    /// The traced graph could not be decoded or references unknown nodes.
    #[error("trace error: {0}")]
    Trace(String),

    #[error("invalid options: {0}")]
    Options(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AutoShardError {
    pub fn shape_mismatch(node: impl ToString, reason: impl ToString) -> Self {
        AutoShardError::ShapeMismatch {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether a caller may retry with relaxed solver options.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AutoShardError::InfeasibleSolution(_))
    }
}

impl From<protobuf::Error> for AutoShardError {
    fn from(e: protobuf::Error) -> Self {
        AutoShardError::Trace(e.to_string())
    }
}

impl From<csv::Error> for AutoShardError {
    fn from(e: csv::Error) -> Self {
        AutoShardError::InvalidMesh(format!("communication profile: {e}"))
    }
}

impl From<serde_json::Error> for AutoShardError {
    fn from(e: serde_json::Error) -> Self {
        AutoShardError::Options(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AutoShardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AutoShardError::shape_mismatch("linear", "in_features 16 != 8");
        assert_eq!(
            err.to_string(),
            "shape mismatch on node 'linear': in_features 16 != 8"
        );
    }

    #[test]
    fn test_only_infeasible_is_retryable() {
        assert!(AutoShardError::InfeasibleSolution("budget".into()).is_retryable());
        assert!(!AutoShardError::IncompatibleLayout("rank".into()).is_retryable());
        assert!(!AutoShardError::UnsupportedOperation("scatter".into()).is_retryable());
    }
}
