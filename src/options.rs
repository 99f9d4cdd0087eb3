use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Knobs for strategy construction and solving.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Per-device peak memory limit in bytes.
    pub memory_budget: Option<u64>,
    /// Price only the forward pass.
    pub forward_only: bool,
    /// Run `simplify_graph` before searching.
    pub simplify: bool,
    /// Search nodes the branch and bound may expand.
    pub max_iterations: u64,
    /// Let the graph output stay sharded instead of gathering it.
    pub distributed_output: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            memory_budget: None,
            forward_only: false,
            simplify: true,
            max_iterations: 1_000_000,
            distributed_output: false,
        }
    }
}

impl SolverOptions {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let opts: SolverOptions = serde_json::from_str(r#"{"forward_only": true}"#).unwrap();
        assert!(opts.forward_only);
        assert!(opts.simplify);
        assert_eq!(opts.memory_budget, None);
        assert_eq!(opts.max_iterations, 1_000_000);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let opts: SolverOptions = serde_json::from_str(r#"{"colour": 1}"#).unwrap();
        assert_eq!(opts, SolverOptions::default());
    }
}
