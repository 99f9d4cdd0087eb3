//! Code for parsing a serialized FX trace into a [`ComputationGraph`].

include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));

use std::collections::BTreeMap;
use std::io::Read;

use protobuf::Message;
use traced_graph::{NodeData, TensorInfo, TracedGraph};

use crate::error::{AutoShardError, Result};
use crate::graph::{ComputationGraph, NodeId, OpFamily, TensorMeta, TracedNode};
use crate::strategy::DataType;

pub struct TraceBuilder {
    trace: TracedGraph,
}

fn tensor_meta(node: &str, info: &TensorInfo) -> Result<TensorMeta> {
    let shape = info
        .dims
        .iter()
        .map(|&d| {
            u64::try_from(d)
                .map_err(|_| AutoShardError::Trace(format!("node '{}' has negative dim {}", node, d)))
        })
        .collect::<Result<Vec<u64>>>()?;
    let dtype = DataType::from_torch(&info.dtype)
        .ok_or_else(|| AutoShardError::Trace(format!("node '{}' has unsupported dtype '{}'", node, info.dtype)))?;
    Ok(TensorMeta { shape, dtype })
}

impl TraceBuilder {
    pub fn parse(file: &mut dyn Read) -> Result<Self> {
        let trace = TracedGraph::parse_from_reader(file)?;
        Ok(TraceBuilder { trace })
    }

    pub fn from_message(trace: TracedGraph) -> Self {
        TraceBuilder { trace }
    }

    fn family_of(nd: &NodeData) -> Result<OpFamily> {
        match nd.op.as_str() {
            "placeholder" => Ok(OpFamily::Placeholder),
            "output" => Ok(OpFamily::Output),
            "call_module" | "call_function" | "call_method" => OpFamily::from_target(&nd.target)
                .ok_or_else(|| AutoShardError::UnsupportedOperation(format!("{} ({})", nd.target, nd.name))),
            other => Err(AutoShardError::Trace(format!(
                "unknown op '{}' in node '{}'",
                other, nd.name
            ))),
        }
    }

    fn traced_node(nd: &NodeData) -> Result<TracedNode> {
        let family = Self::family_of(nd)?;
        let output = match family {
            OpFamily::Output => None,
            _ => {
                let info = nd.tensor_info.as_ref().ok_or_else(|| {
                    AutoShardError::Trace(format!("node '{}' has no tensor info", nd.name))
                })?;
                Some(tensor_meta(&nd.name, info)?)
            }
        };
        let mut node = TracedNode::new(&nd.name, family, output).with_target(&nd.target);
        for param in &nd.params {
            let info = param.tensor_info.as_ref().ok_or_else(|| {
                AutoShardError::Trace(format!("parameter '{}' of '{}' has no tensor info", param.name, nd.name))
            })?;
            let meta = tensor_meta(&param.name, info)?;
            node = node.with_param(&param.role, &param.name, meta.shape.clone());
            if let Some(p) = node.params.get_mut(&param.role) {
                p.meta.dtype = meta.dtype;
            }
        }
        // protobuf maps are unordered
        let attrs: BTreeMap<&String, &i64> = nd.attrs.iter().collect();
        for (key, value) in attrs {
            node = node.with_attr(key, *value);
        }
        Ok(node)
    }

    pub fn build_graph(self) -> Result<ComputationGraph> {
        let mut graph = ComputationGraph::new();
        for nd in &self.trace.nodes {
            let args = nd
                .args
                .iter()
                .map(|arg| {
                    graph.find(arg).ok_or_else(|| {
                        AutoShardError::Trace(format!("node '{}' references unknown node '{}'", nd.name, arg))
                    })
                })
                .collect::<Result<Vec<NodeId>>>()?;
            graph.add_node(Self::traced_node(nd)?, args)?;
        }
        graph.validate()?;
        tracing::debug!(nodes = graph.len(), "parsed traced graph");
        Ok(graph)
    }
}
