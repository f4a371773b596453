//! Boards: portable graphs with a run-loop driver
//!
//! A [`Board`] pairs a graph descriptor with a live node graph: built from
//! an authored node (which serializes its component and remembers it as
//! the anchor) or loaded from a descriptor (which reconstructs one node
//! per descriptor node and one edge per descriptor edge, no authoring code
//! required). Nested descriptors stay loadable under
//! [`graphs`](Board::graphs), referenced by their `invoke` nodes'
//! configuration.
//!
//! [`run_once`](Board::run_once) is the convenience driver: it feeds
//! external values at the first input checkpoint, lets every other node
//! fire, and stops at the first output checkpoint. A firing failure whose
//! error carries a machine-readable cause is converted into a soft
//! `{"$error": cause}` output instead of failing the run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Map;
use tracing::warn;

use crate::descriptor::{EdgeDescriptor, GraphDescriptor, GraphMetadata, NodeDescriptor};
use crate::error::{GraphError, Result};
use crate::handler::Kit;
use crate::node::{Edge, InputValues, NodeConfig, NodeHandle, NodeId, OutputValues};
use crate::probe::Probe;
use crate::run::{Resume, StepEvent, StepRun};
use crate::scope::Scope;

/// A graph descriptor bound to a live, runnable node graph.
pub struct Board {
    /// Serialized nodes
    pub nodes: Vec<NodeDescriptor>,
    /// Serialized edges
    pub edges: Vec<EdgeDescriptor>,
    /// Nested subgraphs, keyed by the id of the referencing node
    pub graphs: BTreeMap<NodeId, GraphDescriptor>,
    /// Top-level metadata
    pub metadata: GraphMetadata,
    /// Inputs bound to the board; they overwrite values supplied to
    /// [`run_once`](Self::run_once)
    pub args: Option<InputValues>,

    scope: Arc<Scope>,
    anchor: Option<NodeHandle>,
}

impl Board {
    /// Build a board from an authored node: serializes its connected
    /// component and keeps the node as the anchor for execution.
    pub async fn from_node(node: &NodeHandle, metadata: GraphMetadata) -> Result<Board> {
        let authoring = node.scope()?;
        let descriptor = authoring.serialize(node, metadata).await?;
        Ok(Board {
            nodes: descriptor.nodes,
            edges: descriptor.edges,
            graphs: descriptor.graphs,
            metadata: descriptor.metadata,
            args: None,
            scope: Scope::with_parents(vec![authoring]),
            anchor: Some(node.clone()),
        })
    }

    /// Reconstruct a live graph from a descriptor: one node per descriptor
    /// node (its configuration becoming fixed inputs), one edge per
    /// descriptor edge, the first node becoming the anchor.
    pub fn from_descriptor(descriptor: &GraphDescriptor, parent: &Arc<Scope>) -> Result<Board> {
        descriptor.validate()?;
        let scope = Scope::with_parents(vec![parent.clone()]);

        let mut by_id: HashMap<&str, NodeHandle> = HashMap::new();
        let mut anchor = None;
        for node in &descriptor.nodes {
            let mut config = NodeConfig::new().with_id(node.id.as_str());
            for (key, value) in &node.configuration {
                config = config.constant(key.as_str(), value.clone());
            }
            let handle = scope.node(&node.node_type, config)?;
            if anchor.is_none() {
                anchor = Some(handle.clone());
            }
            by_id.insert(&node.id, handle);
        }

        for edge in &descriptor.edges {
            // validate() guarantees both endpoints exist.
            let from = &by_id[edge.from.as_str()];
            let to = &by_id[edge.to.as_str()];
            Edge::link(
                from.inner(),
                to.inner(),
                edge.out.clone(),
                edge.input.clone(),
                edge.constant,
            );
        }

        Ok(Board {
            nodes: descriptor.nodes.clone(),
            edges: descriptor.edges.clone(),
            graphs: descriptor.graphs.clone(),
            metadata: descriptor.metadata.clone(),
            args: None,
            scope,
            anchor,
        })
    }

    /// Bind inputs to the board; they overwrite values supplied at run
    /// time.
    pub fn with_args(mut self, args: InputValues) -> Self {
        self.args = Some(args);
        self
    }

    /// The node execution starts from.
    pub fn anchor(&self) -> Option<&NodeHandle> {
        self.anchor.as_ref()
    }

    /// The stored descriptor, reassembled.
    pub fn descriptor(&self) -> GraphDescriptor {
        GraphDescriptor {
            metadata: self.metadata.clone(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            graphs: self.graphs.clone(),
        }
    }

    /// Re-serialize the live graph from the anchor.
    pub async fn serialize(&self, metadata: GraphMetadata) -> Result<GraphDescriptor> {
        let anchor = self.require_anchor()?;
        self.scope.serialize(anchor, metadata).await
    }

    /// Start a step-wise run over the board's graph.
    pub fn run(&self) -> Result<StepRun> {
        self.run_with(Vec::new(), None)
    }

    /// Start a step-wise run with caller-supplied kits (their handlers
    /// shadow the board's own) and an optional probe.
    pub fn run_with(&self, kits: Vec<Kit>, probe: Option<Arc<dyn Probe>>) -> Result<StepRun> {
        let anchor = self.require_anchor()?;
        let exec = Scope::with_parents(vec![self.scope.clone()]);
        for kit in kits {
            exec.add_kit(kit);
        }
        Ok(match probe {
            Some(probe) => exec.run_with_probe(anchor, probe),
            None => exec.run(anchor),
        })
    }

    /// Drive the run to the first output checkpoint.
    ///
    /// `inputs` (overwritten by any bound [`args`](Self::args)) are
    /// supplied at every input checkpoint. A firing failure carrying a
    /// machine-readable cause is returned as `{"$error": cause}`.
    pub async fn run_once(&self, inputs: InputValues) -> Result<OutputValues> {
        let mut merged = inputs;
        if let Some(args) = &self.args {
            for (key, value) in args {
                merged.insert(key.clone(), value.clone());
            }
        }

        let mut run = self.run()?;
        let mut event = run.step(Resume::Start).await;
        loop {
            match event {
                Err(GraphError::NodeFailed {
                    node,
                    cause: Some(cause),
                    ..
                }) => {
                    warn!(node = %node, "firing failed softly; reporting $error output");
                    let mut outputs = Map::new();
                    outputs.insert("$error".to_string(), cause);
                    return Ok(outputs);
                }
                Err(e) => return Err(e),
                Ok(StepEvent::Input { .. }) => {
                    event = run.step(Resume::Inputs(merged.clone())).await;
                }
                Ok(StepEvent::Output { outputs, .. }) => return Ok(outputs),
                Ok(StepEvent::BeforeHandler { .. }) => {
                    event = run.step(Resume::Continue).await;
                }
                Ok(StepEvent::Done) => return Ok(Map::new()),
            }
        }
    }

    fn require_anchor(&self) -> Result<&NodeHandle> {
        self.anchor
            .as_ref()
            .ok_or_else(|| GraphError::Validation("board has no nodes".to_string()))
    }
}
