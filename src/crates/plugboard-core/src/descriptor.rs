//! Portable graph descriptors
//!
//! A [`GraphDescriptor`] is the serialized form of a connected component:
//! nodes, edges, and nested subgraphs, plus optional metadata flattened at
//! the top level. Descriptors are self-contained (every edge endpoint
//! names a node of the same descriptor) and can be reloaded and
//! re-executed without the authoring code that produced them.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::error::{GraphError, Result};
use crate::node::{InputValues, NodeId};

/// Optional top-level metadata, flattened into the descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphMetadata {
    /// Human-readable graph title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Graph description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Version string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Canonical URL of the graph
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Serialized node: identity, handler type, and fixed configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node id within the descriptor
    pub id: NodeId,

    /// Handler type name
    #[serde(rename = "type")]
    pub node_type: String,

    /// Fixed inputs restored after every firing
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub configuration: InputValues,
}

/// Serialized edge between two nodes of the same descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    /// Source node id
    pub from: NodeId,

    /// Destination node id
    pub to: NodeId,

    /// Output key on the source (`"*"` wildcard, `""` control-only)
    pub out: String,

    /// Input key on the destination
    #[serde(rename = "in")]
    pub input: String,

    /// Whether deliveries along this edge persist across firing cycles
    #[serde(default, skip_serializing_if = "is_false")]
    pub constant: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Serialized connected component: nodes, edges, and nested subgraphs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescriptor {
    /// Optional metadata, flattened at the top level
    #[serde(flatten)]
    pub metadata: GraphMetadata,

    /// Nodes in discovery order
    pub nodes: Vec<NodeDescriptor>,

    /// Edges, grouped by source node in discovery order
    pub edges: Vec<EdgeDescriptor>,

    /// Nested subgraphs compiled from inline closures, keyed by the id of
    /// the node that referenced them
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub graphs: BTreeMap<NodeId, GraphDescriptor>,
}

impl GraphDescriptor {
    /// Parse a descriptor from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a descriptor from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check self-containment: node ids are unique, and every edge's
    /// endpoints name nodes of this descriptor. Nested subgraphs are
    /// validated recursively.
    pub fn validate(&self) -> Result<()> {
        let mut ids: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(&node.id) {
                return Err(GraphError::Validation(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            if !ids.contains(edge.from.as_str()) {
                return Err(GraphError::Validation(format!(
                    "edge source '{}' does not exist",
                    edge.from
                )));
            }
            if !ids.contains(edge.to.as_str()) {
                return Err(GraphError::Validation(format!(
                    "edge target '{}' does not exist",
                    edge.to
                )));
            }
        }

        for graph in self.graphs.values() {
            graph.validate()?;
        }

        Ok(())
    }
}
