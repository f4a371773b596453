//! Core node and edge data structures
//!
//! A [`NodeHandle`] is the authoring surface for one graph vertex: it wires
//! incoming data with [`feed`](NodeHandle::feed), attaches downstream nodes
//! with [`to`](NodeHandle::to), projects named outputs with
//! [`output`](NodeHandle::output), and resolves the node's settled output
//! bundle with [`resolve`](NodeHandle::resolve), which triggers the owning
//! scope's eager traversal over the whole connected component.
//!
//! Edges are immutable once created and recorded in both endpoints' edge
//! lists. Three key shapes exist:
//!
//! - **named** (`out = "x"`, `in = "y"`): copy field `x` of the source's
//!   output into field `y` of the destination's working inputs
//! - **wildcard** (`"*" -> "*"`): copy every produced field, renaming none
//! - **control-only** (`"" -> ""`): copy nothing; the delivery alone counts
//!   toward the destination's readiness
//!
//! Nodes are owned by the [`Scope`](crate::Scope) that created them; handles
//! and edges hold weak references, so a graph never outlives its scope.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::Map;
use tokio::sync::watch;

use crate::descriptor::NodeDescriptor;
use crate::error::{GraphError, NodeFailure, Result};
use crate::handler::InlineFn;
use crate::scope::Scope;
use crate::value::Value;

/// A single node value: any JSON value.
pub type NodeValue = serde_json::Value;

/// An input bundle: input key to value.
pub type InputValues = Map<String, NodeValue>;

/// An output bundle: output key to value.
pub type OutputValues = Map<String, NodeValue>;

/// A key remapping: source output key to destination input key.
pub type KeyMap = BTreeMap<String, String>;

/// Node identifier, unique within a process.
pub type NodeId = String;

/// Reserved node type for external-input checkpoints in step-wise runs.
pub const INPUT: &str = "input";

/// Reserved node type for final-output checkpoints in step-wise runs.
pub const OUTPUT: &str = "output";

/// Reserved node type marking a node that wraps an inline closure.
pub const CLOSURE: &str = "fn";

/// Node type emitted when a closure compiles to a nested subgraph.
pub(crate) const INVOKE: &str = "invoke";

/// Node type emitted when a closure compiles to source text.
pub(crate) const RUN_JAVASCRIPT: &str = "runJavascript";

static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Next auto-generated id for a node of the given type.
pub(crate) fn next_node_id(node_type: &str) -> NodeId {
    format!("{}-{}", node_type, NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

type Settled = std::result::Result<OutputValues, NodeFailure>;

/// A directed, keyed data or control dependency between two nodes.
///
/// Immutable once created. Recorded in `from.outgoing` and `to.incoming`;
/// edges are never removed.
#[derive(Debug)]
pub struct Edge {
    pub(crate) from: Weak<NodeInner>,
    pub(crate) to: Weak<NodeInner>,
    /// Output key on the source (`"*"` wildcard, `""` control-only)
    pub out: String,
    /// Input key on the destination (`"*"` wildcard, `""` control-only)
    pub input: String,
    /// Deliveries along a constant edge persist across firing cycles
    pub constant: bool,
}

impl Edge {
    /// Create an edge and record it in both endpoints' edge lists.
    pub(crate) fn link(
        from: &Arc<NodeInner>,
        to: &Arc<NodeInner>,
        out: impl Into<String>,
        input: impl Into<String>,
        constant: bool,
    ) {
        let edge = Arc::new(Edge {
            from: Arc::downgrade(from),
            to: Arc::downgrade(to),
            out: out.into(),
            input: input.into(),
            constant,
        });
        from.state.write().unwrap().outgoing.push(edge.clone());
        to.state.write().unwrap().incoming.push(edge);
    }
}

#[derive(Default)]
pub(crate) struct NodeState {
    /// Fixed inputs, restored after every successful firing
    pub(crate) configuration: InputValues,
    /// Working inputs: seeded from configuration, mutated by deliveries
    pub(crate) inputs: InputValues,
    /// Inputs that persist across firing cycles
    pub(crate) constants: InputValues,
    /// Upstream node ids that delivered data in the current cycle
    pub(crate) received_from: HashSet<NodeId>,
    /// Output bundle of the most recent firing, unset before the first
    pub(crate) outputs: Option<OutputValues>,
    pub(crate) incoming: Vec<Arc<Edge>>,
    pub(crate) outgoing: Vec<Arc<Edge>>,
}

/// Graph vertex: identity, type, configuration, accumulated inputs, edge
/// lists, and a settle-once output channel.
pub struct NodeInner {
    pub(crate) id: NodeId,
    pub(crate) node_type: String,
    pub(crate) inline: Option<InlineFn>,
    pub(crate) scope: Weak<Scope>,
    pub(crate) state: RwLock<NodeState>,
    settled: watch::Sender<Option<Settled>>,
}

impl NodeInner {
    /// Descriptor snapshot: id, type, and configuration.
    pub(crate) fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.id.clone(),
            node_type: self.node_type.clone(),
            configuration: self.state.read().unwrap().configuration.clone(),
        }
    }

    /// Snapshot of the current working inputs.
    pub(crate) fn current_inputs(&self) -> InputValues {
        self.state.read().unwrap().inputs.clone()
    }

    /// Add one configuration entry. Used by the serializer when compiling
    /// closure results onto a synthetic sink node.
    pub(crate) fn set_configuration_value(&self, key: String, value: NodeValue) {
        self.state.write().unwrap().configuration.insert(key, value);
    }

    /// Apply one edge's copy rule to this node's working inputs.
    ///
    /// Named edges copy one field, wildcard edges copy every produced field,
    /// control-only edges copy nothing. Constant edges additionally merge
    /// the copied data into the persistent constant set. The source node is
    /// recorded as having delivered this cycle either way.
    pub(crate) fn receive_inputs(&self, edge: &Edge, outputs: &OutputValues) {
        let data: InputValues = if edge.out == "*" {
            outputs.clone()
        } else if edge.out.is_empty() {
            Map::new()
        } else {
            let mut copied = Map::new();
            if let Some(value) = outputs.get(&edge.out) {
                copied.insert(edge.input.clone(), value.clone());
            }
            copied
        };

        let mut state = self.state.write().unwrap();
        if edge.constant {
            for (key, value) in &data {
                state.constants.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in data {
            state.inputs.insert(key, value);
        }
        if let Some(from) = edge.from.upgrade() {
            state.received_from.insert(from.id.clone());
        }
    }

    /// Whether this node has everything it needs to fire.
    ///
    /// Required are: the presence of a value for every named incoming key
    /// (from whichever source), a delivery from every node wired via a
    /// wildcard or control-only edge, and, once the node has fired at least
    /// once, at least one fresh delivery this cycle (so a node is never
    /// re-queued on stale data alone).
    pub(crate) fn is_ready(&self) -> bool {
        let state = self.state.read().unwrap();

        let mut required_keys = HashSet::new();
        let mut required_nodes = HashSet::new();
        for edge in &state.incoming {
            if edge.input != "*" && !edge.input.is_empty() {
                required_keys.insert(edge.input.as_str());
            }
            if edge.out == "*" || edge.out.is_empty() {
                if let Some(from) = edge.from.upgrade() {
                    required_nodes.insert(from.id.clone());
                }
            }
        }

        required_keys.iter().all(|key| {
            state.inputs.contains_key(*key) || state.constants.contains_key(*key)
        }) && required_nodes
            .iter()
            .all(|id| state.received_from.contains(id))
            && (state.outputs.is_none() || !state.received_from.is_empty())
    }

    /// Record a successful firing: settle the output channel (first firing
    /// only), store the outputs, and reset the working inputs to
    /// configuration plus constants, clearing the delivery set.
    pub(crate) fn complete(&self, outputs: OutputValues) {
        let mut state = self.state.write().unwrap();
        if state.outputs.is_none() {
            self.settle(Ok(outputs.clone()));
        }
        state.outputs = Some(outputs);
        state.inputs = state.configuration.clone();
        let constants = state.constants.clone();
        for (key, value) in constants {
            state.inputs.insert(key, value);
        }
        state.received_from.clear();
    }

    /// Record a failed firing: settle the output channel with the failure
    /// (first firing only). The working inputs are left untouched, so a
    /// retried firing observes the same inputs.
    pub(crate) fn fail(&self, failure: NodeFailure) {
        let state = self.state.read().unwrap();
        if state.outputs.is_none() {
            self.settle(Err(failure));
        }
    }

    fn settle(&self, value: Settled) {
        self.settled.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(value);
                true
            } else {
                false
            }
        });
    }
}

impl std::fmt::Debug for NodeInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("type", &self.node_type)
            .finish()
    }
}

/// One entry of a plain-mapping node configuration, decided at construction
/// time instead of probed at runtime.
#[derive(Clone)]
pub enum ConfigEntry {
    /// A fixed value: becomes configuration (constructor) or a persistent
    /// constant (feed)
    Constant(NodeValue),
    /// Wire the same-named output of another node into this key
    Node(NodeHandle),
    /// Wire a projection into this key, carrying its constant flag
    Value(Value),
}

pub(crate) enum ConfigSource {
    Empty,
    Entries(BTreeMap<String, ConfigEntry>),
    Node(NodeHandle),
    Value(Value),
}

/// Configuration for constructing or feeding a node: an optional explicit
/// id plus either a plain mapping of entries, another node (wired wholesale
/// via a wildcard edge), or a projection (wired via its keymap).
pub struct NodeConfig {
    pub(crate) id: Option<NodeId>,
    pub(crate) source: ConfigSource,
}

impl NodeConfig {
    /// Empty configuration.
    pub fn new() -> Self {
        Self {
            id: None,
            source: ConfigSource::Empty,
        }
    }

    /// Use an explicit node id instead of an auto-generated one.
    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add a fixed value under `key`.
    pub fn constant(self, key: impl Into<String>, value: NodeValue) -> Self {
        self.entry(key, ConfigEntry::Constant(value))
    }

    /// Wire the `key` output of `node` into this node's `key` input.
    pub fn node(self, key: impl Into<String>, node: &NodeHandle) -> Self {
        self.entry(key, ConfigEntry::Node(node.clone()))
    }

    /// Wire a projection into this node's `key` input.
    pub fn value(self, key: impl Into<String>, value: Value) -> Self {
        self.entry(key, ConfigEntry::Value(value))
    }

    fn entry(mut self, key: impl Into<String>, entry: ConfigEntry) -> Self {
        let mut entries = match self.source {
            ConfigSource::Entries(entries) => entries,
            // A node/value source is replaced; entries take precedence.
            _ => BTreeMap::new(),
        };
        entries.insert(key.into(), entry);
        self.source = ConfigSource::Entries(entries);
        self
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl From<NodeHandle> for NodeConfig {
    fn from(node: NodeHandle) -> Self {
        Self {
            id: None,
            source: ConfigSource::Node(node),
        }
    }
}

impl From<&NodeHandle> for NodeConfig {
    fn from(node: &NodeHandle) -> Self {
        node.clone().into()
    }
}

impl From<Value> for NodeConfig {
    fn from(value: Value) -> Self {
        Self {
            id: None,
            source: ConfigSource::Value(value),
        }
    }
}

impl From<&Value> for NodeConfig {
    fn from(value: &Value) -> Self {
        value.clone().into()
    }
}

/// Target of a [`NodeHandle::to`] or [`Value::to`](crate::Value::to) call:
/// an existing node, a handler type name (a new node is created), or an
/// inline closure.
pub enum NodeTarget {
    /// Wire into this existing node
    Node(NodeHandle),
    /// Create a new node of this handler type
    Type(String),
    /// Create a new closure node
    Inline(InlineFn),
}

impl From<&str> for NodeTarget {
    fn from(node_type: &str) -> Self {
        Self::Type(node_type.to_string())
    }
}

impl From<String> for NodeTarget {
    fn from(node_type: String) -> Self {
        Self::Type(node_type)
    }
}

impl From<NodeHandle> for NodeTarget {
    fn from(node: NodeHandle) -> Self {
        Self::Node(node)
    }
}

impl From<&NodeHandle> for NodeTarget {
    fn from(node: &NodeHandle) -> Self {
        Self::Node(node.clone())
    }
}

impl From<InlineFn> for NodeTarget {
    fn from(inline: InlineFn) -> Self {
        Self::Inline(inline)
    }
}

/// Shared handle to a graph node: the fluent authoring surface.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl NodeHandle {
    /// Construct a node in `scope` and apply its configuration: scalar
    /// entries become configuration, node and projection entries become
    /// edges, a node source becomes a wildcard edge, and a projection
    /// source is wired via its keymap. The working inputs are seeded from
    /// the configuration.
    pub(crate) fn create(
        scope: &Arc<Scope>,
        node_type: &str,
        inline: Option<InlineFn>,
        config: NodeConfig,
    ) -> Result<NodeHandle> {
        let NodeConfig { id, source } = config;
        let (settled, _) = watch::channel(None);
        let inner = Arc::new(NodeInner {
            id: id.unwrap_or_else(|| next_node_id(node_type)),
            node_type: node_type.to_string(),
            inline,
            scope: Arc::downgrade(scope),
            state: RwLock::new(NodeState::default()),
            settled,
        });
        scope.adopt(&inner);
        let handle = NodeHandle { inner };

        match source {
            ConfigSource::Empty => {}
            ConfigSource::Entries(entries) => handle.apply_entries(entries, true)?,
            ConfigSource::Node(from) => handle.wire_from(&from, wildcard_keymap(), false),
            ConfigSource::Value(value) => {
                let (from, keymap, constant) = value.into_node_input();
                handle.wire_from(&from, keymap, constant);
            }
        }

        let mut state = handle.inner.state.write().unwrap();
        state.inputs = state.configuration.clone();
        drop(state);

        Ok(handle)
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<NodeInner> {
        &self.inner
    }

    /// This node's id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// This node's handler type.
    pub fn node_type(&self) -> &str {
        &self.inner.node_type
    }

    /// The output bundle of the most recent firing, or `None` before the
    /// first. Unlike [`resolve`](Self::resolve), this tracks later firings.
    pub fn outputs(&self) -> Option<OutputValues> {
        self.inner.state.read().unwrap().outputs.clone()
    }

    /// The scope this node was created in.
    pub fn scope(&self) -> Result<Arc<Scope>> {
        self.inner
            .scope
            .upgrade()
            .ok_or_else(|| GraphError::Internal(format!("scope of node '{}' dropped", self.inner.id)))
    }

    /// Project the named output into a chainable, resolvable [`Value`].
    pub fn output(&self, key: impl Into<String>) -> Value {
        let key = key.into();
        let mut keymap = KeyMap::new();
        keymap.insert(key.clone(), key);
        Value::with_keymap(self.clone(), keymap, false)
    }

    /// Project several outputs at once under new names.
    pub fn project(&self, keymap: KeyMap) -> Value {
        Value::with_keymap(self.clone(), keymap, false)
    }

    /// Wire every output of this node into `target` via a wildcard edge,
    /// creating the target node first when given a type name or closure.
    pub fn to(
        &self,
        target: impl Into<NodeTarget>,
        config: impl Into<NodeConfig>,
    ) -> Result<NodeHandle> {
        let to_node = self.target_node(target.into(), config.into())?;
        to_node.wire_from(self, wildcard_keymap(), false);
        Ok(to_node)
    }

    /// Wire additional inputs into this node: another node (wildcard), a
    /// projection (keymap), or a plain mapping (scalars persist as
    /// constants, references become edges).
    pub fn feed(&self, inputs: impl Into<NodeConfig>) -> Result<&Self> {
        let NodeConfig { source, .. } = inputs.into();
        match source {
            ConfigSource::Empty => {}
            ConfigSource::Entries(entries) => self.apply_entries(entries, false)?,
            ConfigSource::Node(from) => self.wire_from(&from, wildcard_keymap(), false),
            ConfigSource::Value(value) => {
                let (from, keymap, constant) = value.into_node_input();
                self.wire_from(&from, keymap, constant);
            }
        }
        Ok(self)
    }

    /// Trigger the owning scope's eager traversal over this node's
    /// connected component, then wait for the settle-once output channel.
    ///
    /// Resolving multiple times always observes the result of the first
    /// firing, even if the node has fired again since. Resolving inside a
    /// serializing scope fails with the internal suspension signal.
    pub async fn resolve(&self) -> Result<OutputValues> {
        let scope = self.scope()?;
        if scope.serializing() {
            return Err(GraphError::SerializeSuspend);
        }
        scope.invoke(self).await?;
        self.settled().await
    }

    /// Wait for the settle-once channel without triggering execution.
    pub(crate) async fn settled(&self) -> Result<OutputValues> {
        let mut rx = self.inner.settled.subscribe();
        loop {
            if let Some(settled) = rx.borrow_and_update().clone() {
                return settled.map_err(GraphError::from);
            }
            if rx.changed().await.is_err() {
                return Err(GraphError::Internal(format!(
                    "node '{}' dropped before settling",
                    self.inner.id
                )));
            }
        }
    }

    /// Create edges from `from` into this node, one per keymap pair.
    ///
    /// An empty keymap creates a single control-only edge. A key of the
    /// spread form `*-<id>` (all outputs of a captured node) normalizes to
    /// the wildcard pair.
    pub fn wire_from(&self, from: &NodeHandle, keymap: KeyMap, constant: bool) {
        if keymap.is_empty() {
            Edge::link(from.inner(), self.inner(), "", "", false);
            return;
        }
        for (out, input) in keymap {
            if out.starts_with("*-") {
                Edge::link(from.inner(), self.inner(), "*", "*", constant);
            } else {
                Edge::link(from.inner(), self.inner(), out, input, constant);
            }
        }
    }

    pub(crate) fn apply_entries(
        &self,
        entries: BTreeMap<String, ConfigEntry>,
        into_configuration: bool,
    ) -> Result<()> {
        let mut scalars = InputValues::new();
        for (key, entry) in entries {
            match entry {
                ConfigEntry::Constant(value) => {
                    scalars.insert(key, value);
                }
                ConfigEntry::Node(from) => {
                    let mut keymap = KeyMap::new();
                    keymap.insert(key.clone(), key);
                    self.wire_from(&from, keymap, false);
                }
                ConfigEntry::Value(value) => {
                    let renamed = value.rename(key.as_str())?;
                    let (from, keymap, constant) = renamed.into_node_input();
                    self.wire_from(&from, keymap, constant);
                }
            }
        }
        let mut state = self.inner.state.write().unwrap();
        for (key, value) in scalars {
            if into_configuration {
                state.configuration.insert(key, value);
            } else {
                state.constants.insert(key, value);
            }
        }
        Ok(())
    }

    fn target_node(&self, target: NodeTarget, config: NodeConfig) -> Result<NodeHandle> {
        match target {
            NodeTarget::Node(node) => Ok(node),
            NodeTarget::Type(node_type) => {
                NodeHandle::create(&self.scope()?, &node_type, None, config)
            }
            NodeTarget::Inline(inline) => {
                NodeHandle::create(&self.scope()?, CLOSURE, Some(inline), config)
            }
        }
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

pub(crate) fn wildcard_keymap() -> KeyMap {
    let mut keymap = KeyMap::new();
    keymap.insert("*".to_string(), "*".to_string());
    keymap
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(value: NodeValue) -> InputValues {
        value.as_object().cloned().unwrap_or_default()
    }

    fn scoped_node(node_type: &str, config: NodeConfig) -> NodeHandle {
        let scope = Scope::new();
        scope.node(node_type, config).unwrap()
    }

    #[test]
    fn test_scalar_config_becomes_configuration() {
        let node = scoped_node("template", NodeConfig::new().constant("greeting", json!("hello")));
        let descriptor = node.inner().descriptor();
        assert_eq!(descriptor.configuration, values(json!({"greeting": "hello"})));
        // Working inputs are seeded from configuration.
        assert_eq!(node.inner().current_inputs(), values(json!({"greeting": "hello"})));
    }

    #[test]
    fn test_node_entry_becomes_named_edge() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope
            .node("sink", NodeConfig::new().node("text", &from))
            .unwrap();

        let state = to.inner().state.read().unwrap();
        assert_eq!(state.incoming.len(), 1);
        assert_eq!(state.incoming[0].out, "text");
        assert_eq!(state.incoming[0].input, "text");
        assert!(!state.incoming[0].constant);
        drop(state);
        assert_eq!(from.inner().state.read().unwrap().outgoing.len(), 1);
    }

    #[test]
    fn test_node_config_source_wires_wildcard() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope.node("sink", NodeConfig::from(&from)).unwrap();

        let state = to.inner().state.read().unwrap();
        assert_eq!(state.incoming.len(), 1);
        assert_eq!(state.incoming[0].out, "*");
        assert_eq!(state.incoming[0].input, "*");
    }

    #[test]
    fn test_empty_keymap_wires_control_edge() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope.node("sink", NodeConfig::new()).unwrap();
        to.wire_from(&from, KeyMap::new(), false);

        let state = to.inner().state.read().unwrap();
        assert_eq!(state.incoming[0].out, "");
        assert_eq!(state.incoming[0].input, "");
    }

    #[test]
    fn test_spread_key_normalizes_to_wildcard() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope.node("sink", NodeConfig::new()).unwrap();
        let mut keymap = KeyMap::new();
        keymap.insert(format!("*-{}", from.id()), "ignored".to_string());
        to.wire_from(&from, keymap, false);

        let state = to.inner().state.read().unwrap();
        assert_eq!(state.incoming[0].out, "*");
        assert_eq!(state.incoming[0].input, "*");
    }

    #[test]
    fn test_named_edge_delivery_renames_field() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope.node("sink", NodeConfig::new()).unwrap();
        let mut keymap = KeyMap::new();
        keymap.insert("x".to_string(), "y".to_string());
        to.wire_from(&from, keymap, false);

        let edge = to.inner().state.read().unwrap().incoming[0].clone();
        to.inner()
            .receive_inputs(&edge, &values(json!({"x": 7, "other": true})));

        assert_eq!(to.inner().current_inputs(), values(json!({"y": 7})));
        assert!(to
            .inner()
            .state
            .read()
            .unwrap()
            .received_from
            .contains(from.id()));
    }

    #[test]
    fn test_wildcard_delivery_copies_everything_unrenamed() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope.node("sink", NodeConfig::from(&from)).unwrap();

        let edge = to.inner().state.read().unwrap().incoming[0].clone();
        to.inner().receive_inputs(&edge, &values(json!({"x": 1, "y": 2})));

        assert_eq!(to.inner().current_inputs(), values(json!({"x": 1, "y": 2})));
    }

    #[test]
    fn test_control_delivery_copies_nothing() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope.node("sink", NodeConfig::new()).unwrap();
        to.wire_from(&from, KeyMap::new(), false);

        let edge = to.inner().state.read().unwrap().incoming[0].clone();
        to.inner().receive_inputs(&edge, &values(json!({"x": 1})));

        assert!(to.inner().current_inputs().is_empty());
        assert!(to
            .inner()
            .state
            .read()
            .unwrap()
            .received_from
            .contains(from.id()));
    }

    #[test]
    fn test_constant_delivery_survives_reset() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope.node("sink", NodeConfig::new()).unwrap();
        let mut keymap = KeyMap::new();
        keymap.insert("x".to_string(), "x".to_string());
        to.wire_from(&from, keymap, true);

        let edge = to.inner().state.read().unwrap().incoming[0].clone();
        to.inner().receive_inputs(&edge, &values(json!({"x": 42})));
        to.inner().complete(values(json!({"done": true})));

        // The post-fire reset restores configuration plus constants.
        assert_eq!(to.inner().current_inputs(), values(json!({"x": 42})));
    }

    #[test]
    fn test_readiness_requires_all_named_keys() {
        let scope = Scope::new();
        let p_source = scope.node("source", NodeConfig::new()).unwrap();
        let q_source = scope.node("source", NodeConfig::new()).unwrap();
        let join = scope.node("join", NodeConfig::new()).unwrap();
        let mut keymap = KeyMap::new();
        keymap.insert("p".to_string(), "p".to_string());
        join.wire_from(&p_source, keymap, false);
        let mut keymap = KeyMap::new();
        keymap.insert("q".to_string(), "q".to_string());
        join.wire_from(&q_source, keymap, false);

        assert!(!join.inner().is_ready());

        let p_edge = join.inner().state.read().unwrap().incoming[0].clone();
        join.inner().receive_inputs(&p_edge, &values(json!({"p": 1})));
        assert!(!join.inner().is_ready());

        let q_edge = join.inner().state.read().unwrap().incoming[1].clone();
        join.inner().receive_inputs(&q_edge, &values(json!({"q": 2})));
        assert!(join.inner().is_ready());
    }

    #[test]
    fn test_readiness_requires_fresh_delivery_after_firing() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope.node("sink", NodeConfig::new()).unwrap();
        let mut keymap = KeyMap::new();
        keymap.insert("x".to_string(), "x".to_string());
        to.wire_from(&from, keymap, true);

        let edge = to.inner().state.read().unwrap().incoming[0].clone();
        to.inner().receive_inputs(&edge, &values(json!({"x": 1})));
        assert!(to.inner().is_ready());

        to.inner().complete(values(json!({})));
        // The constant keeps x present, but no fresh delivery arrived.
        assert!(!to.inner().is_ready());

        to.inner().receive_inputs(&edge, &values(json!({"x": 2})));
        assert!(to.inner().is_ready());
    }

    #[test]
    fn test_readiness_stays_true_until_firing() {
        let scope = Scope::new();
        let from = scope.node("source", NodeConfig::new()).unwrap();
        let to = scope.node("sink", NodeConfig::new()).unwrap();
        let mut keymap = KeyMap::new();
        keymap.insert("x".to_string(), "x".to_string());
        to.wire_from(&from, keymap, false);

        let edge = to.inner().state.read().unwrap().incoming[0].clone();
        to.inner().receive_inputs(&edge, &values(json!({"x": 1})));

        // Further deliveries never retract readiness.
        assert!(to.inner().is_ready());
        to.inner().receive_inputs(&edge, &values(json!({"x": 2})));
        assert!(to.inner().is_ready());
    }

    #[tokio::test]
    async fn test_settle_once_keeps_first_firing() {
        let scope = Scope::new();
        let node = scope.node("source", NodeConfig::new()).unwrap();

        node.inner().complete(values(json!({"n": 1})));
        node.inner().complete(values(json!({"n": 2})));

        // Observers always see the first firing; outputs track the latest.
        assert_eq!(node.settled().await.unwrap(), values(json!({"n": 1})));
        assert_eq!(node.outputs(), Some(values(json!({"n": 2}))));
    }

    #[tokio::test]
    async fn test_failure_settles_once() {
        let scope = Scope::new();
        let node = scope.node("source", NodeConfig::new()).unwrap();

        node.inner().fail(NodeFailure {
            node: node.id().to_string(),
            message: "boom".to_string(),
            cause: None,
        });

        let err = node.settled().await.unwrap_err();
        assert!(matches!(err, GraphError::NodeFailed { .. }));
    }
}
