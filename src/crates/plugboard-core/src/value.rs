//! Renameable, resolvable projections of a node's future output
//!
//! A [`Value`] borrows a node and carries a keymap from the node's output
//! keys to the names a consumer should see. Projections are cheap to clone;
//! several may reference the same node concurrently with different
//! remappings. [`memoize`](Value::memoize) marks the projection constant, so
//! edges wired from it persist their deliveries across firing cycles.

use crate::error::{GraphError, Result};
use crate::node::{KeyMap, NodeConfig, NodeHandle, NodeTarget, NodeValue};

/// A view over a node plus a key remapping and a constant flag.
#[derive(Clone)]
pub struct Value {
    pub(crate) node: NodeHandle,
    pub(crate) keymap: KeyMap,
    pub(crate) constant: bool,
}

impl Value {
    pub(crate) fn with_keymap(node: NodeHandle, keymap: KeyMap, constant: bool) -> Self {
        Self {
            node,
            keymap,
            constant,
        }
    }

    /// The node this projection borrows.
    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    /// Rename a single-key projection.
    ///
    /// Fails on a multi-key projection; use [`project`](Self::project) with
    /// a full keymap for those.
    pub fn rename(&self, key: impl Into<String>) -> Result<Value> {
        if self.keymap.len() != 1 {
            return Err(GraphError::Projection(format!(
                "cannot rename a projection of {} keys with a single name",
                self.keymap.len()
            )));
        }
        let out = self.keymap.keys().next().cloned().unwrap_or_default();
        let mut keymap = KeyMap::new();
        keymap.insert(out, key.into());
        Ok(Value::with_keymap(self.node.clone(), keymap, self.constant))
    }

    /// Remap this projection's names through another keymap.
    ///
    /// A pair `(from, to)` where `to` names an existing source key of this
    /// projection chains: `from` adopts that key's target name and the old
    /// entry is dropped. Any other pair adds a fresh mapping.
    pub fn project(&self, keymap: KeyMap) -> Value {
        Value::with_keymap(
            self.node.clone(),
            self.remap_keys(keymap),
            self.constant,
        )
    }

    /// Mark this projection constant: edges wired from it deliver values
    /// that persist in the destination across firing cycles.
    pub fn memoize(&self) -> Value {
        Value::with_keymap(self.node.clone(), self.keymap.clone(), true)
    }

    /// Wire this projection into `target` via its keymap, creating the
    /// target node first when given a type name or closure.
    pub fn to(
        &self,
        target: impl Into<NodeTarget>,
        config: impl Into<NodeConfig>,
    ) -> Result<NodeHandle> {
        let target = match target.into() {
            NodeTarget::Node(node) => node,
            other => {
                // Create the node in the borrowed node's scope, then wire.
                let scope = self.node.scope()?;
                match other {
                    NodeTarget::Type(node_type) => scope.node(&node_type, config.into())?,
                    NodeTarget::Inline(inline) => scope.inline(inline, config.into())?,
                    NodeTarget::Node(_) => unreachable!(),
                }
            }
        };
        target.wire_from(&self.node, self.keymap.clone(), self.constant);
        Ok(target)
    }

    /// Wire inputs into the borrowed node through this projection's
    /// inverted keymap, so the names a consumer sees map back onto the
    /// node's own input keys.
    pub fn feed(&self, inputs: impl Into<NodeConfig>) -> Result<()> {
        let inverted: KeyMap = self
            .keymap
            .iter()
            .map(|(out, input)| (input.clone(), out.clone()))
            .collect();
        feed_through(&self.node, inverted, inputs.into())
    }

    /// Resolve this projection to a single value: triggers execution of the
    /// borrowed node's component and extracts the projected field.
    ///
    /// Fails if the keymap has more than one entry.
    pub async fn resolve(&self) -> Result<NodeValue> {
        if self.keymap.len() != 1 {
            return Err(GraphError::Projection(format!(
                "cannot resolve a projection of {} keys as a scalar",
                self.keymap.len()
            )));
        }
        let out_key = self.keymap.keys().next().cloned().unwrap_or_default();
        let outputs = self.node.resolve().await?;
        Ok(outputs.get(&out_key).cloned().unwrap_or(NodeValue::Null))
    }

    pub(crate) fn into_node_input(self) -> (NodeHandle, KeyMap, bool) {
        (self.node, self.keymap, self.constant)
    }

    fn remap_keys(&self, new_keys: KeyMap) -> KeyMap {
        let mut merged = self.keymap.clone();
        for (from_key, to_key) in new_keys {
            if let Some(chained) = merged.remove(&to_key) {
                merged.insert(from_key, chained);
            } else {
                merged.insert(from_key, to_key);
            }
        }
        merged
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("node", &self.node.id())
            .field("keymap", &self.keymap)
            .field("constant", &self.constant)
            .finish()
    }
}

fn feed_through(node: &NodeHandle, inverted: KeyMap, inputs: NodeConfig) -> Result<()> {
    use crate::node::ConfigSource;
    match inputs.source {
        ConfigSource::Empty => Ok(()),
        ConfigSource::Node(from) => {
            node.wire_from(&from, inverted, false);
            Ok(())
        }
        ConfigSource::Value(value) => {
            let remapped = value.project(inverted);
            let (from, keymap, _) = remapped.into_node_input();
            node.wire_from(&from, keymap, false);
            Ok(())
        }
        ConfigSource::Entries(entries) => node.apply_entries(entries, false),
    }
}
