//! Observability probe for step-wise execution
//!
//! A probe observes input/output checkpoints and firings, and may veto a
//! firing by substituting a result of its own. Every hook is defaulted; the
//! engine tolerates running without a probe, in which case all nodes fire
//! normally.

use async_trait::async_trait;

use crate::descriptor::NodeDescriptor;
use crate::node::{InputValues, OutputValues};

/// External event sink for step-wise runs.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Called when a node is about to fire. Returning `Some(outputs)`
    /// vetoes the real handler call and uses the returned bundle instead.
    async fn before_handler(
        &self,
        _node: &NodeDescriptor,
        _inputs: &InputValues,
    ) -> Option<OutputValues> {
        None
    }

    /// Called after a node fired (or was substituted) with the realized
    /// outputs. Purely observational.
    async fn on_node(
        &self,
        _node: &NodeDescriptor,
        _inputs: &InputValues,
        _outputs: &OutputValues,
    ) {
    }

    /// Called when an input checkpoint was resumed with external values.
    async fn on_input(
        &self,
        _node: &NodeDescriptor,
        _inputs: &InputValues,
        _provided: &OutputValues,
    ) {
    }

    /// Called when an output checkpoint is reached.
    async fn on_output(&self, _node: &NodeDescriptor, _outputs: &InputValues) {}
}
