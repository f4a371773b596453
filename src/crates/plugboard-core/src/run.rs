//! Step-wise graph execution with suspend/resume checkpoints
//!
//! [`StepRun`] drives the same worklist/propagation algorithm as the eager
//! traversal, but classifies each popped node before firing and hands
//! control back to the caller at every boundary:
//!
//! - a node of the reserved `input` type suspends with
//!   [`StepEvent::Input`]; the caller resumes with
//!   [`Resume::Inputs`], and those values become the node's fired output
//!   (no handler runs)
//! - a node of the reserved `output` type suspends with
//!   [`StepEvent::Output`], exposing its inputs as final outputs; it fires
//!   with an empty bundle, so nothing but control propagates downstream
//! - any other node suspends with [`StepEvent::BeforeHandler`]; on resume
//!   the probe may veto the firing and substitute a result, the caller may
//!   substitute one with [`Resume::Substitute`], and otherwise the handler
//!   fires for real; either way the probe's `on_node` hook then observes
//!   the realized outputs without suspending
//!
//! Suspension is cooperative and single-threaded: only one checkpoint is
//! outstanding at a time, and the traversal does not proceed until
//! [`step`](StepRun::step) is called again. Abandoning a run simply leaves
//! it paused; no timeout is enforced here.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Map;
use tracing::debug;

use crate::descriptor::NodeDescriptor;
use crate::error::{GraphError, Result};
use crate::node::{InputValues, NodeInner, OutputValues, INPUT, OUTPUT};
use crate::probe::Probe;
use crate::scope::{deliver, fire_node, Scope};

/// A checkpoint produced by [`StepRun::step`].
#[derive(Debug)]
pub enum StepEvent {
    /// The run is suspended at an external-input node; resume with
    /// [`Resume::Inputs`] to supply its values.
    Input {
        /// Descriptor of the suspended node
        node: NodeDescriptor,
        /// The node's current working inputs (bound values, if any)
        inputs: InputValues,
    },
    /// The run is suspended at an output node exposing final values.
    Output {
        /// Descriptor of the suspended node
        node: NodeDescriptor,
        /// The final output bundle
        outputs: OutputValues,
    },
    /// The run is suspended just before firing a handler node.
    BeforeHandler {
        /// Descriptor of the node about to fire
        node: NodeDescriptor,
        /// The inputs the handler would receive
        inputs: InputValues,
    },
    /// The worklist is empty; the run is complete.
    Done,
}

/// How to resume a suspended [`StepRun`].
#[derive(Debug)]
pub enum Resume {
    /// Start the run (first call only; equivalent to `Continue`)
    Start,
    /// Proceed normally
    Continue,
    /// Supply external input values at an input checkpoint
    Inputs(OutputValues),
    /// Veto the pending firing and use these outputs instead
    Substitute(OutputValues),
}

enum PendingKind {
    Input,
    Output,
    BeforeHandler,
}

struct Pending {
    node: Arc<NodeInner>,
    kind: PendingKind,
    inputs: InputValues,
}

/// A step-wise traversal over one connected component.
pub struct StepRun {
    scope: Arc<Scope>,
    queue: VecDeque<Arc<NodeInner>>,
    queued: HashSet<String>,
    pending: Option<Pending>,
    probe: Option<Arc<dyn Probe>>,
}

impl StepRun {
    pub(crate) fn new(
        scope: Arc<Scope>,
        queue: VecDeque<Arc<NodeInner>>,
        queued: HashSet<String>,
        probe: Option<Arc<dyn Probe>>,
    ) -> Self {
        Self {
            scope,
            queue,
            queued,
            pending: None,
            probe,
        }
    }

    /// Consume the outstanding checkpoint (if any) with `resume`, then
    /// advance to the next checkpoint or [`StepEvent::Done`].
    pub async fn step(&mut self, resume: Resume) -> Result<StepEvent> {
        if let Some(pending) = self.pending.take() {
            let descriptor = pending.node.descriptor();
            let outputs: OutputValues = match pending.kind {
                PendingKind::Input => {
                    let provided = match resume {
                        Resume::Inputs(values) | Resume::Substitute(values) => values,
                        _ => Map::new(),
                    };
                    if let Some(probe) = &self.probe {
                        probe.on_input(&descriptor, &pending.inputs, &provided).await;
                    }
                    provided
                }
                // The output node is a sink: nothing but control propagates.
                PendingKind::Output => Map::new(),
                PendingKind::BeforeHandler => {
                    let substituted = match resume {
                        Resume::Substitute(values) => Some(values),
                        _ => match &self.probe {
                            Some(probe) => {
                                probe.before_handler(&descriptor, &pending.inputs).await
                            }
                            None => None,
                        },
                    };
                    let outputs = match substituted {
                        Some(values) => values,
                        None => fire_node(&self.scope, &pending.node).await?,
                    };
                    if let Some(probe) = &self.probe {
                        probe.on_node(&descriptor, &pending.inputs, &outputs).await;
                    }
                    outputs
                }
            };
            deliver(&pending.node, &outputs, &mut self.queue, &mut self.queued);
        }

        let Some(node) = self.queue.pop_front() else {
            return Ok(StepEvent::Done);
        };
        self.queued.remove(&node.id);
        if !node.is_ready() {
            return Err(GraphError::Internal(format!(
                "worklist node '{}' lacked required inputs at pop time",
                node.id
            )));
        }

        let descriptor = node.descriptor();
        let inputs = node.current_inputs();
        debug!(node = %node.id, node_type = %node.node_type, "suspending at checkpoint");

        match node.node_type.as_str() {
            INPUT => {
                self.pending = Some(Pending {
                    node,
                    kind: PendingKind::Input,
                    inputs: inputs.clone(),
                });
                Ok(StepEvent::Input {
                    node: descriptor,
                    inputs,
                })
            }
            OUTPUT => {
                if let Some(probe) = &self.probe {
                    probe.on_output(&descriptor, &inputs).await;
                }
                self.pending = Some(Pending {
                    node,
                    kind: PendingKind::Output,
                    inputs: inputs.clone(),
                });
                Ok(StepEvent::Output {
                    node: descriptor,
                    outputs: inputs,
                })
            }
            _ => {
                self.pending = Some(Pending {
                    node,
                    kind: PendingKind::BeforeHandler,
                    inputs: inputs.clone(),
                });
                Ok(StepEvent::BeforeHandler {
                    node: descriptor,
                    inputs,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler;
    use crate::node::{KeyMap, NodeConfig, NodeValue};
    use serde_json::json;

    fn values(value: NodeValue) -> InputValues {
        value.as_object().cloned().unwrap_or_default()
    }

    fn text_keymap() -> KeyMap {
        let mut keymap = KeyMap::new();
        keymap.insert("text".to_string(), "text".to_string());
        keymap
    }

    #[tokio::test]
    async fn test_input_to_output_checkpoints() {
        let scope = Scope::new();
        let a = scope.node("input", NodeConfig::new()).unwrap();
        let b = scope.node("output", NodeConfig::new()).unwrap();
        b.wire_from(&a, text_keymap(), false);

        let mut run = scope.run(&a);

        let event = run.step(Resume::Start).await.unwrap();
        let StepEvent::Input { node, .. } = event else {
            panic!("expected input checkpoint, got {:?}", event);
        };
        assert_eq!(node.node_type, "input");

        let event = run
            .step(Resume::Inputs(values(json!({"text": "hi"}))))
            .await
            .unwrap();
        let StepEvent::Output { outputs, .. } = event else {
            panic!("expected output checkpoint, got {:?}", event);
        };
        assert_eq!(outputs, values(json!({"text": "hi"})));

        let event = run.step(Resume::Continue).await.unwrap();
        assert!(matches!(event, StepEvent::Done));
    }

    #[tokio::test]
    async fn test_before_handler_fires_on_continue() {
        let scope = Scope::new();
        scope.register_handler("shout", handler(|inputs: InputValues| async move {
            let text = inputs.get("text").and_then(|v| v.as_str()).unwrap_or("");
            Ok(values(json!({"text": text.to_uppercase()})))
        }));

        let a = scope.node("input", NodeConfig::new()).unwrap();
        let b = scope.node("shout", NodeConfig::new()).unwrap();
        b.wire_from(&a, text_keymap(), false);
        let c = scope.node("output", NodeConfig::new()).unwrap();
        c.wire_from(&b, text_keymap(), false);

        let mut run = scope.run(&a);
        assert!(matches!(
            run.step(Resume::Start).await.unwrap(),
            StepEvent::Input { .. }
        ));
        assert!(matches!(
            run.step(Resume::Inputs(values(json!({"text": "hi"}))))
                .await
                .unwrap(),
            StepEvent::BeforeHandler { .. }
        ));

        let event = run.step(Resume::Continue).await.unwrap();
        let StepEvent::Output { outputs, .. } = event else {
            panic!("expected output checkpoint, got {:?}", event);
        };
        assert_eq!(outputs, values(json!({"text": "HI"})));
    }

    #[tokio::test]
    async fn test_before_handler_substitution_skips_handler() {
        let scope = Scope::new();
        scope.register_handler("never", handler(|_| async {
            Err(GraphError::Internal(
                "handler must not run when substituted".to_string(),
            ))
        }));

        let a = scope.node("input", NodeConfig::new()).unwrap();
        let b = scope.node("never", NodeConfig::new()).unwrap();
        b.wire_from(&a, text_keymap(), false);
        let c = scope.node("output", NodeConfig::new()).unwrap();
        c.wire_from(&b, text_keymap(), false);

        let mut run = scope.run(&a);
        run.step(Resume::Start).await.unwrap();
        run.step(Resume::Inputs(values(json!({"text": "hi"}))))
            .await
            .unwrap();

        let event = run
            .step(Resume::Substitute(values(json!({"text": "patched"}))))
            .await
            .unwrap();
        let StepEvent::Output { outputs, .. } = event else {
            panic!("expected output checkpoint, got {:?}", event);
        };
        assert_eq!(outputs, values(json!({"text": "patched"})));
    }

    #[tokio::test]
    async fn test_probe_substitution_vetoes_firing() {
        struct Veto;

        #[async_trait::async_trait]
        impl Probe for Veto {
            async fn before_handler(
                &self,
                _node: &NodeDescriptor,
                _inputs: &InputValues,
            ) -> Option<OutputValues> {
                Some(values(json!({"text": "vetoed"})))
            }
        }

        let scope = Scope::new();
        scope.register_handler("never", handler(|_| async {
            Err(GraphError::Internal(
                "handler must not run when the probe vetoes".to_string(),
            ))
        }));

        let a = scope.node("input", NodeConfig::new()).unwrap();
        let b = scope.node("never", NodeConfig::new()).unwrap();
        b.wire_from(&a, text_keymap(), false);
        let c = scope.node("output", NodeConfig::new()).unwrap();
        c.wire_from(&b, text_keymap(), false);

        let mut run = scope.run_with_probe(&a, Arc::new(Veto));
        run.step(Resume::Start).await.unwrap();
        run.step(Resume::Inputs(values(json!({"text": "hi"}))))
            .await
            .unwrap();

        let event = run.step(Resume::Continue).await.unwrap();
        let StepEvent::Output { outputs, .. } = event else {
            panic!("expected output checkpoint, got {:?}", event);
        };
        assert_eq!(outputs, values(json!({"text": "vetoed"})));

        let event = run.step(Resume::Continue).await.unwrap();
        assert!(matches!(event, StepEvent::Done));
    }
}
