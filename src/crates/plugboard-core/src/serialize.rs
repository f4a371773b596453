//! Graph-to-descriptor serialization, including closure compilation
//!
//! Serialization flattens a connected component into a
//! [`GraphDescriptor`]: plain nodes are emitted verbatim as
//! `{id, type, configuration}`, while closure nodes are compiled.
//!
//! A [`Builder`](crate::InlineFn::Builder) closure is executed once in a
//! fresh child scope flagged serializing, with a synthetic `input` node as
//! its argument and a synthetic `output` node as the sink. Whatever the
//! builder returns is wired into the sink, and the sink's reachable
//! component becomes a nested descriptor recorded under `graphs[id]`; the
//! original node is rewritten to `{type: "invoke", configuration: {graph:
//! "#<id>"}}`. If the dry run resolves a live value, the suspension signal
//! aborts introspection and the node falls back to the source path.
//!
//! The source path (taken directly for
//! [`Effectful`](crate::InlineFn::Effectful) closures) emits a
//! `runJavascript` node from the declared source text, normalizing an
//! arrow function into an equivalent named function declaration (the name
//! is the node id with hyphens replaced by underscores, preserving a
//! leading `async`). Source matching neither recognized shape is a
//! serialization error.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use regex::{Captures, Regex};
use serde_json::json;

use crate::descriptor::{EdgeDescriptor, GraphDescriptor, GraphMetadata, NodeDescriptor};
use crate::error::{GraphError, Result};
use crate::handler::{Emit, InlineFn, NodeContext, Outcome};
use crate::node::{
    wildcard_keymap, NodeConfig, NodeHandle, NodeInner, NodeValue, CLOSURE, INPUT, INVOKE,
    OUTPUT, RUN_JAVASCRIPT,
};
use crate::scope::{discover_component, Scope};

impl Scope {
    /// Serialize the connected component around `node` into a portable
    /// descriptor, compiling inline closures into nested subgraphs or
    /// source-bearing nodes.
    pub async fn serialize(
        &self,
        node: &NodeHandle,
        metadata: GraphMetadata,
    ) -> Result<GraphDescriptor> {
        serialize_component(node.inner().clone(), metadata).await
    }
}

pub(crate) fn serialize_component(
    anchor: Arc<NodeInner>,
    metadata: GraphMetadata,
) -> BoxFuture<'static, Result<GraphDescriptor>> {
    Box::pin(async move {
        let component = discover_component(&anchor);

        let mut graphs = BTreeMap::new();
        let mut nodes = Vec::with_capacity(component.len());
        for node in &component {
            let (descriptor, subgraph) = serialize_node(node).await?;
            if let Some(graph) = subgraph {
                graphs.insert(node.id.clone(), graph);
            }
            nodes.push(descriptor);
        }

        let mut edges = Vec::new();
        for node in &component {
            let outgoing = node.state.read().unwrap().outgoing.clone();
            for edge in outgoing {
                let (Some(from), Some(to)) = (edge.from.upgrade(), edge.to.upgrade()) else {
                    continue;
                };
                edges.push(EdgeDescriptor {
                    from: from.id.clone(),
                    to: to.id.clone(),
                    out: edge.out.clone(),
                    input: edge.input.clone(),
                    constant: edge.constant,
                });
            }
        }

        Ok(GraphDescriptor {
            metadata,
            nodes,
            edges,
            graphs,
        })
    })
}

/// Serialize one node. Nodes of ordinary types are emitted verbatim;
/// closure nodes compile to either an `invoke` node plus a nested
/// descriptor, or a `runJavascript` node carrying normalized source.
async fn serialize_node(
    node: &Arc<NodeInner>,
) -> Result<(NodeDescriptor, Option<GraphDescriptor>)> {
    let mut descriptor = node.descriptor();
    if node.node_type != CLOSURE {
        return Ok((descriptor, None));
    }

    let inline = node.inline.as_ref().ok_or_else(|| {
        GraphError::Serialization(format!("closure node '{}' carries no closure", node.id))
    })?;

    match inline {
        InlineFn::Builder { build, source } => {
            let declaring = node.scope.upgrade().ok_or_else(|| {
                GraphError::Internal(format!("scope of node '{}' dropped", node.id))
            })?;
            let child = Scope::serializing_child(vec![declaring]);
            let input_node = child.node(INPUT, NodeConfig::new())?;
            let output_node = child.node(OUTPUT, NodeConfig::new())?;
            let ctx = NodeContext {
                node: NodeHandle::from_inner(node.clone()),
                scope: child.clone(),
            };

            match build(input_node, ctx).await {
                Ok(outcome) => {
                    let graph = compile_outcome(outcome, &output_node).await?;
                    descriptor.node_type = INVOKE.to_string();
                    descriptor
                        .configuration
                        .insert("graph".to_string(), json!(format!("#{}", node.id)));
                    Ok((descriptor, Some(graph)))
                }
                // The builder resolved a live value: introspection is
                // impossible, fall back to its declared source.
                Err(GraphError::SerializeSuspend) => {
                    source_descriptor(node, source.as_deref(), descriptor)
                }
                Err(e) => Err(e),
            }
        }
        InlineFn::Effectful { source, .. } => {
            source_descriptor(node, source.as_deref(), descriptor)
        }
    }
}

/// Wire a builder's outcome into the synthetic sink node and serialize the
/// sink's reachable component as the nested subgraph.
async fn compile_outcome(outcome: Outcome, output_node: &NodeHandle) -> Result<GraphDescriptor> {
    match outcome {
        Outcome::Node(result) => {
            // An output node returned by the builder is the subgraph; any
            // other node gets its outputs wired into the sink wholesale.
            if result.node_type() == OUTPUT {
                return serialize_component(result.inner().clone(), GraphMetadata::default())
                    .await;
            }
            output_node.wire_from(&result, wildcard_keymap(), false);
        }
        Outcome::Value(value) => {
            let (from, keymap, constant) = value.into_node_input();
            output_node.wire_from(&from, keymap, constant);
        }
        Outcome::Values(fields) => {
            for (key, emit) in fields {
                wire_field(output_node, key, emit)?;
            }
        }
        Outcome::Literal(value) => match value {
            NodeValue::Object(map) => {
                for (key, value) in map {
                    output_node.inner().set_configuration_value(key, value);
                }
            }
            NodeValue::Null => {}
            other => {
                output_node
                    .inner()
                    .set_configuration_value("result".to_string(), other);
            }
        },
    }
    serialize_component(output_node.inner().clone(), GraphMetadata::default()).await
}

fn wire_field(output_node: &NodeHandle, key: String, emit: Emit) -> Result<()> {
    match emit {
        Emit::Literal(value) => {
            output_node.inner().set_configuration_value(key, value);
        }
        Emit::Node(from) => {
            let mut keymap = crate::node::KeyMap::new();
            keymap.insert(key.clone(), key);
            output_node.wire_from(&from, keymap, false);
        }
        Emit::Value(value) => {
            let (from, keymap, constant) = value.rename(key.as_str())?.into_node_input();
            output_node.wire_from(&from, keymap, constant);
        }
    }
    Ok(())
}

/// Emit a `runJavascript` node from declared source text.
fn source_descriptor(
    node: &Arc<NodeInner>,
    source: Option<&str>,
    mut descriptor: NodeDescriptor,
) -> Result<(NodeDescriptor, Option<GraphDescriptor>)> {
    let source = source.ok_or_else(|| {
        GraphError::Serialization(format!(
            "closure node '{}' has no declared source to serialize",
            node.id
        ))
    })?;
    let (code, name) = normalize_source(source, &node.id)?;
    descriptor.node_type = RUN_JAVASCRIPT.to_string();
    descriptor.configuration.insert("code".to_string(), json!(code));
    descriptor.configuration.insert("name".to_string(), json!(name));
    Ok((descriptor, None))
}

fn arrow_function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:async\s+)?(\w+|\([^)]*\))\s*=>\s*").expect("valid arrow-function regex")
    })
}

fn named_function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:async\s+)?function\s+(\w+)\s*\(([^)]*)\)\s*\{")
            .expect("valid named-function regex")
    })
}

/// Normalize declared source into a named function declaration.
///
/// Arrow functions are rewritten in place: the arrow head becomes
/// `function <name>(<params>)`, where the name is `id` with hyphens
/// replaced by underscores, keeping a leading `async`. Traditional
/// function declarations keep their code and contribute their own name.
pub(crate) fn normalize_source(code: &str, id: &str) -> Result<(String, String)> {
    let name = id.replace('-', "_");

    if arrow_function_re().is_match(code) {
        let is_async = code.trim_start().starts_with("async");
        let rewritten = arrow_function_re().replace(code, |caps: &Captures| {
            let params = caps[1].to_string();
            let params = if params.starts_with('(') {
                params
            } else {
                format!("({})", params)
            };
            let async_prefix = if is_async { "async " } else { "" };
            format!("{}function {}{} ", async_prefix, name, params)
        });
        return Ok((rewritten.into_owned(), name));
    }

    if let Some(caps) = named_function_re().captures(code) {
        let declared = caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or(name);
        return Ok((code.to_string(), declared));
    }

    Err(GraphError::Serialization(format!(
        "source of '{}' matches no recognized function shape",
        id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{InputValues, KeyMap};
    use serde_json::json;

    fn values(value: NodeValue) -> InputValues {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_normalize_async_arrow_function() {
        let code = "async (inputs) => { const {a, b} = await inputs; return {result: a + b}; }";
        let (code, name) = normalize_source(code, "sum-step").unwrap();
        assert_eq!(name, "sum_step");
        assert_eq!(
            code,
            "async function sum_step(inputs) { const {a, b} = await inputs; return {result: a + b}; }"
        );
    }

    #[test]
    fn test_normalize_bare_param_arrow_function() {
        let (code, name) = normalize_source("x => ({doubled: x * 2})", "dbl-0").unwrap();
        assert_eq!(name, "dbl_0");
        assert_eq!(code, "function dbl_0(x) ({doubled: x * 2})");
    }

    #[test]
    fn test_named_function_keeps_declared_name() {
        let source = "function add(a, b) { return a + b; }";
        let (code, name) = normalize_source(source, "fn-9").unwrap();
        assert_eq!(name, "add");
        assert_eq!(code, source);
    }

    #[test]
    fn test_unrecognized_source_is_an_error() {
        assert!(matches!(
            normalize_source("class Widget {}", "fn-1"),
            Err(GraphError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_graph_serializes_verbatim() {
        let scope = Scope::new();
        let a = scope
            .node(
                "template",
                NodeConfig::new()
                    .with_id("template-1")
                    .constant("template", json!("hello {name}")),
            )
            .unwrap();
        let b = scope
            .node("render", NodeConfig::new().with_id("render-1"))
            .unwrap();
        let mut keymap = KeyMap::new();
        keymap.insert("prompt".to_string(), "text".to_string());
        b.wire_from(&a, keymap, false);

        let graph = scope.serialize(&a, GraphMetadata::default()).await.unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.nodes[0].id, "template-1");
        assert_eq!(
            graph.nodes[0].configuration,
            values(json!({"template": "hello {name}"}))
        );
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].out, "prompt");
        assert_eq!(graph.edges[0].input, "text");
        assert!(graph.graphs.is_empty());
        assert!(graph.validate().is_ok());
    }

    #[tokio::test]
    async fn test_builder_compiles_to_subgraph() {
        let scope = Scope::new();
        let node = scope
            .inline(
                InlineFn::builder(|input: NodeHandle, _ctx| async move {
                    Ok(Outcome::Value(input.output("text")))
                }),
                NodeConfig::new().with_id("pass-1"),
            )
            .unwrap();

        let graph = scope
            .serialize(&node, GraphMetadata::default())
            .await
            .unwrap();

        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].node_type, "invoke");
        assert_eq!(
            graph.nodes[0].configuration.get("graph"),
            Some(&json!("#pass-1"))
        );

        let subgraph = graph.graphs.get("pass-1").unwrap();
        let types: Vec<&str> = subgraph.nodes.iter().map(|n| n.node_type.as_str()).collect();
        assert!(types.contains(&"input"));
        assert!(types.contains(&"output"));
        assert_eq!(subgraph.edges.len(), 1);
        assert_eq!(subgraph.edges[0].out, "text");
        assert_eq!(subgraph.edges[0].input, "text");
        assert!(subgraph.validate().is_ok());
    }

    #[tokio::test]
    async fn test_builder_literal_becomes_sink_configuration() {
        let scope = Scope::new();
        let node = scope
            .inline(
                InlineFn::builder(|_input, _ctx| async move {
                    Ok(Outcome::Literal(json!(42)))
                }),
                NodeConfig::new().with_id("const-1"),
            )
            .unwrap();

        let graph = scope
            .serialize(&node, GraphMetadata::default())
            .await
            .unwrap();
        let subgraph = graph.graphs.get("const-1").unwrap();
        let sink = subgraph
            .nodes
            .iter()
            .find(|n| n.node_type == "output")
            .unwrap();
        assert_eq!(sink.configuration.get("result"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_suspending_builder_falls_back_to_source() {
        let scope = Scope::new();
        let source = "async (inputs) => { const {a, b} = await inputs; return {result: a + b}; }";
        let node = scope
            .inline(
                InlineFn::builder_with_source(
                    |input: NodeHandle, _ctx| async move {
                        // Resolving the live inputs is a real suspension.
                        let a = input.output("a").resolve().await?;
                        Ok(Outcome::Literal(a))
                    },
                    source,
                ),
                NodeConfig::new().with_id("sum-step"),
            )
            .unwrap();

        let graph = scope
            .serialize(&node, GraphMetadata::default())
            .await
            .unwrap();

        assert!(graph.graphs.is_empty());
        assert_eq!(graph.nodes[0].node_type, "runJavascript");
        assert_eq!(graph.nodes[0].configuration.get("name"), Some(&json!("sum_step")));
        let code = graph.nodes[0]
            .configuration
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap();
        assert!(code.starts_with("async function sum_step(inputs) "));
    }

    #[tokio::test]
    async fn test_effectful_without_source_is_an_error() {
        let scope = Scope::new();
        let node = scope
            .inline(
                InlineFn::effectful(|inputs, _ctx| async move { Ok(inputs) }),
                NodeConfig::new(),
            )
            .unwrap();

        assert!(matches!(
            scope.serialize(&node, GraphMetadata::default()).await,
            Err(GraphError::Serialization(_))
        ));
    }
}
