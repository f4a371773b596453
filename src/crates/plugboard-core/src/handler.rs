//! Handler contracts: registered handlers, inline closures, and kits
//!
//! A registered handler is an async function from an input bundle to an
//! output bundle. It receives a [`NodeContext`] carrying the firing node and
//! the per-firing execution scope, through which it may construct and
//! resolve subgraphs of its own (recursive composition).
//!
//! Inline closures declare their serialization mode up front:
//!
//! - [`InlineFn::Builder`] closures are pure graph builders. They receive a
//!   node handle exposing the (future) inputs and return an [`Outcome`]
//!   describing what to wire to the sink. Builders are safe to dry-run, so
//!   the serializer compiles them into nested subgraphs.
//! - [`InlineFn::Effectful`] closures receive resolved inputs and do real
//!   work. Only source-text serialization is possible for them, from the
//!   source declared at construction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{GraphError, Result};
use crate::node::{InputValues, NodeHandle, NodeValue, OutputValues};
use crate::scope::Scope;
use crate::value::Value;

/// Context passed to every handler invocation.
#[derive(Clone)]
pub struct NodeContext {
    /// The node being fired
    pub node: NodeHandle,
    /// Execution scope for this firing: the calling scope's handlers shadow
    /// those of the scope the node was declared in
    pub scope: Arc<Scope>,
}

/// A registered handler: async function from inputs to outputs.
pub type HandlerFn =
    Arc<dyn Fn(InputValues, NodeContext) -> BoxFuture<'static, Result<OutputValues>> + Send + Sync>;

/// A kit handler: accepts an already-resolved input bundle, no context.
pub type KitHandlerFn =
    Arc<dyn Fn(InputValues) -> BoxFuture<'static, Result<OutputValues>> + Send + Sync>;

/// A graph-builder closure: receives the inputs node and returns what to
/// wire to the sink.
pub type BuilderFn =
    Arc<dyn Fn(NodeHandle, NodeContext) -> BoxFuture<'static, Result<Outcome>> + Send + Sync>;

/// Wrap a plain async closure into a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(InputValues) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<OutputValues>> + Send + 'static,
{
    Arc::new(move |inputs, _ctx| Box::pin(f(inputs)))
}

/// Wrap a plain async closure that wants the context into a [`HandlerFn`].
pub fn handler_with_context<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(InputValues, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<OutputValues>> + Send + 'static,
{
    Arc::new(move |inputs, ctx| Box::pin(f(inputs, ctx)))
}

/// What an inline graph builder returns, decided at construction time and
/// pattern-matched by the scheduler and the serializer.
pub enum Outcome {
    /// The result is a node; its outputs become the closure's outputs
    Node(NodeHandle),
    /// The result is a projection; it is wired under its projected name
    Value(Value),
    /// A mapping of output keys to literals, nodes, or projections
    Values(BTreeMap<String, Emit>),
    /// A plain value; non-objects are wrapped under the key `result`
    Literal(NodeValue),
}

/// One field of an [`Outcome::Values`] mapping.
pub enum Emit {
    /// A plain value
    Literal(NodeValue),
    /// The same-named output of a node
    Node(NodeHandle),
    /// A projection, resolved or wired under the field's key
    Value(Value),
}

/// An inline closure carried by a node of the closure type, with its
/// declared serialization mode.
#[derive(Clone)]
pub enum InlineFn {
    /// Pure graph builder: safe to dry-run for serialization.
    Builder {
        /// The builder function
        build: BuilderFn,
        /// Declared source text, used as a fallback if the builder turns
        /// out to resolve live values during the dry run
        source: Option<String>,
    },
    /// Effectful closure: never dry-run; serialized from declared source.
    Effectful {
        /// The closure to invoke with resolved inputs
        invoke: HandlerFn,
        /// Declared source text for serialization
        source: Option<String>,
    },
}

impl InlineFn {
    /// A graph builder with no declared source.
    pub fn builder<F, Fut>(f: F) -> Self
    where
        F: Fn(NodeHandle, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Outcome>> + Send + 'static,
    {
        Self::Builder {
            build: Arc::new(move |inputs, ctx| Box::pin(f(inputs, ctx))),
            source: None,
        }
    }

    /// A graph builder with declared source text as serialization fallback.
    pub fn builder_with_source<F, Fut>(f: F, source: impl Into<String>) -> Self
    where
        F: Fn(NodeHandle, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Outcome>> + Send + 'static,
    {
        Self::Builder {
            build: Arc::new(move |inputs, ctx| Box::pin(f(inputs, ctx))),
            source: Some(source.into()),
        }
    }

    /// An effectful closure with no declared source (not serializable).
    pub fn effectful<F, Fut>(f: F) -> Self
    where
        F: Fn(InputValues, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<OutputValues>> + Send + 'static,
    {
        Self::Effectful {
            invoke: Arc::new(move |inputs, ctx| Box::pin(f(inputs, ctx))),
            source: None,
        }
    }

    /// An effectful closure with declared source text.
    pub fn effectful_with_source<F, Fut>(f: F, source: impl Into<String>) -> Self
    where
        F: Fn(InputValues, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<OutputValues>> + Send + 'static,
    {
        Self::Effectful {
            invoke: Arc::new(move |inputs, ctx| Box::pin(f(inputs, ctx))),
            source: Some(source.into()),
        }
    }
}

/// A named collection of resolved-input handlers, registered wholesale into
/// a scope. The scope wraps each one to conform to the handler contract.
#[derive(Default, Clone)]
pub struct Kit {
    pub(crate) handlers: HashMap<String, KitHandlerFn>,
}

impl Kit {
    /// An empty kit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler under `name`.
    pub fn add<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(InputValues) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<OutputValues>> + Send + 'static,
    {
        self.handlers
            .insert(name.into(), Arc::new(move |inputs| Box::pin(f(inputs))));
        self
    }
}

/// Handler installed under the reserved `input`/`output` type names. Those
/// types are driven by the step-wise traversal and the serializer; firing
/// one eagerly is a misuse.
pub(crate) fn reserved(name: &'static str) -> HandlerFn {
    Arc::new(move |_inputs, _ctx| {
        Box::pin(async move { Err(GraphError::ReservedType(name.to_string())) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(value: NodeValue) -> InputValues {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_kit_handlers_receive_resolved_inputs() {
        let kit = Kit::new().add("echo", |inputs: InputValues| async move {
            Ok(inputs)
        });
        let scope = Scope::new();
        scope.add_kit(kit);

        let handler = scope.resolve_handler("echo").unwrap();
        let node = scope.node("echo", crate::node::NodeConfig::new()).unwrap();
        let ctx = NodeContext {
            node,
            scope: scope.clone(),
        };
        let outputs = handler(values(json!({"a": 1})), ctx).await.unwrap();
        assert_eq!(outputs, values(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_reserved_handler_refuses_to_fire() {
        let handler = reserved("input");
        let scope = Scope::new();
        let node = scope.node("input", crate::node::NodeConfig::new()).unwrap();
        let ctx = NodeContext {
            node,
            scope: scope.clone(),
        };
        let err = handler(InputValues::new(), ctx).await.unwrap_err();
        assert!(matches!(err, GraphError::ReservedType(name) if name == "input"));
    }
}
