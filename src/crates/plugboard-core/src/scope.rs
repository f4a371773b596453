//! Scopes: handler registries with parent-chain delegation, graph
//! discovery, and the eager worklist traversal
//!
//! A [`Scope`] owns the nodes created through it and resolves handler type
//! names, consulting its local registry first and then each parent in
//! declared order (first parent wins), recursively. Per-firing execution
//! scopes are built with the calling scope ahead of the declaring scope, so
//! handlers supplied by a caller shadow handlers registered when the graph
//! was authored, and handlers of an inner invocation shadow those upstream.
//!
//! Execution always operates over the whole connected component reachable
//! from any node touched, discovered by an undirected breadth-first
//! traversal over incoming and outgoing edges.
//!
//! # Ambient scope
//!
//! The primary way to reach a scope is explicit: node handles carry their
//! scope, and handlers receive one in their [`NodeContext`]. For authoring
//! ergonomics a thread-local *current scope* is also provided, bracketed
//! with stack discipline: [`Scope::enter`] pushes and returns a guard that
//! pops on drop, including during unwinding. The ambient scope is confined
//! to one logical thread of control; truly parallel execution must pass
//! scopes explicitly.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock, Weak};

use futures::future::BoxFuture;
use serde_json::Map;
use tracing::{debug, trace};

use crate::error::{GraphError, NodeFailure, Result};
use crate::handler::{reserved, Emit, HandlerFn, InlineFn, Kit, NodeContext, Outcome};
use crate::node::{
    NodeConfig, NodeHandle, NodeInner, NodeValue, OutputValues, CLOSURE, INPUT, OUTPUT,
};
use crate::run::StepRun;
use crate::probe::Probe;

thread_local! {
    static SCOPE_STACK: RefCell<Vec<Arc<Scope>>> = const { RefCell::new(Vec::new()) };
}

/// Handler registry and traversal engine over the nodes it can reach.
pub struct Scope {
    weak: Weak<Scope>,
    parents: Vec<Arc<Scope>>,
    serializing: bool,
    handlers: RwLock<HashMap<String, HandlerFn>>,
    /// Keep-alive roster of nodes created through this scope
    roster: RwLock<Vec<Arc<NodeInner>>>,
}

impl Scope {
    /// A root scope with the reserved `input`/`output` handlers installed.
    pub fn new() -> Arc<Scope> {
        let scope = Self::build(Vec::new(), false);
        scope.register_handler(INPUT, reserved(INPUT));
        scope.register_handler(OUTPUT, reserved(OUTPUT));
        scope
    }

    /// A child scope delegating handler resolution to `parents` in order.
    pub fn with_parents(parents: Vec<Arc<Scope>>) -> Arc<Scope> {
        Self::build(parents, false)
    }

    /// A child scope flagged serializing, used for closure dry-runs.
    pub(crate) fn serializing_child(parents: Vec<Arc<Scope>>) -> Arc<Scope> {
        Self::build(parents, true)
    }

    fn build(parents: Vec<Arc<Scope>>, serializing: bool) -> Arc<Scope> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            parents,
            serializing,
            handlers: RwLock::new(HashMap::new()),
            roster: RwLock::new(Vec::new()),
        })
    }

    /// A strong handle to this scope. Scopes are only ever constructed
    /// inside an `Arc`, so the upgrade cannot fail while `self` is alive.
    fn handle(&self) -> Arc<Scope> {
        self.weak.upgrade().expect("scope is always owned by an Arc")
    }

    /// Whether this scope is a serialization dry-run scope.
    pub fn serializing(&self) -> bool {
        self.serializing
    }

    /// Register a handler, overwriting any same-named entry in this scope
    /// only. Parent registries are never touched.
    pub fn register_handler(&self, name: impl Into<String>, handler: HandlerFn) {
        self.handlers.write().unwrap().insert(name.into(), handler);
    }

    /// Register every handler of a kit, each wrapped to the handler
    /// contract (kit handlers take resolved inputs and no context).
    pub fn add_kit(&self, kit: Kit) {
        for (name, f) in kit.handlers {
            self.register_handler(name, Arc::new(move |inputs, _ctx| f(inputs)));
        }
    }

    /// Find a handler by name: local registry first, then each parent in
    /// declared order, recursively. First match wins.
    pub fn resolve_handler(&self, name: &str) -> Option<HandlerFn> {
        if let Some(handler) = self.handlers.read().unwrap().get(name) {
            return Some(handler.clone());
        }
        self.parents
            .iter()
            .find_map(|parent| parent.resolve_handler(name))
    }

    /// Create a node of a registered handler type.
    pub fn node(&self, node_type: &str, config: impl Into<NodeConfig>) -> Result<NodeHandle> {
        NodeHandle::create(&self.handle(), node_type, None, config.into())
    }

    /// Create a node wrapping an inline closure.
    pub fn inline(&self, inline: InlineFn, config: impl Into<NodeConfig>) -> Result<NodeHandle> {
        NodeHandle::create(&self.handle(), CLOSURE, Some(inline), config.into())
    }

    pub(crate) fn adopt(&self, node: &Arc<NodeInner>) {
        self.roster.write().unwrap().push(node.clone());
    }

    /// The full connected component around `node`: an undirected
    /// breadth-first traversal over incoming and outgoing edges.
    pub fn discover(&self, node: &NodeHandle) -> Vec<NodeHandle> {
        discover_component(node.inner())
            .into_iter()
            .map(NodeHandle::from_inner)
            .collect()
    }

    /// Eager run-to-completion traversal over `node`'s connected component.
    ///
    /// Every discovered node that is currently ready seeds a FIFO worklist;
    /// each fired node's outputs propagate along its outgoing edges, and
    /// downstream nodes whose readiness just became true join the worklist.
    /// The traversal converges when the worklist empties. A node whose
    /// requirements can never be satisfied simply never fires; that is the
    /// caller's responsibility, not an error.
    ///
    /// Calling this repeatedly is safe: a node that already fired is only
    /// re-queued once it receives a fresh delivery.
    pub async fn invoke(&self, node: &NodeHandle) -> Result<()> {
        let calling = self.handle();
        let (mut queue, mut queued) = seed_worklist(node.inner());
        while let Some(next) = queue.pop_front() {
            queued.remove(&next.id);
            if !next.is_ready() {
                return Err(GraphError::Internal(format!(
                    "worklist node '{}' lacked required inputs at pop time",
                    next.id
                )));
            }
            let outputs = fire_node(&calling, &next).await?;
            deliver(&next, &outputs, &mut queue, &mut queued);
        }
        Ok(())
    }

    /// Step-wise traversal over `node`'s connected component; the returned
    /// [`StepRun`] suspends at every input/output/before-handler boundary.
    pub fn run(&self, node: &NodeHandle) -> StepRun {
        let (queue, queued) = seed_worklist(node.inner());
        StepRun::new(self.handle(), queue, queued, None)
    }

    /// Step-wise traversal observed by a probe, which may veto firings and
    /// substitute results.
    pub fn run_with_probe(&self, node: &NodeHandle, probe: Arc<dyn Probe>) -> StepRun {
        let (queue, queued) = seed_worklist(node.inner());
        StepRun::new(self.handle(), queue, queued, Some(probe))
    }

    /// The innermost ambient scope on this thread, if any.
    pub fn current() -> Option<Arc<Scope>> {
        SCOPE_STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// Make this scope the ambient scope until the guard drops.
    pub fn enter(&self) -> ScopeGuard {
        SCOPE_STACK.with(|stack| stack.borrow_mut().push(self.handle()));
        ScopeGuard { _private: () }
    }

    /// Run `f` with this scope as the ambient scope, restoring the previous
    /// ambient scope afterwards, also on unwind.
    pub fn with_current<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("parents", &self.parents.len())
            .field("serializing", &self.serializing)
            .field("handlers", &self.handlers.read().unwrap().len())
            .finish()
    }
}

/// Restores the previous ambient scope when dropped.
pub struct ScopeGuard {
    _private: (),
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

pub(crate) fn discover_component(anchor: &Arc<NodeInner>) -> Vec<Arc<NodeInner>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut component = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(anchor.clone());

    while let Some(node) = queue.pop_front() {
        if !seen.insert(node.id.clone()) {
            continue;
        }
        let state = node.state.read().unwrap();
        for edge in &state.incoming {
            if let Some(from) = edge.from.upgrade() {
                queue.push_back(from);
            }
        }
        for edge in &state.outgoing {
            if let Some(to) = edge.to.upgrade() {
                queue.push_back(to);
            }
        }
        drop(state);
        component.push(node);
    }

    component
}

pub(crate) fn seed_worklist(
    anchor: &Arc<NodeInner>,
) -> (VecDeque<Arc<NodeInner>>, HashSet<String>) {
    let mut queue = VecDeque::new();
    let mut queued = HashSet::new();
    for node in discover_component(anchor) {
        if node.is_ready() {
            queued.insert(node.id.clone());
            queue.push_back(node);
        }
    }
    (queue, queued)
}

/// Propagate `outputs` along every outgoing edge of `node`, enqueueing any
/// downstream node whose readiness just became true and is not queued yet.
pub(crate) fn deliver(
    node: &Arc<NodeInner>,
    outputs: &OutputValues,
    queue: &mut VecDeque<Arc<NodeInner>>,
    queued: &mut HashSet<String>,
) {
    let outgoing = node.state.read().unwrap().outgoing.clone();
    for edge in outgoing {
        let Some(to) = edge.to.upgrade() else {
            continue;
        };
        to.receive_inputs(&edge, outputs);
        trace!(from = %node.id, to = %to.id, out = %edge.out, "delivered outputs");
        if to.is_ready() && !queued.contains(&to.id) {
            queued.insert(to.id.clone());
            queue.push_back(to);
        }
    }
}

/// Fire one node: resolve its handler against the execution scope (calling
/// scope first, declaring scope second), invoke it with the current working
/// inputs, and on success settle the output channel (first firing only),
/// record the outputs, and reset the working inputs to configuration plus
/// constants. On failure the settle channel is rejected (first firing only)
/// and the working inputs are left untouched.
pub(crate) async fn fire_node(
    calling: &Arc<Scope>,
    node: &Arc<NodeInner>,
) -> Result<OutputValues> {
    let inputs = node.current_inputs();
    let declaring = node.scope.upgrade().ok_or_else(|| {
        GraphError::Internal(format!("scope of node '{}' dropped", node.id))
    })?;
    let exec = Scope::with_parents(vec![calling.clone(), declaring]);
    let ctx = NodeContext {
        node: NodeHandle::from_inner(node.clone()),
        scope: exec.clone(),
    };

    debug!(node = %node.id, node_type = %node.node_type, "firing node");

    let fired: Result<OutputValues> = match &node.inline {
        Some(InlineFn::Builder { build, .. }) => {
            // The builder sees its inputs as an already-settled input node,
            // so projections of it resolve without re-running the graph.
            match NodeHandle::create(&exec, INPUT, None, NodeConfig::new()) {
                Ok(input_node) => {
                    input_node.inner().complete(inputs);
                    match build(input_node, ctx).await {
                        Ok(outcome) => realize(outcome).await,
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        }
        Some(InlineFn::Effectful { invoke, .. }) => invoke(inputs, ctx).await,
        None => match exec.resolve_handler(&node.node_type) {
            Some(handler) => handler(inputs, ctx).await,
            None => Err(GraphError::UnknownHandler(node.node_type.clone())),
        },
    };

    match fired {
        Ok(outputs) => {
            node.complete(outputs.clone());
            Ok(outputs)
        }
        Err(e) => {
            let failure = NodeFailure {
                node: node.id.clone(),
                message: e.to_string(),
                cause: e.cause().cloned(),
            };
            node.fail(failure.clone());
            Err(failure.into())
        }
    }
}

/// Turn a builder's [`Outcome`] into an output bundle, resolving any node
/// or projection references it carries. Resolution triggers execution of
/// the referenced subgraphs.
fn realize(outcome: Outcome) -> BoxFuture<'static, Result<OutputValues>> {
    Box::pin(async move {
        match outcome {
            Outcome::Node(node) => node.resolve().await,
            Outcome::Value(value) => {
                let renamed = value
                    .keymap
                    .values()
                    .next()
                    .cloned()
                    .unwrap_or_else(|| "result".to_string());
                let resolved = value.resolve().await?;
                let mut outputs = Map::new();
                outputs.insert(renamed, resolved);
                Ok(outputs)
            }
            Outcome::Values(fields) => {
                let mut outputs = Map::new();
                for (key, emit) in fields {
                    match emit {
                        Emit::Literal(value) => {
                            outputs.insert(key, value);
                        }
                        Emit::Node(node) => {
                            let bundle = node.resolve().await?;
                            let value = bundle.get(&key).cloned().unwrap_or(NodeValue::Null);
                            outputs.insert(key, value);
                        }
                        Emit::Value(value) => {
                            let resolved = value.rename(key.as_str())?.resolve().await?;
                            outputs.insert(key, resolved);
                        }
                    }
                }
                Ok(outputs)
            }
            Outcome::Literal(value) => match value {
                NodeValue::Object(map) => Ok(map),
                NodeValue::Null => Ok(Map::new()),
                other => {
                    let mut outputs = Map::new();
                    outputs.insert("result".to_string(), other);
                    Ok(outputs)
                }
            },
        }
    })
}
