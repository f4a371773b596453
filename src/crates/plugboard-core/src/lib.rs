//! # plugboard-core - Dataflow Graphs with Portable Descriptors
//!
//! Build computations as directed graphs of named nodes joined by keyed
//! edges, author them lazily through a fluent handle/projection API, run
//! them eagerly or step-wise with suspend/resume checkpoints, and
//! serialize any reachable subgraph into a portable descriptor that can be
//! reloaded and re-executed without the authoring code.
//!
//! ## Core Concepts
//!
//! ### 1. Nodes, Edges, Values
//!
//! A [`NodeHandle`] wraps one graph vertex: a handler type (resolved at
//! firing time) or an inline closure, a fixed configuration, and working
//! inputs accumulated from incoming edges. Edges copy one named field, all
//! fields (wildcard), or nothing (control-only); constant edges persist
//! their deliveries across firing cycles. A [`Value`] is a renameable
//! projection of a node's future output, the unit authors chain.
//!
//! ### 2. Scopes
//!
//! A [`Scope`] owns a handler registry with parent-chain delegation:
//! handlers supplied by a caller shadow handlers registered at authoring
//! time. Scopes discover connected components, run them eagerly
//! ([`Scope::invoke`]) or step-wise ([`Scope::run`]), and serialize them
//! ([`Scope::serialize`]).
//!
//! ### 3. Step-wise execution
//!
//! [`StepRun`] suspends at every `input` / `output` / before-handler
//! boundary, handing control to the caller, who resumes with external
//! input values, a substituted result, or plain continuation. A [`Probe`]
//! may observe every boundary and veto firings.
//!
//! ### 4. Portable descriptors
//!
//! [`GraphDescriptor`] captures nodes, edges, and nested subgraphs.
//! Inline closures compile to either a nested subgraph (dry-run of a
//! [`InlineFn::Builder`]) or a source-bearing `runJavascript` node.
//! [`Board`] reloads descriptors into live graphs and drives them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plugboard_core::{handler, NodeConfig, Scope};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), plugboard_core::GraphError> {
//!     let scope = Scope::new();
//!     scope.register_handler("greet", handler(|inputs| async move {
//!         let name = inputs.get("name").and_then(|v| v.as_str()).unwrap_or("world");
//!         Ok(json!({"text": format!("hello {name}")}).as_object().cloned().unwrap())
//!     }));
//!
//!     let node = scope.node("greet", NodeConfig::new().constant("name", json!("graph")))?;
//!     let outputs = node.resolve().await?;
//!     assert_eq!(outputs["text"], json!("hello graph"));
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!            ┌─────────────────────────────────────────┐
//!            │            Authoring surface            │
//!            │  NodeHandle • Value • NodeConfig • Kit  │
//!            └───────────────────┬─────────────────────┘
//!                                │
//!                                ▼
//!            ┌─────────────────────────────────────────┐
//!            │                 Scope                   │
//!            │  • handler registry (parent chain)      │
//!            │  • discover() - connected component     │
//!            │  • invoke()   - eager worklist          │
//!            │  • run()      - step-wise checkpoints   │
//!            │  • serialize()- portable descriptor     │
//!            └──────┬──────────────────┬───────────────┘
//!                   │                  │
//!                   ▼                  ▼
//!         ┌──────────────────┐  ┌────────────────────┐
//!         │     StepRun      │  │  GraphDescriptor   │
//!         │  Input/Output/   │  │  nodes • edges •   │
//!         │  BeforeHandler   │  │  nested graphs     │
//!         │  checkpoints     │  └─────────┬──────────┘
//!         └────────┬─────────┘            │
//!                  │                      ▼
//!                  │            ┌────────────────────┐
//!                  └───────────▶│       Board        │
//!                               │  load • run_once   │
//!                               └────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`node`] - Node/edge data model, wiring, readiness
//! - [`value`] - Output projections
//! - [`scope`] - Handler registry, discovery, eager traversal, ambient scope
//! - [`run`] - Step-wise execution with checkpoints
//! - [`probe`] - Observability boundary
//! - [`handler`] - Handler contracts, inline closures, kits
//! - [`descriptor`] - Portable graph descriptors
//! - [`serialize`] - Graph-to-descriptor serialization, closure compilation
//! - [`board`] - Descriptor loading and the run-loop driver
//! - [`error`] - Error types
//!
//! ## Common Patterns
//!
//! ### Step-wise driving with external input
//!
//! ```rust,ignore
//! use plugboard_core::{Resume, StepEvent};
//!
//! let mut run = scope.run(&anchor);
//! let mut resume = Resume::Start;
//! loop {
//!     match run.step(resume).await? {
//!         StepEvent::Input { .. } => resume = Resume::Inputs(external.clone()),
//!         StepEvent::Output { outputs, .. } => break println!("{outputs:?}"),
//!         StepEvent::BeforeHandler { .. } => resume = Resume::Continue,
//!         StepEvent::Done => break,
//!     }
//! }
//! ```
//!
//! ### Shipping a graph without its authoring code
//!
//! ```rust,ignore
//! use plugboard_core::{Board, GraphDescriptor, GraphMetadata, Scope};
//!
//! let descriptor = scope.serialize(&anchor, GraphMetadata::default()).await?;
//! let json = descriptor.to_json()?;
//! // ... elsewhere, with only a kit of handlers ...
//! let board = Board::from_descriptor(&GraphDescriptor::from_json(&json)?, &Scope::new())?;
//! let outputs = board.run_once(inputs).await?;
//! ```
//!
//! ## Concurrency Model
//!
//! Scheduling is single-threaded and cooperative: the worklist fires one
//! node at a time and awaits each handler to completion. The ambient
//! current-scope holder is thread-local with stack discipline; truly
//! parallel execution must pass scopes explicitly via [`NodeContext`].

pub mod board;
pub mod descriptor;
pub mod error;
pub mod handler;
pub mod node;
pub mod probe;
pub mod run;
pub mod scope;
pub mod serialize;
pub mod value;

// Re-export main types
pub use board::Board;
pub use descriptor::{EdgeDescriptor, GraphDescriptor, GraphMetadata, NodeDescriptor};
pub use error::{GraphError, NodeFailure, Result};
pub use handler::{
    handler, handler_with_context, BuilderFn, Emit, HandlerFn, InlineFn, Kit, KitHandlerFn,
    NodeContext, Outcome,
};
pub use node::{
    ConfigEntry, Edge, InputValues, KeyMap, NodeConfig, NodeHandle, NodeId, NodeTarget,
    NodeValue, OutputValues, CLOSURE, INPUT, OUTPUT,
};
pub use probe::Probe;
pub use run::{Resume, StepEvent, StepRun};
pub use scope::{Scope, ScopeGuard};
pub use value::Value;
