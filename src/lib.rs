//! Nodeflow: a node-graph computation engine.
//!
//! A mutable directed graph of typed nodes linked by typed data ports.
//! Node classes come from a factory that plugin modules extend at runtime;
//! engine objects are shareable across the consumer boundary through
//! reference-counted opaque handles; graphs execute in dependency order on
//! an environment-owned worker pool.

pub mod data;
pub mod env;
pub mod error;
pub mod handle;
pub mod nodes;
pub mod plugins;

pub use data::{DataType, NodeData, OpaqueData};
pub use env::Env;
pub use error::{clear_last_error, last_error, FlowError, Result};
pub use handle::{HandleId, HandleRegistry};
pub use nodes::{
    ComputeContext, ComputeFn, ComputeOutputs, Connection, EventRegistration, Graph, GraphEvents,
    Node, NodeClass, NodeEvents, NodeFactory, Port, PortDefinition, PortDirection, PortMetadata,
};
pub use plugins::{CreatePluginFn, LoadStage, Module, NodePlugin, PluginHandle, PluginInfo};
