//! Node system: ports, nodes, factory, graph, and lifecycle events

pub mod builtin;
pub mod events;
pub mod factory;
pub mod graph;
pub mod node;
pub mod port;

pub use events::{EventRegistration, GraphEvents, NodeEvents};
pub use factory::{NodeClass, NodeFactory};
pub use graph::{Connection, Graph};
pub use node::{ComputeContext, ComputeFn, ComputeOutputs, Node};
pub use port::{Port, PortDefinition, PortDirection, PortMetadata};
