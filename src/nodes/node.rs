//! Node type and core node functionality

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::debug;
use serde_json::{json, Map, Value};

use crate::data::{DataType, NodeData};
use crate::env::Env;
use crate::error::{raise, FlowError, Result};

use super::events::NodeEvents;
use super::factory::NodeFactory;
use super::graph::Graph;
use super::port::{Port, PortDirection, PortMetadata};

/// Inputs, defaults, and environment visible to a compute procedure
pub struct ComputeContext {
    inputs: HashMap<String, NodeData>,
    defaults: HashMap<String, String>,
    env: Option<Arc<Env>>,
}

impl ComputeContext {
    /// Data currently present on an input port
    pub fn input(&self, key: &str) -> Option<&NodeData> {
        self.inputs.get(key)
    }

    /// Class-declared default literal for an input port
    pub fn default_literal(&self, key: &str) -> Option<&str> {
        self.defaults.get(key).map(String::as_str)
    }

    /// The environment the node was created in, if still alive
    pub fn env(&self) -> Option<&Arc<Env>> {
        self.env.as_ref()
    }
}

/// Output values produced by one compute invocation, keyed by port
pub type ComputeOutputs = Vec<(String, NodeData)>;

/// Computation bound to a node class
pub type ComputeFn =
    Arc<dyn Fn(&ComputeContext) -> std::result::Result<ComputeOutputs, String> + Send + Sync>;

struct NodeState {
    name: String,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
}

/// A computational unit in a graph: identity, typed ports, and a compute
/// procedure bound to its class
pub struct Node {
    id: String,
    class_id: String,
    compute: ComputeFn,
    state: Mutex<NodeState>,
    events: NodeEvents,
    env: Weak<Env>,
    factory: Weak<NodeFactory>,
    graph: Mutex<Weak<Graph>>,
}

impl Node {
    pub(crate) fn new(
        id: String,
        class_id: String,
        name: String,
        inputs: Vec<Port>,
        outputs: Vec<Port>,
        compute: ComputeFn,
        env: Weak<Env>,
        factory: Weak<NodeFactory>,
    ) -> Arc<Node> {
        Arc::new(Node {
            id,
            class_id,
            compute,
            state: Mutex::new(NodeState {
                name,
                inputs,
                outputs,
            }),
            events: NodeEvents::new(),
            env,
            factory,
            graph: Mutex::new(Weak::new()),
        })
    }

    /// Stable identity, distinct from the display name
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class_id(&self) -> &str {
        &self.class_id
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.state.lock().unwrap().name = name.to_string();
    }

    /// Computational event registry for this node
    pub fn events(&self) -> &NodeEvents {
        &self.events
    }

    pub(crate) fn set_graph(&self, graph: Weak<Graph>) {
        *self.graph.lock().unwrap() = graph;
    }

    fn owning_graph(&self) -> Option<Arc<Graph>> {
        self.graph.lock().unwrap().upgrade()
    }

    fn with_port<T>(
        &self,
        key: &str,
        direction: PortDirection,
        f: impl FnOnce(&Port) -> T,
    ) -> Result<T> {
        let state = self.state.lock().unwrap();
        let ports = match direction {
            PortDirection::Input => &state.inputs,
            PortDirection::Output => &state.outputs,
        };
        match ports.iter().find(|p| p.key() == key) {
            Some(port) => Ok(f(port)),
            None => Err(raise(FlowError::PortNotFound(format!(
                "node {} has no {} port '{key}'",
                self.id,
                direction_name(direction)
            )))),
        }
    }

    fn set_port_data(
        &self,
        key: &str,
        direction: PortDirection,
        data: Option<NodeData>,
    ) -> Result<()> {
        let event = {
            let mut state = self.state.lock().unwrap();
            let ports = match direction {
                PortDirection::Input => &mut state.inputs,
                PortDirection::Output => &mut state.outputs,
            };
            let port = ports.iter_mut().find(|p| p.key() == key).ok_or_else(|| {
                raise(FlowError::PortNotFound(format!(
                    "node {} has no {} port '{key}'",
                    self.id,
                    direction_name(direction)
                )))
            })?;
            if let Some(value) = &data {
                let declared = port.data_type();
                if value.data_type() != *declared {
                    return Err(raise(FlowError::TypeMismatch(format!(
                        "port '{key}' holds {}, got {}",
                        declared,
                        value.data_type()
                    ))));
                }
            }
            port.set_data(data.clone());
            data.map(|d| (key.to_string(), d))
        };
        if let Some(event) = event {
            match direction {
                PortDirection::Input => self.events.set_input.emit(&event),
                PortDirection::Output => self.events.set_output.emit(&event),
            }
        }
        Ok(())
    }

    /// Set data on an input port, firing a "set input" event.
    ///
    /// The value's type must match the port's declared type; graph
    /// propagation converts beforehand when the factory allows it.
    pub fn set_input_data(&self, key: &str, data: NodeData) -> Result<()> {
        self.set_port_data(key, PortDirection::Input, Some(data))
    }

    /// Data currently on an input port; `Ok(None)` when the port is empty
    pub fn get_input_data(&self, key: &str) -> Result<Option<NodeData>> {
        self.with_port(key, PortDirection::Input, |p| p.data().cloned())
    }

    pub fn clear_input_data(&self, key: &str) -> Result<()> {
        self.set_port_data(key, PortDirection::Input, None)
    }

    /// Set data on an output port, firing a "set output" event
    pub fn set_output_data(&self, key: &str, data: NodeData) -> Result<()> {
        self.set_port_data(key, PortDirection::Output, Some(data))
    }

    pub fn get_output_data(&self, key: &str) -> Result<Option<NodeData>> {
        self.with_port(key, PortDirection::Output, |p| p.data().cloned())
    }

    pub fn clear_output_data(&self, key: &str) -> Result<()> {
        self.set_port_data(key, PortDirection::Output, None)
    }

    /// True iff every input port flagged required currently holds data
    pub fn validate_required_inputs(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .inputs
            .iter()
            .all(|p| !p.is_required() || p.data().is_some())
    }

    /// Run this node's computation on its current inputs.
    ///
    /// On success the produced values are written to the output ports. On
    /// failure prior output data is left untouched, a node error event
    /// fires, and `ComputationFailed` is returned.
    pub fn invoke_compute(&self) -> Result<()> {
        let ctx = {
            let state = self.state.lock().unwrap();
            let inputs = state
                .inputs
                .iter()
                .filter_map(|p| p.data().map(|d| (p.key().to_string(), d.clone())))
                .collect();
            let defaults = state
                .inputs
                .iter()
                .filter_map(|p| p.default_literal().map(|d| (p.key().to_string(), d.to_string())))
                .collect();
            ComputeContext {
                inputs,
                defaults,
                env: self.env.upgrade(),
            }
        };

        let outputs = match (self.compute)(&ctx) {
            Ok(outputs) => outputs,
            Err(message) => return Err(self.computation_failed(message)),
        };

        // Validate the whole result before writing anything, so a bad
        // compute result cannot leave partially updated outputs
        let rejection = {
            let state = self.state.lock().unwrap();
            outputs.iter().find_map(|(key, value)| {
                match state.outputs.iter().find(|p| p.key() == key.as_str()) {
                    None => Some(format!("compute wrote undeclared port '{key}'")),
                    Some(port) if value.data_type() != *port.data_type() => Some(format!(
                        "compute wrote {} to port '{key}' declared {}",
                        value.data_type(),
                        port.data_type()
                    )),
                    Some(_) => None,
                }
            })
        };
        if let Some(message) = rejection {
            return Err(self.computation_failed(message));
        }

        for (key, value) in outputs {
            self.set_port_data(&key, PortDirection::Output, Some(value))?;
        }
        debug!("node {} ({}) computed", self.id, self.class_id);
        self.events.compute.emit(&());
        Ok(())
    }

    fn computation_failed(&self, message: String) -> FlowError {
        let err = raise(FlowError::ComputationFailed(format!(
            "node {}: {message}",
            self.id
        )));
        self.events.error.emit(&message);
        err
    }

    /// Whether any live connection targets one of this node's inputs
    pub fn has_connected_inputs(&self) -> bool {
        self.owning_graph()
            .map(|g| g.connections().iter().any(|c| c.target_node() == self.id))
            .unwrap_or(false)
    }

    /// Whether any live connection starts at one of this node's outputs
    pub fn has_connected_outputs(&self) -> bool {
        self.owning_graph()
            .map(|g| g.connections().iter().any(|c| c.source_node() == self.id))
            .unwrap_or(false)
    }

    pub fn input_port_keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.inputs.iter().map(|p| p.key().to_string()).collect()
    }

    pub fn output_port_keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.outputs.iter().map(|p| p.key().to_string()).collect()
    }

    pub fn input_port_type(&self, key: &str) -> Result<DataType> {
        self.with_port(key, PortDirection::Input, |p| p.data_type().clone())
    }

    pub fn output_port_type(&self, key: &str) -> Result<DataType> {
        self.with_port(key, PortDirection::Output, |p| p.data_type().clone())
    }

    pub fn port_description(&self, key: &str, is_input: bool) -> Result<Option<String>> {
        let direction = if is_input {
            PortDirection::Input
        } else {
            PortDirection::Output
        };
        self.with_port(key, direction, |p| p.description().map(str::to_string))
    }

    /// Introspection metadata for one input port
    pub fn port_metadata(&self, key: &str) -> Result<PortMetadata> {
        self.with_port(key, PortDirection::Input, |p| p.metadata())
    }

    /// Introspection metadata for every input port, in declaration order
    pub fn input_ports_metadata(&self) -> Vec<PortMetadata> {
        let state = self.state.lock().unwrap();
        state.inputs.iter().map(Port::metadata).collect()
    }

    pub(crate) fn to_json_value(&self) -> Value {
        let state = self.state.lock().unwrap();
        let collect = |ports: &[Port]| -> Map<String, Value> {
            ports
                .iter()
                .filter_map(|p| p.data().map(|d| (p.key().to_string(), d.to_json())))
                .collect()
        };
        json!({
            "id": self.id,
            "class": self.class_id,
            "name": state.name,
            "inputs": collect(&state.inputs),
            "outputs": collect(&state.outputs),
        })
    }

    /// Serialize this node's identity and current port data
    pub fn save_to_json(&self) -> String {
        self.to_json_value().to_string()
    }

    /// Restore port data values from a node document.
    ///
    /// Only data values are restored; identity and topology belong to the
    /// graph document. Fails without touching the node if the document
    /// names unknown ports or carries mismatched types.
    pub fn load_from_json(&self, json_str: &str) -> Result<()> {
        let doc: Value = serde_json::from_str(json_str).map_err(|e| {
            raise(FlowError::InvalidArgument(format!("node document: {e}")))
        })?;

        let mut staged: Vec<(String, PortDirection, NodeData)> = Vec::new();
        for (field, direction) in [
            ("inputs", PortDirection::Input),
            ("outputs", PortDirection::Output),
        ] {
            let Some(section) = doc.get(field) else {
                continue;
            };
            let entries = section.as_object().ok_or_else(|| {
                raise(FlowError::InvalidArgument(format!(
                    "node document field '{field}' must be an object"
                )))
            })?;
            for (key, value) in entries {
                let declared = self.with_port(key, direction, |p| p.data_type().clone())?;
                if let Some(data) = NodeData::from_json(value)? {
                    if data.data_type() != declared {
                        return Err(raise(FlowError::TypeMismatch(format!(
                            "port '{key}' holds {declared}, document carries {}",
                            data.data_type()
                        ))));
                    }
                    staged.push((key.clone(), direction, data));
                }
            }
        }

        for (key, direction, data) in staged {
            self.set_port_data(&key, direction, Some(data))?;
        }
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(factory) = self.factory.upgrade() {
            factory.note_instance_dropped(&self.class_id);
        }
    }
}

fn direction_name(direction: PortDirection) -> &'static str {
    match direction {
        PortDirection::Input => "input",
        PortDirection::Output => "output",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::port::PortDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_node(compute: ComputeFn) -> Arc<Node> {
        let inputs = vec![
            Port::from_definition(
                &PortDefinition::required("lhs", DataType::Integer),
                PortDirection::Input,
            ),
            Port::from_definition(
                &PortDefinition::optional("rhs", DataType::Integer).with_default("0"),
                PortDirection::Input,
            ),
        ];
        let outputs = vec![Port::from_definition(
            &PortDefinition::required("out", DataType::Integer),
            PortDirection::Output,
        )];
        Node::new(
            "node-1".to_string(),
            "test.add".to_string(),
            "adder".to_string(),
            inputs,
            outputs,
            compute,
            Weak::new(),
            Weak::new(),
        )
    }

    fn adding_compute() -> ComputeFn {
        Arc::new(|ctx: &ComputeContext| {
            let lhs = ctx.input("lhs").and_then(|d| d.as_integer().ok()).unwrap_or(0);
            let rhs = ctx.input("rhs").and_then(|d| d.as_integer().ok()).unwrap_or(0);
            Ok(vec![("out".to_string(), NodeData::integer(lhs + rhs))])
        })
    }

    #[test]
    fn set_get_clear_port_data() {
        let node = test_node(adding_compute());

        assert_eq!(node.get_input_data("lhs").unwrap(), None);
        node.set_input_data("lhs", NodeData::integer(3)).unwrap();
        assert_eq!(
            node.get_input_data("lhs").unwrap(),
            Some(NodeData::integer(3))
        );

        node.clear_input_data("lhs").unwrap();
        assert_eq!(node.get_input_data("lhs").unwrap(), None);

        assert!(matches!(
            node.set_input_data("missing", NodeData::integer(1)),
            Err(FlowError::PortNotFound(_))
        ));
        assert!(matches!(
            node.set_input_data("lhs", NodeData::string("nope")),
            Err(FlowError::TypeMismatch(_))
        ));
    }

    #[test]
    fn required_input_validation() {
        let node = test_node(adding_compute());
        assert!(!node.validate_required_inputs());
        node.set_input_data("lhs", NodeData::integer(1)).unwrap();
        // rhs is optional
        assert!(node.validate_required_inputs());
    }

    #[test]
    fn compute_writes_outputs_and_fires_events() {
        let node = test_node(adding_compute());
        let computes = Arc::new(AtomicUsize::new(0));
        let outputs_set = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&computes);
        let _on_compute = node.events().on_compute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let o = Arc::clone(&outputs_set);
        let _on_output = node.events().on_set_output(move |key, data| {
            assert_eq!(key, "out");
            assert_eq!(data.as_integer().unwrap(), 7);
            o.fetch_add(1, Ordering::SeqCst);
        });

        node.set_input_data("lhs", NodeData::integer(3)).unwrap();
        node.set_input_data("rhs", NodeData::integer(4)).unwrap();
        node.invoke_compute().unwrap();

        assert_eq!(node.get_output_data("out").unwrap(), Some(NodeData::integer(7)));
        assert_eq!(computes.load(Ordering::SeqCst), 1);
        assert_eq!(outputs_set.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_compute_leaves_outputs_untouched() {
        let failing: ComputeFn = Arc::new(|_| Err("deliberate failure".to_string()));
        let node = test_node(failing);
        node.set_output_data("out", NodeData::integer(99)).unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let _on_error = node.events().on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        node.set_input_data("lhs", NodeData::integer(1)).unwrap();
        assert!(matches!(
            node.invoke_compute(),
            Err(FlowError::ComputationFailed(_))
        ));
        assert_eq!(node.get_output_data("out").unwrap(), Some(NodeData::integer(99)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn compute_writing_undeclared_port_fails_atomically() {
        let rogue: ComputeFn = Arc::new(|_| {
            Ok(vec![
                ("out".to_string(), NodeData::integer(1)),
                ("bogus".to_string(), NodeData::integer(2)),
            ])
        });
        let node = test_node(rogue);
        node.set_input_data("lhs", NodeData::integer(1)).unwrap();
        assert!(matches!(
            node.invoke_compute(),
            Err(FlowError::ComputationFailed(_))
        ));
        assert_eq!(node.get_output_data("out").unwrap(), None);
    }

    #[test]
    fn set_input_event_fires_inline() {
        let node = test_node(adding_compute());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let _reg = node.events().on_set_input(move |key, data| {
            assert_eq!(key, "rhs");
            assert_eq!(data.as_integer().unwrap(), 5);
            s.fetch_add(1, Ordering::SeqCst);
        });
        node.set_input_data("rhs", NodeData::integer(5)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn node_document_round_trip() {
        let node = test_node(adding_compute());
        node.set_input_data("lhs", NodeData::integer(3)).unwrap();
        node.set_output_data("out", NodeData::integer(7)).unwrap();

        let doc = node.save_to_json();
        let restored = test_node(adding_compute());
        restored.load_from_json(&doc).unwrap();
        assert_eq!(
            restored.get_input_data("lhs").unwrap(),
            Some(NodeData::integer(3))
        );
        assert_eq!(
            restored.get_output_data("out").unwrap(),
            Some(NodeData::integer(7))
        );
    }

    #[test]
    fn node_document_with_unknown_port_is_rejected() {
        let node = test_node(adding_compute());
        let err = node
            .load_from_json(r#"{"inputs":{"nope":{"type":"integer","value":1}}}"#)
            .unwrap_err();
        assert!(matches!(err, FlowError::PortNotFound(_)));
    }

    #[test]
    fn port_introspection() {
        let node = test_node(adding_compute());
        assert_eq!(node.input_port_keys(), vec!["lhs", "rhs"]);
        assert_eq!(node.output_port_keys(), vec!["out"]);
        assert_eq!(node.input_port_type("lhs").unwrap(), DataType::Integer);
        assert!(node.input_port_type("out").is_err());

        let meta = node.port_metadata("rhs").unwrap();
        assert_eq!(meta.value_json, r#"{"type":"integer","value":"0"}"#);
        assert!(meta.has_default);
    }
}
