//! Graph structure, topology invariants, and dependency-ordered execution

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::data::NodeData;
use crate::env::Env;
use crate::error::{raise, FlowError, Result};

use super::events::GraphEvents;
use super::factory::NodeFactory;
use super::node::Node;

/// A directed typed edge from one node's output port to another node's
/// input port. Immutable after creation.
#[derive(Debug)]
pub struct Connection {
    id: String,
    source_node: String,
    source_port: String,
    target_node: String,
    target_port: String,
}

impl Connection {
    fn new(
        id: String,
        source_node: &str,
        source_port: &str,
        target_node: &str,
        target_port: &str,
    ) -> Self {
        Self {
            id,
            source_node: source_node.to_string(),
            source_port: source_port.to_string(),
            target_node: target_node.to_string(),
            target_port: target_port.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_node(&self) -> &str {
        &self.source_node
    }

    pub fn source_port(&self) -> &str {
        &self.source_port
    }

    pub fn target_node(&self) -> &str {
        &self.target_node
    }

    pub fn target_port(&self) -> &str {
        &self.target_port
    }
}

struct GraphInner {
    /// Insertion order is execution tie-break order
    nodes: Vec<Arc<Node>>,
    connections: Vec<Arc<Connection>>,
}

/// A mutable directed graph of nodes and connections, bound to one
/// environment for execution
pub struct Graph {
    env: Arc<Env>,
    inner: Mutex<GraphInner>,
    events: GraphEvents,
}

impl Graph {
    pub fn create(env: &Arc<Env>) -> Arc<Graph> {
        Arc::new(Graph {
            env: Arc::clone(env),
            inner: Mutex::new(GraphInner {
                nodes: Vec::new(),
                connections: Vec::new(),
            }),
            events: GraphEvents::new(),
        })
    }

    pub fn env(&self) -> &Arc<Env> {
        &self.env
    }

    /// Structural event registry for this graph
    pub fn events(&self) -> &GraphEvents {
        &self.events
    }

    /// Create a node of `class_id` through the environment's factory and
    /// add it to the graph, firing a "node added" event
    pub fn add_node(self: &Arc<Self>, class_id: &str, name: &str) -> Result<Arc<Node>> {
        let node = self
            .env
            .factory()
            .create_node(class_id, None, name, &self.env)?;
        self.install_node(Arc::clone(&node))?;
        Ok(node)
    }

    fn install_node(self: &Arc<Self>, node: Arc<Node>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.nodes.iter().any(|n| n.id() == node.id()) {
                return Err(raise(FlowError::InvalidArgument(format!(
                    "graph already contains node {}",
                    node.id()
                ))));
            }
            node.set_graph(Arc::downgrade(self));
            inner.nodes.push(Arc::clone(&node));
        }
        self.events.node_added.emit(&node);
        Ok(())
    }

    /// Remove a node, cascading removal of every connection touching it
    pub fn remove_node(&self, node_id: &str) -> Result<()> {
        let (node, removed_connections) = {
            let mut inner = self.inner.lock().unwrap();
            let position = inner
                .nodes
                .iter()
                .position(|n| n.id() == node_id)
                .ok_or_else(|| {
                    raise(FlowError::NodeNotFound(format!("node not found: {node_id}")))
                })?;
            let node = inner.nodes.remove(position);
            node.set_graph(Weak::new());

            let mut removed = Vec::new();
            inner.connections.retain(|conn| {
                if conn.source_node() == node_id || conn.target_node() == node_id {
                    removed.push(Arc::clone(conn));
                    false
                } else {
                    true
                }
            });
            (node, removed)
        };

        for conn in &removed_connections {
            self.events.nodes_disconnected.emit(conn);
        }
        self.events.node_removed.emit(&node);
        debug!(
            "removed node {node_id} and {} connection(s)",
            removed_connections.len()
        );
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> Result<Arc<Node>> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .iter()
            .find(|n| n.id() == node_id)
            .cloned()
            .ok_or_else(|| raise(FlowError::NodeNotFound(format!("node not found: {node_id}"))))
    }

    /// All nodes, in insertion order
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.lock().unwrap().nodes.clone()
    }

    /// All connections, in creation order
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().unwrap().connections.clone()
    }

    /// Validate a prospective edge. Returns the index of an existing edge
    /// into the target input that the new edge would replace.
    fn validate_connect(
        &self,
        inner: &GraphInner,
        source_id: &str,
        source_port: &str,
        target_id: &str,
        target_port: &str,
    ) -> Result<Option<usize>> {
        let source = inner
            .nodes
            .iter()
            .find(|n| n.id() == source_id)
            .ok_or_else(|| {
                raise(FlowError::NodeNotFound(format!("node not found: {source_id}")))
            })?;
        let target = inner
            .nodes
            .iter()
            .find(|n| n.id() == target_id)
            .ok_or_else(|| {
                raise(FlowError::NodeNotFound(format!("node not found: {target_id}")))
            })?;
        if source_id == target_id {
            return Err(raise(FlowError::ConnectionFailed(
                "cannot connect a node to itself".to_string(),
            )));
        }

        // Direction is enforced by which port list each lookup searches
        let source_type = source.output_port_type(source_port)?;
        let target_type = target.input_port_type(target_port)?;
        if !self.env.factory().is_convertible(&source_type, &target_type) {
            return Err(raise(FlowError::TypeMismatch(format!(
                "cannot connect {source_type} output to {target_type} input"
            ))));
        }

        if reaches(&inner.connections, target_id, source_id) {
            return Err(raise(FlowError::ConnectionFailed(format!(
                "connecting {source_id} to {target_id} would create a cycle"
            ))));
        }

        Ok(inner
            .connections
            .iter()
            .position(|c| c.target_node() == target_id && c.target_port() == target_port))
    }

    /// Create an edge from a source output to a target input.
    ///
    /// An existing edge into the target input is atomically replaced,
    /// firing "nodes disconnected" for it before "nodes connected" for the
    /// new edge.
    pub fn connect(
        &self,
        source_id: &str,
        source_port: &str,
        target_id: &str,
        target_port: &str,
    ) -> Result<Arc<Connection>> {
        self.connect_with_id(None, source_id, source_port, target_id, target_port)
    }

    fn connect_with_id(
        &self,
        forced_id: Option<&str>,
        source_id: &str,
        source_port: &str,
        target_id: &str,
        target_port: &str,
    ) -> Result<Arc<Connection>> {
        let (replaced, connection) = {
            let mut inner = self.inner.lock().unwrap();
            let replaced_index =
                self.validate_connect(&inner, source_id, source_port, target_id, target_port)?;
            let replaced = replaced_index.map(|i| inner.connections.remove(i));
            let id = forced_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let connection = Arc::new(Connection::new(
                id,
                source_id,
                source_port,
                target_id,
                target_port,
            ));
            inner.connections.push(Arc::clone(&connection));
            (replaced, connection)
        };

        if let Some(old) = replaced {
            self.events.nodes_disconnected.emit(&old);
        }
        self.events.nodes_connected.emit(&connection);
        Ok(connection)
    }

    /// Remove an edge by id, firing a "nodes disconnected" event
    pub fn disconnect(&self, connection_id: &str) -> Result<()> {
        let connection = {
            let mut inner = self.inner.lock().unwrap();
            let position = inner
                .connections
                .iter()
                .position(|c| c.id() == connection_id)
                .ok_or_else(|| {
                    raise(FlowError::ConnectionFailed(format!(
                        "connection not found: {connection_id}"
                    )))
                })?;
            inner.connections.remove(position)
        };
        self.events.nodes_disconnected.emit(&connection);
        Ok(())
    }

    /// Dry-run of the validation in `connect`: no mutation, no events
    pub fn can_connect(
        &self,
        source_id: &str,
        source_port: &str,
        target_id: &str,
        target_port: &str,
    ) -> bool {
        let inner = self.inner.lock().unwrap();
        self.validate_connect(&inner, source_id, source_port, target_id, target_port)
            .is_ok()
    }

    /// Remove all nodes and connections, firing removal events for each
    pub fn clear(&self) {
        let (nodes, connections) = {
            let mut inner = self.inner.lock().unwrap();
            for node in &inner.nodes {
                node.set_graph(Weak::new());
            }
            (
                std::mem::take(&mut inner.nodes),
                std::mem::take(&mut inner.connections),
            )
        };
        for conn in &connections {
            self.events.nodes_disconnected.emit(conn);
        }
        for node in &nodes {
            self.events.node_removed.emit(node);
        }
    }

    /// Execute every node in dependency order on the environment's pool.
    ///
    /// Independent nodes run in parallel; ready-set ties are broken by node
    /// insertion order. A failing node does not abort the run: the failure
    /// is recorded, its downstream nodes are still attempted, and the run
    /// returns `ComputationFailed` naming every failed node.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let (nodes, connections) = {
            let inner = self.inner.lock().unwrap();
            (inner.nodes.clone(), inner.connections.clone())
        };
        let total = nodes.len();
        if total == 0 {
            return Ok(());
        }

        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id(), i))
            .collect();
        let mut indegree = vec![0usize; total];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); total];
        let mut incoming: Vec<Vec<(Arc<Connection>, Arc<Node>)>> = vec![Vec::new(); total];
        for conn in &connections {
            let (Some(&s), Some(&t)) = (
                index.get(conn.source_node()),
                index.get(conn.target_node()),
            ) else {
                continue;
            };
            indegree[t] += 1;
            successors[s].push(t);
            incoming[t].push((Arc::clone(conn), Arc::clone(&nodes[s])));
        }

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let factory = self.env.factory();
        let (tx, rx) = mpsc::channel::<(usize, std::result::Result<(), String>)>();
        let mut completed = 0usize;
        let mut in_flight = 0usize;
        let mut failures: Vec<String> = Vec::new();

        while completed < total {
            while let Some(Reverse(idx)) = ready.pop() {
                let node = Arc::clone(&nodes[idx]);
                let node_inputs = std::mem::take(&mut incoming[idx]);
                let factory = Arc::clone(&factory);
                let tx = tx.clone();
                in_flight += 1;
                self.env.execute(move || {
                    // A panicking compute must still report completion or
                    // the run would wait on it forever
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        execute_node(&node, &node_inputs, &factory)
                    }))
                    .unwrap_or_else(|_| Err("computation panicked".to_string()));
                    let _ = tx.send((idx, result));
                });
            }
            if in_flight == 0 {
                return Err(raise(FlowError::Unknown(
                    "run stalled: connection graph is not acyclic".to_string(),
                )));
            }

            let (idx, result) = rx.recv().expect("run completion channel closed");
            in_flight -= 1;
            completed += 1;
            if let Err(message) = result {
                warn!("node {} failed: {message}", nodes[idx].id());
                failures.push(format!("{}: {message}", nodes[idx].id()));
            }
            for &succ in &successors[idx] {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            let message = format!("computation failed for {}", failures.join("; "));
            self.events.error.emit(&message);
            Err(raise(FlowError::ComputationFailed(message)))
        }
    }

    /// Serialize nodes (with current port data) and connections
    pub fn save_to_json(&self) -> String {
        let (nodes, connections) = {
            let inner = self.inner.lock().unwrap();
            (inner.nodes.clone(), inner.connections.clone())
        };
        let doc = json!({
            "nodes": nodes.iter().map(|n| n.to_json_value()).collect::<Vec<Value>>(),
            "connections": connections
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id(),
                        "source_node": c.source_node(),
                        "source_port": c.source_port(),
                        "target_node": c.target_node(),
                        "target_port": c.target_port(),
                    })
                })
                .collect::<Vec<Value>>(),
        });
        serde_json::to_string_pretty(&doc).expect("graph document serialization cannot fail")
    }

    /// Replace this graph's contents with a serialized document.
    ///
    /// All-or-nothing: the document is fully validated against the
    /// environment's factory before any mutation, and an inconsistent
    /// document (unknown class, dangling endpoint, bad value, cycle)
    /// fails with `InvalidArgument` leaving the graph unmodified.
    pub fn load_from_json(self: &Arc<Self>, json_str: &str) -> Result<()> {
        let doc: GraphDoc = serde_json::from_str(json_str)
            .map_err(|e| raise(FlowError::InvalidArgument(format!("graph document: {e}"))))?;
        let factory = self.env.factory();
        let staged = validate_document(&doc, &factory)?;

        self.clear();
        for node_doc in &doc.nodes {
            let node = factory.create_node(&node_doc.class, Some(&node_doc.id), &node_doc.name, &self.env)?;
            self.install_node(Arc::clone(&node))?;
            for (key, data) in &staged.input_data[node_doc.id.as_str()] {
                node.set_input_data(key, data.clone())?;
            }
            for (key, data) in &staged.output_data[node_doc.id.as_str()] {
                node.set_output_data(key, data.clone())?;
            }
        }
        for conn in &doc.connections {
            self.connect_with_id(
                Some(&conn.id),
                &conn.source_node,
                &conn.source_port,
                &conn.target_node,
                &conn.target_port,
            )?;
        }
        debug!(
            "loaded graph document: {} node(s), {} connection(s)",
            doc.nodes.len(),
            doc.connections.len()
        );
        Ok(())
    }
}

/// Whether `to` is reachable from `from` over the current edges
fn reaches(connections: &[Arc<Connection>], from: &str, to: &str) -> bool {
    let mut stack = vec![from];
    let mut visited: HashSet<&str> = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == to {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        for conn in connections {
            if conn.source_node() == current {
                stack.push(conn.target_node());
            }
        }
    }
    false
}

/// Propagate incoming values, validate required inputs, and compute
fn execute_node(
    node: &Arc<Node>,
    incoming: &[(Arc<Connection>, Arc<Node>)],
    factory: &Arc<NodeFactory>,
) -> std::result::Result<(), String> {
    for (conn, source) in incoming {
        let data = source
            .get_output_data(conn.source_port())
            .map_err(|e| e.message().to_string())?;
        let Some(data) = data else {
            continue;
        };
        let declared = node
            .input_port_type(conn.target_port())
            .map_err(|e| e.message().to_string())?;
        let adapted = factory
            .convert(&data, &declared)
            .map_err(|e| e.message().to_string())?;
        node.set_input_data(conn.target_port(), adapted)
            .map_err(|e| e.message().to_string())?;
    }

    if !node.validate_required_inputs() {
        let message = "missing required inputs".to_string();
        node.events().error.emit(&message);
        return Err(message);
    }
    node.invoke_compute().map_err(|e| e.message().to_string())
}

#[derive(Deserialize)]
struct GraphDoc {
    #[serde(default)]
    nodes: Vec<NodeDoc>,
    #[serde(default)]
    connections: Vec<ConnectionDoc>,
}

#[derive(Deserialize)]
struct NodeDoc {
    id: String,
    class: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Map<String, Value>,
    #[serde(default)]
    outputs: Map<String, Value>,
}

#[derive(Deserialize)]
struct ConnectionDoc {
    id: String,
    source_node: String,
    source_port: String,
    target_node: String,
    target_port: String,
}

struct StagedData<'a> {
    input_data: HashMap<&'a str, Vec<(String, NodeData)>>,
    output_data: HashMap<&'a str, Vec<(String, NodeData)>>,
}

/// Full validation pass over a graph document; produces parsed port data
fn validate_document<'a>(doc: &'a GraphDoc, factory: &Arc<NodeFactory>) -> Result<StagedData<'a>> {
    let mut staged = StagedData {
        input_data: HashMap::new(),
        output_data: HashMap::new(),
    };
    let mut schemas = HashMap::new();

    for node_doc in &doc.nodes {
        if node_doc.id.is_empty() {
            return Err(raise(FlowError::InvalidArgument(
                "document node has an empty id".to_string(),
            )));
        }
        if schemas.contains_key(node_doc.id.as_str()) {
            return Err(raise(FlowError::InvalidArgument(format!(
                "duplicate node id in document: {}",
                node_doc.id
            ))));
        }
        let class = factory.get_class(&node_doc.class).map_err(|_| {
            raise(FlowError::InvalidArgument(format!(
                "unknown node class in document: {}",
                node_doc.class
            )))
        })?;

        let parse_section = |section: &Map<String, Value>,
                                 defs: &[super::port::PortDefinition]|
         -> Result<Vec<(String, NodeData)>> {
            let mut values = Vec::new();
            for (key, value) in section {
                let def = defs.iter().find(|d| &d.key == key).ok_or_else(|| {
                    raise(FlowError::InvalidArgument(format!(
                        "node {} has no port '{key}' in class {}",
                        node_doc.id, node_doc.class
                    )))
                })?;
                if let Some(data) = NodeData::from_json(value)? {
                    if data.data_type() != def.data_type {
                        return Err(raise(FlowError::InvalidArgument(format!(
                            "port '{key}' of node {} holds {}, document carries {}",
                            node_doc.id,
                            def.data_type,
                            data.data_type()
                        ))));
                    }
                    values.push((key.clone(), data));
                }
            }
            Ok(values)
        };
        let inputs = parse_section(&node_doc.inputs, &class.inputs)?;
        let outputs = parse_section(&node_doc.outputs, &class.outputs)?;
        staged.input_data.insert(node_doc.id.as_str(), inputs);
        staged.output_data.insert(node_doc.id.as_str(), outputs);
        schemas.insert(node_doc.id.as_str(), class);
    }

    let mut taken_inputs = HashSet::new();
    let mut connection_ids = HashSet::new();
    for conn in &doc.connections {
        if !connection_ids.insert(conn.id.as_str()) {
            return Err(raise(FlowError::InvalidArgument(format!(
                "duplicate connection id in document: {}",
                conn.id
            ))));
        }
        let source = schemas.get(conn.source_node.as_str()).ok_or_else(|| {
            raise(FlowError::InvalidArgument(format!(
                "connection {} references unknown node {}",
                conn.id, conn.source_node
            )))
        })?;
        let target = schemas.get(conn.target_node.as_str()).ok_or_else(|| {
            raise(FlowError::InvalidArgument(format!(
                "connection {} references unknown node {}",
                conn.id, conn.target_node
            )))
        })?;
        let source_def = source
            .outputs
            .iter()
            .find(|d| d.key == conn.source_port)
            .ok_or_else(|| {
                raise(FlowError::InvalidArgument(format!(
                    "connection {} references unknown output port '{}'",
                    conn.id, conn.source_port
                )))
            })?;
        let target_def = target
            .inputs
            .iter()
            .find(|d| d.key == conn.target_port)
            .ok_or_else(|| {
                raise(FlowError::InvalidArgument(format!(
                    "connection {} references unknown input port '{}'",
                    conn.id, conn.target_port
                )))
            })?;
        if !factory.is_convertible(&source_def.data_type, &target_def.data_type) {
            return Err(raise(FlowError::InvalidArgument(format!(
                "connection {} links {} output to {} input",
                conn.id, source_def.data_type, target_def.data_type
            ))));
        }
        if !taken_inputs.insert((conn.target_node.as_str(), conn.target_port.as_str())) {
            return Err(raise(FlowError::InvalidArgument(format!(
                "document wires input '{}' of node {} more than once",
                conn.target_port, conn.target_node
            ))));
        }
    }

    // Kahn's algorithm over the document edges: every node must drain
    let mut indegree: HashMap<&str, usize> =
        doc.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    for conn in &doc.connections {
        *indegree.get_mut(conn.target_node.as_str()).unwrap() += 1;
    }
    let mut queue: Vec<&str> = indegree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut drained = 0;
    while let Some(current) = queue.pop() {
        drained += 1;
        for conn in &doc.connections {
            if conn.source_node == current {
                let degree = indegree.get_mut(conn.target_node.as_str()).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push(conn.target_node.as_str());
                }
            }
        }
    }
    if drained != doc.nodes.len() {
        return Err(raise(FlowError::InvalidArgument(
            "document connection graph contains a cycle".to_string(),
        )));
    }

    Ok(staged)
}
